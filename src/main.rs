use anyhow::Result;
use kestrel::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    // Override the default log_level if there is a greater verbosity flag
    kestrel::init_logger(options.override_log_level());

    match kestrel::replay::run(&options, kestrel::plugins()).await {
        Ok(summary) => {
            println!("{summary}");
            std::process::exit(0)
        }
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
