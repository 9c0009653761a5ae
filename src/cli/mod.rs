use std::{env, ffi::OsString, path::PathBuf};

use clap::{ArgAction, Parser};
use kestrel_core::platform::OsVersion;

pub const NAME: &str = "kestrel-replay";

/// Feeds a recorded notification trace to the sensor core running on a
/// simulated platform.
#[derive(Parser, Debug, Clone)]
#[clap(name = NAME, version)]
#[clap(about = "Replay a notification trace through the Kestrel sensor")]
pub struct ReplayOpts {
    #[clap(long)]
    pub config_file: Option<String>,
    /// JSON lines trace file. Reads standard input when missing.
    #[clap(long)]
    pub trace: Option<PathBuf>,
    /// Pids of 32-bit processes.
    #[clap(long, value_delimiter = ',')]
    pub wow64: Vec<u32>,
    /// Pids of protected processes.
    #[clap(long, value_delimiter = ',')]
    pub protected: Vec<u32>,
    /// Simulated OS version, as major.minor.build
    #[clap(long, default_value = "10.0.19045", value_parser = parse_os_version)]
    pub os_version: OsVersion,
    /// Print every dispatched event.
    #[clap(long)]
    pub print_events: bool,
    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl ReplayOpts {
    pub fn override_log_level(&self) -> log::Level {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

pub fn parse_from_args() -> ReplayOpts {
    parse_from(&mut std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> ReplayOpts
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    ReplayOpts::try_parse_from(args).unwrap_or_else(|e| e.exit())
}

fn parse_os_version(value: &str) -> Result<OsVersion, String> {
    let parts = value
        .split('.')
        .map(str::parse::<u32>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("invalid version {value}: {err}"))?;
    match parts.as_slice() {
        [major, minor] => Ok(OsVersion::new(*major, *minor, 0)),
        [major, minor, build] => Ok(OsVersion::new(*major, *minor, *build)),
        _ => Err(format!("invalid version {value}: expected major.minor[.build]")),
    }
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::Level {
    match num {
        u8::MIN..=0 => log::Level::Info,
        1 => log::Level::Debug,
        2..=u8::MAX => log::Level::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
