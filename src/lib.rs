//! Kestrel is a host monitoring sensor core.
//!
//! Notification sources (process, thread and image-load callbacks, messages
//! from the user-mode hooks) are turned into [events](kestrel_core::event)
//! and broadcast synchronously to a set of [plugins](kestrel_core::pdk)
//! through the [`Sensor`](sensor::Sensor).
//!
//! ## Plugins
//!
//! - `injector`: loads the hook library into every user process as soon as
//!   the system images it depends on are mapped.
//! - `rpc-inspector`: forwards the RPC calls intercepted by the hooks to an
//!   analyzer.
//!
//! Each plugin is behind the cargo feature of the same name, both are part of
//! the default `full` feature.
//!
//! The `kestrel-replay` executable runs the sensor on a
//! [simulated platform](kestrel_core::platform::simulated) and feeds it a
//! JSON lines notification trace, see [`replay`].

use kestrel_core::pdk::PluginFactory;

pub mod cli;
pub mod replay;
pub mod sensor;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Plugins shipped with this build, in dispatch order.
pub fn plugins() -> Vec<PluginFactory> {
    [
        #[cfg(feature = "injector")]
        injector::plugin(),
        #[cfg(feature = "rpc-inspector")]
        rpc_inspector::plugin(),
    ]
    .into_iter()
    .collect()
}

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: log::Level) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let default_level = log::Level::Info;
        let level = if override_log_level > default_level {
            override_log_level
        } else {
            default_level
        };

        env_logger::builder()
            .filter_level(level.to_level_filter())
            .format_timestamp(None)
            .format_module_path(false)
            .init();
    }
}
