//! This module includes all the necessary to build plugins for Kestrel
//!
//! Plugins implement the [`Plugin`] trait:
//! - a stable [`PluginId`] and a name, used as logging target
//! - `on_event`, invoked synchronously for every event broadcast on the bus
//! - an optional `shutdown` hook, run when the sensor stops
//!
//! Plugins are not built directly by the sensor: a [`PluginFactory`] bundles
//! the plugin name, its [`PluginDetails`] and the receipe to build it from a
//! [`PluginContext`], which carries the plugin configuration section, the
//! [`Platform`](crate::platform::Platform) oracles and the shared
//! [`ProcessCache`](process_cache::ProcessCache).
//!
//! # Example
//!
//! In this example, a plugin prints the pid of every process that terminates.
//!
//! ```
//! use kestrel_core::bus::EventBus;
//! use kestrel_core::event::{Event, Payload};
//! use kestrel_core::pdk::{Plugin, PluginError, PluginFactory, PluginId, Version};
//!
//! pub struct PrintExits;
//!
//! impl Plugin for PrintExits {
//!     fn id(&self) -> PluginId {
//!         PluginId::from_raw(100)
//!     }
//!
//!     fn name(&self) -> &str {
//!         "print-exits"
//!     }
//!
//!     fn on_event(&self, event: &Event<'_>, _bus: &EventBus) -> Result<(), PluginError> {
//!         if let Payload::ProcessTerminate { pid } = event.payload() {
//!             println!("process {pid} terminated");
//!         }
//!         Ok(())
//!     }
//! }
//!
//! pub fn plugin() -> PluginFactory {
//!     PluginFactory::new("print-exits", Version::new(0, 1, 0), true, |_ctx| Ok(PrintExits))
//! }
//! ```

mod config;
mod plugin;
pub mod process_cache;

pub use config::*;
pub use plugin::*;
pub use semver::Version;
