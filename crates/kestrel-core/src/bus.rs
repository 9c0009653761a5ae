use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use thiserror::Error;

use crate::{
    event::Event,
    pdk::{Plugin, PluginId},
};

/// Broadcasts events to the registered plugins.
///
/// The plugin list is fixed when the bus is built: registration only exists on
/// [`EventBusBuilder`], so the list is read-only by the time any notification
/// source can reach [`EventBus::dispatch`] and needs no lock.
pub struct EventBus {
    plugins: Box<[Arc<dyn Plugin>]>,
}

/// Describes a bus error.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    #[error("plugin id {0} registered twice ({1})")]
    DuplicatePlugin(PluginId, String),
}

/// Outcome of a single broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStatus {
    /// Plugins which handled the event.
    pub delivered: usize,
    /// Plugins which returned an error or panicked.
    pub failed: usize,
}

impl DispatchStatus {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Default)]
pub struct EventBusBuilder {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `plugin`; registration order is dispatch order.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<&mut Self, BusError> {
        if self.plugins.iter().any(|p| p.id() == plugin.id()) {
            return Err(BusError::DuplicatePlugin(
                plugin.id(),
                plugin.name().to_string(),
            ));
        }
        log::debug!("registered plugin {} {}", plugin.name(), plugin.id());
        self.plugins.push(plugin);
        Ok(self)
    }

    pub fn build(self) -> EventBus {
        EventBus {
            plugins: self.plugins.into_boxed_slice(),
        }
    }
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Delivers `event` to every plugin, in registration order, on the calling
    /// thread.
    ///
    /// A plugin returning an error or panicking is logged and skipped, the
    /// remaining plugins still receive the event.
    pub fn dispatch(&self, event: &Event<'_>) -> DispatchStatus {
        log::trace!(target: "event", "{event}");

        let mut status = DispatchStatus::default();
        for plugin in self.plugins.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| plugin.on_event(event, self))) {
                Ok(Ok(())) => status.delivered += 1,
                Ok(Err(err)) => {
                    status.failed += 1;
                    log::warn!(
                        target: plugin.name(),
                        "failed handling {} event: {err}",
                        event.id()
                    );
                }
                Err(panic) => {
                    status.failed += 1;
                    log::error!(
                        target: plugin.name(),
                        "panicked handling {} event: {}",
                        event.id(),
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        status
    }

    /// Registered plugins, in dispatch order.
    pub fn plugins(&self) -> impl Iterator<Item = (PluginId, &str)> {
        self.plugins.iter().map(|p| (p.id(), p.name()))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Runs the plugins shutdown hooks, last registered first.
    pub fn shutdown(&self) {
        for plugin in self.plugins.iter().rev() {
            log::debug!("shutting down plugin {}", plugin.name());
            if panic::catch_unwind(AssertUnwindSafe(|| plugin.shutdown())).is_err() {
                log::error!(target: plugin.name(), "panicked during shutdown");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
