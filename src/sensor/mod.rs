//! The sensor context: owns the bus, the plugins and the process cache, and
//! exposes one entry point per notification source.
//!
//! ```text
//! notification source ──> Sensor::on_* ──> Event ──> EventBus::dispatch ──> plugins
//! ```
//!
//! Process creations are visible in the [`ProcessCache`] before the event is
//! broadcast and stay there until the terminate event has been delivered.

use std::{
    collections::TryReserveError,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use kestrel_core::{
    bus::{DispatchStatus, EventBus},
    event::{Architecture, Event, EventError, EventId, ImageInfo, Pid, Tid},
    hook::{HookError, HookHeader},
    pdk::{
        PluginContext, PluginFactory,
        process_cache::{ProcessCache, ProcessInfo},
    },
    platform::Platform,
};
use thiserror::Error;
use widestring::{U16Str, U16String};

mod barrier;
mod config;

pub use barrier::{Phase, StartupBarrier};
pub use config::{GENERAL_CONFIG, SensorConfig};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("hook message rejected: {0}")]
    Hook(#[from] HookError),
    #[error("sensor stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorStats {
    /// Events broadcast on the bus.
    pub dispatched: u64,
    /// Notifications dropped because their event could not be built.
    pub construction_failures: u64,
    /// Hook messages failing header validation.
    pub rejected_hook_messages: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    construction_failures: AtomicU64,
    rejected_hook_messages: AtomicU64,
}

pub struct Sensor {
    bus: EventBus,
    platform: Arc<dyn Platform>,
    process_cache: ProcessCache,
    barrier: StartupBarrier,
    counters: Counters,
}

impl Sensor {
    /// Builds the enabled plugins, in the given order, and the bus.
    ///
    /// Notifications are accepted once [`Sensor::arm`] is called.
    pub fn start(
        config: &SensorConfig,
        platform: Arc<dyn Platform>,
        factories: Vec<PluginFactory>,
    ) -> Result<Self> {
        let process_cache = ProcessCache::new();
        let mut builder = EventBus::builder();

        for factory in factories {
            let name = factory.name.clone();
            if !config.is_enabled(&name, factory.info.enabled_by_default)? {
                log::info!("Plugin {name} disabled");
                continue;
            }

            let ctx = PluginContext::new(
                name.clone(),
                config.get_module_config(&name).unwrap_or_default(),
                platform.clone(),
                process_cache.clone(),
            );
            let plugin = factory
                .setup(&ctx)
                .map_err(|err| anyhow::anyhow!(err))
                .with_context(|| format!("Error starting plugin {name}"))?;
            builder.register(plugin)?;
            log::info!("Starting plugin {name} v{}", factory.info.version);
        }

        Ok(Self {
            bus: builder.build(),
            platform,
            process_cache,
            barrier: StartupBarrier::new(),
            counters: Counters::default(),
        })
    }

    /// Opens the startup barrier: every notification source is registered.
    pub fn arm(&self) {
        self.barrier.arm();
        log::debug!("sensor armed with {} plugins", self.bus.len());
    }

    /// Stops accepting notifications and shuts the plugins down. Only the
    /// first call has an effect.
    pub fn stop(&self) {
        if self.barrier.stop() != Phase::Stopped {
            log::info!("Stopping sensor");
            self.bus.shutdown();
        }
    }

    pub fn phase(&self) -> Phase {
        self.barrier.phase()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn process_cache(&self) -> &ProcessCache {
        &self.process_cache
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn stats(&self) -> SensorStats {
        SensorStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            construction_failures: self.counters.construction_failures.load(Ordering::Relaxed),
            rejected_hook_messages: self.counters.rejected_hook_messages.load(Ordering::Relaxed),
        }
    }

    pub fn on_process_create(
        &self,
        pid: Pid,
        parent_pid: Pid,
        architecture: Architecture,
        process_path: &[u16],
    ) -> Result<DispatchStatus, NotifyError> {
        self.ensure_running()?;
        let event = Event::process_create(pid, parent_pid, architecture, process_path)
            .map_err(|err| self.construction_failed(err))?;

        let image = event
            .process_path()
            .map_or(Ok(U16String::new()), try_to_owned)
            .map_err(|_| {
                self.construction_failed(EventError::InsufficientResources(EventId::ProcessCreate))
            })?;
        self.process_cache.insert(
            pid,
            ProcessInfo {
                ppid: parent_pid,
                image,
                architecture,
                wow64: self.platform.is_wow64(pid),
                create_time: event.timestamp(),
            },
        );
        Ok(self.dispatch(&event))
    }

    pub fn on_process_terminate(&self, pid: Pid) -> Result<DispatchStatus, NotifyError> {
        self.ensure_running()?;
        let status = self.dispatch(&Event::process_terminate(pid));
        self.process_cache.remove(pid);
        Ok(status)
    }

    pub fn on_image_load(
        &self,
        pid: Pid,
        image_path: &[u16],
        image: ImageInfo,
    ) -> Result<DispatchStatus, NotifyError> {
        self.ensure_running()?;
        let event =
            Event::image_load(pid, image_path, image).map_err(|err| self.construction_failed(err))?;
        Ok(self.dispatch(&event))
    }

    /// Blocks until the sensor is armed.
    pub fn on_thread_create(&self, pid: Pid, tid: Tid) -> Result<DispatchStatus, NotifyError> {
        if !self.barrier.wait() {
            return Err(NotifyError::Stopped);
        }
        Ok(self.dispatch(&Event::thread_create(pid, tid)))
    }

    /// Blocks until the sensor is armed.
    pub fn on_thread_terminate(&self, pid: Pid, tid: Tid) -> Result<DispatchStatus, NotifyError> {
        if !self.barrier.wait() {
            return Err(NotifyError::Stopped);
        }
        Ok(self.dispatch(&Event::thread_terminate(pid, tid)))
    }

    /// Broadcasts a user-mode hook message. Messages with an invalid header
    /// are dropped before any plugin sees them.
    pub fn on_um_hook_message(&self, message: &[u8]) -> Result<DispatchStatus, NotifyError> {
        self.ensure_running()?;
        if let Err(err) = HookHeader::parse(message) {
            self.counters
                .rejected_hook_messages
                .fetch_add(1, Ordering::Relaxed);
            log::debug!("dropping hook message: {err}");
            return Err(err.into());
        }
        Ok(self.dispatch(&Event::um_hook_message(message)))
    }

    fn ensure_running(&self) -> Result<(), NotifyError> {
        match self.barrier.phase() {
            Phase::Stopped => Err(NotifyError::Stopped),
            Phase::Starting | Phase::Armed => Ok(()),
        }
    }

    fn construction_failed(&self, err: EventError) -> NotifyError {
        self.counters
            .construction_failures
            .fetch_add(1, Ordering::Relaxed);
        log::warn!("{err}");
        err.into()
    }

    fn dispatch(&self, event: &Event<'_>) -> DispatchStatus {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.bus.dispatch(event)
    }
}

/// Copies the event's path for the cache without aborting on allocation failure.
fn try_to_owned(path: &U16Str) -> Result<U16String, TryReserveError> {
    let mut units = Vec::new();
    units.try_reserve_exact(path.len())?;
    units.extend_from_slice(path.as_slice());
    Ok(U16String::from_vec(units))
}

impl Drop for Sensor {
    fn drop(&mut self) {
        self.stop();
    }
}
