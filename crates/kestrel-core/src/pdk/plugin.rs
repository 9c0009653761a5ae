use std::{borrow::Cow, fmt, ops::Deref, sync::Arc};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{bus::EventBus, event::Event, platform::Platform};

use super::{ModuleConfig, process_cache::ProcessCache};

pub type PluginError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable numeric identity of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId(u32);

impl PluginId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Consumer of the events broadcast by the [`EventBus`].
///
/// `on_event` runs synchronously on whatever thread raised the notification,
/// possibly concurrently with other invocations, so plugins keep their state
/// behind their own synchronization. A plugin must not hold one of its locks
/// while dispatching further events on `bus`.
pub trait Plugin: Send + Sync {
    fn id(&self) -> PluginId;

    fn name(&self) -> &str;

    fn on_event(&self, event: &Event<'_>, bus: &EventBus) -> Result<(), PluginError>;

    /// Called once when the sensor stops, in reverse registration order.
    fn shutdown(&self) {}
}

pub type PluginSetupFn =
    dyn Fn(&PluginContext) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync;

/// Contains informations to identify a plugin and the receipe to build it.
pub struct PluginFactory {
    pub name: PluginName,
    pub info: PluginDetails,
    pub setup_fn: Box<PluginSetupFn>,
}

impl PluginFactory {
    /// Constucts a new [`PluginFactory`].
    pub fn new<N, F, P>(name: N, version: Version, enabled_by_default: bool, setup_fn: F) -> Self
    where
        N: Into<PluginName>,
        F: Fn(&PluginContext) -> Result<P, PluginError>,
        F: Send + Sync + 'static,
        P: Plugin + 'static,
    {
        Self {
            name: name.into(),
            info: PluginDetails {
                version,
                enabled_by_default,
            },
            setup_fn: Box::new(move |ctx| {
                let plugin = setup_fn(ctx)?;
                Ok(Arc::new(plugin) as Arc<dyn Plugin>)
            }),
        }
    }

    pub fn setup(&self, ctx: &PluginContext) -> Result<Arc<dyn Plugin>, PluginError> {
        (self.setup_fn)(ctx)
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory")
            .field("name", &self.name)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Hash)]
pub struct PluginName(Cow<'static, str>);

impl Deref for PluginName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&'static str> for PluginName {
    fn from(val: &'static str) -> PluginName {
        PluginName(Cow::Borrowed(val))
    }
}

impl From<String> for PluginName {
    fn from(val: String) -> PluginName {
        PluginName(Cow::Owned(val))
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contains plugin informations
#[derive(Debug, Clone)]
pub struct PluginDetails {
    pub version: Version,
    pub enabled_by_default: bool,
}

/// Everything a plugin gets at construction time.
#[derive(Clone)]
pub struct PluginContext {
    plugin_name: PluginName,
    config: ModuleConfig,
    platform: Arc<dyn Platform>,
    process_cache: ProcessCache,
}

impl PluginContext {
    pub fn new(
        plugin_name: PluginName,
        config: ModuleConfig,
        platform: Arc<dyn Platform>,
        process_cache: ProcessCache,
    ) -> Self {
        Self {
            plugin_name,
            config,
            platform,
            process_cache,
        }
    }

    /// Returns the plugin name
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn platform(&self) -> Arc<dyn Platform> {
        self.platform.clone()
    }

    pub fn process_cache(&self) -> ProcessCache {
        self.process_cache.clone()
    }
}
