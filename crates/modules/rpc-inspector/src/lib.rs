//! Forwards the RPC calls intercepted by the user-mode hooks to an analyzer.
//!
//! The plugin keeps no state between messages: each [`UmHookMessage`] is
//! decoded and, when it carries an RPC call, handed to the configured
//! [`RpcAnalyzer`]. Port connection notices are only logged.
//!
//! The optional `interfaces` key of the `[rpc-inspector]` section restricts
//! forwarding to a comma separated list of interface GUIDs.
//!
//! [`UmHookMessage`]: kestrel_core::event::Payload::UmHookMessage

use std::sync::Arc;

use kestrel_core::{
    bus::EventBus,
    event::{Event, Payload},
    hook::{HookMessage, RPC_BUFFER_SIZE},
    pdk::{
        ConfigError, ModuleConfig, Plugin, PluginContext, PluginError, PluginFactory, PluginId,
        Version,
    },
};
use uguid::Guid;

pub const PLUGIN_NAME: &str = "rpc-inspector";
pub const PLUGIN_ID: PluginId = PluginId::from_raw(2);

/// Bytes of the call buffer shown by [`LogAnalyzer`].
const LOGGED_BYTES: usize = 32;

pub fn plugin() -> PluginFactory {
    plugin_with_analyzer(Arc::new(LogAnalyzer))
}

/// Same as [`plugin`], forwarding calls to `analyzer`.
pub fn plugin_with_analyzer(analyzer: Arc<dyn RpcAnalyzer>) -> PluginFactory {
    PluginFactory::new(
        PLUGIN_NAME,
        Version::parse(env!("CARGO_PKG_VERSION")).unwrap(),
        true,
        move |ctx: &PluginContext| RpcInspector::new(ctx, analyzer.clone()),
    )
}

/// An intercepted RPC call, borrowed from the hook message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcCall<'a> {
    pub buffer: &'a [u8],
    pub length: usize,
    pub interface_id: Guid,
    pub procedure_number: u64,
    pub transfer_syntax_flag: u64,
    /// The hook does not report which port carried the call.
    pub port_handle: Option<u64>,
}

pub trait RpcAnalyzer: Send + Sync {
    fn analyze(&self, call: &RpcCall<'_>) -> Result<(), PluginError>;
}

/// Logs every call at info level.
pub struct LogAnalyzer;

impl RpcAnalyzer for LogAnalyzer {
    fn analyze(&self, call: &RpcCall<'_>) -> Result<(), PluginError> {
        let shown = call.length.min(LOGGED_BYTES).min(call.buffer.len());
        log::info!(
            target: PLUGIN_NAME,
            "{} proc {} syntax {} [{}..]",
            call.interface_id,
            call.procedure_number,
            call.transfer_syntax_flag,
            hex::encode(&call.buffer[..shown])
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Forward only these interfaces, every interface when empty.
    pub interfaces: Vec<Guid>,
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            interfaces: config.get_list("interfaces")?,
        })
    }
}

pub struct RpcInspector {
    config: Config,
    analyzer: Arc<dyn RpcAnalyzer>,
}

impl RpcInspector {
    pub fn new(ctx: &PluginContext, analyzer: Arc<dyn RpcAnalyzer>) -> Result<Self, PluginError> {
        let config = Config::try_from(ctx.config())?;
        if !config.interfaces.is_empty() {
            log::debug!(
                target: ctx.plugin_name(),
                "forwarding {} interfaces",
                config.interfaces.len()
            );
        }
        Ok(Self { config, analyzer })
    }

    fn is_watched(&self, interface_id: &Guid) -> bool {
        self.config.interfaces.is_empty() || self.config.interfaces.contains(interface_id)
    }
}

impl Plugin for RpcInspector {
    fn id(&self) -> PluginId {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn on_event(&self, event: &Event<'_>, _bus: &EventBus) -> Result<(), PluginError> {
        let Payload::UmHookMessage { message } = event.payload() else {
            return Ok(());
        };

        match HookMessage::parse(message)? {
            HookMessage::PortConnected {
                port_name,
                port_handle,
            } => {
                log::debug!(
                    target: PLUGIN_NAME,
                    "port {} connected as {port_handle:#x}",
                    port_name.to_string_lossy()
                );
                Ok(())
            }
            HookMessage::RpcMessage {
                interface_id,
                procedure_number,
                transfer_syntax_flag,
                buffer,
            } => {
                if !self.is_watched(&interface_id) {
                    return Ok(());
                }
                self.analyzer.analyze(&RpcCall {
                    buffer,
                    length: RPC_BUFFER_SIZE,
                    interface_id,
                    procedure_number,
                    transfer_syntax_flag,
                    port_handle: None,
                })
            }
        }
    }
}
