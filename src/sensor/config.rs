use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result, bail};
use kestrel_core::pdk::ModuleConfig;

/// General configuration section for settings shared by all plugins.
pub const GENERAL_CONFIG: &str = "kestrel";

/// Backslashes are kept verbatim, values hold Windows paths.
fn parse_option() -> ini::ParseOption {
    ini::ParseOption {
        enabled_escape: false,
        ..Default::default()
    }
}

/// Sensor configuration, one [`ModuleConfig`] per `INI` section.
#[derive(Debug, Clone, Default)]
pub struct SensorConfig {
    configs: HashMap<String, ModuleConfig>,
}

impl SensorConfig {
    /// Construct a new [`SensorConfig`] from a configuration file.
    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        let conf = ini::Ini::load_from_file_opt(&config_file, parse_option())
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&conf))
    }

    /// Construct a new [`SensorConfig`] from `INI` text.
    pub fn from_ini_str(content: &str) -> Result<Self> {
        let conf = ini::Ini::load_from_str_opt(content, parse_option())
            .context("Error parsing configuration")?;
        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &ini::Ini) -> Self {
        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();
        for (section, prop) in conf {
            if let Some(section) = section {
                let plugin_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    plugin_config.insert(key.to_string(), value.to_string());
                }
            }
        }
        Self { configs }
    }

    /// Get a plugin configuration.
    pub fn get_module_config(&self, plugin: &str) -> Option<ModuleConfig> {
        self.configs.get(plugin).cloned()
    }

    pub fn general(&self) -> ModuleConfig {
        self.get_module_config(GENERAL_CONFIG).unwrap_or_default()
    }

    /// Whether `plugin` must be started.
    ///
    /// When the general section lists `enabled_plugins`, only those plugins
    /// run. Otherwise the `enabled` key of the plugin section decides, falling
    /// back to `enabled_by_default`.
    pub fn is_enabled(&self, plugin: &str, enabled_by_default: bool) -> Result<bool> {
        let allow_list: Vec<String> = self.general().get_list("enabled_plugins")?;
        if !allow_list.is_empty() {
            return Ok(allow_list.iter().any(|name| name == plugin));
        }
        let enabled = self
            .get_module_config(plugin)
            .unwrap_or_default()
            .with_default("enabled", enabled_by_default)
            .with_context(|| format!("Invalid configuration of plugin {plugin}"))?;
        Ok(enabled)
    }

    /// Update a plugin configuration value.
    pub fn set(&mut self, plugin: &str, key: &str, value: &str) {
        self.configs
            .entry(plugin.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r"
[kestrel]
enabled_plugins = injector, rpc-inspector

[injector]
dll_path_native = D:\hk\native.dll
enabled = true

[rpc-inspector]
enabled = nope
";

    #[test]
    fn sections_become_plugin_configs() {
        let config = SensorConfig::from_ini_str(CONFIG).unwrap();
        let injector = config.get_module_config("injector").unwrap();

        assert_eq!(injector.get_raw("dll_path_native"), Some(r"D:\hk\native.dll"));
        assert_eq!(injector.get_raw("enabled"), Some("true"));
        assert!(config.get_module_config("missing").is_none());
    }

    #[test]
    fn allow_list_wins() {
        let config = SensorConfig::from_ini_str(CONFIG).unwrap();

        assert!(config.is_enabled("injector", false).unwrap());
        assert!(config.is_enabled("rpc-inspector", false).unwrap());
        assert!(!config.is_enabled("event-printer", true).unwrap());
    }

    #[test]
    fn enabled_key() {
        let mut config = SensorConfig::default();
        assert!(config.is_enabled("injector", true).unwrap());

        config.set("injector", "enabled", "false");
        assert!(!config.is_enabled("injector", true).unwrap());

        config.set("injector", "enabled", "nope");
        assert!(config.is_enabled("injector", true).is_err());
    }

    #[test]
    fn file_values_keep_backslashes() {
        let path = std::env::temp_dir().join(format!("kestrel-{}.ini", std::process::id()));
        std::fs::write(&path, "[injector]\ndll_path_wow64 = C:\\Windows\\SysWOW64\\nthook.dll\n")
            .unwrap();

        let config = SensorConfig::with_custom_file(path.to_str().unwrap());
        std::fs::remove_file(&path).unwrap();

        let injector = config.unwrap().get_module_config("injector").unwrap();
        assert_eq!(
            injector.get_raw("dll_path_wow64"),
            Some(r"C:\Windows\SysWOW64\nthook.dll")
        );
    }

    #[test]
    fn missing_file() {
        assert!(SensorConfig::with_custom_file("/nonexistent/kestrel.ini").is_err());
    }
}
