use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    4711
}

fn default_device_type() -> String {
    "EnergyManagementSystem".to_string()
}

/// Static identity and transport settings of the local SHIP node.
///
/// Everything here ends up either in the mDNS announcement or in the
/// websocket server setup; certificates are handled separately via
/// [`crate::cert::DeviceCertificate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The SHIP ID of this node, announced as the `id` TXT key and
    /// reported to peers during the ACCESS phase.
    pub identifier: String,
    /// mDNS service instance name. Falls back to `identifier` when empty.
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// TCP port of the websocket server.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whether remote pairing requests are accepted without user
    /// interaction; announced as the `register` TXT key.
    #[serde(default)]
    pub register: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            service_name: String::new(),
            brand: String::new(),
            model: String::new(),
            device_type: default_device_type(),
            port: default_port(),
            register: false,
        }
    }
}

impl Config {
    /// Load a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&raw).context("parsing config file")?;
        Ok(config)
    }

    /// The mDNS instance name to announce.
    pub fn instance_name(&self) -> &str {
        if self.service_name.is_empty() {
            &self.identifier
        } else {
            &self.service_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg: Config = toml::from_str(r#"identifier = "Demo-EVSE-123456""#).unwrap();
        assert_eq!(cfg.identifier, "Demo-EVSE-123456");
        assert_eq!(cfg.port, 4711);
        assert!(!cfg.register);
        assert_eq!(cfg.instance_name(), "Demo-EVSE-123456");
    }

    #[test]
    fn service_name_overrides_instance_name() {
        let cfg = Config {
            identifier: "Demo-EVSE-123456".into(),
            service_name: "Demo".into(),
            ..Config::default()
        };
        assert_eq!(cfg.instance_name(), "Demo");
    }
}
