use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// Host-scheduler parameters, passed through to the dataplane substrate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostSchedConfig {
    pub max_cores: u32,
    #[serde(default)]
    pub guaranteed_cores: u32,
    #[serde(default)]
    pub spinning_cores: u32,
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_interface() -> String {
    "eth0".to_string()
}

impl Default for HostSchedConfig {
    fn default() -> HostSchedConfig {
        HostSchedConfig {
            max_cores: 4,
            guaranteed_cores: 0,
            spinning_cores: 0,
            interface: default_interface(),
        }
    }
}

/// Per-process bootstrap configuration, loaded from the JSON file named on
/// the command line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// "ip:port" of the controller.
    pub controller: String,
    /// Listen port of the proclet server; 0 picks an ephemeral port.
    #[serde(default)]
    pub rpc_port: u16,
    /// Listen port of the migration loader; 0 picks an ephemeral port.
    #[serde(default)]
    pub migrator_port: u16,
    #[serde(default)]
    pub host: HostSchedConfig,
    /// Path of the shared region the host scheduler publishes pressure
    /// through; absent means an in-process region (tests, single host).
    #[serde(default)]
    pub pressure_shm: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let cfg: Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        if cfg.host.max_cores == 0 {
            return Err(Error::Config("host.max_cores must be non-zero".into()));
        }
        Ok(cfg)
    }

    pub fn controller_addr(&self) -> Result<SocketAddr> {
        self.controller
            .to_socket_addrs()
            .map_err(|e| Error::Config(format!("bad controller address: {}", e)))?
            .next()
            .ok_or_else(|| Error::Config("controller address resolves to nothing".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg: Config = serde_json::from_str(
            r#"{ "controller": "127.0.0.1:9500", "host": { "max_cores": 8 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.rpc_port, 0);
        assert_eq!(cfg.host.max_cores, 8);
        assert_eq!(cfg.host.interface, "eth0");
        assert!(cfg.pressure_shm.is_none());
        assert_eq!(
            cfg.controller_addr().unwrap(),
            "127.0.0.1:9500".parse().unwrap()
        );
    }

    #[test]
    fn zero_cores_is_a_config_error() {
        let text = r#"{ "controller": "127.0.0.1:9500", "host": { "max_cores": 0 } }"#;
        let cfg: Config = serde_json::from_str(text).unwrap();
        assert_eq!(cfg.host.max_cores, 0);
        let dir = std::env::temp_dir().join("drift-config-test.json");
        std::fs::write(&dir, text).unwrap();
        assert!(Config::load(&dir).is_err());
        std::fs::remove_file(&dir).ok();
    }
}
