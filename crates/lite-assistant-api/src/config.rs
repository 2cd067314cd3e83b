//! Server configuration from the environment

use mqtt_protocol::MqttConfig;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Everything the server needs at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub data_dir: PathBuf,
    pub listen_addr: SocketAddr,
}

impl AppConfig {
    /// Read `DATA_DIR`, `LISTEN_ADDR` and the `MQTT_*` variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok(), MqttConfig::from_env())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>, mqtt: MqttConfig) -> anyhow::Result<Self> {
        let var = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        let data_dir = PathBuf::from(var("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into()));
        let listen_addr = var("LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.into())
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid LISTEN_ADDR: {e}"))?;

        Ok(Self {
            mqtt,
            data_dir,
            listen_addr,
        })
    }

    pub fn devices_path(&self) -> PathBuf {
        self.data_dir.join("devices.json")
    }

    pub fn automations_path(&self) -> PathBuf {
        self.data_dir.join("automations.json")
    }

    pub fn schedules_path(&self) -> PathBuf {
        self.data_dir.join("schedules.json")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.data_dir.join("automation_logs.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AppConfig::from_vars(|name| vars.get(name).cloned(), MqttConfig::default())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.listen_addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.logs_path(), PathBuf::from("./data/automation_logs.jsonl"));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[("DATA_DIR", "/var/lib/lite"), ("LISTEN_ADDR", "127.0.0.1:8080")]).unwrap();
        assert_eq!(config.schedules_path(), PathBuf::from("/var/lib/lite/schedules.json"));
        assert_eq!(config.listen_addr.port(), 8080);
    }

    #[test]
    fn test_blank_values_fall_back() {
        let config = config(&[("DATA_DIR", "  ")]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
    }

    #[test]
    fn test_invalid_listen_addr() {
        assert!(config(&[("LISTEN_ADDR", "not-an-address")]).is_err());
    }
}
