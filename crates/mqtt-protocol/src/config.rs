//! Broker connection settings

use serde::Deserialize;

/// Topics every Tasmota install publishes on
pub const TASMOTA_TOPICS: &[&str] = &[
    "tele/+/LWT",
    "stat/+/STATUS0",
    "tele/+/STATE",
    "tele/+/SENSOR",
    "stat/+/RESULT",
    "tasmota/discovery/#",
    "tasmota/+/tele/SENSOR",
    "tasmota/+/tele/STATE",
    "tasmota/+/stat/RESULT",
];

/// Configuration for the MQTT connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker hostname or IP address
    pub broker_host: String,
    /// Broker port
    pub broker_port: u16,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Client identifier
    pub client_id: String,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u16,
    /// Extra subscription patterns on top of the Tasmota set
    pub custom_topics: Vec<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            username: None,
            password: None,
            client_id: "lite-assistant".to_string(),
            keep_alive_secs: 30,
            custom_topics: Vec::new(),
        }
    }
}

impl MqttConfig {
    /// Build a config from `MQTT_*` environment variables, falling back
    /// to defaults for anything unset or unparsable
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        Self {
            broker_host: var("MQTT_HOST").unwrap_or(defaults.broker_host),
            broker_port: var("MQTT_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.broker_port),
            username: var("MQTT_USERNAME"),
            password: var("MQTT_PASSWORD"),
            client_id: var("MQTT_CLIENT_ID").unwrap_or(defaults.client_id),
            keep_alive_secs: var("MQTT_KEEP_ALIVE_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.keep_alive_secs),
            custom_topics: var("MQTT_CUSTOM_TOPICS")
                .map(|v| parse_topic_list(&v))
                .unwrap_or_default(),
        }
    }

    /// All patterns to subscribe to
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = TASMOTA_TOPICS.iter().map(|t| (*t).to_string()).collect();
        for topic in &self.custom_topics {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        topics
    }
}

fn parse_topic_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
