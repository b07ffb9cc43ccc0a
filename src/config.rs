use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub worker: Option<WorkerConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn worker(&self) -> WorkerConfig {
        self.worker.clone().unwrap_or_default()
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Amqp,
    Mqtt,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// AMQP only.
    pub vhost: Option<String>,
    /// MQTT only. Must differ between instances; generated per process
    /// when unset, which loses unacked messages across restarts.
    pub client_id: Option<String>,
    /// MQTT only. Shared subscription group that instances split the
    /// inbound topic across.
    pub share_group: Option<String>,
    /// MQTT only.
    pub keep_alive_seconds: Option<u64>,
}

impl BrokerConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.kind {
            BrokerKind::Amqp => 5672,
            BrokerKind::Mqtt => 1883,
        })
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct WorkerConfig {
    pub reconnect_delay_seconds: Option<u64>,
    pub requeue_malformed: Option<bool>,
}

impl WorkerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds.unwrap_or(5))
    }
}
