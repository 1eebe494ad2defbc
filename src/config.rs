use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{parse_duration, Address, Listener, Protocol};

/// Main configuration structure, loaded from YAML.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub etcd: EtcdConfig,
    pub logging: LoggingConfig,
    pub stats: StatsConfig,
    /// Base64 key used to open sealed TLS material from the store.
    pub seal_key: String,
}

/// Front-side server knobs shared by all listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address hosts without listeners are served on, e.g. `localhost:8181`.
    pub default_listener: Option<DefaultListenerConfig>,
    pub read_timeout: String,
    pub write_timeout: String,
    pub max_header_bytes: usize,
    /// How long a graceful stop waits for in-flight requests.
    pub drain_timeout: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_listener: None,
            read_timeout: "60s".into(),
            write_timeout: "60s".into(),
            max_header_bytes: 1 << 20,
            drain_timeout: "10s".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DefaultListenerConfig {
    pub protocol: Protocol,
    pub address: String,
}

impl Default for DefaultListenerConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http,
            address: "localhost:8181".into(),
        }
    }
}

impl DefaultListenerConfig {
    pub fn to_listener(&self) -> Listener {
        Listener::new("default", self.protocol, Address::tcp(self.address.clone()))
    }
}

/// Per-endpoint forwarding defaults, overridable per location.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub endpoint_dial_timeout: String,
    pub endpoint_read_timeout: String,
    /// Request bodies up to this size are staged in memory; the remainder
    /// spills to a temporary file.
    pub max_mem_body_bytes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint_dial_timeout: "5s".into(),
            endpoint_read_timeout: "50s".into(),
            max_mem_body_bytes: 4 << 20,
        }
    }
}

/// Connection parameters for the configuration store. The store client
/// itself lives outside this process's core; only its wiring is configured
/// here.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub key_prefix: String,
    pub consistency: EtcdConsistency,
    pub sync_interval: String,
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".into()],
            key_prefix: "muxd".into(),
            consistency: EtcdConsistency::Strong,
            sync_interval: "5s".into(),
            ca_file: None,
            cert_file: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EtcdConsistency {
    Strong,
    Weak,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub sink: LogSink,
    pub severity: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            sink: LogSink::Console,
            severity: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    Console,
    Json,
    Syslog,
    Logstash,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsConfig {
    pub prefix: String,
    pub address: Option<String>,
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: Config =
            serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks durations parse and warns about timeout combinations that
    /// starve the forwarder, mirroring the classic dial+read vs write check.
    pub fn validate(&self) -> Result<()> {
        parse_duration(&self.server.read_timeout)?;
        let write = parse_duration(&self.server.write_timeout)?;
        let dial = parse_duration(&self.engine.endpoint_dial_timeout)?;
        let endpoint_read = parse_duration(&self.engine.endpoint_read_timeout)?;
        parse_duration(&self.server.drain_timeout)?;
        parse_duration(&self.etcd.sync_interval)?;

        if dial + endpoint_read >= write {
            warn!(
                server_write = ?write,
                endpoint_dial = ?dial,
                endpoint_read = ?endpoint_read,
                "server write timeout should exceed endpoint dial + read timeouts"
            );
        }
        Ok(())
    }

    pub fn endpoint_dial_timeout(&self) -> Duration {
        parse_duration(&self.engine.endpoint_dial_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn endpoint_read_timeout(&self) -> Duration {
        parse_duration(&self.engine.endpoint_read_timeout).unwrap_or(Duration::from_secs(50))
    }

    pub fn drain_timeout(&self) -> Duration {
        parse_duration(&self.server.drain_timeout).unwrap_or(Duration::from_secs(10))
    }
}
