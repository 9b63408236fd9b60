use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs, io::ErrorKind, net::IpAddr, path::Path, time::Duration};
use tracing::info;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;
pub const MAX_KEEPALIVE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub routing: RoutingConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
}

/// Where sessions go once the first request line has been read.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Request path that selects the framed upstream.
    pub ws_path: String,
    pub framed: TargetConfig,
    pub raw: TargetConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Size of the first read and of each copy buffer, in bytes.
    pub buffer_size: usize,
    pub keepalive_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ws_path: "/ws/".to_string(),
            framed: TargetConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            raw: TargetConfig {
                host: "127.0.0.1".to_string(),
                port: 22,
            },
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 512 * 1024,
            keepalive_secs: 24 * 60 * 60,
        }
    }
}

impl ListenConfig {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl RelayConfig {
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).context("Failed to parse configuration as valid TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.routing.ws_path.is_empty() {
            bail!("routing.ws_path must not be empty");
        }
        if self.relay.buffer_size == 0 || self.relay.buffer_size > MAX_BUFFER_SIZE {
            bail!("relay.buffer_size must be between 1 and {MAX_BUFFER_SIZE} bytes");
        }
        if self.relay.keepalive_secs == 0 || self.relay.keepalive_secs > MAX_KEEPALIVE_SECS {
            bail!("relay.keepalive_secs must be between 1 and {MAX_KEEPALIVE_SECS}");
        }
        Ok(())
    }

    /// Names of upstreams that point back at the relay's own listening port on
    /// this host. Sessions routed there would loop through the relay.
    #[must_use]
    pub fn looping_targets(&self) -> Vec<&'static str> {
        [("framed", &self.routing.framed), ("raw", &self.routing.raw)]
            .into_iter()
            .filter(|(_, target)| target.port == self.listen.port && is_local_host(&target.host))
            .map(|(name, _)| name)
            .collect()
    }
}

fn is_local_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback() || ip.is_unspecified())
}

/// Loads the configuration file, falling back to built-in defaults when the
/// file does not exist. A file that exists but cannot be parsed is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    match fs::read_to_string(path) {
        Ok(content) => Config::from_toml(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(config_file = %path.display(), "Configuration file not found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read configuration file {}", path.display()))
        }
    }
}
