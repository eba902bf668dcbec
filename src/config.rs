//! Server configuration, stored as JSON.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::engine::NatConfig;
use crate::error::ConfigError;
use crate::policy::{AllowList, OriginPolicy, Permissive};
use crate::session::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_TIMEOUT, SessionLimits};

pub const DEFAULT_CONFIG_PATH: &str = "etc/config.json";
pub const DEFAULT_LISTEN_PORT: u16 = 52611;
pub const DEFAULT_SIGNALING_PATH: &str = "/ws";
pub const PUBLIC_IP_ENV: &str = "PUBLIC_IP";

pub const DEFAULT_STUN_SERVERS: [&str; 4] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun.sipgate.net:3478",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_port: u16,

    /// Public address for NAT 1:1 mapping on cloud hosts. Empty means none.
    #[serde(deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<IpAddr>,

    /// UDP port range for peers; 0 means OS-assigned.
    pub udp_port_min: u16,
    pub udp_port_max: u16,

    /// Local address peer sockets bind to. Detected when absent.
    #[serde(deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<IpAddr>,

    pub stun_servers: Vec<String>,

    pub ice_lite: bool,

    /// When set, only these origins may open a signaling connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,

    pub signaling_path: String,

    pub read_timeout_secs: u64,

    pub max_message_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            public_ip: None,
            udp_port_min: 0,
            udp_port_max: 0,
            bind_ip: None,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            ice_lite: false,
            allowed_origins: None,
            signaling_path: DEFAULT_SIGNALING_PATH.to_string(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT.as_secs(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<IpAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(ip) => ip.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

impl Config {
    /// Load `path`, writing a default config there first if it is missing.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();

        if !path.exists() {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                    path: shown.clone(),
                    source,
                })?;
            }
            let config = Self::default();
            let data = serde_json::to_string_pretty(&config)?;
            std::fs::write(path, data).map_err(|source| ConfigError::Write {
                path: shown.clone(),
                source,
            })?;
            info!(path = %shown, "Default config file created");
            return Ok(config);
        }

        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown,
            source,
        })?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill `public_ip` from the `PUBLIC_IP` environment variable when the
    /// file left it empty.
    pub fn with_env_public_ip(self) -> Result<Self, ConfigError> {
        self.with_public_ip_fallback(std::env::var(PUBLIC_IP_ENV).ok().as_deref())
    }

    fn with_public_ip_fallback(mut self, raw: Option<&str>) -> Result<Self, ConfigError> {
        if self.public_ip.is_none()
            && let Some(raw) = raw.map(str::trim)
            && !raw.is_empty()
        {
            let ip = raw
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("{PUBLIC_IP_ENV}={raw}: {e}")))?;
            self.public_ip = Some(ip);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.signaling_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "signaling_path must start with '/': {}",
                self.signaling_path
            )));
        }
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("read_timeout_secs must be positive".into()));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid("max_message_bytes must be positive".into()));
        }
        Ok(())
    }

    /// The UDP port range, if both ends are set and ordered.
    pub fn udp_port_range(&self) -> Option<(u16, u16)> {
        match (self.udp_port_min, self.udp_port_max) {
            (0, 0) => None,
            (min, max) if min > 0 && max >= min => Some((min, max)),
            (min, max) => {
                warn!(min, max, "Ignoring invalid UDP port range, using random ports");
                None
            }
        }
    }

    pub fn nat_config(&self) -> NatConfig {
        NatConfig {
            public_ip: self.public_ip,
            udp_port_range: self.udp_port_range(),
        }
    }

    /// STUN servers to query; empty when a direct mapping makes them unnecessary.
    pub fn effective_stun_servers(&self) -> Vec<String> {
        if self.nat_config().direct_mapping() {
            Vec::new()
        } else {
            self.stun_servers.clone()
        }
    }

    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_message_size: self.max_message_bytes,
        }
    }

    pub fn origin_policy(&self) -> Arc<dyn OriginPolicy> {
        match &self.allowed_origins {
            Some(origins) => Arc::new(AllowList::new(origins.iter().cloned())),
            None => Arc::new(Permissive),
        }
    }
}
