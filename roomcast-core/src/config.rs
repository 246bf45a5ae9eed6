use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub webrtc: WebRtcConfig,
    pub rooms: RoomsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Largest accepted WebSocket message, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// ICE and UDP settings for server-side peer connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs offered to the ICE agent
    pub stun_servers: Vec<String>,
    /// UDP port range for media (both 0 = ephemeral)
    pub udp_port_min: u16,
    pub udp_port_max: u16,
    /// Public IPs announced in host candidates when running behind NAT
    pub nat_1to1_ips: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            udp_port_min: 0,
            udp_port_max: 0,
            nat_1to1_ips: Vec::new(),
        }
    }
}

/// Room coordination tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    pub keyframe_interval_ms: u64,
    pub max_sync_attempts: usize,
    pub retry_delay_ms: u64,
    pub disconnect_grace_secs: u64,
    /// 0 = unlimited
    pub max_rooms: usize,
    /// 0 = unlimited
    pub max_participants_per_room: usize,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            keyframe_interval_ms: 1000,
            max_sync_attempts: 25,
            retry_delay_ms: 3000,
            disconnect_grace_secs: 20,
            max_rooms: 0,
            max_participants_per_room: 0,
        }
    }
}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "warning", "error"];

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMCAST__SERVER__HTTP_PORT=9000, ROOMCAST__WEBRTC__STUN_SERVERS=a,b
        builder = builder.add_source(
            Environment::with_prefix("ROOMCAST")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("webrtc.stun_servers")
                .with_list_parse_key("webrtc.nat_1to1_ips"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the loaded values, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.http_port == 0 {
            errors.push("server.http_port must not be 0".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be positive".to_string());
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            errors.push(format!("logging.level '{}' is not a known level", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        let webrtc = &self.webrtc;
        if webrtc.udp_port_min > webrtc.udp_port_max {
            errors.push(format!(
                "webrtc.udp_port_min ({}) exceeds webrtc.udp_port_max ({})",
                webrtc.udp_port_min, webrtc.udp_port_max
            ));
        }
        if (webrtc.udp_port_min == 0) != (webrtc.udp_port_max == 0) {
            errors.push("webrtc.udp_port_min and webrtc.udp_port_max must be set together".to_string());
        }
        for url in &webrtc.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                errors.push(format!("webrtc.stun_servers entry '{url}' is not a stun: URL"));
            }
        }
        for ip in &webrtc.nat_1to1_ips {
            if ip.parse::<std::net::IpAddr>().is_err() {
                errors.push(format!("webrtc.nat_1to1_ips entry '{ip}' is not an IP address"));
            }
        }

        let rooms = &self.rooms;
        if !(1000..=3000).contains(&rooms.keyframe_interval_ms) {
            errors.push(format!(
                "rooms.keyframe_interval_ms must be between 1000 and 3000, got {}",
                rooms.keyframe_interval_ms
            ));
        }
        if rooms.max_sync_attempts == 0 {
            errors.push("rooms.max_sync_attempts must be positive".to_string());
        }
        if rooms.retry_delay_ms == 0 {
            errors.push("rooms.retry_delay_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}
