//! # Configuration Management
//!
//! Loads and manages application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_BACKEND_PORT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! Defaults mirror the reference deployment: the web app on 8010, the speech
//! backend on 8998 behind self-signed TLS, 100 ms capture chunks, a 4 s
//! reconnect delay and a 600 ms text debounce.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub text: TextConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech backend address, resolved once at proxy startup.
///
/// The backend is treated as a black-box peer: it sends a zero-payload
/// `Ready` frame once warmed up, then streams audio and text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend host (the moshi-style speech server)
    pub host: String,

    /// Backend port
    pub port: u16,

    /// `ws` or `wss` (the reference backend serves self-signed `wss`)
    pub scheme: String,

    /// WebSocket path on the backend
    pub path: String,

    /// Bound on the backend connect attempt, so a hung backend can never
    /// leave a browser socket half-open forever
    pub connect_timeout_ms: u64,
}

impl BackendConfig {
    /// Resolve the backend URL for one relayed connection, forwarding the
    /// inbound query string (voice/persona selectors) verbatim.
    pub fn url_with_query(&self, query: &str) -> String {
        let mut url = format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Session/reconnect policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Fixed delay before the single reconnect attempt after an abnormal
    /// close. No exponential growth: the delay is reissued as-is on every
    /// abnormal close.
    pub reconnect_delay_ms: u64,
}

/// Client audio pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Capture chunk interval in milliseconds
    pub capture_chunk_ms: u64,

    /// Sample rate of the playback stream in Hz
    pub sample_rate: u32,

    /// Number of audio channels
    pub channels: u8,

    /// Bit depth of PCM payloads
    pub bit_depth: u8,
}

/// Text aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextConfig {
    /// Inactivity window before the token buffer flushes as one utterance
    pub debounce_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8010,
            },
            backend: BackendConfig {
                host: "127.0.0.1".to_string(),
                port: 8998,
                scheme: "wss".to_string(),
                path: "/api/chat".to_string(),
                connect_timeout_ms: 5000,
            },
            session: SessionConfig {
                reconnect_delay_ms: 4000,
            },
            audio: AudioConfig {
                capture_chunk_ms: 100,
                sample_rate: 24000,
                channels: 1,
                bit_depth: 16,
            },
            text: TextConfig { debounce_ms: 600 },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_BACKEND_PORT=9000`: Override backend port
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly set bare HOST/PORT without a prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.backend.port == 0 {
            return Err(anyhow::anyhow!("Backend port cannot be 0"));
        }

        if self.backend.scheme != "ws" && self.backend.scheme != "wss" {
            return Err(anyhow::anyhow!(
                "Backend scheme must be ws or wss, got '{}'",
                self.backend.scheme
            ));
        }

        if !self.backend.path.starts_with('/') {
            return Err(anyhow::anyhow!("Backend path must start with '/'"));
        }

        if self.backend.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Backend connect timeout must be greater than 0"));
        }

        if self.session.reconnect_delay_ms == 0 {
            return Err(anyhow::anyhow!("Reconnect delay must be greater than 0"));
        }

        if self.audio.capture_chunk_ms == 0 {
            return Err(anyhow::anyhow!("Capture chunk interval must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.text.debounce_ms == 0 {
            return Err(anyhow::anyhow!("Text debounce must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config
    /// updates via `PUT /api/v1/config`).
    ///
    /// Partial updates are allowed: only the fields present in the JSON are
    /// touched, then the whole configuration is re-validated.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(backend) = partial_config.get("backend") {
            if let Some(host) = backend.get("host").and_then(|v| v.as_str()) {
                self.backend.host = host.to_string();
            }
            if let Some(port) = backend.get("port").and_then(|v| v.as_u64()) {
                self.backend.port = port as u16;
            }
            if let Some(scheme) = backend.get("scheme").and_then(|v| v.as_str()) {
                self.backend.scheme = scheme.to_string();
            }
            if let Some(path) = backend.get("path").and_then(|v| v.as_str()) {
                self.backend.path = path.to_string();
            }
            if let Some(timeout) = backend.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                self.backend.connect_timeout_ms = timeout;
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(delay) = session.get("reconnect_delay_ms").and_then(|v| v.as_u64()) {
                self.session.reconnect_delay_ms = delay;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(chunk) = audio.get("capture_chunk_ms").and_then(|v| v.as_u64()) {
                self.audio.capture_chunk_ms = chunk;
            }
            if let Some(rate) = audio.get("sample_rate").and_then(|v| v.as_u64()) {
                self.audio.sample_rate = rate as u32;
            }
        }

        if let Some(text) = partial_config.get("text") {
            if let Some(debounce) = text.get("debounce_ms").and_then(|v| v.as_u64()) {
                self.text.debounce_ms = debounce;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8010);
        assert_eq!(config.backend.port, 8998);
        assert_eq!(config.session.reconnect_delay_ms, 4000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.scheme = "http".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"backend": {"port": 9001}, "text": {"debounce_ms": 250}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.backend.port, 9001);
        assert_eq!(config.text.debounce_ms, 250);
        // Untouched fields keep their values.
        assert_eq!(config.server.port, 8010);
        assert_eq!(config.audio.capture_chunk_ms, 100);
    }

    #[test]
    fn test_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"reconnect_delay_ms": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_backend_url_with_query() {
        let config = AppConfig::default();
        assert_eq!(
            config.backend.url_with_query(""),
            "wss://127.0.0.1:8998/api/chat"
        );
        assert_eq!(
            config.backend.url_with_query("voice=NATF2&persona=chef"),
            "wss://127.0.0.1:8998/api/chat?voice=NATF2&persona=chef"
        );
    }
}
