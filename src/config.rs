//! # Configuration Management
//!
//! Loads the relay's configuration from several layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT` and `API_KEY` environment variables
//! 2. Environment variables (APP_SERVER__PORT, APP_UPSTREAM__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::upstream::ResponseModality;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_GEMINI_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamSettings,
    pub relay: RelayConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection settings for the remote streaming engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Websocket endpoint of the engine, without the API key.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub response_modality: ResponseModality,
    pub system_instruction: Option<String>,
    pub connect_timeout_secs: u64,
}

/// Per-session relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_concurrent_sessions: usize,
    /// Client chunks waiting for the inbound relay before the socket is throttled.
    pub inbound_queue_capacity: usize,
    /// Engine audio chunks waiting for the local sink.
    pub playback_queue_capacity: usize,
    /// How long teardown waits for a relay task before aborting it.
    pub teardown_grace_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Record each session's engine audio as `<dir>/<session_id>.wav`.
    /// Audio is then kept local and not sent to the client.
    pub audio_record_dir: Option<String>,
    pub output_sample_rate: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(), // Localhost only (safe for development)
                port: 8080,
            },
            upstream: UpstreamSettings {
                endpoint: DEFAULT_GEMINI_ENDPOINT.to_string(),
                api_key: String::new(),
                model: "gemini-2.0-flash-live-001".to_string(),
                response_modality: ResponseModality::Text,
                system_instruction: Some("You are a daily life assistant.".to_string()),
                connect_timeout_secs: 10,
            },
            relay: RelayConfig {
                max_concurrent_sessions: 10,
                inbound_queue_capacity: 64,
                playback_queue_capacity: 32,
                teardown_grace_ms: 2000,
                heartbeat_interval_secs: 5,
                client_timeout_secs: 30,
            },
            debug: DebugConfig {
                audio_record_dir: None,
                output_sample_rate: 24000, // Engine audio output rate
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources and merge them by priority.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // APP_RELAY__MAX_CONCURRENT_SESSIONS becomes relay.max_concurrent_sessions
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("API_KEY") {
            settings = settings.set_override("upstream.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.upstream.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Upstream model cannot be empty"));
        }

        url::Url::parse(&self.upstream.endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid upstream endpoint: {}", e))?;

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.inbound_queue_capacity == 0 || self.relay.playback_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Relay queue capacities must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs == 0
            || self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.debug.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Output sample rate must be greater than 0"));
        }

        Ok(())
    }

    /// Copy safe to show over HTTP: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.upstream.api_key.is_empty() {
            config.upstream.api_key = "***".to_string();
        }
        config
    }
}
