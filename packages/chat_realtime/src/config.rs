use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::coordinator::{CoordinatorConfig, DEFAULT_PUBLIC_ORIGIN};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [api]
//                    base_url = "https://chat.example.com"
//
//   env var:         CHAT_API__BASE_URL=https://chat.example.com
//
//   (single underscore stays within field names: CHAT_API__TOKEN_POLL_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub realtime: RealtimeFileConfig,
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub calls: CallsFileConfig,
}

/// Realtime backend connection (lives under `[realtime]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Capacity of the raw event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for RealtimeFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Auth API the identity and token are read from (lives under `[api]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Value of the session cookie; without it the API reports no user.
    #[serde(default)]
    pub session_cookie: Option<String>,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_token_poll_secs")]
    pub token_poll_secs: u64,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            session_cookie: None,
            cookie_name: default_cookie_name(),
            token_poll_secs: default_token_poll_secs(),
        }
    }
}

/// Video call links (lives under `[calls]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallsFileConfig {
    #[serde(default = "default_public_origin")]
    pub public_origin: String,
}

impl Default for CallsFileConfig {
    fn default() -> Self {
        Self {
            public_origin: default_public_origin(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:5001/realtime".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_event_buffer() -> usize {
    256
}
fn default_base_url() -> String {
    "http://127.0.0.1:5001".to_string()
}
fn default_cookie_name() -> String {
    "jwt".to_string()
}
fn default_token_poll_secs() -> u64 {
    30
}
fn default_public_origin() -> String {
    DEFAULT_PUBLIC_ORIGIN.to_string()
}

/// Build a figment that layers: defaults → config.toml → CHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_REALTIME__WS_URL=wss://...`  →  `realtime.ws_url = "wss://..."`
///   `CHAT_API__TOKEN_POLL_SECS=5`      →  `api.token_poll_secs = 5`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Realtime link configuration (runtime view).
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub ws_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub event_buffer: usize,
}

impl LinkConfig {
    pub fn from_file(fc: &RealtimeFileConfig) -> Self {
        Self {
            ws_url: fc.ws_url.clone(),
            api_key: fc.api_key.clone().filter(|key| !key.is_empty()),
            // zero would fail every request immediately
            request_timeout: Duration::from_secs(fc.request_timeout_secs.max(1)),
            event_buffer: fc.event_buffer.max(1),
        }
    }
}

/// Token source configuration (runtime view).
#[derive(Clone, Debug)]
pub struct TokenSourceConfig {
    pub base_url: String,
    pub cookie_name: String,
    pub session_cookie: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl TokenSourceConfig {
    pub fn from_file(fc: &ApiFileConfig, request_timeout: Duration) -> Self {
        Self {
            base_url: fc.base_url.clone(),
            cookie_name: fc.cookie_name.clone(),
            session_cookie: fc.session_cookie.clone().filter(|c| !c.is_empty()),
            poll_interval: Duration::from_secs(fc.token_poll_secs.max(1)),
            request_timeout,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_file(fc: &CallsFileConfig) -> Self {
        Self {
            public_origin: fc.public_origin.clone(),
        }
    }
}

// =============================================================================
// Directory layout (not tunable via figment — derived from --config-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub config_dir: PathBuf,
}

impl ChatConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::config_dir()
                .context("Could not find the user config directory")?
                .join("chat-realtime"),
        };

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

        info!("Config directory: {}", config_dir.display());
        Ok(Self { config_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Resolve the layered configuration for this directory.
    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.config_dir)
            .extract()
            .context("Failed to load configuration")
    }
}
