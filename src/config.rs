//! Application configuration
//!
//! Defaults target the public PeerJS cloud server. Every field can be
//! overridden through `PEERCALL_*` environment variables, and the CLI layers
//! its own flags on top of that.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("Invalid URL for {key}: {source}")]
    InvalidUrl {
        key: &'static str,
        #[source]
        source: url::ParseError,
    },
}

// ============================================================================
// PEER SERVER
// ============================================================================

/// Connection parameters for a PeerJS-compatible signaling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerServerConfig {
    pub host: String,
    pub port: u16,
    /// Mount path, always starting and ending with `/`
    pub path: String,
    pub key: String,
    pub secure: bool,
    /// Fixed identity to register with; fetched from the server when unset
    pub peer_id: Option<String>,
}

impl Default for PeerServerConfig {
    fn default() -> Self {
        Self {
            host: "0.peerjs.com".to_string(),
            port: 443,
            path: "/".to_string(),
            key: "peerjs".to_string(),
            secure: true,
            peer_id: None,
        }
    }
}

impl PeerServerConfig {
    /// Builds the config from a single URL such as `wss://host:9000/myapp`
    ///
    /// Used for the `SIGNALING_URL` variable. The scheme decides `secure`,
    /// a missing port falls back to the scheme default.
    pub fn from_url(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
            key: "SIGNALING_URL",
            source,
        })?;

        let secure = match url.scheme() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "SIGNALING_URL",
                    message: format!("unsupported scheme '{other}'"),
                })
            }
        };

        let host = url
            .host_str()
            .ok_or(ConfigError::InvalidValue {
                key: "SIGNALING_URL",
                message: "missing host".to_string(),
            })?
            .to_string();

        Ok(Self {
            host,
            port: url.port_or_known_default().unwrap_or(443),
            path: normalize_path(url.path()),
            secure,
            ..Self::default()
        })
    }

    /// `http(s)://host:port/path/` without the key segment
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }

    /// `ws(s)://host:port/path/` without the `peerjs` segment
    pub fn ws_base(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "peer_server.host",
                message: "must not be empty".to_string(),
            });
        }
        if self.key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "peer_server.key",
                message: "must not be empty".to_string(),
            });
        }
        if let Some(id) = &self.peer_id {
            if id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "peer_server.peer_id",
                    message: "must not be empty when set".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Ensures a leading and trailing slash, as the PeerJS client does
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

// ============================================================================
// ICE SERVERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Google STUN servers, enough for most non-symmetric NATs
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// MEDIA + BOOKKEEPING
// ============================================================================

/// Where the file-backed capture devices read from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// IVF file (VP8/VP9) standing in for the camera
    pub video_file: Option<PathBuf>,
    /// Ogg/Opus file standing in for the microphone
    pub audio_file: Option<PathBuf>,
    /// Replay files from the start when they run out
    pub looping: bool,
    /// Simulates the user declining the capture prompt
    pub deny: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookkeepingConfig {
    /// Base URL; records go to `{url}/peers` and `{url}/connections`
    pub url: String,
    #[serde(default = "default_bookkeeping_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_bookkeeping_timeout_ms() -> u64 {
    5_000
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub peer_server: PeerServerConfig,
    pub ice_servers: Vec<IceServerConfig>,
    pub media: MediaConfig,
    pub bookkeeping: Option<BookkeepingConfig>,
    /// `tracing` filter directive, overridden by `RUST_LOG`
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            peer_server: PeerServerConfig::default(),
            ice_servers: default_ice_servers(),
            media: MediaConfig::default(),
            bookkeeping: None,
            log_filter: "peercall=debug,webrtc=warn".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.peer_server = PeerServerConfig::from_url(&url)?;
        }
        if let Some(host) = lookup("PEERCALL_HOST") {
            config.peer_server.host = host;
        }
        if let Some(port) = lookup("PEERCALL_PORT") {
            config.peer_server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PEERCALL_PORT",
                message: format!("'{port}' is not a port number"),
            })?;
        }
        if let Some(path) = lookup("PEERCALL_PATH") {
            config.peer_server.path = normalize_path(&path);
        }
        if let Some(key) = lookup("PEERCALL_KEY") {
            config.peer_server.key = key;
        }
        if let Some(secure) = lookup("PEERCALL_SECURE") {
            config.peer_server.secure = parse_bool("PEERCALL_SECURE", &secure)?;
        }
        if let Some(id) = lookup("PEERCALL_PEER_ID") {
            config.peer_server.peer_id = Some(id);
        }
        if let Some(urls) = lookup("PEERCALL_ICE_SERVERS") {
            config.ice_servers = vec![IceServerConfig {
                urls: urls
                    .split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(String::from)
                    .collect(),
                username: lookup("PEERCALL_ICE_USERNAME").unwrap_or_default(),
                credential: lookup("PEERCALL_ICE_CREDENTIAL").unwrap_or_default(),
            }];
        }
        if let Some(path) = lookup("PEERCALL_VIDEO_FILE") {
            config.media.video_file = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("PEERCALL_AUDIO_FILE") {
            config.media.audio_file = Some(PathBuf::from(path));
        }
        if let Some(looping) = lookup("PEERCALL_LOOP") {
            config.media.looping = parse_bool("PEERCALL_LOOP", &looping)?;
        }
        if let Some(url) = lookup("PEERCALL_BOOKKEEPING_URL") {
            config.bookkeeping = Some(BookkeepingConfig {
                url,
                timeout_ms: default_bookkeeping_timeout_ms(),
            });
        }
        if let Some(filter) = lookup("PEERCALL_LOG") {
            config.log_filter = filter;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.peer_server.validate()?;

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "ice_servers",
                    message: "an ICE server needs at least one URL".to_string(),
                });
            }
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:"))
                {
                    return Err(ConfigError::InvalidValue {
                        key: "ice_servers",
                        message: format!("'{url}' is not a stun:/turn: URL"),
                    });
                }
            }
        }

        if let Some(bookkeeping) = &self.bookkeeping {
            Url::parse(&bookkeeping.url).map_err(|source| ConfigError::InvalidUrl {
                key: "bookkeeping.url",
                source,
            })?;
        }

        Ok(())
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            message: format!("'{raw}' is not a boolean"),
        }),
    }
}

// ============================================================================
// TESTS
// ============================================================================
