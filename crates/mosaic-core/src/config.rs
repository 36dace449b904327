//! Service configuration.
//!
//! Parsed from a TOML file; every field has a default so an empty file (or a
//! missing one) yields a working development setup. Validation runs at parse
//! time and fails closed: a config that would build an inconsistent canvas
//! never reaches the store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::palette::{DEFAULT_PALETTE, Palette};
use crate::ratelimit::VolumeLimiterConfig;

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Canvas geometry and palette.
    #[serde(default)]
    pub canvas: CanvasConfig,

    /// Per-route volume limits.
    #[serde(default)]
    pub limits: VolumeLimiterConfig,

    /// Fraud-check collaborator settings.
    #[serde(default)]
    pub captcha: CaptchaConfig,

    /// Change-history collaborator settings.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Background flush and sweep settings.
    #[serde(default)]
    pub flush: FlushConfig,
}

impl ServiceConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid
    /// - `chunk_size` is zero or does not divide both canvas dimensions
    /// - The palette is empty, oversized or contains malformed hex colors
    /// - The cooldown is not positive
    /// - The captcha oracle is enabled without a secret
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the palette described by `[canvas].palette`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if any entry fails to parse; `from_toml` already
    /// guarantees this cannot happen for validated configs.
    pub fn palette(&self) -> Result<Palette, ConfigError> {
        Palette::from_hex(&self.canvas.palette)
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let canvas = &self.canvas;
        if canvas.chunk_size == 0 {
            return Err(ConfigError::Validation("chunk_size must be positive".into()));
        }
        if canvas.width == 0
            || canvas.height == 0
            || canvas.width % canvas.chunk_size != 0
            || canvas.height % canvas.chunk_size != 0
        {
            return Err(ConfigError::Validation(format!(
                "chunk_size {} must divide canvas dimensions {}x{}",
                canvas.chunk_size, canvas.width, canvas.height
            )));
        }
        if canvas.cooldown_secs <= 0 {
            return Err(ConfigError::Validation("cooldown_secs must be positive".into()));
        }
        Palette::from_hex(&canvas.palette).map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.captcha.enabled && self.captcha.secret.is_empty() {
            return Err(ConfigError::Validation(
                "captcha.enabled = true requires captcha.secret".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Token issuer URL; also the expected issuer on verification.
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Cookie `Domain` attribute; omitted entirely when unset.
    #[serde(default)]
    pub cookie_domain: Option<String>,

    /// Trust the first `X-Forwarded-For` entry as the client IP. Enable only
    /// behind a proxy that strips the header from client requests.
    #[serde(default = "default_trust_forwarded_for")]
    pub trust_forwarded_for: bool,

    /// Identity signing key file; created on first start if missing.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            issuer: default_issuer(),
            cookie_domain: None,
            trust_forwarded_for: default_trust_forwarded_for(),
            key_file: default_key_file(),
        }
    }
}

/// Canvas geometry and palette.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConfig {
    /// Canvas width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,

    /// Canvas height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,

    /// Chunk edge length; must divide both dimensions.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// Seconds an identity must wait between accepted writes.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,

    /// Ordered hex palette; at most 256 entries.
    #[serde(default = "default_palette")]
    pub palette: Vec<String>,

    /// Directory for persisted chunk files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for rendered chunk images.
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            chunk_size: default_chunk_size(),
            cooldown_secs: default_cooldown_secs(),
            palette: default_palette(),
            data_dir: default_data_dir(),
            images_dir: default_images_dir(),
        }
    }
}

/// Fraud-check collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// Whether the oracle is consulted at all. Disabled means every request
    /// passes; for development only.
    #[serde(default)]
    pub enabled: bool,

    /// Shared secret for the verification API. Required when enabled.
    #[serde(default)]
    pub secret: String,

    /// Verification endpoint.
    #[serde(default = "default_captcha_url")]
    pub verify_url: String,

    /// Hostname the oracle must report for a token to count.
    #[serde(default)]
    pub hostname: String,

    /// Scores below this are treated as ambiguous.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,

    /// Cooldown multiplier applied to writes with an ambiguous score.
    #[serde(default = "default_low_score_cooldown_factor")]
    pub low_score_cooldown_factor: u32,

    /// Upper bound on the verification call, in milliseconds.
    #[serde(default = "default_captcha_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: String::new(),
            verify_url: default_captcha_url(),
            hostname: String::new(),
            score_threshold: default_score_threshold(),
            low_score_cooldown_factor: default_low_score_cooldown_factor(),
            timeout_ms: default_captcha_timeout_ms(),
        }
    }
}

/// Change-history collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// SQLite database path.
    #[serde(default = "default_history_db")]
    pub db_path: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_history_db(),
        }
    }
}

/// Background flush and sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Capacity of the flush notification queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Seconds between rescans of dirty chunks. This bounds the crash
    /// data-loss window: a crash loses at most the writes since the last
    /// successful flush, and an unflushed chunk is retried this often.
    #[serde(default = "default_rescan_secs")]
    pub rescan_secs: u64,

    /// Seconds between sweeps of superseded chunk images.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Minimum age before a superseded image is deleted.
    #[serde(default = "default_sweep_max_age_secs")]
    pub sweep_max_age_secs: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            rescan_secs: default_rescan_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_max_age_secs: default_sweep_max_age_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3024".to_string()
}

fn default_issuer() -> String {
    "https://mosaic.place".to_string()
}

const fn default_trust_forwarded_for() -> bool {
    true
}

fn default_key_file() -> PathBuf {
    PathBuf::from("mosaic.jwt.key")
}

const fn default_width() -> u32 {
    256
}

const fn default_height() -> u32 {
    256
}

const fn default_chunk_size() -> u32 {
    128
}

const fn default_cooldown_secs() -> i64 {
    60
}

fn default_palette() -> Vec<String> {
    DEFAULT_PALETTE.iter().map(ToString::to_string).collect()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("pngs")
}

fn default_history_db() -> PathBuf {
    PathBuf::from("history.db")
}

fn default_captcha_url() -> String {
    "https://www.google.com/recaptcha/api/siteverify".to_string()
}

const fn default_score_threshold() -> f64 {
    0.5
}

const fn default_low_score_cooldown_factor() -> u32 {
    5
}

const fn default_captcha_timeout_ms() -> u64 {
    4000
}

const fn default_queue_depth() -> usize {
    1024
}

const fn default_rescan_secs() -> u64 {
    5
}

const fn default_sweep_interval_secs() -> u64 {
    3600
}

const fn default_sweep_max_age_secs() -> u64 {
    86_400
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
