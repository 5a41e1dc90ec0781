use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

fn default_socket_path() -> PathBuf {
    if is_root() {
        PathBuf::from(common::DEFAULT_SOCKET_PATH)
    } else {
        PathBuf::from(common::USER_SOCKET_PATH)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_delivery_dir")]
    pub delivery_dir: PathBuf,
    #[serde(default = "default_max_duration")]
    pub max_duration_minutes: i64,
    /// Added to the requested duration to get the wall-clock ceiling.
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    /// Anything smaller is a stub, not a recording.
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    #[serde(default = "default_conversion_timeout")]
    pub conversion_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when the ceiling is hit.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

fn default_output_dir() -> PathBuf {
    if is_root() {
        PathBuf::from(common::DEFAULT_RECORDING_DIR)
    } else {
        PathBuf::from(common::USER_RECORDING_DIR)
    }
}
fn default_delivery_dir() -> PathBuf {
    if is_root() {
        PathBuf::from(common::DEFAULT_DELIVERY_DIR)
    } else {
        PathBuf::from(common::USER_DELIVERY_DIR)
    }
}
fn default_max_duration() -> i64 { 720 }
fn default_safety_margin() -> u64 { 60 }
fn default_min_output_bytes() -> u64 { 100_000 }
fn default_conversion_timeout() -> u64 { 600 }
fn default_stop_grace() -> u64 { 5 }

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            delivery_dir: default_delivery_dir(),
            max_duration_minutes: default_max_duration(),
            safety_margin_secs: default_safety_margin(),
            min_output_bytes: default_min_output_bytes(),
            conversion_timeout_secs: default_conversion_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

impl RecordingConfig {
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Quality settings for the capture re-encode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderProfile {
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    #[serde(default = "default_crf")]
    pub crf: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_max_rate")]
    pub max_rate: String,
    #[serde(default = "default_buf_size")]
    pub buf_size: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

fn default_max_height() -> u32 { 480 }
fn default_crf() -> u32 { 28 }
fn default_preset() -> String { "veryfast".to_string() }
fn default_max_rate() -> String { "800k".to_string() }
fn default_buf_size() -> String { "1600k".to_string() }
fn default_audio_bitrate() -> String { "96k".to_string() }

impl Default for EncoderProfile {
    fn default() -> Self {
        Self {
            max_height: default_max_height(),
            crf: default_crf(),
            preset: default_preset(),
            max_rate: default_max_rate(),
            buf_size: default_buf_size(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Encoder used for both capture and remux.
    #[serde(default = "default_program")]
    pub program: PathBuf,
    #[serde(default = "default_segment_timeout")]
    pub segment_timeout_secs: u64,
    #[serde(default = "default_protocol_whitelist")]
    pub protocol_whitelist: String,
    #[serde(default)]
    pub profile: EncoderProfile,
}

fn default_program() -> PathBuf { PathBuf::from("ffmpeg") }
fn default_segment_timeout() -> u64 { 30 }
fn default_protocol_whitelist() -> String { "file,http,https,tcp,tls,crypto".to_string() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            segment_timeout_secs: default_segment_timeout(),
            protocol_whitelist: default_protocol_whitelist(),
            profile: EncoderProfile::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
    pub engine_output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            engine_output: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn log_file(&self) -> PathBuf {
        if let Ok(path) = std::env::var("STREAMREC_LOG") {
            return PathBuf::from(path);
        }
        self.output.clone().unwrap_or_else(|| {
            PathBuf::from(if is_root() { common::DEFAULT_LOG_FILE } else { common::USER_LOG_FILE })
        })
    }

    pub fn engine_log_file(&self) -> PathBuf {
        self.engine_output.clone().unwrap_or_else(|| {
            PathBuf::from(if is_root() {
                common::DEFAULT_ENGINE_LOG_FILE
            } else {
                common::USER_ENGINE_LOG_FILE
            })
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Every chat message is mirrored here as JSON when set.
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
    /// Upper bound for one send, edit or delete.
    #[serde(default = "default_message_timeout")]
    pub message_timeout_secs: u64,
    /// Upper bound for handing over the finished file.
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 { 10 }
fn default_message_timeout() -> u64 { 15 }
fn default_upload_timeout() -> u64 { 600 }

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: default_webhook_timeout(),
            message_timeout_secs: default_message_timeout(),
            upload_timeout_secs: default_upload_timeout(),
        }
    }
}

impl NotificationConfig {
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    pub timezone: Option<String>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        }
    }

    /// Explicit path must exist; the default location may be absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    log::info!("No config at {:?}, using defaults", path);
                    Self::default()
                }
            }
        };
        config.timezone()?;
        Ok(config)
    }

    pub fn timezone(&self) -> Result<Option<Tz>> {
        self.timezone
            .as_deref()
            .map(common::parse_timezone)
            .transpose()
    }
}

fn default_config_path() -> PathBuf {
    if is_root() {
        return PathBuf::from(common::DEFAULT_CONFIG_PATH);
    }
    let user_path = common::USER_CONFIG_PATH;
    match (user_path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(user_path),
    }
}

fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}
