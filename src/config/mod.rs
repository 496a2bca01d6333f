use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CrosspostError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub vk: VkConfig,
    #[serde(default)]
    pub supabase: Option<SupabaseConfig>,
    #[serde(default)]
    pub crosspost: CrosspostConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_data_dir() -> String {
    "~/.crosspost".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_token: None,
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Alternate Bot API server (self-hosted or test double).
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u32,
}

fn default_poll_timeout() -> u32 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_url: None,
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VkConfig {
    #[serde(default = "default_vk_api_url")]
    pub api_url: String,
    #[serde(default = "default_vk_api_version")]
    pub api_version: String,
    #[serde(default = "default_vk_timeout")]
    pub timeout_secs: u64,
}

fn default_vk_api_url() -> String {
    "https://api.vk.com/method".to_string()
}
fn default_vk_api_version() -> String {
    "5.199".to_string()
}
fn default_vk_timeout() -> u64 {
    60
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            api_url: default_vk_api_url(),
            api_version: default_vk_api_version(),
            timeout_secs: default_vk_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
}

impl SupabaseConfig {
    /// Treat a section whose values resolved to empty env vars as absent.
    pub fn is_usable(&self) -> bool {
        !self.url.trim().is_empty() && !self.key.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrosspostConfig {
    #[serde(default = "default_window_ms")]
    pub media_group_window_ms: u64,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Delay multiplier between download attempts; 1 keeps it fixed.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: u32,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default)]
    pub temp_dir: Option<String>,
    #[serde(default = "default_temp_max_age")]
    pub temp_max_age_secs: u64,
    #[serde(default = "default_true")]
    pub skip_duplicates: bool,
}

fn default_window_ms() -> u64 {
    2000
}
fn default_max_attachment_bytes() -> u64 {
    100 * 1024 * 1024 // 100 MB
}
fn default_download_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_retry_backoff() -> u32 {
    1
}
fn default_retry_max_delay_ms() -> u64 {
    60_000
}
fn default_temp_max_age() -> u64 {
    86_400
}
fn default_true() -> bool {
    true
}

impl Default for CrosspostConfig {
    fn default() -> Self {
        Self {
            media_group_window_ms: default_window_ms(),
            max_attachment_bytes: default_max_attachment_bytes(),
            download_attempts: default_download_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff: default_retry_backoff(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            temp_dir: None,
            temp_max_age_secs: default_temp_max_age(),
            skip_duplicates: true,
        }
    }
}

impl CrosspostConfig {
    pub fn media_group_window(&self) -> Duration {
        Duration::from_millis(self.media_group_window_ms)
    }

    pub fn download_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.download_attempts.max(1),
            delay: Duration::from_millis(self.retry_delay_ms),
            backoff: self.retry_backoff,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryStore {
    /// Supabase when configured, else the local JSON store.
    #[default]
    Auto,
    Supabase,
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(default)]
    pub primary: PrimaryStore,
    #[serde(default)]
    pub fallback_log: Option<String>,
}

/// A channel binding declared directly in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub channel_id: i64,
    #[serde(default)]
    pub channel_username: Option<String>,
    pub target_id: i64,
    #[serde(default)]
    pub target_name: Option<String>,
    pub access_token: String,
    #[serde(default = "default_true")]
    pub post_as_group: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CrosspostError::Config(format!("Failed to read config: {e}")))?;
        let content = substitute_env_vars(&content);
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let crosspost = &self.crosspost;
        if crosspost.retry_backoff < 1 {
            return Err(CrosspostError::Config(
                "crosspost.retry_backoff must be at least 1".into(),
            ));
        }
        if crosspost.retry_max_delay_ms < crosspost.retry_delay_ms {
            return Err(CrosspostError::Config(format!(
                "crosspost.retry_max_delay_ms ({}) is below retry_delay_ms ({})",
                crosspost.retry_max_delay_ms, crosspost.retry_delay_ms
            )));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        home_dir().join(".crosspost").join("config.toml")
    }

    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.gateway.data_dir)
    }

    pub fn temp_dir(&self) -> PathBuf {
        match &self.crosspost.temp_dir {
            Some(dir) => expand_home(dir),
            None => self.data_dir().join("files"),
        }
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.data_dir().join("crosspost.log")
    }

    /// Where a running relay records its pid and bind address.
    pub fn run_state_path(&self) -> PathBuf {
        self.data_dir().join("run.json")
    }

    pub fn fallback_log_path(&self) -> PathBuf {
        match &self.mapping.fallback_log {
            Some(path) => expand_home(path),
            None => self.data_dir().join("data.txt"),
        }
    }

    /// The Supabase section, if present and filled in.
    pub fn supabase(&self) -> Option<&SupabaseConfig> {
        self.supabase.as_ref().filter(|s| s.is_usable())
    }

    pub fn default_toml() -> &'static str {
        r#"[gateway]
bind = "127.0.0.1:3000"
data_dir = "~/.crosspost"

[telegram]
bot_token = "${TELEGRAM_BOT_TOKEN}"

[vk]
api_version = "5.199"

[crosspost]
media_group_window_ms = 2000
max_attachment_bytes = 104857600
download_attempts = 3
retry_delay_ms = 1000

# Supabase-backed bindings, mappings and activity log
# [supabase]
# url = "${SUPABASE_URL}"
# key = "${SUPABASE_KEY}"

# Static bindings, used when [supabase] is not configured
# [[bindings]]
# channel_id = -1001234567890
# channel_username = "mychannel"
# target_id = 123456
# access_token = "${VK_GROUP_TOKEN}"
# post_as_group = true
"#
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn expand_home(path: &str) -> PathBuf {
    PathBuf::from(path.replace('~', &home_dir().to_string_lossy()))
}

/// Substitute `${VAR_NAME}` patterns with environment variable values.
pub fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .to_string()
}
