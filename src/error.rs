use thiserror::Error;

use crate::event::SourceKey;

#[derive(Error, Debug)]
pub enum CrosspostError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("No mapping for source message {0}")]
    MappingNotFound(SourceKey),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Binding directory error: {0}")]
    Directory(String),

    #[error("Mapping store error: {0}")]
    Mapping(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),
}

impl CrosspostError {
    /// Whether a bounded retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientIo(_) | Self::Io(_) | Self::Http(_) | Self::Telegram(_) => true,
            Self::Api(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CrosspostError>;
