use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metadata::VideoDescriptor;

/// Failure kinds reported by the host download facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostDownloadErrorKind {
    NotEnabled,
    NotWhitelisted,
    NotPermitted,
    NotSupported,
    NotSucceeded,
    Timeout,
}

impl HostDownloadErrorKind {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotEnabled => "Host downloads are not enabled",
            Self::NotWhitelisted => "The file extension is not whitelisted for host downloads",
            Self::NotPermitted => "The host refused permission to write the file",
            Self::NotSupported => "Host downloads are not supported in this environment",
            Self::NotSucceeded => "The host download did not succeed",
            Self::Timeout => "The host download timed out",
        }
    }
}

impl std::fmt::Display for HostDownloadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.user_message())
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Video {id} not found")]
    NotFound {
        id: String,
        cached: Option<Box<VideoDescriptor>>,
    },

    #[error("Video {id} is hosted externally at {embed_url}")]
    ExternalVideo { id: String, embed_url: String },

    #[error("No file sources returned for video {0}")]
    NoSource(String),

    #[error("No available source with quality {quality} for video {id}")]
    NoAvailableSource { id: String, quality: String },

    #[error("Selected source {quality} of video {id} has no download link")]
    SourceUnavailable { id: String, quality: String },

    #[error("Download path error: [\"{0}\"]")]
    PathFormat(String),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Backend rejected the task: {0}")]
    BackendRejected(String),

    #[error("Host download error: {kind}{}", fmt_details(.details))]
    HostDownload {
        kind: HostDownloadErrorKind,
        details: Option<String>,
    },

    #[error("Video {id} resolved to quality {actual}, expected {preferred}")]
    QualityWarning {
        id: String,
        actual: String,
        preferred: String,
    },

    #[error("Video {id} mentions a third-party download link ({domain})")]
    SuspiciousLink { id: String, domain: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl AppError {
    /// Policy gates that stop a single dispatch without counting as a failure
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::QualityWarning { .. } | Self::SuspiciousLink { .. })
    }

    pub fn host_download(kind: HostDownloadErrorKind) -> Self {
        Self::HostDownload { kind, details: None }
    }
}

fn fmt_details(details: &Option<String>) -> String {
    details
        .as_deref()
        .map(|d| format!(" ({})", d))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, AppError>;
