pub mod cache;
pub mod http_pool;
pub mod manager;
pub mod path_template;
pub mod quality;
pub mod reconciler;
pub mod strategies;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DownloadType;
use crate::errors::{AppError, Result};
use crate::metadata::{FileSource, VideoDescriptor};
use path_template::LocalPath;

/// Transport settings handed to a backend along with the job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendOptions {
    pub proxy: String,
    pub cookies: String,
    pub referer: String,
}

/// A resolved video ready for submission. Only built when the chosen source has a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub descriptor: VideoDescriptor,
    pub source: FileSource,
    pub path: LocalPath,
    /// Template output before path parsing; the custom RPC wants it verbatim
    pub rendered_path: String,
    pub options: BackendOptions,
}

impl DownloadJob {
    pub fn new(
        descriptor: VideoDescriptor,
        path: LocalPath,
        rendered_path: String,
        options: BackendOptions,
    ) -> Result<Self> {
        let source = descriptor
            .chosen_source()
            .cloned()
            .ok_or_else(|| AppError::NoAvailableSource {
                id: descriptor.id.clone(),
                quality: descriptor.download_quality.clone(),
            })?;
        if descriptor.download_url.is_empty() {
            return Err(AppError::SourceUnavailable {
                id: descriptor.id.clone(),
                quality: descriptor.download_quality.clone(),
            });
        }
        Ok(Self {
            descriptor,
            source,
            path,
            rendered_path,
            options,
        })
    }

    pub fn url(&self) -> &str {
        &self.descriptor.download_url
    }

    pub fn display_name(&self) -> String {
        self.descriptor.display_name()
    }
}

/// Acknowledgement that a backend accepted a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub backend: DownloadType,
    pub video_id: String,
    /// Backend-side handle, e.g. the Aria2 GID
    pub reference: Option<String>,
}

/// A download execution engine that accepts jobs
#[async_trait]
pub trait DownloadBackend: Send + Sync {
    fn kind(&self) -> DownloadType;

    fn name(&self) -> &'static str;

    /// Hands the job over and returns once the backend acknowledged it
    async fn submit(&self, job: &DownloadJob) -> Result<DispatchReceipt>;

    /// Verifies the backend is reachable and accepts our credentials
    async fn check(&self) -> Result<()>;
}
