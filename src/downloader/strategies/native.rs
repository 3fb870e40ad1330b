use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::DownloadType;
use crate::downloader::http_pool::HttpPool;
use crate::downloader::{DispatchReceipt, DownloadBackend, DownloadJob};
use crate::errors::{AppError, HostDownloadErrorKind, Result};
use crate::notifications::{Notification, NotificationAction, Notifier};
use crate::utils::ensure_dir_exists;

/// Downloads through our own HTTP pool, standing in for a host download facility.
///
/// Submission returns as soon as the transfer task is spawned. Transfer failures
/// arrive later as notifications offering a retry of the single video.
pub struct NativeBackend {
    pool: Arc<HttpPool>,
    root: PathBuf,
    enabled: bool,
    allowed_extensions: Vec<String>,
    notifier: Notifier,
}

impl NativeBackend {
    pub fn new(
        pool: Arc<HttpPool>,
        root: PathBuf,
        enabled: bool,
        allowed_extensions: Vec<String>,
        notifier: Notifier,
    ) -> Self {
        Self {
            pool,
            root,
            enabled,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            notifier,
        }
    }

    /// Where the job lands on disk. Rooted templates are placed under the download root.
    pub fn destination(&self, job: &DownloadJob) -> Result<PathBuf> {
        if !job.path.drive.is_empty() {
            if cfg!(windows) {
                return Ok(PathBuf::from(&job.path.full_path));
            }
            return Err(AppError::HostDownload {
                kind: HostDownloadErrorKind::NotSupported,
                details: Some(format!("drive letter {} on this platform", job.path.drive)),
            });
        }
        let relative = job.path.full_path.trim_start_matches(['/', '\\']);
        Ok(self.root.join(relative))
    }

    fn check_extension(&self, filename: &str) -> Result<()> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if self.allowed_extensions.is_empty() || self.allowed_extensions.contains(&extension) {
            Ok(())
        } else {
            Err(AppError::HostDownload {
                kind: HostDownloadErrorKind::NotWhitelisted,
                details: Some(format!(".{}", extension)),
            })
        }
    }
}

/// Maps a transfer failure to the host error kind shown to the user
pub fn classify_failure(error: &AppError) -> HostDownloadErrorKind {
    match error {
        AppError::HostDownload { kind, .. } => *kind,
        AppError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            HostDownloadErrorKind::NotPermitted
        }
        AppError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => HostDownloadErrorKind::Timeout,
        AppError::Http(e) if e.is_timeout() => HostDownloadErrorKind::Timeout,
        _ => HostDownloadErrorKind::NotSucceeded,
    }
}

#[async_trait]
impl DownloadBackend for NativeBackend {
    fn kind(&self) -> DownloadType {
        DownloadType::Browser
    }

    fn name(&self) -> &'static str {
        "Native"
    }

    async fn submit(&self, job: &DownloadJob) -> Result<DispatchReceipt> {
        if !self.enabled {
            return Err(AppError::host_download(HostDownloadErrorKind::NotEnabled));
        }
        self.check_extension(&job.path.filename)?;
        let destination = self.destination(job)?;

        let pool = self.pool.clone();
        let notifier = self.notifier.clone();
        let url = job.url().to_string();
        let id = job.descriptor.id.clone();
        let title = job.descriptor.title.clone();
        let headers = if job.options.cookies.is_empty() {
            Vec::new()
        } else {
            vec![("Cookie".to_string(), job.options.cookies.clone())]
        };

        tokio::spawn(async move {
            let result: Result<u64> = async {
                if let Some(parent) = destination.parent() {
                    ensure_dir_exists(parent).await?;
                }
                pool.download_to_file(&url, &destination, &headers, |progress| {
                    log::debug!(
                        "[NATIVE] {} {:.1}% ({} bytes)",
                        id,
                        progress.progress_percentage,
                        progress.downloaded_bytes
                    );
                })
                .await
            }
            .await;

            match result {
                Ok(bytes) => notifier.notify(Notification::info(
                    "Download finished",
                    format!("{}[{}] saved to {:?} ({} bytes)", title, id, destination, bytes),
                )),
                Err(e) => {
                    let kind = classify_failure(&e);
                    notifier.notify(
                        Notification::error(
                            "Download failed",
                            format!("{}[{}]: {} ({})", title, id, kind.user_message(), e),
                        )
                        .with_action(NotificationAction::RetryVideo {
                            id: id.clone(),
                            name: title.clone(),
                        }),
                    );
                }
            }
        });

        log::info!("📥 [NATIVE] {} started", job.display_name());
        Ok(DispatchReceipt {
            backend: DownloadType::Browser,
            video_id: job.descriptor.id.clone(),
            reference: None,
        })
    }

    async fn check(&self) -> Result<()> {
        if !self.enabled {
            return Err(AppError::host_download(HostDownloadErrorKind::NotEnabled));
        }
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            AppError::HostDownload {
                kind: classify_failure(&AppError::Io(e)),
                details: Some(format!("{:?}", self.root)),
            }
        })
    }
}
