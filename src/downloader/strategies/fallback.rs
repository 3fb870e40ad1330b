use async_trait::async_trait;
use std::process::{Command, Stdio};
use std::sync::Arc;
use url::Url;

use crate::config::DownloadType;
use crate::downloader::{DispatchReceipt, DownloadBackend, DownloadJob};
use crate::errors::{AppError, Result};

/// Something that can show a URL to the user
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Opens URLs with the platform's default handler
pub struct SystemOpener;

impl UrlOpener for SystemOpener {
    fn open(&self, url: &str) -> Result<()> {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", "start", ""]);
            c
        } else if cfg!(target_os = "macos") {
            Command::new("open")
        } else {
            Command::new("xdg-open")
        };
        command
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}

/// Adds the suggested file name as a `download` query hint
pub fn with_filename_hint(url: &str, filename: &str) -> Result<String> {
    let mut parsed =
        Url::parse(url).map_err(|e| AppError::ParseError(format!("Invalid URL {}: {}", url, e)))?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != "download")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("download", filename);
    Ok(parsed.to_string())
}

/// Leaves the download to the user by opening the resolved link
pub struct FallbackBackend {
    opener: Arc<dyn UrlOpener>,
}

impl FallbackBackend {
    pub fn new(opener: Arc<dyn UrlOpener>) -> Self {
        Self { opener }
    }
}

#[async_trait]
impl DownloadBackend for FallbackBackend {
    fn kind(&self) -> DownloadType {
        DownloadType::Others
    }

    fn name(&self) -> &'static str {
        "Fallback"
    }

    async fn submit(&self, job: &DownloadJob) -> Result<DispatchReceipt> {
        let url = with_filename_hint(job.url(), &job.path.filename)?;
        self.opener.open(&url)?;
        log::info!("🌍 [FALLBACK] Opened {} for manual download", job.display_name());
        Ok(DispatchReceipt {
            backend: DownloadType::Others,
            video_id: job.descriptor.id.clone(),
            reference: Some(url),
        })
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::path_template::parse_local_path;
    use crate::downloader::BackendOptions;
    use crate::metadata::{FileSource, VideoDescriptor};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingOpener {
        opened: Mutex<Vec<String>>,
    }

    impl UrlOpener for RecordingOpener {
        fn open(&self, url: &str) -> Result<()> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    #[test]
    fn filename_hint_replaces_existing_one() {
        let url = with_filename_hint("https://cdn.test/a.mp4?hash=1&download=old", "demo[abc].mp4").unwrap();
        assert_eq!(url, "https://cdn.test/a.mp4?hash=1&download=demo%5Babc%5D.mp4");
    }

    #[tokio::test]
    async fn submit_opens_hinted_url() {
        let opener = Arc::new(RecordingOpener::default());
        let backend = FallbackBackend::new(opener.clone());

        let mut descriptor = VideoDescriptor::new("abc", "demo");
        descriptor.file_sources = vec![FileSource {
            label: "Source".into(),
            url: "x".into(),
            view: None,
            size: None,
        }];
        descriptor.download_quality = "Source".into();
        descriptor.download_url = "https://cdn.test/a.mp4".into();
        let job = DownloadJob::new(
            descriptor,
            parse_local_path("/v/demo.mp4").unwrap(),
            "/v/demo.mp4".into(),
            BackendOptions::default(),
        )
        .unwrap();

        let receipt = backend.submit(&job).await.unwrap();
        assert_eq!(receipt.backend, DownloadType::Others);
        assert_eq!(
            opener.opened.lock().unwrap().as_slice(),
            ["https://cdn.test/a.mp4?download=demo.mp4".to_string()]
        );
    }
}
