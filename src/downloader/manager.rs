use chrono::{DateTime, FixedOffset, Local};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AppConfig, DownloadType};
use crate::downloader::path_template::{self, TemplateVars};
use crate::downloader::{BackendOptions, DispatchReceipt, DownloadBackend, DownloadJob};
use crate::errors::{AppError, Result};
use crate::metadata::VideoDescriptor;

/// Routes resolved videos to exactly one registered backend
#[derive(Default)]
pub struct Dispatcher {
    backends: HashMap<DownloadType, Arc<dyn DownloadBackend>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `backend` under its own kind, replacing any previous one
    pub fn register(&mut self, backend: Arc<dyn DownloadBackend>) {
        log::debug!("[DISPATCH] Registered backend {}", backend.name());
        self.backends.insert(backend.kind(), backend);
    }

    pub fn backend(&self, kind: DownloadType) -> Result<&Arc<dyn DownloadBackend>> {
        self.backends
            .get(&kind)
            .ok_or_else(|| AppError::Validation(format!("No backend registered for {:?}", kind)))
    }

    /// Submits the descriptor to the configured backend. Returns once the backend
    /// acknowledged the job; the transfer itself is never awaited.
    pub async fn dispatch(
        &self,
        descriptor: &VideoDescriptor,
        config: &AppConfig,
    ) -> Result<DispatchReceipt> {
        let backend = self.backend(config.download_type)?;
        let job = build_job(descriptor, config, Local::now().into())?;
        log::info!(
            "🚀 [DISPATCH] {} -> {} ({})",
            job.display_name(),
            backend.name(),
            job.path.full_path
        );
        backend.submit(&job).await
    }

    pub async fn check(&self, kind: DownloadType) -> Result<()> {
        self.backend(kind)?.check().await
    }
}

/// Variables available to the download path template
pub fn template_vars(descriptor: &VideoDescriptor, now: DateTime<FixedOffset>) -> TemplateVars {
    let upload_time = descriptor
        .upload_time
        .map(|t| DateTime::<FixedOffset>::from(t.with_timezone(&Local)))
        .unwrap_or(now);
    TemplateVars::new()
        .with("NowTime", now)
        .with("UploadTime", upload_time)
        .with("AUTHOR", descriptor.author.username.as_str())
        .with("ID", descriptor.id.as_str())
        .with("TITLE", descriptor.title.as_str())
        .with("ALIAS", descriptor.author.display_name.as_str())
        .with("QUALITY", descriptor.download_quality.as_str())
}

/// Renders the path and assembles the job handed to a backend
pub fn build_job(
    descriptor: &VideoDescriptor,
    config: &AppConfig,
    now: DateTime<FixedOffset>,
) -> Result<DownloadJob> {
    let vars = template_vars(descriptor, now);
    let rendered = path_template::expand(&config.download_path, &vars);
    let path = path_template::parse_local_path(rendered.trim())?;
    let options = BackendOptions {
        proxy: config.download_proxy.clone(),
        cookies: config.cookies.clone(),
        referer: referer_host(&config.site_base),
    };
    DownloadJob::new(descriptor.clone(), path, rendered, options)
}

fn referer_host(site_base: &str) -> String {
    url::Url::parse(site_base)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileSource;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingBackend {
        kind: DownloadType,
        jobs: Mutex<Vec<DownloadJob>>,
    }

    impl RecordingBackend {
        fn new(kind: DownloadType) -> Arc<Self> {
            Arc::new(Self {
                kind,
                jobs: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DownloadBackend for RecordingBackend {
        fn kind(&self) -> DownloadType {
            self.kind
        }

        fn name(&self) -> &'static str {
            "Recording"
        }

        async fn submit(&self, job: &DownloadJob) -> Result<DispatchReceipt> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(DispatchReceipt {
                backend: self.kind,
                video_id: job.descriptor.id.clone(),
                reference: None,
            })
        }

        async fn check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn descriptor() -> VideoDescriptor {
        let mut descriptor = VideoDescriptor::new("abc123", "demo");
        descriptor.author.username = "alice".into();
        descriptor.author.display_name = "Alice".into();
        descriptor.file_sources = vec![FileSource {
            label: "Source".into(),
            url: "//cdn.test/a.mp4".into(),
            view: None,
            size: None,
        }];
        descriptor.download_quality = "Source".into();
        descriptor.download_url = "https://cdn.test/a.mp4".into();
        descriptor.state = true;
        descriptor
    }

    #[tokio::test]
    async fn dispatches_to_exactly_the_configured_backend() {
        let aria2 = RecordingBackend::new(DownloadType::Aria2);
        let others = RecordingBackend::new(DownloadType::Others);
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(aria2.clone());
        dispatcher.register(others.clone());

        let config = AppConfig {
            download_type: DownloadType::Aria2,
            ..AppConfig::default()
        };
        let receipt = dispatcher.dispatch(&descriptor(), &config).await.unwrap();

        assert_eq!(receipt.backend, DownloadType::Aria2);
        assert_eq!(aria2.jobs.lock().unwrap().len(), 1);
        assert!(others.jobs.lock().unwrap().is_empty());

        let job = aria2.jobs.lock().unwrap()[0].clone();
        assert_eq!(job.path.full_path, "/Iwara/alice/demo[abc123].mp4");
        assert_eq!(job.options.referer, "www.iwara.tv");
    }

    #[tokio::test]
    async fn missing_backend_is_reported() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch(&descriptor(), &AppConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn invalid_template_fails_with_path_format() {
        let config = AppConfig {
            download_path: "/Iwara/%#AUTHOR#%/".into(),
            ..AppConfig::default()
        };
        let now: DateTime<FixedOffset> = "2024-01-02T03:04:05+00:00".parse().unwrap();
        assert!(matches!(
            build_job(&descriptor(), &config, now),
            Err(AppError::PathFormat(_))
        ));
    }

    #[test]
    fn templates_can_use_every_variable() {
        let config = AppConfig {
            download_path: "%#ALIAS#%/%#QUALITY#%/%#NowTime:YYYY#%/%#TITLE#%[%#ID#%].mp4".into(),
            ..AppConfig::default()
        };
        let now: DateTime<FixedOffset> = "2024-01-02T03:04:05+00:00".parse().unwrap();
        let job = build_job(&descriptor(), &config, now).unwrap();
        assert_eq!(job.path.full_path, "Alice/Source/2024/demo[abc123].mp4");
        assert_eq!(job.rendered_path, "Alice/Source/2024/demo[abc123].mp4");
    }
}
