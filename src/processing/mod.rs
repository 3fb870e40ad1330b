// Orchestration loop: drains the selection set one video at a time through
// resolve, policy gates and dispatch.
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{AppConfig, ConfigStore, DownloadType};
use crate::downloader::manager::Dispatcher;
use crate::downloader::quality;
use crate::downloader::reconciler::{fetch_completed, Aria2Rpc, VideoRestarter};
use crate::downloader::DispatchReceipt;
use crate::errors::{AppError, Result};
use crate::metadata::resolver::{ResolveOptions, Resolver};
use crate::metadata::VideoDescriptor;
use crate::notifications::{Notification, Notifier};
use crate::selection::{SelectionEntry, SelectionSet};
use crate::utils::find_download_link_domain;

/// How one video left the pipeline
#[derive(Debug)]
pub enum Outcome {
    Dispatched(DispatchReceipt),
    /// A policy gate stopped the dispatch
    Held(AppError),
    Failed(AppError),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AnalyzeSummary {
    pub total: usize,
    pub dispatched: Vec<String>,
    pub held: Vec<String>,
    pub failed: Vec<String>,
    /// Deselected elsewhere before their turn came
    pub skipped: Vec<String>,
    /// Already complete in Aria2, never resolved
    pub already_completed: Vec<String>,
}

pub struct Pipeline {
    config: Arc<ConfigStore>,
    resolver: Arc<Resolver>,
    dispatcher: Arc<Dispatcher>,
    selection: Arc<SelectionSet>,
    notifier: Notifier,
    aria2: Option<Arc<dyn Aria2Rpc>>,
    show_progress: bool,
}

impl Pipeline {
    pub fn new(
        config: Arc<ConfigStore>,
        resolver: Arc<Resolver>,
        dispatcher: Arc<Dispatcher>,
        selection: Arc<SelectionSet>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            resolver,
            dispatcher,
            selection,
            notifier,
            aria2: None,
            show_progress: false,
        }
    }

    /// Lets the loop skip IDs Aria2 already finished
    pub fn with_aria2(mut self, aria2: Arc<dyn Aria2Rpc>) -> Self {
        self.aria2 = Some(aria2);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn selection(&self) -> &Arc<SelectionSet> {
        &self.selection
    }

    /// Processes `entries`, or the whole selection set when `None`.
    ///
    /// Keys are snapshotted up front. An ID removed from the selection by someone
    /// else before its turn is skipped; IDs added meanwhile wait for the next run.
    /// Every processed ID is removed from the selection whatever the outcome; one
    /// video failing, or the store refusing a removal, never stops the rest.
    pub async fn analyze(&self, entries: Option<Vec<SelectionEntry>>) -> AnalyzeSummary {
        let from_selection = entries.is_none();
        let mut pending = match entries {
            Some(entries) => entries,
            None => self.selection.entries().await,
        };
        let config = self.config.snapshot();
        let mut summary = AnalyzeSummary {
            total: pending.len(),
            ..Default::default()
        };

        if config.download_type == DownloadType::Aria2 {
            let completed = self.completed_in_aria2().await;
            pending.retain(|entry| {
                if completed.contains(&entry.id) {
                    summary.already_completed.push(entry.id.clone());
                    false
                } else {
                    true
                }
            });
            for id in &summary.already_completed {
                log::info!("⏭️ [PIPELINE] {} already downloaded by Aria2", id);
                self.deselect(id).await;
            }
        }

        let progress = self.progress_bar(summary.total as u64);
        progress.inc(summary.already_completed.len() as u64);

        for entry in pending {
            if from_selection && !self.selection.has(&entry.id).await {
                log::info!("⏭️ [PIPELINE] {} was deselected, skipping", entry.id);
                summary.skipped.push(entry.id);
                progress.inc(1);
                continue;
            }
            progress.set_message(entry.name.clone());

            match self.process_video(&entry.id, &entry.name).await {
                Outcome::Dispatched(_) => summary.dispatched.push(entry.id.clone()),
                Outcome::Held(_) => summary.held.push(entry.id.clone()),
                Outcome::Failed(_) => summary.failed.push(entry.id.clone()),
            }
            self.deselect(&entry.id).await;
            progress.inc(1);
        }
        progress.finish_and_clear();

        if summary.total != 1 {
            self.notifier.notify(Notification::info(
                "All completed",
                format!(
                    "{} dispatched, {} held, {} failed, {} skipped, {} already downloaded",
                    summary.dispatched.len(),
                    summary.held.len(),
                    summary.failed.len(),
                    summary.skipped.len(),
                    summary.already_completed.len()
                ),
            ));
        }
        summary
    }

    /// The single-video pipeline. Never returns an error; outcomes are also notified.
    pub async fn process_video(&self, id: &str, name: &str) -> Outcome {
        let config = self.config.snapshot();
        let options = ResolveOptions {
            priority: config.priority_table(),
            tie_break: config.tie_break,
            comment_concurrency: config.comment_concurrency,
        };

        let descriptor = match self.resolver.resolve(id, name, &options).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::error!("❌ [PIPELINE] Resolving {} failed: {}", id, e);
                self.notifier
                    .notify(Notification::for_failure(id, name, &e, &config.site_base));
                return Outcome::Failed(e);
            }
        };

        self.social_actions(&descriptor, &config).await;

        if let Some(warning) = check_gates(&descriptor, &config) {
            log::warn!("⚠️ [PIPELINE] {} held: {}", descriptor.display_name(), warning);
            self.notifier.notify(Notification::for_failure(
                &descriptor.id,
                &descriptor.title,
                &warning,
                &config.site_base,
            ));
            return Outcome::Held(warning);
        }

        match self.dispatcher.dispatch(&descriptor, &config).await {
            Ok(receipt) => {
                self.notifier.notify(Notification::info(
                    "Task pushed",
                    format!("{} handed to {:?}", descriptor.display_name(), receipt.backend),
                ));
                Outcome::Dispatched(receipt)
            }
            Err(e) => {
                log::error!("❌ [PIPELINE] Dispatching {} failed: {}", descriptor.display_name(), e);
                self.notifier.notify(Notification::for_failure(
                    &descriptor.id,
                    &descriptor.title,
                    &e,
                    &config.site_base,
                ));
                Outcome::Failed(e)
            }
        }
    }

    /// Auto-follow and auto-like. Failures only warn.
    async fn social_actions(&self, descriptor: &VideoDescriptor, config: &AppConfig) {
        let api = self.resolver.api();
        if config.auto_follow && !descriptor.following && !descriptor.author.id.is_empty() {
            match api.follow_user(&descriptor.author.id).await {
                Ok(true) => log::info!("👤 [PIPELINE] Followed {}", descriptor.author.username),
                Ok(false) | Err(_) => self.notifier.notify(Notification::warning(
                    "Auto follow failed",
                    descriptor.author.display_name.clone(),
                )),
            }
        }
        if config.auto_like && !descriptor.liked {
            match api.like_video(&descriptor.id).await {
                Ok(true) => log::info!("👍 [PIPELINE] Liked {}", descriptor.display_name()),
                Ok(false) | Err(_) => self.notifier.notify(Notification::warning(
                    "Auto like failed",
                    descriptor.display_name(),
                )),
            }
        }
    }

    /// A store failure leaves the ID selected for the next run and never stops the loop
    async fn deselect(&self, id: &str) {
        if let Err(e) = self.selection.del(id).await {
            log::warn!("⚠️ [PIPELINE] Could not deselect {}: {}", id, e);
        }
    }

    async fn completed_in_aria2(&self) -> HashSet<String> {
        let Some(aria2) = &self.aria2 else {
            return HashSet::new();
        };
        match fetch_completed(aria2.as_ref()).await {
            Ok(completed) => completed,
            Err(e) => {
                log::warn!("⚠️ [PIPELINE] Could not read completed Aria2 tasks: {}", e);
                HashSet::new()
            }
        }
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::with_template("[{pos}/{len}] {bar:30} {msg}") {
            bar.set_style(style);
        }
        bar
    }
}

/// Suspicious-link check first, then the quality check
pub fn check_gates(descriptor: &VideoDescriptor, config: &AppConfig) -> Option<AppError> {
    if config.check_download_link {
        if let Some(domain) = find_download_link_domain(&descriptor.comment_text) {
            return Some(AppError::SuspiciousLink {
                id: descriptor.id.clone(),
                domain: domain.to_string(),
            });
        }
    }
    if config.check_priority_source {
        return quality::check_preferred(
            &descriptor.id,
            &descriptor.download_quality,
            &config.preferred_quality,
        );
    }
    None
}

#[async_trait]
impl VideoRestarter for Pipeline {
    async fn restart(&self, id: &str) -> Result<()> {
        match self.process_video(id, id).await {
            Outcome::Dispatched(_) => Ok(()),
            Outcome::Held(e) | Outcome::Failed(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::cache::DescriptorCache;
    use crate::downloader::strategies::aria2::{Aria2File, Aria2Task};
    use crate::downloader::{DownloadBackend, DownloadJob};
    use crate::metadata::resolver::tests::FakeApi;
    use crate::selection::SelectionBus;
    use crate::storage::DurableStore;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingBackend {
        jobs: Mutex<Vec<String>>,
        deselect_on_submit: Mutex<Option<(Arc<SelectionSet>, String)>>,
        reject: Mutex<Option<String>>,
        break_store_on_submit: Mutex<Option<Arc<DurableStore>>>,
    }

    #[async_trait]
    impl DownloadBackend for RecordingBackend {
        fn kind(&self) -> DownloadType {
            DownloadType::Others
        }

        fn name(&self) -> &'static str {
            "Recording"
        }

        async fn submit(&self, job: &DownloadJob) -> Result<DispatchReceipt> {
            if self.reject.lock().unwrap().as_deref() == Some(job.descriptor.id.as_str()) {
                return Err(AppError::BackendRejected(format!("{} refused", job.descriptor.id)));
            }
            self.jobs.lock().unwrap().push(job.descriptor.id.clone());
            let deselect = self.deselect_on_submit.lock().unwrap().take();
            if let Some((selection, id)) = deselect {
                selection.del(&id).await?;
            }
            let store = self.break_store_on_submit.lock().unwrap().take();
            if let Some(store) = store {
                store.break_table().await;
            }
            Ok(DispatchReceipt {
                backend: DownloadType::Others,
                video_id: job.descriptor.id.clone(),
                reference: None,
            })
        }

        async fn check(&self) -> Result<()> {
            Ok(())
        }
    }

    struct CompletedAria2(Vec<Aria2Task>);

    #[async_trait]
    impl Aria2Rpc for CompletedAria2 {
        async fn tell_active(&self, _keys: &[&str]) -> Result<Vec<Aria2Task>> {
            Ok(Vec::new())
        }

        async fn tell_stopped(&self, _offset: i64, _num: u64, _keys: &[&str]) -> Result<Vec<Aria2Task>> {
            Ok(self.0.clone())
        }

        async fn force_remove(&self, _gid: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        pipeline: Pipeline,
        store: Arc<DurableStore>,
        backend: Arc<RecordingBackend>,
        notifications: tokio::sync::mpsc::UnboundedReceiver<Notification>,
    }

    async fn harness(api: FakeApi, config: AppConfig) -> Harness {
        let store = Arc::new(DurableStore::in_memory().await.unwrap());
        let cache = Arc::new(DescriptorCache::new(store.clone(), 60));
        let resolver = Arc::new(Resolver::new(Arc::new(api), cache));
        let backend = Arc::new(RecordingBackend {
            jobs: Mutex::new(Vec::new()),
            deselect_on_submit: Mutex::new(None),
            reject: Mutex::new(None),
            break_store_on_submit: Mutex::new(None),
        });
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(backend.clone());
        let selection = SelectionSet::open("test", store.clone(), SelectionBus::new())
            .await
            .unwrap();
        let (notifier, notifications) = Notifier::channel();
        let pipeline = Pipeline::new(
            Arc::new(ConfigStore::new(config, None)),
            resolver,
            Arc::new(dispatcher),
            selection,
            notifier,
        );
        Harness {
            pipeline,
            store,
            backend,
            notifications,
        }
    }

    fn relaxed_config() -> AppConfig {
        AppConfig {
            download_type: DownloadType::Others,
            check_download_link: false,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn dispatches_and_deselects() {
        let h = harness(FakeApi::with_video("abc"), relaxed_config()).await;
        h.pipeline.selection().set("abc", "demo").await.unwrap();

        let summary = h.pipeline.analyze(None).await;

        assert_eq!(summary.dispatched, vec!["abc"]);
        assert_eq!(*h.backend.jobs.lock().unwrap(), vec!["abc"]);
        assert!(h.pipeline.selection().is_empty().await);
    }

    #[tokio::test]
    async fn not_found_deselects_without_dispatch() {
        let mut api = FakeApi::with_video("abc");
        api.video.id = None;
        let mut h = harness(api, relaxed_config()).await;
        h.pipeline.selection().set("abc", "demo").await.unwrap();

        let summary = h.pipeline.analyze(None).await;

        assert_eq!(summary.failed, vec!["abc"]);
        assert!(h.backend.jobs.lock().unwrap().is_empty());
        assert!(!h.pipeline.selection().has("abc").await);
        let notification = h.notifications.recv().await.unwrap();
        assert!(notification.action.is_some());
    }

    #[tokio::test]
    async fn suspicious_comments_hold_the_dispatch() {
        let config = AppConfig {
            check_download_link: true,
            ..relaxed_config()
        };
        let h = harness(FakeApi::with_video("abc"), config).await;

        match h.pipeline.process_video("abc", "demo").await {
            Outcome::Held(AppError::SuspiciousLink { domain, .. }) => assert_eq!(domain, "mega.nz"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(h.backend.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lower_quality_is_held_when_checked() {
        let mut api = FakeApi::with_video("abc");
        api.files = json!([{"name": "540", "src": {"download": "//cdn.test/540.mp4"}}]);
        let h = harness(api, relaxed_config()).await;

        assert!(matches!(
            h.pipeline.process_video("abc", "demo").await,
            Outcome::Held(AppError::QualityWarning { .. })
        ));
    }

    #[tokio::test]
    async fn ids_deselected_mid_run_are_skipped() {
        let h = harness(FakeApi::with_video("abc"), relaxed_config()).await;
        let selection = h.pipeline.selection().clone();
        selection.set("abc", "one").await.unwrap();
        selection.set("gone", "two").await.unwrap();
        *h.backend.deselect_on_submit.lock().unwrap() = Some((selection.clone(), "gone".into()));

        let summary = h.pipeline.analyze(None).await;

        assert_eq!(summary.dispatched, vec!["abc"]);
        assert_eq!(summary.skipped, vec!["gone"]);
        assert_eq!(*h.backend.jobs.lock().unwrap(), vec!["abc"]);
    }

    #[tokio::test]
    async fn explicit_lists_are_processed_as_given() {
        let h = harness(FakeApi::with_video("abc"), relaxed_config()).await;
        let entries = vec![SelectionEntry {
            id: "abc".into(),
            name: "demo".into(),
        }];

        let summary = h.pipeline.analyze(Some(entries)).await;
        assert_eq!(summary.dispatched, vec!["abc"]);
    }

    #[tokio::test]
    async fn aria2_completed_ids_are_dropped_before_resolving() {
        let config = AppConfig {
            download_type: DownloadType::Aria2,
            ..relaxed_config()
        };
        let mut h = harness(FakeApi::with_video("abc"), config).await;
        h.pipeline = h.pipeline.with_aria2(Arc::new(CompletedAria2(vec![Aria2Task {
            gid: "1".into(),
            status: "complete".into(),
            files: vec![Aria2File { path: "/v/demo[abc].mp4".into() }],
            ..Default::default()
        }])));
        h.pipeline.selection().set("abc", "demo").await.unwrap();

        let summary = h.pipeline.analyze(None).await;

        assert_eq!(summary.already_completed, vec!["abc"]);
        assert!(summary.dispatched.is_empty());
        assert!(h.pipeline.selection().is_empty().await);
    }

    #[tokio::test]
    async fn one_failing_video_does_not_stop_the_others() {
        let mut api = FakeApi::with_video("abc");
        api.missing = vec!["lost".to_string()];
        let mut h = harness(api, relaxed_config()).await;
        *h.backend.reject.lock().unwrap() = Some("refused".into());
        let selection = h.pipeline.selection().clone();
        for id in ["first", "lost", "refused", "last"] {
            selection.set(id, id).await.unwrap();
        }

        let summary = h.pipeline.analyze(None).await;

        assert_eq!(summary.dispatched, vec!["first", "last"]);
        assert_eq!(summary.failed, vec!["lost", "refused"]);
        assert_eq!(*h.backend.jobs.lock().unwrap(), vec!["first", "last"]);
        assert!(selection.is_empty().await);

        let mut titles = Vec::new();
        while let Ok(notification) = h.notifications.try_recv() {
            titles.push(notification.title);
        }
        assert_eq!(titles.last().map(String::as_str), Some("All completed"));
    }

    #[tokio::test]
    async fn store_failure_mid_run_keeps_processing() {
        let mut h = harness(FakeApi::with_video("abc"), relaxed_config()).await;
        let selection = h.pipeline.selection().clone();
        for id in ["one", "two", "three"] {
            selection.set(id, id).await.unwrap();
        }
        *h.backend.break_store_on_submit.lock().unwrap() = Some(h.store.clone());

        let summary = h.pipeline.analyze(None).await;

        assert_eq!(summary.dispatched, vec!["one", "two", "three"]);
        assert!(summary.failed.is_empty());
        assert!(h.store.keys().await.is_err());

        let mut titles = Vec::new();
        while let Ok(notification) = h.notifications.try_recv() {
            titles.push(notification.title);
        }
        assert_eq!(titles.last().map(String::as_str), Some("All completed"));
    }
}
