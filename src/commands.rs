use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::api::client::ApiClient;
use crate::api::token::{TokenKind, TokenStore};
use crate::config::{AppConfig, ConfigStore, DownloadType};
use crate::downloader::cache::DescriptorCache;
use crate::downloader::http_pool::HttpPoolManager;
use crate::downloader::manager::{template_vars, Dispatcher};
use crate::downloader::path_template;
use crate::downloader::reconciler::Reconciler;
use crate::downloader::strategies::{
    Aria2Backend, Aria2Client, FallbackBackend, IwaraDownloaderBackend, NativeBackend, SystemOpener,
};
use crate::errors::{AppError, Result};
use crate::metadata::resolver::Resolver;
use crate::metadata::VideoDescriptor;
use crate::notifications::{Notification, Notifier};
use crate::processing::Pipeline;
use crate::selection::{SelectionBus, SelectionEntry, SelectionSet};
use crate::storage::DurableStore;
use crate::utils::{compare_versions, parse_manual_ids, VersionState};

const MAX_CONNECTIONS: usize = 10;
const DESCRIPTOR_TTL_SECS: u64 = 3600;
const DESCRIPTOR_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 3600);
const VERSION_KEY: &str = "meta/version";

// State management
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub store: Arc<DurableStore>,
    pub tokens: Arc<TokenStore>,
    pub selection: Arc<SelectionSet>,
    pub dispatcher: Arc<Dispatcher>,
    pub pipeline: Arc<Pipeline>,
    pub aria2: Arc<Aria2Client>,
    pub notifier: Notifier,
}

impl AppState {
    /// Wires every service from the configuration. Called once per process.
    pub async fn initialize(
        config: AppConfig,
        config_path: Option<PathBuf>,
        store_path: PathBuf,
        scope_id: &str,
        notifier: Notifier,
    ) -> Result<Self> {
        let config_store = Arc::new(ConfigStore::new(config.clone(), config_path));
        let store = Arc::new(DurableStore::open(store_path).await?);
        check_version(&store, &notifier).await;

        let tokens = Arc::new(TokenStore::new(
            config.authorization.clone(),
            config.refresh_token.clone(),
        ));
        {
            let tokens = tokens.clone();
            config_store.subscribe(Box::new(move |field, config| match field {
                "authorization" => {
                    if let Some(token) = &config.authorization {
                        tokens.set_access_token(token);
                    }
                }
                "refresh_token" => {
                    if let Some(token) = &config.refresh_token {
                        tokens.set_refresh_token(token);
                    }
                }
                _ => {}
            }));
        }

        let pool = HttpPoolManager::new(MAX_CONNECTIONS, config.request_timeout_secs)?.get_pool();
        let client = pool.get_client().clone();

        let api = Arc::new(ApiClient::new(
            client.clone(),
            &config.api_base,
            &config.cookies,
            &config.signature_secret,
            tokens.clone(),
        ));
        let cache = Arc::new(DescriptorCache::new(store.clone(), DESCRIPTOR_TTL_SECS));
        if let Err(e) = cache.prune(DESCRIPTOR_MAX_AGE).await {
            log::warn!("⚠️ [CACHE] Could not prune stale descriptors: {}", e);
        }
        let resolver = Arc::new(Resolver::new(api, cache));

        let aria2 = Arc::new(Aria2Client::new(client.clone(), &config.aria2_path, &config.aria2_token));
        let download_pool = if config.download_proxy.is_empty() {
            pool.clone()
        } else {
            HttpPoolManager::new(MAX_CONNECTIONS, config.request_timeout_secs)?
                .with_proxy(&config.download_proxy)?
                .get_pool()
        };

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(Aria2Backend::new(Aria2Client::new(
            client.clone(),
            &config.aria2_path,
            &config.aria2_token,
        ))));
        dispatcher.register(Arc::new(IwaraDownloaderBackend::new(
            client,
            &config.iwara_downloader_path,
            &config.iwara_downloader_token,
        )));
        dispatcher.register(Arc::new(NativeBackend::new(
            download_pool,
            native_download_root()?,
            config.native_download_enabled,
            config.native_allowed_extensions.clone(),
            notifier.clone(),
        )));
        dispatcher.register(Arc::new(FallbackBackend::new(Arc::new(SystemOpener))));
        let dispatcher = Arc::new(dispatcher);

        let selection = SelectionSet::open(scope_id, store.clone(), SelectionBus::new()).await?;
        let pipeline = Arc::new(
            Pipeline::new(
                config_store.clone(),
                resolver,
                dispatcher.clone(),
                selection.clone(),
                notifier.clone(),
            )
            .with_aria2(aria2.clone())
            .with_progress(true),
        );

        log::info!("✅ Services initialized (backend: {:?})", config.download_type);
        Ok(Self {
            config: config_store,
            store,
            tokens,
            selection,
            dispatcher,
            pipeline,
            aria2,
            notifier,
        })
    }
}

fn native_download_root() -> Result<PathBuf> {
    match dirs::download_dir() {
        Some(dir) => Ok(dir),
        None => Ok(AppConfig::get_data_dir()?.join("downloads")),
    }
}

/// Announces a new build once per upgrade
async fn check_version(store: &DurableStore, notifier: &Notifier) {
    let current = env!("CARGO_PKG_VERSION");
    let previous: Option<String> = store.get_as(VERSION_KEY).await.ok().flatten();
    let state = previous
        .as_deref()
        .map(|previous| compare_versions(current, previous))
        .unwrap_or(VersionState::High);
    if state == VersionState::High {
        if let Some(previous) = &previous {
            notifier.notify(Notification::info(
                "Updated",
                format!("iwara-dl {} (was {})", current, previous),
            ));
        }
        if let Err(e) = store.set_as(VERSION_KEY, &current).await {
            log::warn!("⚠️ Could not record version: {}", e);
        }
    }
}

pub async fn select_videos(state: &AppState, input: &str) -> Result<serde_json::Value> {
    let ids = parse_manual_ids(input);
    if ids.is_empty() {
        return Err(AppError::Validation("No video IDs found in input".to_string()));
    }
    for id in &ids {
        state.selection.set(id, id).await?;
    }
    Ok(json!({
        "success": true,
        "added": ids,
        "selected": state.selection.len().await
    }))
}

pub async fn deselect_videos(state: &AppState, input: &str) -> Result<serde_json::Value> {
    let ids = parse_manual_ids(input);
    for id in &ids {
        state.selection.del(id).await?;
    }
    Ok(json!({
        "success": true,
        "removed": ids,
        "selected": state.selection.len().await
    }))
}

pub async fn clear_selection(state: &AppState) -> Result<serde_json::Value> {
    let cleared_count = state.selection.len().await;
    state.selection.clear().await?;
    Ok(json!({
        "success": true,
        "cleared_count": cleared_count
    }))
}

pub async fn list_selection(state: &AppState) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(state.selection.entries().await)?)
}

/// Drains the whole selection set
pub async fn run_selection(state: &AppState) -> Result<serde_json::Value> {
    let summary = state.pipeline.analyze(None).await;
    Ok(json!({
        "success": summary.failed.is_empty(),
        "total": summary.total,
        "dispatched": summary.dispatched,
        "held": summary.held,
        "failed": summary.failed,
        "skipped": summary.skipped,
        "already_completed": summary.already_completed
    }))
}

/// Runs the given IDs through the pipeline without touching the rest of the selection
pub async fn download_videos(state: &AppState, input: &str) -> Result<serde_json::Value> {
    let entries: Vec<SelectionEntry> = parse_manual_ids(input)
        .into_iter()
        .map(|id| SelectionEntry {
            name: id.clone(),
            id,
        })
        .collect();
    if entries.is_empty() {
        return Err(AppError::Validation("No video IDs found in input".to_string()));
    }
    let summary = state.pipeline.analyze(Some(entries)).await;
    Ok(json!({
        "success": summary.failed.is_empty() && summary.held.is_empty(),
        "dispatched": summary.dispatched,
        "held": summary.held,
        "failed": summary.failed,
        "already_completed": summary.already_completed
    }))
}

pub async fn reconcile(state: &AppState, watch: bool) -> Result<serde_json::Value> {
    let config = state.config.snapshot();
    if config.download_type != DownloadType::Aria2 {
        log::warn!("⚠️ Reconciling Aria2 while the configured backend is {:?}", config.download_type);
    }
    let reconciler = Reconciler::new(
        state.aria2.clone(),
        state.pipeline.clone(),
        config.stall_speed_threshold,
    );

    if watch {
        // Runs until the process is stopped.
        let interval = Duration::from_secs(config.reconcile_interval_secs.max(1));
        reconciler.watch(interval).await;
        Ok(json!({ "success": true, "watching": true }))
    } else {
        let report = reconciler.reconcile_once().await?;
        Ok(json!({
            "success": true,
            "completed": report.completed,
            "stalled": report.stalled,
            "restarted": report.restarted,
            "removed": report.removed,
            "skipped": report.skipped
        }))
    }
}

/// Tests the configured backend and renders the path template with sample values
pub async fn check(state: &AppState, backend: Option<DownloadType>) -> Result<serde_json::Value> {
    let config = state.config.snapshot();
    let kind = backend.unwrap_or(config.download_type);

    let mut sample = VideoDescriptor::new("sampleid", "Sample Title");
    sample.author.username = "sample_author".to_string();
    sample.author.display_name = "Sample Author".to_string();
    sample.download_quality = "Source".to_string();
    sample.upload_time = Some(chrono::Utc::now());
    let template = path_template::render(
        &config.download_path,
        &template_vars(&sample, chrono::Local::now().into()),
    );

    let backend_error = match state.dispatcher.check(kind).await {
        Ok(()) => None,
        Err(e) => {
            state.notifier.notify(Notification::error(
                "Connection test",
                format!("{:?}: {}", kind, e),
            ));
            Some(e.to_string())
        }
    };

    let success = backend_error.is_none() && template.is_ok();
    let path_template = match template {
        Ok(path) => json!({ "ok": true, "sample": path.full_path }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };

    Ok(json!({
        "success": success,
        "backend": {
            "type": kind,
            "ok": backend_error.is_none(),
            "error": backend_error
        },
        "path_template": path_template
    }))
}

pub fn parse_ids(input: &str) -> serde_json::Value {
    json!(parse_manual_ids(input))
}

pub fn show_config(state: &AppState) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(state.config.snapshot())?;
    for secret in ["authorization", "refresh_token", "aria2_token", "iwara_downloader_token"] {
        if matches!(value.get(secret), Some(v) if !v.is_null() && v.as_str() != Some("")) {
            value[secret] = json!("***");
        }
    }
    Ok(value)
}

pub fn set_config(state: &AppState, field: &str, raw: &str) -> Result<serde_json::Value> {
    let changed = state.config.set_field(field, raw)?;
    Ok(json!({
        "success": true,
        "changed": changed
    }))
}

/// Stores a JWT under the slot its payload claims
pub fn login_token(state: &AppState, token: &str) -> Result<serde_json::Value> {
    let kind = state
        .tokens
        .observe(token)
        .ok_or_else(|| AppError::Validation("Not a JWT".to_string()))?;
    let token = token.trim().to_string();
    let changed = match kind {
        TokenKind::Access => state
            .config
            .update(|config| config.authorization = Some(token))?,
        TokenKind::Refresh => state
            .config
            .update(|config| config.refresh_token = Some(token))?,
        TokenKind::Other => {
            return Err(AppError::Validation(
                "Token is neither an access nor a refresh token".to_string(),
            ))
        }
    };
    Ok(json!({
        "success": true,
        "kind": format!("{:?}", kind),
        "changed": changed
    }))
}
