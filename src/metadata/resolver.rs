use rand::Rng;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::api::client::MetadataApi;
use crate::api::FileSourceRaw;
use crate::downloader::cache::DescriptorCache;
use crate::downloader::quality::{self, PriorityTable, TieBreak};
use crate::errors::{AppError, Result};
use crate::metadata::comments::{comment_text, fetch_comment_tree};
use crate::metadata::{Author, FileSource, VideoDescriptor};
use crate::utils::{normalize_text, sanitize_filename, truncate_chars};

const MAX_TITLE_CHARS: usize = 128;

/// Knobs the resolver reads from the configuration on every call
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub priority: PriorityTable,
    pub tie_break: TieBreak,
    pub comment_concurrency: usize,
}

/// Turns a video ID into a fully populated [`VideoDescriptor`]
pub struct Resolver {
    api: Arc<dyn MetadataApi>,
    cache: Arc<DescriptorCache>,
    rng: Mutex<rand::rngs::StdRng>,
}

impl Resolver {
    pub fn new(api: Arc<dyn MetadataApi>, cache: Arc<DescriptorCache>) -> Self {
        use rand::SeedableRng;
        Self {
            api,
            cache,
            rng: Mutex::new(rand::rngs::StdRng::from_entropy()),
        }
    }

    pub fn api(&self) -> &Arc<dyn MetadataApi> {
        &self.api
    }

    /// Resolves `id`. `name_hint` is used as the title when the record carries none.
    pub async fn resolve(
        &self,
        id: &str,
        name_hint: &str,
        options: &ResolveOptions,
    ) -> Result<VideoDescriptor> {
        let id = id.to_lowercase();
        log::info!("🔍 [RESOLVE] Resolving video {}", id);

        if let Err(e) = self.api.refresh_authorization().await {
            log::warn!("⚠️ [RESOLVE] Token refresh failed, keeping last credential: {}", e);
        }

        let raw = self.api.fetch_video(&id).await?;
        if raw.id.is_none() {
            let cached = self.cache.get(&id).await.map(Box::new);
            if cached.is_some() {
                log::info!("💾 [RESOLVE] Video {} not returned by the API, cached copy available", id);
            }
            return Err(AppError::NotFound { id, cached });
        }

        let mut descriptor = VideoDescriptor::new(&id, name_hint);
        let title = raw.title.clone().unwrap_or_else(|| name_hint.to_string());
        descriptor.title = truncate_chars(&sanitize_filename(&normalize_text(&title)), MAX_TITLE_CHARS);

        if let Some(embed_url) = raw.embed_url.clone().filter(|url| !url.is_empty()) {
            descriptor.external = true;
            return Err(AppError::ExternalVideo { id, embed_url });
        }

        if let Some(user) = &raw.user {
            descriptor.author = Author {
                id: user.id.clone(),
                username: sanitize_filename(&normalize_text(&user.username)),
                display_name: user.name.clone(),
            };
            descriptor.following = user.following;
            descriptor.friend = user.friend;
        }
        descriptor.liked = raw.liked;
        descriptor.private = raw.private;
        descriptor.upload_time = raw.created_at;
        descriptor.tags = raw.tags.clone();
        if let Some(file) = &raw.file {
            descriptor.file_name = sanitize_filename(&file.name);
            descriptor.size = file.size;
        }

        let file_url = raw
            .file_url
            .clone()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| AppError::NoSource(id.clone()))?;
        let mut sources = parse_file_sources(&id, self.api.fetch_file_sources(&file_url).await?)?;
        quality::rank(&mut sources, &options.priority);

        let chosen = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| AppError::Validation("resolver rng lock poisoned".to_string()))?;
            pick_source(&id, &sources, options.tie_break, &mut *rng)?
        };
        descriptor.download_quality = chosen.label.clone();
        descriptor.download_url = download_url(&chosen.url);
        descriptor.file_sources = sources;

        let comments = fetch_comment_tree(self.api.as_ref(), &id, options.comment_concurrency).await?;
        descriptor.comment_text = comment_text(raw.body.as_deref().unwrap_or_default(), &comments);

        descriptor.state = true;
        if let Err(e) = self.cache.put(&descriptor).await {
            log::warn!("⚠️ [RESOLVE] Could not cache {}: {}", descriptor.id, e);
        }
        log::info!(
            "✅ [RESOLVE] {} resolved with quality {} ({} comments)",
            descriptor.display_name(),
            descriptor.download_quality,
            comments.len()
        );
        Ok(descriptor)
    }
}

fn parse_file_sources(id: &str, value: Value) -> Result<Vec<FileSource>> {
    let list = match value {
        Value::Array(list) if !list.is_empty() => list,
        _ => return Err(AppError::NoSource(id.to_string())),
    };
    list.into_iter()
        .map(|item| {
            serde_json::from_value::<FileSourceRaw>(item)
                .map(FileSource::from)
                .map_err(AppError::from)
        })
        .collect()
}

fn pick_source<R: Rng + ?Sized>(
    id: &str,
    ranked: &[FileSource],
    tie_break: TieBreak,
    rng: &mut R,
) -> Result<FileSource> {
    let chosen = quality::select(ranked, tie_break, rng).ok_or_else(|| AppError::NoAvailableSource {
        id: id.to_string(),
        quality: String::new(),
    })?;
    if chosen.url.is_empty() {
        return Err(AppError::SourceUnavailable {
            id: id.to_string(),
            quality: chosen.label.clone(),
        });
    }
    Ok(chosen.clone())
}

/// Source links are protocol-relative and percent-encoded
fn download_url(src: &str) -> String {
    let absolute = if src.starts_with("//") {
        format!("https:{}", src)
    } else {
        src.to_string()
    };
    urlencoding::decode(&absolute)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(absolute)
}
