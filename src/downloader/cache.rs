use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::Result;
use crate::metadata::VideoDescriptor;
use crate::storage::DurableStore;

const MAX_IN_MEMORY_ENTRIES: u64 = 1_000;
const STORE_PREFIX: &str = "videos/";

/// Last-good descriptors, kept in memory and written through to the durable store
pub struct DescriptorCache {
    memory: Cache<String, VideoDescriptor>,
    store: Arc<DurableStore>,
}

impl DescriptorCache {
    pub fn new(store: Arc<DurableStore>, ttl_seconds: u64) -> Self {
        Self {
            memory: Cache::builder()
                .max_capacity(MAX_IN_MEMORY_ENTRIES)
                .time_to_live(Duration::from_secs(ttl_seconds.max(1)))
                .build(),
            store,
        }
    }

    pub fn store_key(id: &str) -> String {
        format!("{}{}", STORE_PREFIX, id.to_lowercase())
    }

    pub async fn get(&self, id: &str) -> Option<VideoDescriptor> {
        let key = Self::store_key(id);
        if let Some(descriptor) = self.memory.get(&key).await {
            return Some(descriptor);
        }

        match self.store.get_as::<VideoDescriptor>(&key).await {
            Ok(Some(descriptor)) => {
                self.memory.insert(key, descriptor.clone()).await;
                Some(descriptor)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("⚠️ [CACHE] Ignoring unreadable entry {}: {}", key, e);
                None
            }
        }
    }

    /// Write-through; the newest descriptor for an ID always wins.
    ///
    /// The durable copy leaves out the comment text, which is only needed while
    /// the video is being checked.
    pub async fn put(&self, descriptor: &VideoDescriptor) -> Result<()> {
        let key = Self::store_key(&descriptor.id);
        let durable = VideoDescriptor {
            comment_text: String::new(),
            ..descriptor.clone()
        };
        self.store.set_as(&key, &durable).await?;
        self.memory.insert(key, descriptor.clone()).await;
        log::debug!("[CACHE] Stored descriptor {}", descriptor.id);
        Ok(())
    }

    /// Forgets durable descriptors not refreshed within `max_age`
    pub async fn prune(&self, max_age: Duration) -> Result<u64> {
        let removed = self.store.prune(STORE_PREFIX, max_age).await?;
        if removed > 0 {
            log::info!("🧹 [CACHE] Pruned {} stale descriptors", removed);
        }
        Ok(removed)
    }

    pub async fn invalidate(&self, id: &str) {
        self.memory.invalidate(&Self::store_key(id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_durable_store() {
        let store = Arc::new(DurableStore::in_memory().await.unwrap());
        let cache = DescriptorCache::new(store.clone(), 60);

        let mut descriptor = VideoDescriptor::new("ABC", "demo");
        descriptor.state = true;
        cache.put(&descriptor).await.unwrap();
        cache.invalidate("abc").await;

        assert_eq!(cache.get("ABC").await, Some(descriptor));
        assert!(store.get("videos/abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn durable_copy_drops_comment_text() {
        let store = Arc::new(DurableStore::in_memory().await.unwrap());
        let cache = DescriptorCache::new(store.clone(), 60);

        let mut descriptor = VideoDescriptor::new("abc", "demo");
        descriptor.comment_text = "a very long thread".to_string();
        cache.put(&descriptor).await.unwrap();

        assert_eq!(cache.get("abc").await.unwrap().comment_text, "a very long thread");
        cache.invalidate("abc").await;
        assert_eq!(cache.get("abc").await.unwrap().comment_text, "");
        assert_eq!(cache.prune(Duration::from_secs(3600)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn newest_write_wins() {
        let cache = DescriptorCache::new(Arc::new(DurableStore::in_memory().await.unwrap()), 60);
        cache.put(&VideoDescriptor::new("a", "first")).await.unwrap();
        cache.put(&VideoDescriptor::new("a", "second")).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().title, "second");
    }

    #[tokio::test]
    async fn unknown_id_is_none() {
        let cache = DescriptorCache::new(Arc::new(DurableStore::in_memory().await.unwrap()), 60);
        assert!(cache.get("missing").await.is_none());
    }
}
