// Video IDs queued for batch download, shared between every open context.
//
// Each context owns a replica. Local mutations are persisted and broadcast; replicas
// apply broadcasts from others without persisting again, and reload from the durable
// store when another process changes an entry. Every entry is its own store row, so
// conflicts resolve per video ID, last write wins.
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::errors::Result;
use crate::storage::DurableStore;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Set,
    Del,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Wire shape of a selection change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "scopeID")]
    pub scope_id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: MessageData,
}

impl ChannelMessage {
    pub fn set(scope_id: &str, key: &str, value: &str) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            kind: MessageType::Set,
            data: MessageData {
                key: key.to_string(),
                value: Some(value.to_string()),
            },
        }
    }

    pub fn del(scope_id: &str, key: &str) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            kind: MessageType::Del,
            data: MessageData {
                key: key.to_string(),
                value: None,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: Uuid,
    message: ChannelMessage,
}

/// Broadcast channel connecting the replicas of one process
#[derive(Clone)]
pub struct SelectionBus {
    sender: broadcast::Sender<Envelope>,
}

impl Default for SelectionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    fn publish(&self, origin: Uuid, message: ChannelMessage) {
        // Nobody listening is fine
        let _ = self.sender.send(Envelope { origin, message });
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

/// One queued video: lowercase ID and a display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionEntry {
    pub id: String,
    pub name: String,
}

pub struct SelectionSet {
    scope_id: String,
    replica_id: Uuid,
    entries: RwLock<Vec<SelectionEntry>>,
    store: Arc<DurableStore>,
    bus: SelectionBus,
}

impl SelectionSet {
    /// Loads the persisted list for `scope_id` and starts following the bus and the store
    pub async fn open(
        scope_id: &str,
        store: Arc<DurableStore>,
        bus: SelectionBus,
    ) -> Result<Arc<Self>> {
        let set = Arc::new(Self::detached(scope_id, store, bus));
        set.reload().await?;
        set.spawn_listeners();
        log::info!(
            "📋 [SELECTION] Opened scope {} with {} entries",
            scope_id,
            set.len().await
        );
        Ok(set)
    }

    /// A replica that only changes through explicit calls
    pub fn detached(scope_id: &str, store: Arc<DurableStore>, bus: SelectionBus) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            replica_id: Uuid::new_v4(),
            entries: RwLock::new(Vec::new()),
            store,
            bus,
        }
    }

    /// Store prefix under which every entry of `scope_id` lives
    pub fn store_prefix(scope_id: &str) -> String {
        format!("selection/{}/", scope_id)
    }

    pub fn entry_key(scope_id: &str, id: &str) -> String {
        format!("{}{}", Self::store_prefix(scope_id), id.to_lowercase())
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub async fn set(&self, id: &str, name: &str) -> Result<()> {
        let message = ChannelMessage::set(&self.scope_id, &id.to_lowercase(), name);
        self.apply_and_publish(message).await
    }

    pub async fn del(&self, id: &str) -> Result<()> {
        let message = ChannelMessage::del(&self.scope_id, &id.to_lowercase());
        self.apply_and_publish(message).await
    }

    pub async fn clear(&self) -> Result<()> {
        for id in self.keys().await {
            self.del(&id).await?;
        }
        Ok(())
    }

    /// Applies a message from another replica. Messages for other scopes are ignored.
    pub async fn apply(&self, message: &ChannelMessage) -> bool {
        if message.scope_id != self.scope_id {
            return false;
        }
        let mut entries = self.entries.write().await;
        apply_to(&mut entries, message)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.iter().map(|e| e.id.clone()).collect()
    }

    pub async fn entries(&self) -> Vec<SelectionEntry> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<String> {
        let id = id.to_lowercase();
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.name.clone())
    }

    pub async fn has(&self, id: &str) -> bool {
        self.get(id).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Replaces the replica with the persisted list
    pub async fn reload(&self) -> Result<()> {
        let prefix = Self::store_prefix(&self.scope_id);
        let persisted: Vec<SelectionEntry> = self
            .store
            .scan_prefix(&prefix)
            .await?
            .into_iter()
            .map(|(key, value)| SelectionEntry {
                id: key.strip_prefix(&prefix).unwrap_or(&key).to_string(),
                name: value.as_str().unwrap_or_default().to_string(),
            })
            .collect();
        *self.entries.write().await = persisted;
        Ok(())
    }

    async fn apply_and_publish(&self, message: ChannelMessage) -> Result<()> {
        if !apply_to(&mut *self.entries.write().await, &message) {
            return Ok(());
        }
        let key = Self::entry_key(&self.scope_id, &message.data.key);
        match message.kind {
            MessageType::Set => {
                let name = message.data.value.clone().unwrap_or_default();
                self.store.set_as(&key, &name).await?
            }
            MessageType::Del => self.store.remove(&key).await?,
        }
        self.bus.publish(self.replica_id, message);
        Ok(())
    }

    fn spawn_listeners(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut bus_rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                let envelope = match bus_rx.recv().await {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("⚠️ [SELECTION] Missed {} broadcasts, reloading", skipped);
                        match weak.upgrade() {
                            Some(set) => {
                                if let Err(e) = set.reload().await {
                                    log::warn!("⚠️ [SELECTION] Reload failed: {}", e);
                                }
                                continue;
                            }
                            None => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(set) = weak.upgrade() else { break };
                if envelope.origin != set.replica_id {
                    set.apply(&envelope.message).await;
                }
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let mut store_rx = self.store.subscribe();
        let prefix = Self::store_prefix(&self.scope_id);
        tokio::spawn(async move {
            loop {
                let change = match store_rx.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !change.remote || !change.key.starts_with(&prefix) {
                    continue;
                }
                let Some(set) = weak.upgrade() else { break };
                if let Err(e) = set.reload().await {
                    log::warn!("⚠️ [SELECTION] Reload after remote change failed: {}", e);
                }
            }
        });
    }
}

fn apply_to(entries: &mut Vec<SelectionEntry>, message: &ChannelMessage) -> bool {
    let key = message.data.key.to_lowercase();
    let position = entries.iter().position(|e| e.id == key);
    match message.kind {
        MessageType::Set => {
            let name = message.data.value.clone().unwrap_or_default();
            match position {
                Some(i) if entries[i].name == name => false,
                Some(i) => {
                    entries[i].name = name;
                    true
                }
                None => {
                    entries.push(SelectionEntry { id: key, name });
                    true
                }
            }
        }
        MessageType::Del => match position {
            Some(i) => {
                entries.remove(i);
                true
            }
            None => false,
        },
    }
}
