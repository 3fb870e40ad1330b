// Recovers stalled Aria2 transfers.
//
// Aria2 cannot tell us which video a task belongs to, so the ID is read back from
// the output file name: the last `[...]` group, as written by the default path
// template. A stalled task whose video is not already complete is resolved and
// dispatched again from scratch, then removed from the queue.
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::downloader::strategies::aria2::{Aria2Client, Aria2Task};
use crate::errors::Result;

const ACTIVE_KEYS: [&str; 4] = ["gid", "downloadSpeed", "files", "bittorrent"];
const STOPPED_KEYS: [&str; 5] = ["gid", "status", "files", "errorCode", "bittorrent"];
const STOPPED_PAGE: u64 = 2048;

/// The Aria2 calls the reconciler needs
#[async_trait]
pub trait Aria2Rpc: Send + Sync {
    async fn tell_active(&self, keys: &[&str]) -> Result<Vec<Aria2Task>>;
    async fn tell_stopped(&self, offset: i64, num: u64, keys: &[&str]) -> Result<Vec<Aria2Task>>;
    async fn force_remove(&self, gid: &str) -> Result<()>;
}

#[async_trait]
impl Aria2Rpc for Aria2Client {
    async fn tell_active(&self, keys: &[&str]) -> Result<Vec<Aria2Task>> {
        Aria2Client::tell_active(self, keys).await
    }

    async fn tell_stopped(&self, offset: i64, num: u64, keys: &[&str]) -> Result<Vec<Aria2Task>> {
        Aria2Client::tell_stopped(self, offset, num, keys).await
    }

    async fn force_remove(&self, gid: &str) -> Result<()> {
        Aria2Client::force_remove(self, gid).await
    }
}

/// Runs the single-video pipeline for a stalled task
#[async_trait]
pub trait VideoRestarter: Send + Sync {
    async fn restart(&self, id: &str) -> Result<()>;
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub completed: usize,
    pub stalled: usize,
    pub restarted: Vec<String>,
    pub removed: Vec<String>,
    pub skipped: usize,
}

/// Reads the video ID from the last `[...]` group of a file name.
///
/// Only the group opened by the last `[` counts; an unclosed or empty group yields none.
pub fn extract_video_id(path: &str) -> Option<String> {
    let filename = path
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(path)
        .to_lowercase();
    let open = filename.rfind('[')?;
    let rest = &filename[open + 1..];
    let close = rest.find(']')?;
    let id = rest[..close].trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// ID of the first file in the task that carries one
pub fn task_video_id(task: &Aria2Task) -> Option<String> {
    let id = task
        .files
        .iter()
        .find_map(|file| extract_video_id(&file.path));
    if id.is_none() {
        log::debug!("[RECONCILE] No video ID in task {} files {:?}", task.gid, task.files);
    }
    id
}

/// IDs of non-P2P tasks that finished or hit "file already exists"
pub fn completed_ids(stopped: &[Aria2Task]) -> HashSet<String> {
    stopped
        .iter()
        .filter(|task| !task.is_p2p() && task.is_completed())
        .filter_map(task_video_id)
        .collect()
}

/// Non-P2P tasks transferring at or below `threshold` bytes per second
pub fn stalled_tasks(active: &[Aria2Task], threshold: u64) -> Vec<&Aria2Task> {
    active
        .iter()
        .filter(|task| !task.is_p2p())
        .filter(|task| task.speed().map_or(false, |speed| speed <= threshold))
        .collect()
}

/// Completed video IDs as Aria2 currently reports them
pub async fn fetch_completed(rpc: &dyn Aria2Rpc) -> Result<HashSet<String>> {
    let stopped = rpc.tell_stopped(0, STOPPED_PAGE, &STOPPED_KEYS).await?;
    Ok(completed_ids(&stopped))
}

pub struct Reconciler {
    rpc: Arc<dyn Aria2Rpc>,
    restarter: Arc<dyn VideoRestarter>,
    stall_threshold: u64,
}

impl Reconciler {
    pub fn new(rpc: Arc<dyn Aria2Rpc>, restarter: Arc<dyn VideoRestarter>, stall_threshold: u64) -> Self {
        Self {
            rpc,
            restarter,
            stall_threshold,
        }
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let completed = fetch_completed(self.rpc.as_ref()).await?;
        let active = self.rpc.tell_active(&ACTIVE_KEYS).await?;
        let stalled = stalled_tasks(&active, self.stall_threshold);

        let mut report = ReconcileReport {
            completed: completed.len(),
            stalled: stalled.len(),
            ..Default::default()
        };

        for task in stalled {
            let Some(id) = task_video_id(task) else {
                report.skipped += 1;
                continue;
            };

            if completed.contains(&id) {
                log::info!("✅ [RECONCILE] {} already completed, dropping stalled task {}", id, task.gid);
            } else {
                log::info!("🔄 [RECONCILE] Restarting {} (task {} stalled)", id, task.gid);
                match self.restarter.restart(&id).await {
                    Ok(()) => report.restarted.push(id.clone()),
                    Err(e) => log::warn!("⚠️ [RECONCILE] Restart of {} failed: {}", id, e),
                }
            }

            match self.rpc.force_remove(&task.gid).await {
                Ok(()) => report.removed.push(task.gid.clone()),
                Err(e) => log::warn!("⚠️ [RECONCILE] Could not remove task {}: {}", task.gid, e),
            }
        }

        Ok(report)
    }

    /// Reconciles every `interval` forever; failed passes are logged and retried next tick
    pub async fn watch(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.reconcile_once().await {
                Ok(report) => log::info!(
                    "🔍 [RECONCILE] {} stalled, {} restarted, {} skipped",
                    report.stalled,
                    report.restarted.len(),
                    report.skipped
                ),
                Err(e) => log::warn!("⚠️ [RECONCILE] Pass failed: {}", e),
            }
        }
    }
}
