use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::DownloadType;
use crate::downloader::{DispatchReceipt, DownloadBackend, DownloadJob};
use crate::errors::{AppError, Result};
use crate::metadata::Tag;
use crate::utils::version_triplet;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub name: String,
    pub url: String,
    pub size: u64,
    pub source: String,
    pub alias: String,
    pub author: String,
    pub upload_time: Option<chrono::DateTime<chrono::Utc>>,
    pub comments: String,
    pub tags: Vec<Tag>,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOption {
    pub proxy: String,
    pub cookies: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcReply {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
}

/// Client for the companion "IwaraDownloader" service
pub struct IwaraDownloaderBackend {
    client: Client,
    endpoint: String,
    token: String,
}

impl IwaraDownloaderBackend {
    pub fn new(client: Client, endpoint: &str, token: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            token: token.to_string(),
        }
    }

    /// Request body for `code`; empty token and missing data are left out
    pub fn request_body(&self, code: &str, data: Option<Value>) -> Value {
        let mut body = json!({
            "ver": version_triplet(),
            "code": code,
        });
        if !self.token.is_empty() {
            body["token"] = json!(self.token);
        }
        if let Some(data) = data {
            body["data"] = data;
        }
        body
    }

    pub fn add_payload(job: &DownloadJob) -> Value {
        let descriptor = &job.descriptor;
        json!({
            "info": TaskInfo {
                name: descriptor.title.clone(),
                url: job.url().to_string(),
                size: descriptor.size,
                source: descriptor.id.clone(),
                alias: descriptor.author.display_name.clone(),
                author: descriptor.author.username.clone(),
                upload_time: descriptor.upload_time,
                comments: descriptor.comment_text.clone(),
                tags: descriptor.tags.clone(),
                path: job.rendered_path.clone(),
            },
            "option": TaskOption {
                proxy: job.options.proxy.clone(),
                cookies: job.options.cookies.clone(),
            },
        })
    }

    async fn post(&self, body: Value) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::BackendUnreachable(format!("IwaraDownloader at {}: {}", self.endpoint, e)))?;
        let reply: RpcReply = response
            .json()
            .await
            .map_err(|e| AppError::BackendUnreachable(format!("IwaraDownloader sent an unreadable reply: {}", e)))?;
        check_reply(reply)
    }
}

fn check_reply(reply: RpcReply) -> Result<()> {
    if reply.code == 0 {
        Ok(())
    } else {
        Err(AppError::BackendRejected(
            reply.msg.unwrap_or_else(|| format!("code {}", reply.code)),
        ))
    }
}

#[async_trait]
impl DownloadBackend for IwaraDownloaderBackend {
    fn kind(&self) -> DownloadType {
        DownloadType::IwaraDownloader
    }

    fn name(&self) -> &'static str {
        "IwaraDownloader"
    }

    async fn submit(&self, job: &DownloadJob) -> Result<DispatchReceipt> {
        self.post(self.request_body("add", Some(Self::add_payload(job))))
            .await?;
        log::info!("📤 [RPC] {} pushed to IwaraDownloader", job.display_name());
        Ok(DispatchReceipt {
            backend: DownloadType::IwaraDownloader,
            video_id: job.descriptor.id.clone(),
            reference: None,
        })
    }

    async fn check(&self) -> Result<()> {
        self.post(self.request_body("State", None)).await
    }
}
