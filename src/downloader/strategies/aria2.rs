use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::DownloadType;
use crate::downloader::{DispatchReceipt, DownloadBackend, DownloadJob};
use crate::errors::{AppError, Result};
use crate::utils::generate_rpc_id;

/// Aria2 reports this code when the output file already exists
pub const ERROR_CODE_FILE_EXISTS: &str = "13";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aria2File {
    #[serde(default)]
    pub path: String,
}

/// Status view of one Aria2 task, restricted to the keys we ask for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aria2Task {
    #[serde(default)]
    pub gid: String,
    #[serde(default)]
    pub status: String,
    /// Bytes per second, sent as a decimal string
    pub download_speed: Option<String>,
    #[serde(default)]
    pub files: Vec<Aria2File>,
    pub error_code: Option<String>,
    pub bittorrent: Option<Value>,
}

impl Aria2Task {
    pub fn is_p2p(&self) -> bool {
        self.bittorrent.as_ref().map_or(false, |bt| !bt.is_null())
    }

    /// None when the speed field is missing or not a number
    pub fn speed(&self) -> Option<u64> {
        self.download_speed.as_deref()?.trim().parse().ok()
    }

    /// Finished, or refused because the file is already on disk
    pub fn is_completed(&self) -> bool {
        self.status == "complete" || self.error_code.as_deref() == Some(ERROR_CODE_FILE_EXISTS)
    }
}

/// Minimal Aria2 JSON-RPC 2.0 client
pub struct Aria2Client {
    client: Client,
    endpoint: String,
    token: String,
}

impl Aria2Client {
    pub fn new(client: Client, endpoint: &str, token: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            token: token.to_string(),
        }
    }

    /// Builds the request body; the secret token always leads the parameter list
    pub fn request_body(&self, method: &str, params: Vec<Value>) -> Value {
        let mut all_params = Vec::with_capacity(params.len() + 1);
        all_params.push(Value::String(format!("token:{}", self.token)));
        all_params.extend(params);
        json!({
            "jsonrpc": "2.0",
            "method": method,
            "id": generate_rpc_id(),
            "params": all_params,
        })
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        log::debug!("[ARIA2] {} -> {}", method, self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .header("accept", "application/json")
            .json(&self.request_body(method, params))
            .send()
            .await
            .map_err(|e| AppError::BackendUnreachable(format!("Aria2 at {}: {}", self.endpoint, e)))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::BackendUnreachable(format!("Aria2 sent an unreadable reply: {}", e)))?;
        parse_rpc_reply(body)
    }

    /// Returns the GID of the new task
    pub async fn add_uri(&self, uris: &[&str], options: Value) -> Result<String> {
        let result = self
            .call("aria2.addUri", vec![json!(uris), options])
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::ParseError(format!("aria2.addUri returned {}", result)))
    }

    pub async fn tell_active(&self, keys: &[&str]) -> Result<Vec<Aria2Task>> {
        let result = self.call("aria2.tellActive", vec![json!(keys)]).await?;
        parse_tasks(result)
    }

    pub async fn tell_stopped(&self, offset: i64, num: u64, keys: &[&str]) -> Result<Vec<Aria2Task>> {
        let result = self
            .call("aria2.tellStopped", vec![json!(offset), json!(num), json!(keys)])
            .await?;
        parse_tasks(result)
    }

    pub async fn force_remove(&self, gid: &str) -> Result<()> {
        self.call("aria2.forceRemove", vec![json!(gid)]).await?;
        Ok(())
    }
}

fn parse_rpc_reply(body: Value) -> Result<Value> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(AppError::BackendRejected(message));
    }
    body.get("result")
        .cloned()
        .ok_or_else(|| AppError::ParseError(format!("JSON-RPC reply without result: {}", body)))
}

/// Tasks that fail to parse are logged and dropped
fn parse_tasks(result: Value) -> Result<Vec<Aria2Task>> {
    let Value::Array(items) = result else {
        return Err(AppError::ParseError(format!("Expected a task list, got {}", result)));
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<Aria2Task>(item.clone()) {
            Ok(task) => Some(task),
            Err(e) => {
                log::warn!("⚠️ [ARIA2] Skipping malformed task {}: {}", item, e);
                None
            }
        })
        .collect())
}

/// Builds `aria2.addUri` options, leaving out empty proxy and cookie settings
pub fn add_uri_options(job: &DownloadJob) -> Value {
    let mut options = Map::new();
    if !job.options.proxy.is_empty() {
        options.insert("all-proxy".into(), json!(job.options.proxy));
    }
    options.insert("out".into(), json!(job.path.filename));
    options.insert("dir".into(), json!(job.path.directory));
    if !job.options.referer.is_empty() {
        options.insert("referer".into(), json!(job.options.referer));
    }
    if !job.options.cookies.is_empty() {
        options.insert("header".into(), json!([format!("Cookie:{}", job.options.cookies)]));
    }
    Value::Object(options)
}

pub struct Aria2Backend {
    client: Aria2Client,
}

impl Aria2Backend {
    pub fn new(client: Aria2Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DownloadBackend for Aria2Backend {
    fn kind(&self) -> DownloadType {
        DownloadType::Aria2
    }

    fn name(&self) -> &'static str {
        "Aria2"
    }

    async fn submit(&self, job: &DownloadJob) -> Result<DispatchReceipt> {
        let gid = self.client.add_uri(&[job.url()], add_uri_options(job)).await?;
        log::info!("📤 [ARIA2] {} queued as {}", job.display_name(), gid);
        Ok(DispatchReceipt {
            backend: DownloadType::Aria2,
            video_id: job.descriptor.id.clone(),
            reference: Some(gid),
        })
    }

    async fn check(&self) -> Result<()> {
        self.client.call("aria2.tellActive", Vec::new()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::path_template::parse_local_path;
    use crate::downloader::BackendOptions;
    use crate::metadata::{FileSource, VideoDescriptor};

    fn job(options: BackendOptions) -> DownloadJob {
        let mut descriptor = VideoDescriptor::new("abc", "demo");
        descriptor.file_sources = vec![FileSource {
            label: "Source".into(),
            url: "//cdn.test/a.mp4".into(),
            view: None,
            size: None,
        }];
        descriptor.download_quality = "Source".into();
        descriptor.download_url = "https://cdn.test/a.mp4".into();
        let path = parse_local_path("/Iwara/alice/demo[abc].mp4").unwrap();
        DownloadJob::new(descriptor, path, "/Iwara/alice/demo[abc].mp4".into(), options).unwrap()
    }

    #[test]
    fn token_leads_the_params() {
        let client = Aria2Client::new(Client::new(), "http://localhost:6800/jsonrpc", "secret");
        let body = client.request_body("aria2.tellActive", vec![json!(["gid"])]);
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["params"], json!(["token:secret", ["gid"]]));
        assert!(body["id"].as_str().map_or(false, |id| !id.is_empty()));
    }

    #[test]
    fn empty_proxy_and_cookies_are_omitted() {
        let options = add_uri_options(&job(BackendOptions {
            referer: "www.iwara.tv".into(),
            ..Default::default()
        }));
        assert_eq!(
            options,
            json!({"out": "demo[abc].mp4", "dir": "/Iwara/alice/", "referer": "www.iwara.tv"})
        );
    }

    #[test]
    fn proxy_and_cookies_are_forwarded() {
        let options = add_uri_options(&job(BackendOptions {
            proxy: "http://proxy:8080".into(),
            cookies: "a=b".into(),
            referer: String::new(),
        }));
        assert_eq!(options["all-proxy"], "http://proxy:8080");
        assert_eq!(options["header"], json!(["Cookie:a=b"]));
    }

    #[test]
    fn rpc_errors_become_rejections() {
        let err = parse_rpc_reply(json!({"id": "1", "error": {"code": 1, "message": "Unauthorized"}}))
            .unwrap_err();
        assert!(matches!(err, AppError::BackendRejected(ref m) if m == "Unauthorized"));
        assert_eq!(parse_rpc_reply(json!({"result": "2089b05ecca3d829"})).unwrap(), "2089b05ecca3d829");
    }

    #[test]
    fn task_status_helpers() {
        let tasks = parse_tasks(json!([
            {"gid": "1", "status": "complete", "files": [{"path": "/v/a[x].mp4"}]},
            {"gid": "2", "status": "error", "errorCode": "13"},
            {"gid": "3", "downloadSpeed": "512", "bittorrent": {"info": {}}},
            {"gid": "4", "downloadSpeed": "fast"},
            "garbage"
        ]))
        .unwrap();
        assert_eq!(tasks.len(), 4);
        assert!(tasks[0].is_completed());
        assert!(tasks[1].is_completed());
        assert!(tasks[2].is_p2p());
        assert_eq!(tasks[2].speed(), Some(512));
        assert_eq!(tasks[3].speed(), None);
    }
}
