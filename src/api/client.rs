use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use url::Url;

use crate::api::token::TokenStore;
use crate::api::{CommentPageRaw, VideoApiRaw};
use crate::errors::{AppError, Result};

/// Read side of the platform API the resolver depends on
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// Exchanges the refresh token for a new access token and starts using it
    async fn refresh_authorization(&self) -> Result<()>;

    async fn fetch_video(&self, id: &str) -> Result<VideoApiRaw>;

    /// Returns the raw file list so callers can tell a non-list reply from an empty one
    async fn fetch_file_sources(&self, file_url: &str) -> Result<Value>;

    async fn fetch_comments(
        &self,
        video_id: &str,
        parent: Option<&str>,
        page: u64,
    ) -> Result<CommentPageRaw>;

    /// Returns true when the platform accepted the follow
    async fn follow_user(&self, user_id: &str) -> Result<bool>;

    /// Returns true when the platform accepted the like
    async fn like_video(&self, video_id: &str) -> Result<bool>;
}

/// Computes the `X-Version` header for a file URL: SHA-1 over
/// `{last path segment}_{expires query value}_{secret}`, hex encoded.
pub fn sign_url(url: &str, secret: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| AppError::ParseError(format!("Invalid URL {}: {}", url, e)))?;
    let last_segment = parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or_default()
        .to_string();
    let expires = parsed
        .query_pairs()
        .find(|(key, _)| key == "expires")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| "null".to_string());

    let mut hasher = Sha1::new();
    hasher.update(format!("{}_{}_{}", last_segment, expires, secret).as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// HTTP adapter for the platform API that adds auth, cookies and signatures
pub struct ApiClient {
    client: Client,
    api_base: String,
    cookies: String,
    signature_secret: String,
    tokens: Arc<TokenStore>,
}

impl ApiClient {
    pub fn new(
        client: Client,
        api_base: &str,
        cookies: &str,
        signature_secret: &str,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            cookies: cookies.to_string(),
            signature_secret: signature_secret.to_string(),
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    fn auth_headers(&self, signed_url: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if !self.cookies.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.cookies) {
                headers.insert(COOKIE, value);
            }
        }
        if let Some(authorization) = self.tokens.authorization_header() {
            if let Ok(value) = HeaderValue::from_str(&authorization) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if let Some(url) = signed_url.filter(|u| !u.is_empty()) {
            let signature = sign_url(url, &self.signature_secret)?;
            if let Ok(value) = HeaderValue::from_str(&signature) {
                headers.insert("X-Version", value);
            }
        }
        Ok(headers)
    }

    async fn get_value(&self, url: &str, signed: bool) -> Result<Value> {
        log::debug!("[API] GET {}", url);
        let headers = self.auth_headers(signed.then_some(url))?;
        let response = self.client.get(url).headers(headers).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            log::debug!("[API] {} answered {}: {}", url, status, body);
        }
        Ok(body)
    }

    async fn post_status(&self, url: &str) -> Result<StatusCode> {
        log::debug!("[API] POST {}", url);
        let headers = self.auth_headers(None)?;
        let response = self.client.post(url).headers(headers).send().await?;
        Ok(response.status())
    }
}

#[async_trait]
impl MetadataApi for ApiClient {
    async fn refresh_authorization(&self) -> Result<()> {
        let refresh = self
            .tokens
            .refresh_token()
            .ok_or_else(|| AppError::Validation("No refresh token configured".to_string()))?;

        let response = self
            .client
            .post(format!("{}/user/token", self.api_base))
            .header(AUTHORIZATION, format!("Bearer {}", refresh))
            .send()
            .await?;
        let body: Value = response.json().await?;

        let access = body
            .get("accessToken")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::ParseError(format!("Token response without accessToken: {}", body)))?;
        self.tokens.set_access_token(access);
        log::debug!("[API] Access token refreshed");
        Ok(())
    }

    async fn fetch_video(&self, id: &str) -> Result<VideoApiRaw> {
        let value = self
            .get_value(&format!("{}/video/{}", self.api_base, id), false)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn fetch_file_sources(&self, file_url: &str) -> Result<Value> {
        self.get_value(file_url, true).await
    }

    async fn fetch_comments(
        &self,
        video_id: &str,
        parent: Option<&str>,
        page: u64,
    ) -> Result<CommentPageRaw> {
        let mut url = format!("{}/video/{}/comments?page={}", self.api_base, video_id, page);
        if let Some(parent) = parent.filter(|p| !p.is_empty()) {
            url.push_str(&format!("&parent={}", urlencoding::encode(parent)));
        }
        let value = self.get_value(&url, false).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn follow_user(&self, user_id: &str) -> Result<bool> {
        let status = self
            .post_status(&format!("{}/user/{}/followers", self.api_base, user_id))
            .await?;
        Ok(status == StatusCode::CREATED)
    }

    async fn like_video(&self, video_id: &str) -> Result<bool> {
        let status = self
            .post_status(&format!("{}/video/{}/like", self.api_base, video_id))
            .await?;
        Ok(status == StatusCode::CREATED)
    }
}
