use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use std::sync::RwLock;

/// What a JWT issued by the platform is good for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
    Other,
}

/// Decodes the payload segment of a JWT without verifying it
pub fn decode_payload(token: &str) -> Option<Value> {
    let token = token.trim().rsplit(' ').next()?;
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn token_kind(token: &str) -> Option<TokenKind> {
    let payload = decode_payload(token)?;
    Some(match payload.get("type").and_then(Value::as_str) {
        Some("access_token") => TokenKind::Access,
        Some("refresh_token") => TokenKind::Refresh,
        _ => TokenKind::Other,
    })
}

/// Holds the last known access and refresh tokens.
///
/// The access token is replaced on every successful refresh and kept as-is when a
/// refresh fails, so callers always have something to send.
#[derive(Debug, Default)]
pub struct TokenStore {
    access: RwLock<Option<String>>,
    refresh: RwLock<Option<String>>,
}

impl TokenStore {
    pub fn new(access: Option<String>, refresh: Option<String>) -> Self {
        Self {
            access: RwLock::new(access.map(|t| strip_bearer(&t).to_string())),
            refresh: RwLock::new(refresh.map(|t| strip_bearer(&t).to_string())),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.access.read().ok().and_then(|guard| guard.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.refresh.read().ok().and_then(|guard| guard.clone())
    }

    pub fn authorization_header(&self) -> Option<String> {
        self.access_token().map(|token| format!("Bearer {}", token))
    }

    pub fn set_access_token(&self, token: &str) {
        if let Ok(mut guard) = self.access.write() {
            *guard = Some(strip_bearer(token).to_string());
        }
    }

    pub fn set_refresh_token(&self, token: &str) {
        if let Ok(mut guard) = self.refresh.write() {
            *guard = Some(strip_bearer(token).to_string());
        }
    }

    /// Files a token under the slot its payload claims; returns the detected kind
    pub fn observe(&self, token: &str) -> Option<TokenKind> {
        let kind = token_kind(token)?;
        let raw = strip_bearer(token).to_string();
        match kind {
            TokenKind::Access => self.set_access_token(&raw),
            TokenKind::Refresh => self.set_refresh_token(&raw),
            TokenKind::Other => log::debug!("Ignoring token of unknown type"),
        }
        Some(kind)
    }
}

fn strip_bearer(token: &str) -> &str {
    token.trim().rsplit(' ').next().unwrap_or_default()
}
