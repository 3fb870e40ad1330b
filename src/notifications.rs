use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Follow-up the user can trigger from a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationAction {
    /// Run the single-ID pipeline again
    RetryVideo { id: String, name: String },
    OpenUrl(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub body: String,
    pub action: Option<NotificationAction>,
}

impl Notification {
    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            title: title.into(),
            body: body.into(),
            action: None,
        }
    }

    pub fn warning(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            ..Self::info(title, body)
        }
    }

    pub fn error(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            ..Self::info(title, body)
        }
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Builds the user-facing message for a failed or gated video.
    ///
    /// External videos and suspicious links offer a page to open, everything else
    /// offers another pass over the same ID.
    pub fn for_failure(id: &str, name: &str, error: &AppError, site_base: &str) -> Self {
        let label = format!("{}[{}]", name, id);
        match error {
            AppError::ExternalVideo { embed_url, .. } => {
                Self::error("External video", format!("{} is hosted elsewhere: {}", label, embed_url))
                    .with_action(NotificationAction::OpenUrl(embed_url.clone()))
            }
            AppError::SuspiciousLink { domain, .. } => Self::warning(
                "Possible off-site download",
                format!("{} mentions {} in its description or comments", label, domain),
            )
            .with_action(NotificationAction::OpenUrl(format!(
                "{}/video/{}",
                site_base.trim_end_matches('/'),
                id
            ))),
            AppError::QualityWarning { .. } => Self::warning("Quality check", format!("{}: {}", label, error))
                .with_action(NotificationAction::RetryVideo {
                    id: id.to_string(),
                    name: name.to_string(),
                }),
            _ => Self::error("Download failed", format!("{}: {}", label, error)).with_action(
                NotificationAction::RetryVideo {
                    id: id.to_string(),
                    name: name.to_string(),
                },
            ),
        }
    }
}

/// Fans notifications out to the log and, optionally, to a listener
#[derive(Clone, Default)]
pub struct Notifier {
    sender: Option<mpsc::UnboundedSender<Notification>>,
}

impl Notifier {
    /// A notifier that only logs
    pub fn logging() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Info => log::info!("🔔 [NOTIFY] {}: {}", notification.title, notification.body),
            NotificationLevel::Warning => log::warn!("⚠️ [NOTIFY] {}: {}", notification.title, notification.body),
            NotificationLevel::Error => log::error!("❌ [NOTIFY] {}: {}", notification.title, notification.body),
        }
        if let Some(sender) = &self.sender {
            if sender.send(notification).is_err() {
                log::debug!("[NOTIFY] Listener gone, notification dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_video_offers_original_page() {
        let error = AppError::ExternalVideo {
            id: "abc".into(),
            embed_url: "https://youtube.test/x".into(),
        };
        let n = Notification::for_failure("abc", "demo", &error, "https://www.iwara.tv");
        assert_eq!(n.action, Some(NotificationAction::OpenUrl("https://youtube.test/x".into())));
    }

    #[test]
    fn failures_offer_single_id_retry() {
        let n = Notification::for_failure("abc", "demo", &AppError::NoSource("abc".into()), "");
        assert_eq!(n.level, NotificationLevel::Error);
        assert_eq!(
            n.action,
            Some(NotificationAction::RetryVideo { id: "abc".into(), name: "demo".into() })
        );
    }

    #[test]
    fn suspicious_link_points_at_video_page() {
        let error = AppError::SuspiciousLink { id: "abc".into(), domain: "mega.nz".into() };
        let n = Notification::for_failure("abc", "demo", &error, "https://www.iwara.tv/");
        assert_eq!(n.level, NotificationLevel::Warning);
        assert_eq!(
            n.action,
            Some(NotificationAction::OpenUrl("https://www.iwara.tv/video/abc".into()))
        );
    }

    #[tokio::test]
    async fn channel_delivers_notifications() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.notify(Notification::info("t", "b"));
        assert_eq!(rx.recv().await.unwrap().title, "t");
    }
}
