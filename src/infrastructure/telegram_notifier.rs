use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

use crate::application::{AppError, AppResult, NotificationSink};
use crate::domain::{Notification, UserId};

const API_BASE: &str = "https://api.telegram.org";
/// Telegram rejects photo captions longer than this.
const CAPTION_LIMIT: usize = 1024;

pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl TelegramNotifier {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
            token,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.token,
            method
        )
    }

    async fn call<T: Serialize + Sync>(&self, method: &str, destination: UserId, payload: &T) -> AppResult<()> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(payload)
            .send()
            .await
            .map_err(|e| AppError::Notification(e.to_string()))?;

        if resp.status() == StatusCode::FORBIDDEN {
            return Err(AppError::DestinationBlocked(destination));
        }
        resp.error_for_status()
            .map_err(|e| AppError::Notification(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Serialize)]
struct SendPhoto<'a> {
    chat_id: i64,
    photo: &'a str,
    caption: &'a str,
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        let chat_id = notification.destination.0;

        if let Some(photo) = notification.image_url.as_deref() {
            if notification.text.chars().count() <= CAPTION_LIMIT {
                let payload = SendPhoto {
                    chat_id,
                    photo,
                    caption: &notification.text,
                };
                match self.call("sendPhoto", notification.destination, &payload).await {
                    Ok(()) => return Ok(()),
                    Err(e @ AppError::DestinationBlocked(_)) => return Err(e),
                    Err(e) => {
                        warn!(chat_id, "photo rejected, falling back to text: {e}");
                    }
                }
            } else {
                debug!(chat_id, "caption too long for a photo, sending text");
            }
        }

        let payload = SendMessage {
            chat_id,
            text: &notification.text,
            disable_web_page_preview: false,
        };
        self.call("sendMessage", notification.destination, &payload)
            .await
    }
}
