//! Zonebot Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client
//! recreation, inline keyboards, chat-member queries, and message chunking

use anyhow::{anyhow, Result};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{info, warn};
use zonebot_format::MessageEntity;

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
    #[serde(default)]
    pub my_chat_member: Option<ChatMemberUpdated>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

impl TelegramChat {
    pub fn is_private(&self) -> bool {
        self.chat_type == "private"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl TelegramUser {
    pub fn display_name(&self) -> &str {
        self.first_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or("User")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<TelegramMessage>,
    pub data: Option<String>,
}

/// Delivered when the bot's own membership in a chat changes; drives the
/// ownership guard on unsanctioned group adds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: TelegramChat,
    pub from: TelegramUser,
    pub new_chat_member: ChatMemberState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMemberState {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: T,
}

#[derive(Debug, Deserialize)]
struct ChatMemberResult {
    status: String,
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    api_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
}

impl TelegramAdapter {
    pub fn new(
        bot_token: &str,
        data_dir: PathBuf,
        config_timeout: Option<u64>,
        config_recreate: Option<u64>,
    ) -> Self {
        let api_url = format!("https://api.telegram.org/bot{}", bot_token);
        let client = Self::build_client();
        let poll_timeout_secs = config_timeout.unwrap_or(60);
        let client_recreate_interval_secs = config_recreate.unwrap_or(600);

        Self {
            client,
            bot_token: bot_token.to_string(),
            api_url,
            data_dir,
            poll_timeout_secs,
            client_recreate_interval_secs,
        }
    }

    fn build_client() -> Client {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client")
    }

    /// Numeric bot id, parsed from the token prefix. Used for the liveness
    /// check before a delayed send.
    pub fn bot_user_id(&self) -> Option<i64> {
        self.bot_token.split(':').next()?.trim().parse().ok()
    }

    fn offset_path(&self) -> PathBuf {
        let runtime_dir = self.data_dir.join("runtime");
        let _ = std::fs::create_dir_all(&runtime_dir);
        let bot_id = self.bot_token.split(':').next().unwrap_or("default");
        runtime_dir.join(format!("telegram.{}.offset", bot_id))
    }

    async fn read_offset(&self) -> Option<i64> {
        let p = self.offset_path();
        match fs::read_to_string(&p).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let p = self.offset_path();
        if let Some(parent) = p.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        let _ = fs::write(&p, format!("{}\n", offset)).await;
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let url = format!("{}/getUpdates", self.api_url);

        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "callback_query", "my_chat_member"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getUpdates request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram getUpdates HTTP error: {}", e))?;

        let parsed: ApiResponse<Vec<TelegramUpdate>> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getUpdates decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!("telegram getUpdates returned ok=false"));
        }

        Ok(parsed.result)
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
        parse_html: bool,
        inline_keyboard: Option<Vec<Vec<InlineButton>>>,
    ) -> Result<()> {
        let chunks = self.chunk_message(text);

        for (i, chunk) in chunks.iter().enumerate() {
            let url = format!("{}/sendMessage", self.api_url);

            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "disable_web_page_preview": true,
            });

            if parse_html {
                payload["parse_mode"] = serde_json::json!("HTML");
            }

            if let Some(reply_to_message_id) = reply_to {
                if i == 0 {
                    payload["reply_to_message_id"] = serde_json::json!(reply_to_message_id);
                }
            }

            if i == chunks.len() - 1 {
                if let Some(keyboard) = &inline_keyboard {
                    payload["reply_markup"] = serde_json::json!({
                        "inline_keyboard": keyboard.iter().map(|row| {
                            row.iter().map(|btn| serde_json::json!({
                                "text": btn.text,
                                "callback_data": btn.callback_data
                            })).collect::<Vec<_>>()
                        }).collect::<Vec<_>>()
                    });
                }
            }

            self.send_with_html_fallback(&url, payload).await?;
        }

        Ok(())
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<()> {
        let url = format!("{}/answerCallbackQuery", self.api_url);

        let mut payload = serde_json::json!({
            "callback_query_id": callback_query_id,
            "show_alert": show_alert,
        });

        if let Some(t) = text {
            payload["text"] = serde_json::json!(t);
        }

        let _ = self.client.post(&url).json(&payload).send().await;
        Ok(())
    }

    /// Membership status of a user (or the bot itself) in a chat:
    /// creator, administrator, member, restricted, left, kicked.
    pub async fn get_chat_member(&self, chat_id: i64, user_id: i64) -> Result<String> {
        let url = format!("{}/getChatMember", self.api_url);
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "user_id": user_id,
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getChatMember request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram getChatMember HTTP {}: {}", status, body));
        }

        let parsed: ApiResponse<ChatMemberResult> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getChatMember decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!("telegram getChatMember returned ok=false"));
        }

        Ok(parsed.result.status)
    }

    pub async fn leave_chat(&self, chat_id: i64) -> Result<()> {
        let url = format!("{}/leaveChat", self.api_url);
        let payload = serde_json::json!({ "chat_id": chat_id });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram leaveChat request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram leaveChat HTTP {}: {}", status, body));
        }

        Ok(())
    }

    async fn send_with_html_fallback(
        &self,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let endpoint = url.rsplit('/').next().unwrap_or("telegram");

        let first_resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", endpoint, e))?;

        if first_resp.status().is_success() {
            let parsed: ApiResponse<serde_json::Value> = first_resp
                .json()
                .await
                .map_err(|e| anyhow!("telegram {} decode failed: {}", endpoint, e))?;
            if parsed.ok {
                return Ok(());
            }
            if payload.get("parse_mode").is_none() {
                return Err(anyhow!("telegram {} returned ok=false", endpoint));
            }
            warn!(
                "telegram {} returned ok=false with HTML payload, retrying without parse_mode",
                endpoint
            );
        } else {
            let status = first_resp.status();
            let body = first_resp.text().await.unwrap_or_default();
            if payload.get("parse_mode").is_none() {
                if Self::is_reply_target_missing(&body) {
                    let mut no_reply_payload = payload.clone();
                    if Self::remove_reply_to_message_id(&mut no_reply_payload) {
                        warn!(
                            "telegram {} failed due to missing reply target; retrying without reply_to_message_id",
                            endpoint
                        );
                        return self
                            .send_without_reply_target(url, endpoint, no_reply_payload)
                            .await;
                    }
                }
                return Err(anyhow!("telegram {} HTTP {}: {}", endpoint, status, body));
            }
            warn!(
                "telegram {} HTTP {} with HTML payload, retrying without parse_mode: {}",
                endpoint, status, body
            );
        }

        let mut fallback_payload = payload;
        if let Some(obj) = fallback_payload.as_object_mut() {
            obj.remove("parse_mode");
        }

        let fallback_resp = self
            .client
            .post(url)
            .json(&fallback_payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} fallback request failed: {}", endpoint, e))?;

        if !fallback_resp.status().is_success() {
            let status = fallback_resp.status();
            let body = fallback_resp.text().await.unwrap_or_default();
            if Self::is_reply_target_missing(&body) {
                let mut no_reply_payload = fallback_payload.clone();
                if Self::remove_reply_to_message_id(&mut no_reply_payload) {
                    warn!(
                        "telegram {} fallback failed due to missing reply target; retrying without reply_to_message_id",
                        endpoint
                    );
                    return self
                        .send_without_reply_target(url, endpoint, no_reply_payload)
                        .await;
                }
            }
            return Err(anyhow!(
                "telegram {} fallback HTTP {}: {}",
                endpoint,
                status,
                body
            ));
        }

        let parsed: ApiResponse<serde_json::Value> = fallback_resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} fallback decode failed: {}", endpoint, e))?;
        if !parsed.ok {
            return Err(anyhow!("telegram {} fallback returned ok=false", endpoint));
        }

        Ok(())
    }

    async fn send_without_reply_target(
        &self,
        url: &str,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} no-reply retry request failed: {}", endpoint, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "telegram {} no-reply retry HTTP {}: {}",
                endpoint,
                status,
                body
            ));
        }

        let parsed: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} no-reply retry decode failed: {}", endpoint, e))?;
        if !parsed.ok {
            return Err(anyhow!(
                "telegram {} no-reply retry returned ok=false",
                endpoint
            ));
        }

        Ok(())
    }

    fn remove_reply_to_message_id(payload: &mut serde_json::Value) -> bool {
        payload
            .as_object_mut()
            .map(|obj| obj.remove("reply_to_message_id").is_some())
            .unwrap_or(false)
    }

    fn is_reply_target_missing(body: &str) -> bool {
        body.to_ascii_lowercase()
            .contains("message to be replied not found")
    }

    fn chunk_message(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < chars.len() {
            let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

            if end < chars.len() {
                let mut split = end;
                for i in (start..end).rev() {
                    let c = chars[i];
                    if c == '\n' || c == ' ' || c == '.' || c == '!' || c == '?' {
                        split = i + 1;
                        break;
                    }
                }
                if split > start {
                    end = split;
                }
            }

            chunks.push(chars[start..end].iter().collect::<String>());
            start = end;
        }

        chunks
    }

    pub async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        let url = format!("{}/setMyCommands", self.api_url);
        let commands = serde_json::json!([
            { "command": "start", "description": "Greet the bot" },
            { "command": "help", "description": "Show help" },
            { "command": "status", "description": "Show configured triggers" },
            { "command": "set_t1", "description": "Configure the enter trigger" },
            { "command": "set_t2", "description": "Configure the car trigger" },
            { "command": "set_t3", "description": "Configure the bike trigger" },
            { "command": "off", "description": "Deactivate and leave the group" }
        ]);

        let payload = serde_json::json!({ "commands": commands });
        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram setMyCommands request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram setMyCommands HTTP {}: {}", status, body));
        }

        let parsed: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram setMyCommands decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!("telegram setMyCommands returned ok=false"));
        }

        Ok(())
    }

    /// Long-poll loop: forwards every update into the dispatcher channel.
    /// Runs until the receiving side goes away.
    pub async fn poll(&self, sender: mpsc::Sender<TelegramUpdate>) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("Recreating HTTP client to prevent stale connections");
                client = Self::build_client();
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;

                if sender.send(update).await.is_err() {
                    info!("Update channel closed; stopping Telegram polling");
                    return Ok(());
                }
            }
        }
    }
}
