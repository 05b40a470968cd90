//! Zonebot Core
//!
//! The trigger dispatcher: routes inbound Telegram updates to hashtag
//! triggers, admin commands, the configuration wizard, and the ownership
//! guard. Each trigger event walks RECEIVED → CONFIG_RESOLVED → ACKED →
//! ARMED → FIRED; the armed stage is a one-shot in-process timer and is
//! lost on restart.

pub mod access;
pub mod trigger;
pub mod wizard;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use zonebot_cache::{keys, TtlCache};
use zonebot_format::{format_delay, render_message};
use zonebot_release::ReleaseCoordinator;
use zonebot_storage::Storage;
use zonebot_telegram::{
    ChatMemberUpdated, InlineButton, TelegramAdapter, TelegramCallbackQuery, TelegramMessage,
    TelegramUpdate,
};

use access::AccessControl;
use trigger::{ArmedJobs, TriggerConfigSource, TriggerKind};
use wizard::{WizardSession, WizardStep};

const GREETING: &str = "Ninja at your service 🥷";
const HELP_TEXT: &str = "🤖 Commands:\n\
/status - configured triggers\n\
/set_t1 - configure #ورود\n\
/set_t2 - configure #ماشین\n\
/set_t3 - configure #موتور\n\
/off - deactivate and leave the group\n\
#ورود #ماشین #موتور #خروج";
const DENIAL_MESSAGE: &str = "Only the bot's master can give orders here.";
const OWNERSHIP_WARNING: &str =
    "This bot belongs to the zone network. You are not allowed to deploy it.";
const INFO_BUTTON_TEXT: &str = "Zone Info";
const INFO_BUTTON_DATA: &str = "zone_info";
const INFO_ALERT: &str = "Welcome to the zone! 🗺️";

const STATUS_CACHE_TTL_SECS: u64 = 300;

fn info_button() -> Vec<Vec<InlineButton>> {
    vec![vec![InlineButton {
        text: INFO_BUTTON_TEXT.to_string(),
        callback_data: INFO_BUTTON_DATA.to_string(),
    }]]
}

/// First token of a slash command, lowercased, with any @botname suffix
/// stripped. None for anything that is not a command.
fn parse_command(text: &str) -> Option<String> {
    let first = text.split_whitespace().next()?;
    let name = first.strip_prefix('/')?;
    let name = name.split('@').next().unwrap_or(name);
    if name.is_empty() {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

pub struct Dispatcher {
    telegram: Arc<TelegramAdapter>,
    storage: Arc<Mutex<Storage>>,
    cache: Arc<TtlCache>,
    release: Arc<ReleaseCoordinator>,
    access: AccessControl,
    config_source: TriggerConfigSource,
    /// Open wizard sessions keyed by (chat, user): one member configuring
    /// a trigger never has their flow disturbed by other members' chatter.
    wizards: Mutex<HashMap<(i64, i64), WizardSession>>,
    armed: ArmedJobs,
}

impl Dispatcher {
    pub fn new(
        telegram: Arc<TelegramAdapter>,
        storage: Arc<Mutex<Storage>>,
        cache: Arc<TtlCache>,
        release: Arc<ReleaseCoordinator>,
        owner_id: i64,
    ) -> Self {
        let access = AccessControl::new(owner_id, Arc::clone(&cache), Arc::clone(&telegram));
        let config_source = TriggerConfigSource::new(Arc::clone(&storage), Arc::clone(&cache));

        Self {
            telegram,
            storage,
            cache,
            release,
            access,
            config_source,
            wizards: Mutex::new(HashMap::new()),
            armed: ArmedJobs::new(),
        }
    }

    /// Consume updates until the channel closes. Each update is handled in
    /// its own task, so one handler stuck on slow I/O never delays
    /// unrelated events. Handler failures are logged and never tear the
    /// loop down.
    pub async fn run(self: Arc<Self>, mut updates: mpsc::Receiver<TelegramUpdate>) {
        info!("Dispatcher started");
        while let Some(update) = updates.recv().await {
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = dispatcher.handle_update(update).await {
                    error!("Update handling failed: {:#}", err);
                }
            });
        }
        info!("Dispatcher stopped: update channel closed");
    }

    async fn handle_update(self: &Arc<Self>, update: TelegramUpdate) -> Result<()> {
        if let Some(change) = &update.my_chat_member {
            self.ownership_guard(change).await;
        }

        if let Some(callback) = &update.callback_query {
            self.handle_callback(callback).await;
        }

        if let Some(message) = update.message {
            self.handle_message(message).await?;
        }

        Ok(())
    }

    async fn handle_message(self: &Arc<Self>, message: TelegramMessage) -> Result<()> {
        let Some(text) = message.text.clone() else {
            return Ok(());
        };

        if let Some(command) = parse_command(&text) {
            return self.handle_command(&command, &message).await;
        }

        for kind in TriggerKind::scan(&text) {
            self.handle_trigger(&message, kind).await;
        }

        self.continue_wizard(&message, &text).await
    }

    /// Standing guard, independent of the trigger state machine: the bot
    /// only stays in groups the owner added it to.
    async fn ownership_guard(&self, change: &ChatMemberUpdated) {
        if !matches!(
            change.new_chat_member.status.as_str(),
            "member" | "administrator"
        ) {
            return;
        }
        if self.access.is_owner(change.from.id) {
            return;
        }

        let chat_id = change.chat.id;
        warn!(
            "Bot added to chat {} by non-owner {}; leaving",
            chat_id, change.from.id
        );
        if let Err(err) = self
            .telegram
            .send_message(chat_id, OWNERSHIP_WARNING, None, false, None)
            .await
        {
            warn!("Failed to send ownership warning to chat {}: {}", chat_id, err);
        }
        if let Err(err) = self.telegram.leave_chat(chat_id).await {
            warn!("Failed to leave chat {}: {}", chat_id, err);
        }
    }

    async fn handle_callback(&self, callback: &TelegramCallbackQuery) {
        let text = match callback.data.as_deref() {
            Some(INFO_BUTTON_DATA) => Some(INFO_ALERT),
            _ => None,
        };
        let _ = self
            .telegram
            .answer_callback_query(&callback.id, text, text.is_some())
            .await;
    }

    async fn handle_command(self: &Arc<Self>, command: &str, message: &TelegramMessage) -> Result<()> {
        match command {
            "start" => self.reply(message, GREETING).await,
            "help" => self.reply(message, HELP_TEXT).await,
            "status" => self.command_status(message).await,
            "set_t1" => self.command_setup(message, TriggerKind::Enter).await,
            "set_t2" => self.command_setup(message, TriggerKind::Car).await,
            "set_t3" => self.command_setup(message, TriggerKind::Bike).await,
            "off" => self.command_off(message).await,
            _ => Ok(()),
        }
    }

    async fn reply(&self, message: &TelegramMessage, text: &str) -> Result<()> {
        self.telegram
            .send_message(message.chat.id, text, Some(message.message_id), false, None)
            .await
    }

    /// Admin gate for management commands. Sends the denial reply itself.
    async fn require_admin(&self, message: &TelegramMessage) -> Result<bool> {
        let Some(from) = &message.from else {
            return Ok(false);
        };
        if self.access.can_administer(&message.chat, from.id).await {
            return Ok(true);
        }
        self.reply(message, DENIAL_MESSAGE).await?;
        Ok(false)
    }

    async fn command_status(&self, message: &TelegramMessage) -> Result<()> {
        if !self.require_admin(message).await? {
            return Ok(());
        }

        let chat_id = message.chat.id;
        let listing_key = keys::triggers_listing(chat_id);
        let listing = match self.cache.get_json::<String>(&listing_key) {
            Some(cached) => cached,
            None => {
                let rows = {
                    let storage = self.storage.lock().await;
                    storage.list_triggers_for_chat(&chat_id.to_string())
                };
                let rows = match rows {
                    Ok(rows) => rows,
                    Err(err) => {
                        warn!("Status lookup failed for chat {}: {}", chat_id, err);
                        return self.reply(message, "⚠️ Could not read trigger status").await;
                    }
                };

                let mut listing = String::from("\n⚙️ Triggers:");
                if rows.is_empty() {
                    listing.push_str("\n❌ No triggers configured");
                } else {
                    for row in rows {
                        if let Some(kind) = TriggerKind::from_stored(&row.trigger_type) {
                            listing.push_str(&format!(
                                "\n{} {}: {}",
                                kind.setup_emoji(),
                                kind.hashtag(),
                                format_delay(row.delay)
                            ));
                        }
                    }
                }
                self.cache
                    .set_json(&listing_key, &listing, STATUS_CACHE_TTL_SECS);
                listing
            }
        };

        self.reply(message, &format!("🤖 Status:{}", listing)).await
    }

    async fn command_setup(&self, message: &TelegramMessage, kind: TriggerKind) -> Result<()> {
        if !self.require_admin(message).await? {
            return Ok(());
        }
        let Some(from) = &message.from else {
            return Ok(());
        };

        let chat_id = message.chat.id;
        {
            let mut wizards = self.wizards.lock().await;
            wizards.insert((chat_id, from.id), WizardSession::new(kind, chat_id, from.id));
        }

        self.reply(
            message,
            &format!(
                "{} Trigger {}\n⏰ Delay in seconds (1-3600):",
                kind.setup_emoji(),
                kind.hashtag()
            ),
        )
        .await
    }

    async fn command_off(&self, message: &TelegramMessage) -> Result<()> {
        if !self.require_admin(message).await? {
            return Ok(());
        }

        let chat_id = message.chat.id;
        let deleted = {
            let storage = self.storage.lock().await;
            storage.delete_triggers_for_chat(&chat_id.to_string())
        };

        match deleted {
            Ok(count) => {
                for kind in TriggerKind::PERSISTED {
                    self.cache.delete(&keys::trigger(chat_id, kind.as_str()));
                }
                self.cache.delete(&keys::triggers_listing(chat_id));
                info!("Deactivated chat {}: {} trigger rows deleted", chat_id, count);
                self.reply(message, "✅ Triggers cleared. Leaving the group...")
                    .await?;
            }
            Err(err) => {
                warn!("Failed to clear triggers for chat {}: {}", chat_id, err);
                self.reply(message, "⚠️ Could not clear triggers; leaving the group anyway...")
                    .await?;
            }
        }

        if let Err(err) = self.telegram.leave_chat(chat_id).await {
            warn!("Failed to leave chat {}: {}", chat_id, err);
        }
        Ok(())
    }

    /// RECEIVED → CONFIG_RESOLVED → ACKED → ARMED. The FIRED stage runs in
    /// its own task; its failures never reach this handler.
    async fn handle_trigger(self: &Arc<Self>, message: &TelegramMessage, kind: TriggerKind) {
        if message.chat.is_private() {
            return;
        }
        let Some(from) = &message.from else {
            return;
        };

        let chat_id = message.chat.id;
        let message_id = message.message_id;
        let user_id = from.id;
        let user_name = from.display_name().to_string();

        // Exit short-circuits: no config, no delay, release right away.
        if kind == TriggerKind::Exit {
            let farewell = format!("{}┊{} left the zone", kind.ack_emoji(), user_name);
            if let Err(err) = self
                .telegram
                .send_message(chat_id, &farewell, Some(message_id), false, Some(info_button()))
                .await
            {
                warn!("Failed to send farewell in chat {}: {}", chat_id, err);
            }
            self.release.release(user_id).await;
            return;
        }

        let resolved = self.config_source.resolve(chat_id, kind).await;

        let ack = format!(
            "{}┊{} entered the zone\n\n⏳┊Time: {}",
            kind.ack_emoji(),
            user_name,
            format_delay(resolved.delay_secs)
        );
        if let Err(err) = self
            .telegram
            .send_message(chat_id, &ack, Some(message_id), false, Some(info_button()))
            .await
        {
            warn!("Failed to ack trigger in chat {}: {}", chat_id, err);
        }

        if !self.armed.try_arm(chat_id, message_id, kind) {
            debug!(
                "Duplicate {} trigger for chat {} message {} discarded",
                kind.as_str(),
                chat_id,
                message_id
            );
            return;
        }

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher
                .fire_delayed(chat_id, message_id, kind, user_id, resolved)
                .await;
        });
    }

    /// FIRED: deliver the delayed message, then attempt the release. The
    /// two steps are independent; a send failure must not suppress the
    /// release, which is the more consequential side effect.
    async fn fire_delayed(
        self: Arc<Self>,
        chat_id: i64,
        message_id: i64,
        kind: TriggerKind,
        user_id: i64,
        resolved: trigger::ResolvedTrigger,
    ) {
        tokio::time::sleep(Duration::from_secs(resolved.delay_secs.max(0) as u64)).await;

        let mut deliver = true;
        if let Some(bot_id) = self.telegram.bot_user_id() {
            match self.telegram.get_chat_member(chat_id, bot_id).await {
                Ok(status) if matches!(status.as_str(), "left" | "kicked") => {
                    info!("Skipping delayed send: bot no longer in chat {}", chat_id);
                    deliver = false;
                }
                Ok(_) => {}
                Err(err) => {
                    // Inconclusive check: send anyway rather than drop.
                    debug!("Liveness check failed for chat {}: {}", chat_id, err);
                }
            }
        }

        if deliver {
            let formatted = render_message(&resolved.message, &resolved.entities);
            if let Err(err) = self
                .telegram
                .send_message(
                    chat_id,
                    &formatted.text,
                    Some(message_id),
                    formatted.parse_html,
                    Some(info_button()),
                )
                .await
            {
                warn!("Delayed send failed for chat {}: {}", chat_id, err);
            }
        }

        self.release.release(user_id).await;
        self.armed.disarm(chat_id, message_id, kind);
    }

    /// Advance the sender's own wizard session, if they have one.
    /// Messages from members without an open session are not wizard input
    /// and are left alone.
    async fn continue_wizard(&self, message: &TelegramMessage, text: &str) -> Result<()> {
        let chat_id = message.chat.id;
        let Some(from) = &message.from else {
            return Ok(());
        };
        let session_key = (chat_id, from.id);

        let mut wizards = self.wizards.lock().await;
        let Some(session) = wizards.get_mut(&session_key) else {
            return Ok(());
        };

        // Admin rights may have been revoked since the session opened.
        if !self.access.can_administer(&message.chat, from.id).await {
            wizards.remove(&session_key);
            drop(wizards);
            return self.reply(message, DENIAL_MESSAGE).await;
        }

        match session.step {
            WizardStep::AwaitingDelay => {
                let Some(delay) = session.accept_delay(text) else {
                    drop(wizards);
                    return self.reply(message, "❌ Enter a number from 1 to 3600").await;
                };
                drop(wizards);
                self.reply(
                    message,
                    &format!(
                        "✅ Delay: {}\n📝 Now send the delayed message:",
                        format_delay(delay)
                    ),
                )
                .await
            }
            WizardStep::AwaitingMessage => {
                let Some(session) = wizards.remove(&session_key) else {
                    return Ok(());
                };
                drop(wizards);
                self.finish_wizard(message, session, text).await
            }
        }
    }

    /// Terminal wizard step: persist, invalidate, confirm. The session is
    /// already removed, so the wizard never gets stuck on a failed save.
    async fn finish_wizard(
        &self,
        message: &TelegramMessage,
        session: WizardSession,
        text: &str,
    ) -> Result<()> {
        let kind = session.kind;
        let chat_id = session.chat_id;
        let Some(delay) = session.pending_delay else {
            warn!("Wizard session for chat {} lost its pending delay", chat_id);
            return self.reply(message, "❌ Could not save the trigger, try again").await;
        };

        let entities_json =
            serde_json::to_string(&message.entities).unwrap_or_else(|_| "[]".to_string());
        let set_by = message.from.as_ref().map(|from| from.id.to_string());

        let saved = {
            let mut storage = self.storage.lock().await;
            storage.set_trigger(
                &chat_id.to_string(),
                kind.as_str(),
                delay,
                text,
                &entities_json,
                set_by.as_deref(),
            )
        };

        match saved {
            Ok(()) => {
                self.cache.delete(&keys::trigger(chat_id, kind.as_str()));
                self.cache.delete(&keys::triggers_listing(chat_id));
                self.reply(
                    message,
                    &format!("{} Trigger {} saved!", kind.setup_emoji(), kind.hashtag()),
                )
                .await
            }
            Err(err) => {
                warn!(
                    "Failed to save trigger {} for chat {}: {}",
                    kind.as_str(),
                    chat_id,
                    err
                );
                self.reply(message, "❌ Could not save the trigger, try again").await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use zonebot_config::ReleaseConfig;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("zonebot-dispatcher-{}-{}.db", name, ts))
    }

    fn test_dispatcher(name: &str) -> Arc<Dispatcher> {
        let storage = Storage::new(temp_db_path(name)).expect("storage");
        let cache = Arc::new(TtlCache::new());
        let release = Arc::new(ReleaseCoordinator::new(
            ReleaseConfig::default(),
            Arc::clone(&cache),
        ));
        let telegram = Arc::new(TelegramAdapter::new(
            "123456:TESTTOKEN",
            std::env::temp_dir(),
            Some(60),
            Some(600),
        ));
        Arc::new(Dispatcher::new(
            telegram,
            Arc::new(Mutex::new(storage)),
            cache,
            release,
            42,
        ))
    }

    fn group_message(chat_id: i64, user_id: i64, text: &str) -> TelegramMessage {
        serde_json::from_value(serde_json::json!({
            "message_id": 10,
            "text": text,
            "chat": {"id": chat_id, "type": "supergroup"},
            "from": {"id": user_id, "first_name": "Tester"},
        }))
        .expect("message")
    }

    #[test]
    fn command_parsing_strips_bot_mention() {
        assert_eq!(parse_command("/status"), Some("status".to_string()));
        assert_eq!(parse_command("/Set_T1@ZoneBot"), Some("set_t1".to_string()));
        assert_eq!(parse_command("/off extra args"), Some("off".to_string()));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn info_button_is_a_single_standing_button() {
        let keyboard = info_button();
        assert_eq!(keyboard.len(), 1);
        assert_eq!(keyboard[0].len(), 1);
        assert_eq!(keyboard[0][0].callback_data, INFO_BUTTON_DATA);
    }

    #[tokio::test]
    async fn other_members_chatter_leaves_open_wizard_untouched() {
        let dispatcher = test_dispatcher("wizard-bystander");
        {
            let mut wizards = dispatcher.wizards.lock().await;
            wizards.insert((-100, 42), WizardSession::new(TriggerKind::Enter, -100, 42));
        }

        let bystander = group_message(-100, 777, "just chatting");
        dispatcher
            .continue_wizard(&bystander, "just chatting")
            .await
            .expect("chatter handled");

        let wizards = dispatcher.wizards.lock().await;
        assert!(
            wizards.contains_key(&(-100, 42)),
            "open session survives other members' messages"
        );
        assert!(!wizards.contains_key(&(-100, 777)));
    }

    #[tokio::test]
    async fn run_spawns_handlers_and_stops_when_channel_closes() {
        let dispatcher = test_dispatcher("run-loop");
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(rx));

        for update_id in 1..=3 {
            tx.send(TelegramUpdate {
                update_id,
                message: None,
                callback_query: None,
                my_chat_member: None,
            })
            .await
            .expect("send");
        }
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run loop stops when the channel closes")
            .expect("run task");
    }
}
