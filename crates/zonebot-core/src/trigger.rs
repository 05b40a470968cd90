//! Trigger kinds, configuration resolution, and the armed-job
//! de-duplication set.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::warn;
use zonebot_cache::{keys, TtlCache};
use zonebot_format::MessageEntity;
use zonebot_storage::Storage;

pub const DEFAULT_DELAY_SECS: i64 = 5;
pub const DEFAULT_DELAYED_MESSAGE: &str = "Operation complete! ✅";

/// How long a resolved trigger config stays memoized.
const TRIGGER_CACHE_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Enter,
    Car,
    Bike,
    Exit,
}

impl TriggerKind {
    /// Kinds that carry a persisted configuration. Exit is handled inline
    /// with no stored row and no delay.
    pub const PERSISTED: [TriggerKind; 3] =
        [TriggerKind::Enter, TriggerKind::Car, TriggerKind::Bike];

    const ALL: [TriggerKind; 4] = [
        TriggerKind::Enter,
        TriggerKind::Car,
        TriggerKind::Bike,
        TriggerKind::Exit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Enter => "enter",
            TriggerKind::Car => "car",
            TriggerKind::Bike => "bike",
            TriggerKind::Exit => "exit",
        }
    }

    pub fn hashtag(&self) -> &'static str {
        match self {
            TriggerKind::Enter => "#ورود",
            TriggerKind::Car => "#ماشین",
            TriggerKind::Bike => "#موتور",
            TriggerKind::Exit => "#خروج",
        }
    }

    /// Emoji used in the immediate acknowledgement.
    pub fn ack_emoji(&self) -> &'static str {
        match self {
            TriggerKind::Enter => "🎴",
            TriggerKind::Car => "🚗",
            TriggerKind::Bike => "🏍️",
            TriggerKind::Exit => "🧭",
        }
    }

    /// Emoji used in wizard prompts and the status listing.
    pub fn setup_emoji(&self) -> &'static str {
        match self {
            TriggerKind::Enter => "🚪",
            TriggerKind::Car => "🚗",
            TriggerKind::Bike => "🏍️",
            TriggerKind::Exit => "🧭",
        }
    }

    pub fn from_stored(value: &str) -> Option<TriggerKind> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
    }

    /// Every kind whose hashtag occurs in the text, in declaration order.
    /// A message may carry several hashtags; each fires independently.
    pub fn scan(text: &str) -> Vec<TriggerKind> {
        Self::ALL
            .into_iter()
            .filter(|kind| text.contains(kind.hashtag()))
            .collect()
    }
}

/// The effective configuration a trigger fires with, after defaulting.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTrigger {
    pub delay_secs: i64,
    pub message: String,
    pub entities: Vec<MessageEntity>,
}

impl ResolvedTrigger {
    fn defaults() -> Self {
        Self {
            delay_secs: DEFAULT_DELAY_SECS,
            message: DEFAULT_DELAYED_MESSAGE.to_string(),
            entities: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedTrigger {
    delay: i64,
    message: String,
    entities: Vec<MessageEntity>,
}

/// Cache-fronted config lookup. Absence of a row is not an error: defaults
/// apply, and defaulting lives here and nowhere else.
pub struct TriggerConfigSource {
    storage: Arc<tokio::sync::Mutex<Storage>>,
    cache: Arc<TtlCache>,
}

impl TriggerConfigSource {
    pub fn new(storage: Arc<tokio::sync::Mutex<Storage>>, cache: Arc<TtlCache>) -> Self {
        Self { storage, cache }
    }

    pub async fn resolve(&self, chat_id: i64, kind: TriggerKind) -> ResolvedTrigger {
        let key = keys::trigger(chat_id, kind.as_str());
        if let Some(cached) = self.cache.get_json::<CachedTrigger>(&key) {
            return ResolvedTrigger {
                delay_secs: cached.delay,
                message: cached.message,
                entities: cached.entities,
            };
        }

        let row = {
            let storage = self.storage.lock().await;
            storage.get_trigger(&chat_id.to_string(), kind.as_str())
        };

        match row {
            Ok(Some(row)) => {
                let entities: Vec<MessageEntity> = serde_json::from_str(&row.entities_json)
                    .unwrap_or_else(|err| {
                        warn!(
                            "Malformed entities for chat {} kind {}: {}",
                            chat_id,
                            kind.as_str(),
                            err
                        );
                        Vec::new()
                    });
                let resolved = ResolvedTrigger {
                    delay_secs: row.delay,
                    message: row.delayed_message,
                    entities,
                };
                self.cache.set_json(
                    &key,
                    &CachedTrigger {
                        delay: resolved.delay_secs,
                        message: resolved.message.clone(),
                        entities: resolved.entities.clone(),
                    },
                    TRIGGER_CACHE_TTL_SECS,
                );
                resolved
            }
            Ok(None) => ResolvedTrigger::defaults(),
            Err(err) => {
                warn!(
                    "Trigger lookup failed for chat {} kind {}: {}",
                    chat_id,
                    kind.as_str(),
                    err
                );
                ResolvedTrigger::defaults()
            }
        }
    }
}

/// In-memory set of armed delayed jobs, keyed by (chat, originating
/// message, kind). At most one live job per key; duplicates are discarded
/// silently, while distinct hashtags in one message each get their own
/// job. Not persisted, lost on restart.
#[derive(Default)]
pub struct ArmedJobs {
    inner: Mutex<HashSet<(i64, i64, TriggerKind)>>,
}

impl ArmedJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a job is already armed for this key.
    pub fn try_arm(&self, chat_id: i64, message_id: i64, kind: TriggerKind) -> bool {
        self.inner
            .lock()
            .map(|mut set| set.insert((chat_id, message_id, kind)))
            .unwrap_or(false)
    }

    pub fn disarm(&self, chat_id: i64, message_id: i64, kind: TriggerKind) {
        if let Ok(mut set) = self.inner.lock() {
            set.remove(&(chat_id, message_id, kind));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("zonebot-core-{}-{}.db", name, ts))
    }

    #[test]
    fn scan_finds_each_hashtag_occurrence() {
        let kinds = TriggerKind::scan("comes in #ورود and also #ماشین today");
        assert_eq!(kinds, vec![TriggerKind::Enter, TriggerKind::Car]);
        assert!(TriggerKind::scan("no hashtags here").is_empty());
        assert_eq!(TriggerKind::scan("#خروج"), vec![TriggerKind::Exit]);
    }

    #[test]
    fn stored_kind_round_trip() {
        for kind in TriggerKind::PERSISTED {
            assert_eq!(TriggerKind::from_stored(kind.as_str()), Some(kind));
        }
        assert_eq!(TriggerKind::from_stored("unknown"), None);
    }

    #[tokio::test]
    async fn resolve_applies_defaults_when_row_missing() {
        let storage = Storage::new(temp_db_path("defaults")).expect("storage");
        let source = TriggerConfigSource::new(
            Arc::new(tokio::sync::Mutex::new(storage)),
            Arc::new(TtlCache::new()),
        );

        let resolved = source.resolve(-100, TriggerKind::Car).await;
        assert_eq!(resolved.delay_secs, DEFAULT_DELAY_SECS);
        assert_eq!(resolved.message, DEFAULT_DELAYED_MESSAGE);
        assert!(resolved.entities.is_empty());
    }

    #[tokio::test]
    async fn resolve_reads_row_and_memoizes_it() {
        let mut storage = Storage::new(temp_db_path("memoize")).expect("storage");
        storage
            .set_trigger(
                "-100",
                "enter",
                45,
                "Welcome!",
                r#"[{"offset":0,"length":7,"type":"bold"}]"#,
                None,
            )
            .expect("insert");

        let cache = Arc::new(TtlCache::new());
        let source = TriggerConfigSource::new(
            Arc::new(tokio::sync::Mutex::new(storage)),
            Arc::clone(&cache),
        );

        let resolved = source.resolve(-100, TriggerKind::Enter).await;
        assert_eq!(resolved.delay_secs, 45);
        assert_eq!(resolved.message, "Welcome!");
        assert_eq!(resolved.entities.len(), 1);
        assert!(
            cache.get(&keys::trigger(-100, "enter")).is_some(),
            "lookup result memoized"
        );

        // Second resolve is served from cache; equal result either way.
        let again = source.resolve(-100, TriggerKind::Enter).await;
        assert_eq!(again, resolved);
    }

    #[tokio::test]
    async fn resolve_tolerates_malformed_entities() {
        let mut storage = Storage::new(temp_db_path("malformed")).expect("storage");
        storage
            .set_trigger("-100", "bike", 30, "hi", "not-json", None)
            .expect("insert");

        let source = TriggerConfigSource::new(
            Arc::new(tokio::sync::Mutex::new(storage)),
            Arc::new(TtlCache::new()),
        );

        let resolved = source.resolve(-100, TriggerKind::Bike).await;
        assert_eq!(resolved.delay_secs, 30);
        assert!(resolved.entities.is_empty());
    }

    #[test]
    fn duplicate_arm_for_same_message_and_kind_is_rejected() {
        let jobs = ArmedJobs::new();
        assert!(jobs.try_arm(-100, 555, TriggerKind::Enter));
        assert!(!jobs.try_arm(-100, 555, TriggerKind::Enter), "second arm discarded");
        assert!(jobs.try_arm(-100, 556, TriggerKind::Enter), "different message is fine");
        assert!(jobs.try_arm(-200, 555, TriggerKind::Enter), "different chat is fine");

        jobs.disarm(-100, 555, TriggerKind::Enter);
        assert!(jobs.try_arm(-100, 555, TriggerKind::Enter), "re-armable after disarm");
    }

    #[test]
    fn distinct_kinds_in_one_message_each_arm_their_own_job() {
        let jobs = ArmedJobs::new();
        assert!(jobs.try_arm(-100, 555, TriggerKind::Enter));
        assert!(jobs.try_arm(-100, 555, TriggerKind::Car), "car job arms alongside enter");
        assert!(!jobs.try_arm(-100, 555, TriggerKind::Car), "repeat of car still discarded");
        assert_eq!(jobs.len(), 2);
    }
}
