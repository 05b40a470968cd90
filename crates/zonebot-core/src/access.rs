//! Access control for trigger administration.
//!
//! The configured owner identity has unconditional access. Anyone else must
//! be a creator or administrator of the group, resolved via a cached
//! chat-member lookup. Admin commands are group-scoped: a private chat with
//! a non-owner is always denied.

use std::sync::Arc;
use tracing::warn;
use zonebot_cache::{keys, TtlCache};
use zonebot_telegram::{TelegramAdapter, TelegramChat};

const ADMIN_CACHE_TTL_SECS: u64 = 600;

pub struct AccessControl {
    owner_id: i64,
    cache: Arc<TtlCache>,
    telegram: Arc<TelegramAdapter>,
}

impl AccessControl {
    pub fn new(owner_id: i64, cache: Arc<TtlCache>, telegram: Arc<TelegramAdapter>) -> Self {
        Self {
            owner_id,
            cache,
            telegram,
        }
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        user_id == self.owner_id
    }

    pub async fn can_administer(&self, chat: &TelegramChat, user_id: i64) -> bool {
        if self.is_owner(user_id) {
            return true;
        }
        if chat.is_private() {
            return false;
        }

        let key = keys::admin(chat.id, user_id);
        if let Some(cached) = self.cache.get_json::<bool>(&key) {
            return cached;
        }

        let allowed = match self.telegram.get_chat_member(chat.id, user_id).await {
            Ok(status) => matches!(status.as_str(), "creator" | "administrator"),
            Err(err) => {
                warn!(
                    "Admin lookup failed for user {} in chat {}: {}",
                    user_id, chat.id, err
                );
                false
            }
        };

        self.cache.set_json(&key, &allowed, ADMIN_CACHE_TTL_SECS);
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access() -> AccessControl {
        let telegram = Arc::new(TelegramAdapter::new(
            "123456:TESTTOKEN",
            std::env::temp_dir(),
            Some(60),
            Some(600),
        ));
        AccessControl::new(42, Arc::new(TtlCache::new()), telegram)
    }

    fn group_chat() -> TelegramChat {
        serde_json::from_value(serde_json::json!({"id": -100, "type": "supergroup"}))
            .expect("chat")
    }

    fn private_chat() -> TelegramChat {
        serde_json::from_value(serde_json::json!({"id": 42, "type": "private"})).expect("chat")
    }

    #[test]
    fn owner_matches_exactly() {
        let access = access();
        assert!(access.is_owner(42));
        assert!(!access.is_owner(43));
    }

    #[tokio::test]
    async fn owner_is_allowed_everywhere() {
        let access = access();
        assert!(access.can_administer(&group_chat(), 42).await);
        assert!(access.can_administer(&private_chat(), 42).await);
    }

    #[tokio::test]
    async fn private_chat_non_owner_is_denied_without_lookup() {
        let access = access();
        assert!(!access.can_administer(&private_chat(), 7).await);
    }

    #[tokio::test]
    async fn cached_admin_result_is_honored() {
        let access = access();
        access.cache.set_json(&keys::admin(-100, 7), &true, 600);
        assert!(access.can_administer(&group_chat(), 7).await);

        access.cache.set_json(&keys::admin(-100, 8), &false, 600);
        assert!(!access.can_administer(&group_chat(), 8).await);
    }
}
