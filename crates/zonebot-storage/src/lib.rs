//! Zonebot Storage
//!
//! SQLite persistence for trigger configurations, one row per
//! (chat, trigger kind)

use anyhow::Result;
use rusqlite::OptionalExtension;
use std::path::Path;

pub struct Storage {
    conn: rusqlite::Connection,
}

/// One persisted trigger configuration. `entities_json` carries the raw
/// Telegram message entities captured by the wizard, stored verbatim so the
/// formatter sees exactly what the wizard saw.
#[derive(Debug, Clone)]
pub struct TriggerRow {
    pub chat_id: String,
    pub trigger_type: String,
    pub delay: i64,
    pub delayed_message: String,
    pub entities_json: String,
    pub updated_at: String,
    pub set_by: Option<String>,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS triggers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                delay INTEGER NOT NULL,
                delayed_message TEXT NOT NULL,
                message_entities TEXT NOT NULL DEFAULT '[]',
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                set_by TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_triggers_chat_type
            ON triggers(chat_id, trigger_type);
            ",
        )?;

        Ok(Self { conn })
    }

    pub fn get_trigger(&self, chat_id: &str, trigger_type: &str) -> Result<Option<TriggerRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT chat_id, trigger_type, delay, delayed_message, message_entities, updated_at, set_by
             FROM triggers
             WHERE chat_id = ?1 AND trigger_type = ?2
             LIMIT 1",
        )?;

        let row = stmt
            .query_row([chat_id, trigger_type], Self::map_row)
            .optional()?;
        Ok(row)
    }

    /// Replace any existing row for (chat, kind) with the new configuration.
    /// Delete-then-insert inside one transaction keeps the uniqueness
    /// invariant even if an older database predates the unique index.
    pub fn set_trigger(
        &mut self,
        chat_id: &str,
        trigger_type: &str,
        delay: i64,
        delayed_message: &str,
        entities_json: &str,
        set_by: Option<&str>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM triggers WHERE chat_id = ?1 AND trigger_type = ?2",
            [chat_id, trigger_type],
        )?;
        tx.execute(
            "INSERT INTO triggers (chat_id, trigger_type, delay, delayed_message, message_entities, updated_at, set_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                chat_id,
                trigger_type,
                delay,
                delayed_message,
                entities_json,
                chrono::Utc::now().to_rfc3339(),
                set_by,
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_triggers_for_chat(&self, chat_id: &str) -> Result<Vec<TriggerRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT chat_id, trigger_type, delay, delayed_message, message_entities, updated_at, set_by
             FROM triggers
             WHERE chat_id = ?1
             ORDER BY trigger_type",
        )?;

        let rows = stmt.query_map([chat_id], Self::map_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Bulk removal when the bot is deactivated for a chat. Returns the
    /// number of rows deleted.
    pub fn delete_triggers_for_chat(&self, chat_id: &str) -> Result<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM triggers WHERE chat_id = ?1", [chat_id])?;
        Ok(deleted)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TriggerRow> {
        Ok(TriggerRow {
            chat_id: row.get(0)?,
            trigger_type: row.get(1)?,
            delay: row.get(2)?,
            delayed_message: row.get(3)?,
            entities_json: row.get(4)?,
            updated_at: row.get(5)?,
            set_by: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Storage;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("zonebot-storage-{}-{}.db", name, ts))
    }

    #[test]
    fn set_and_get_trigger_round_trip() {
        let path = temp_db_path("roundtrip");
        let mut storage = Storage::new(&path).expect("storage init");

        storage
            .set_trigger("-100", "enter", 45, "Welcome!", "[]", Some("42"))
            .expect("insert");

        let row = storage
            .get_trigger("-100", "enter")
            .expect("query")
            .expect("row present");
        assert_eq!(row.delay, 45);
        assert_eq!(row.delayed_message, "Welcome!");
        assert_eq!(row.entities_json, "[]");
        assert_eq!(row.set_by.as_deref(), Some("42"));
    }

    #[test]
    fn missing_row_is_none_not_error() {
        let path = temp_db_path("missing");
        let storage = Storage::new(&path).expect("storage init");
        let row = storage.get_trigger("-100", "car").expect("query");
        assert!(row.is_none());
    }

    #[test]
    fn replacing_trigger_keeps_single_row() {
        let path = temp_db_path("replace");
        let mut storage = Storage::new(&path).expect("storage init");

        storage
            .set_trigger("-100", "enter", 45, "first", "[]", None)
            .expect("insert");
        storage
            .set_trigger("-100", "enter", 90, "second", "[]", None)
            .expect("replace");

        let rows = storage.list_triggers_for_chat("-100").expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delay, 90);
        assert_eq!(rows[0].delayed_message, "second");
    }

    #[test]
    fn delete_for_chat_removes_all_kinds_and_leaves_others() {
        let path = temp_db_path("bulk");
        let mut storage = Storage::new(&path).expect("storage init");

        storage
            .set_trigger("-100", "enter", 5, "a", "[]", None)
            .expect("insert");
        storage
            .set_trigger("-100", "car", 5, "b", "[]", None)
            .expect("insert");
        storage
            .set_trigger("-200", "enter", 5, "c", "[]", None)
            .expect("insert");

        let deleted = storage.delete_triggers_for_chat("-100").expect("delete");
        assert_eq!(deleted, 2);
        assert!(storage.list_triggers_for_chat("-100").expect("list").is_empty());
        assert_eq!(storage.list_triggers_for_chat("-200").expect("list").len(), 1);
    }

    #[test]
    fn entities_json_stored_verbatim() {
        let path = temp_db_path("entities");
        let mut storage = Storage::new(&path).expect("storage init");
        let entities = r#"[{"offset":0,"length":8,"type":"bold"}]"#;

        storage
            .set_trigger("-100", "bike", 30, "Welcome!", entities, None)
            .expect("insert");

        let row = storage
            .get_trigger("-100", "bike")
            .expect("query")
            .expect("row");
        assert_eq!(row.entities_json, entities);
    }
}
