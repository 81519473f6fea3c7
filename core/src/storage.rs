//! Local call log and user cache using SQLite

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::models::*;

pub struct CallHistory {
    conn: Mutex<Connection>,
}

impl CallHistory {
    pub fn open(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = Path::new(data_dir).join("huddle.db");
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let history = Self {
            conn: Mutex::new(conn),
        };
        history.init_schema()?;
        Ok(history)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS call_log (
                call_id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                initiator_id TEXT NOT NULL,
                participants_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                connected_at INTEGER,
                ended_at INTEGER NOT NULL,
                end_reason TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                display_name TEXT,
                avatar_file_id TEXT,
                last_seen_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_call_log_ended ON call_log(ended_at);
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Call log
    // ========================================================================

    pub fn record(&self, entry: &CallLogEntry) -> Result<()> {
        let participants = serde_json::to_string(&entry.participants)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO call_log
               (call_id, room_id, call_type, initiator_id, participants_json, created_at, connected_at, ended_at, end_reason)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                entry.call_id,
                entry.room_id,
                entry.call_type.as_str(),
                entry.initiator_id,
                participants,
                entry.created_at,
                entry.connected_at,
                entry.ended_at,
                entry.end_reason.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Most recent calls first.
    pub fn recent(&self, limit: i64) -> Result<Vec<CallLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT call_id, room_id, call_type, initiator_id, participants_json,
                      created_at, connected_at, ended_at, end_reason
               FROM call_log
               ORDER BY ended_at DESC
               LIMIT ?1"#,
        )?;

        let rows = stmt.query_map(params![limit], read_log_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }

        Ok(entries)
    }

    pub fn get(&self, call_id: &str) -> Result<Option<CallLogEntry>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            r#"SELECT call_id, room_id, call_type, initiator_id, participants_json,
                      created_at, connected_at, ended_at, end_reason
               FROM call_log WHERE call_id = ?1"#,
            params![call_id],
            read_log_row,
        );

        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM call_log", [])?;
        Ok(())
    }

    // ========================================================================
    // Users cache
    // ========================================================================

    pub fn save_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO users (user_id, display_name, avatar_file_id, last_seen_at)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![user.user_id, user.display_name, user.avatar_file_id, user.last_seen_at],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT user_id, display_name, avatar_file_id, last_seen_at FROM users WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(User {
                    user_id: row.get(0)?,
                    display_name: row.get(1)?,
                    avatar_file_id: row.get(2)?,
                    online: false,
                    last_seen_at: row.get(3)?,
                })
            },
        );

        match result {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_log_row(row: &Row<'_>) -> rusqlite::Result<CallLogEntry> {
    let call_type: String = row.get(2)?;
    let participants: String = row.get(4)?;
    let end_reason: String = row.get(8)?;

    Ok(CallLogEntry {
        call_id: row.get(0)?,
        room_id: row.get(1)?,
        call_type: parse_call_type(&call_type),
        initiator_id: row.get(3)?,
        participants: serde_json::from_str(&participants).unwrap_or_default(),
        created_at: row.get(5)?,
        connected_at: row.get(6)?,
        ended_at: row.get(7)?,
        end_reason: parse_end_reason(&end_reason).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

fn parse_call_type(value: &str) -> CallType {
    match value {
        "video" => CallType::Video,
        _ => CallType::Audio,
    }
}

fn parse_end_reason(value: &str) -> Result<EndReason> {
    match value {
        "local_hangup" => Ok(EndReason::LocalHangup),
        "cancelled" => Ok(EndReason::Cancelled),
        "rejected" => Ok(EndReason::Rejected),
        "remote_ended" => Ok(EndReason::RemoteEnded),
        "peers_failed" => Ok(EndReason::PeersFailed),
        "setup_failed" => Ok(EndReason::SetupFailed),
        other => Err(Error::Storage(format!("unknown end reason {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(call_id: &str, ended_at: i64) -> CallLogEntry {
        CallLogEntry {
            call_id: call_id.to_string(),
            room_id: format!("room-{}", call_id),
            call_type: CallType::Video,
            initiator_id: "alice".into(),
            participants: vec!["alice".into(), "bob".into()],
            created_at: ended_at - 1000,
            connected_at: Some(ended_at - 900),
            ended_at,
            end_reason: EndReason::RemoteEnded,
        }
    }

    #[test]
    fn test_record_and_read_back() {
        let history = CallHistory::open_in_memory().unwrap();
        history.record(&entry("c1", 5_000)).unwrap();

        let stored = history.get("c1").unwrap().unwrap();
        assert_eq!(stored, entry("c1", 5_000));
        assert!(history.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_recent_is_newest_first() {
        let history = CallHistory::open_in_memory().unwrap();
        history.record(&entry("old", 1_000)).unwrap();
        history.record(&entry("new", 9_000)).unwrap();

        let ids: Vec<String> = history.recent(10).unwrap().into_iter().map(|e| e.call_id).collect();
        assert_eq!(ids, vec!["new", "old"]);

        history.clear().unwrap();
        assert!(history.recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_user_cache() {
        let history = CallHistory::open_in_memory().unwrap();
        history
            .save_user(&User {
                user_id: "bob".into(),
                display_name: Some("Bob".into()),
                avatar_file_id: None,
                online: true,
                last_seen_at: Some("2026-10-01T12:00:00Z".into()),
            })
            .unwrap();

        let bob = history.get_user("bob").unwrap().unwrap();
        assert_eq!(bob.display_name.as_deref(), Some("Bob"));
        assert!(!bob.online);
    }
}
