//! Database storage layer for Huddle Server

use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

use crate::crypto;
use crate::models::*;

const SQLITE_TIME: &str = "%Y-%m-%d %H:%M:%S";

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_path: &str) -> anyhow::Result<Self> {
        // Ensure directory exists
        if let Some(parent) = Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", database_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Private in-memory database. One connection, since every sqlite
    /// memory connection is its own database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                display_name TEXT,
                avatar_file_id TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_seen_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                expires_at TEXT NOT NULL,
                is_valid INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS calls (
                call_id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                initiator_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                connected_at INTEGER,
                ended_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS call_participants (
                call_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                status TEXT NOT NULL,
                joined_at INTEGER,
                left_at INTEGER,
                PRIMARY KEY (call_id, user_id),
                FOREIGN KEY (call_id) REFERENCES calls(call_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_calls_ended ON calls(ended_at);
            CREATE INDEX IF NOT EXISTS idx_participants_user ON call_participants(user_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // User Operations
    // ========================================================================

    pub async fn create_user(&self, user_id: &str, display_name: Option<&str>) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, display_name, created_at) VALUES (?, ?, datetime('now'))",
        )
        .bind(user_id)
        .bind(display_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT user_id, display_name, avatar_file_id, created_at, last_seen_at, is_active
             FROM users WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn set_display_name(&self, user_id: &str, display_name: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET display_name = ? WHERE user_id = ?")
            .bind(display_name)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn update_user_last_seen(&self, user_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET last_seen_at = datetime('now') WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn deactivate_user(&self, user_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE users SET is_active = 0 WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        // Invalidate all sessions
        sqlx::query("UPDATE sessions SET is_valid = 0 WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_users(&self) -> anyhow::Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT user_id, display_name, avatar_file_id, created_at, last_seen_at, is_active
             FROM users ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    // ========================================================================
    // Session Operations
    // ========================================================================

    pub async fn create_session(
        &self,
        user_id: &str,
        device_id: &str,
        token: &str,
        ttl_hours: i64,
    ) -> anyhow::Result<DateTime<Utc>> {
        let token_hash = crypto::hash_token(token);
        let expires_at = Utc::now() + Duration::hours(ttl_hours);

        sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, device_id, created_at, expires_at, is_valid)
             VALUES (?, ?, ?, datetime('now'), ?, 1)",
        )
        .bind(&token_hash)
        .bind(user_id)
        .bind(device_id)
        .bind(expires_at.format(SQLITE_TIME).to_string())
        .execute(&self.pool)
        .await?;

        Ok(expires_at)
    }

    /// A token is good while its session is valid, unexpired and the user
    /// is still active.
    pub async fn validate_session(&self, token: &str) -> anyhow::Result<Option<Session>> {
        let token_hash = crypto::hash_token(token);

        let session = sqlx::query_as::<_, Session>(
            "SELECT s.token_hash, s.user_id, s.device_id, s.created_at, s.expires_at, s.is_valid
             FROM sessions s JOIN users u ON u.user_id = s.user_id
             WHERE s.token_hash = ? AND s.is_valid = 1 AND u.is_active = 1
               AND s.expires_at > datetime('now')",
        )
        .bind(&token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    // ========================================================================
    // Call Operations
    // ========================================================================

    /// Upsert a call record together with its participant list.
    pub async fn save_call(&self, call: &Call) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO calls (call_id, room_id, call_type, initiator_id, created_at, connected_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(call_id) DO UPDATE SET
                call_type = excluded.call_type,
                connected_at = excluded.connected_at,
                ended_at = excluded.ended_at",
        )
        .bind(&call.call_id)
        .bind(&call.room_id)
        .bind(call.call_type.as_str())
        .bind(&call.initiator_id)
        .bind(call.created_at)
        .bind(call.connected_at)
        .bind(call.ended_at)
        .execute(&mut *tx)
        .await?;

        for (position, participant) in call.participants.iter().enumerate() {
            sqlx::query(
                "INSERT INTO call_participants (call_id, user_id, position, status, joined_at, left_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(call_id, user_id) DO UPDATE SET
                    status = excluded.status,
                    joined_at = excluded.joined_at,
                    left_at = excluded.left_at",
            )
            .bind(&call.call_id)
            .bind(&participant.user_id)
            .bind(position as i64)
            .bind(participant.status.as_str())
            .bind(participant.joined_at)
            .bind(participant.left_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_call(&self, call_id: &str) -> anyhow::Result<Option<Call>> {
        let row = sqlx::query_as::<_, CallRow>(
            "SELECT call_id, room_id, call_type, initiator_id, created_at, connected_at, ended_at
             FROM calls WHERE call_id = ?",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let participants = self.get_participants(&row.call_id).await?;
                Ok(Some(row.into_call(participants)))
            }
            None => Ok(None),
        }
    }

    /// Newest first.
    pub async fn recent_calls_for_user(&self, user_id: &str, limit: i64) -> anyhow::Result<Vec<Call>> {
        let rows = sqlx::query_as::<_, CallRow>(
            "SELECT c.call_id, c.room_id, c.call_type, c.initiator_id, c.created_at, c.connected_at, c.ended_at
             FROM calls c JOIN call_participants p ON p.call_id = c.call_id
             WHERE p.user_id = ?
             ORDER BY c.created_at DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut calls = Vec::with_capacity(rows.len());
        for row in rows {
            let participants = self.get_participants(&row.call_id).await?;
            calls.push(row.into_call(participants));
        }
        Ok(calls)
    }

    async fn get_participants(&self, call_id: &str) -> anyhow::Result<Vec<ParticipantRow>> {
        let participants = sqlx::query_as::<_, ParticipantRow>(
            "SELECT user_id, status, joined_at, left_at
             FROM call_participants WHERE call_id = ? ORDER BY position",
        )
        .bind(call_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(participants)
    }

    /// Rooms live in memory only; calls still open at startup were cut off
    /// by the previous shutdown.
    pub async fn close_stale_calls(&self, now_millis: i64) -> anyhow::Result<u64> {
        sqlx::query(
            "UPDATE call_participants SET status = 'left', left_at = ?
             WHERE status IN ('invited', 'ringing', 'joined')
               AND call_id IN (SELECT call_id FROM calls WHERE ended_at IS NULL)",
        )
        .bind(now_millis)
        .execute(&self.pool)
        .await?;

        let result = sqlx::query("UPDATE calls SET ended_at = ? WHERE ended_at IS NULL")
            .bind(now_millis)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // Cleanup Operations
    // ========================================================================

    /// Drop dead sessions and call records past retention. Returns
    /// `(sessions, calls)` removed.
    pub async fn cleanup_expired(&self, call_retention_days: u64) -> anyhow::Result<(u64, u64)> {
        let sessions_result =
            sqlx::query("DELETE FROM sessions WHERE expires_at <= datetime('now') OR is_valid = 0")
                .execute(&self.pool)
                .await?;

        let cutoff = (Utc::now() - Duration::days(call_retention_days as i64)).timestamp_millis();
        let calls_result = sqlx::query("DELETE FROM calls WHERE ended_at IS NOT NULL AND ended_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok((sessions_result.rows_affected(), calls_result.rows_affected()))
    }
}
