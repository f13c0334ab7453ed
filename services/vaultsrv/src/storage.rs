//! SQLite persistence for protected messages and fast-lane codes
//!
//! Every phase transition goes through a conditional UPDATE keyed on the
//! phase value the caller last read (`WHERE id = ? AND phase = ?`). Zero
//! rows affected means another operation moved the record first; callers
//! treat that as a benign skip or map it to their domain outcome. This is
//! the only concurrency discipline in the system - no locks, no versions.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::domain::{FastLaneCode, Phase, ProtectedMessage};
use crate::error::{Result, VaultError};

/// Open a file-backed pool with the service's standard SQLite settings
pub async fn connect(db_path: impl AsRef<Path>, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path.as_ref())
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    info!("SQLite ready: {}", db_path.as_ref().display());
    Ok(pool)
}

/// In-memory pool for tests and drills. Capped at one connection so every
/// query sees the same database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(VaultError::Database)?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create tables and indexes if missing
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS protected_messages (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            owner_email TEXT,
            owner_phone TEXT,
            recipient_email TEXT,
            recipient_phone TEXT,
            content TEXT NOT NULL,
            phase TEXT NOT NULL DEFAULT 'idle',
            phase_entered_at TEXT,
            escalation_active INTEGER NOT NULL DEFAULT 0,
            advance_count INTEGER NOT NULL DEFAULT 0,
            disclosed INTEGER NOT NULL DEFAULT 0,
            presence_confirmed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_phase ON protected_messages (phase)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fast_lane_codes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_phone TEXT NOT NULL,
            code TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            consumed_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Protected messages
// ============================================================================

pub async fn insert_message(pool: &SqlitePool, msg: &ProtectedMessage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO protected_messages (
            id, owner_id, owner_email, owner_phone,
            recipient_email, recipient_phone, content,
            phase, phase_entered_at, escalation_active, advance_count,
            disclosed, presence_confirmed, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(msg.id.to_string())
    .bind(&msg.owner_id)
    .bind(&msg.owner_email)
    .bind(&msg.owner_phone)
    .bind(&msg.recipient_email)
    .bind(&msg.recipient_phone)
    .bind(&msg.content)
    .bind(msg.phase.to_string())
    .bind(msg.phase_entered_at)
    .bind(msg.escalation_active)
    .bind(msg.advance_count)
    .bind(msg.disclosed)
    .bind(msg.presence_confirmed)
    .bind(msg.created_at)
    .bind(msg.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_message(pool: &SqlitePool, id: &Uuid) -> Result<Option<ProtectedMessage>> {
    let row = sqlx::query("SELECT * FROM protected_messages WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(hydrate_message).transpose()
}

/// All messages currently in a reminder phase (sweep candidates)
pub async fn list_ladder_messages(pool: &SqlitePool) -> Result<Vec<ProtectedMessage>> {
    let rows = sqlx::query(
        "SELECT * FROM protected_messages WHERE phase LIKE 'phase_%' ORDER BY phase_entered_at ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        messages.push(hydrate_message(row)?);
    }
    Ok(messages)
}

/// Message counts grouped by phase, for the status endpoint
pub async fn phase_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows =
        sqlx::query("SELECT phase, COUNT(*) AS n FROM protected_messages GROUP BY phase")
            .fetch_all(pool)
            .await?;

    rows.into_iter()
        .map(|row| Ok((row.try_get("phase")?, row.try_get("n")?)))
        .collect()
}

// ============================================================================
// Conditional phase transitions
// ============================================================================

/// IDLE -> PHASE_1. Returns false if the record was no longer idle.
pub async fn cas_start(pool: &SqlitePool, id: &Uuid, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE protected_messages
        SET phase = 'phase_1',
            phase_entered_at = ?,
            escalation_active = 1,
            advance_count = advance_count + 1,
            updated_at = ?
        WHERE id = ? AND phase = 'idle'
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Reminder stage advance keyed on the phase last read
pub async fn cas_advance(
    pool: &SqlitePool,
    id: &Uuid,
    from: Phase,
    to: Phase,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE protected_messages
        SET phase = ?,
            phase_entered_at = ?,
            advance_count = advance_count + 1,
            updated_at = ?
        WHERE id = ? AND phase = ?
        "#,
    )
    .bind(to.to_string())
    .bind(now)
    .bind(now)
    .bind(id.to_string())
    .bind(from.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Final ladder step: phase -> DISCLOSED, keyed on the phase last read
pub async fn cas_disclose(
    pool: &SqlitePool,
    id: &Uuid,
    from: Phase,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE protected_messages
        SET phase = 'disclosed',
            disclosed = 1,
            phase_entered_at = ?,
            advance_count = advance_count + 1,
            updated_at = ?
        WHERE id = ? AND phase = ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id.to_string())
    .bind(from.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Presence confirmed: phase -> CONFIRMED_ALIVE, keyed on the phase last
/// read. `escalation_active` stays as-is (historical flag).
pub async fn cas_confirm_alive(
    pool: &SqlitePool,
    id: &Uuid,
    from: Phase,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE protected_messages
        SET phase = 'confirmed_alive',
            presence_confirmed = 1,
            phase_entered_at = ?,
            updated_at = ?
        WHERE id = ? AND phase = ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id.to_string())
    .bind(from.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

// ============================================================================
// Fast lane
// ============================================================================

pub async fn insert_fast_lane_code(
    pool: &SqlitePool,
    phone: &str,
    code: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO fast_lane_codes (target_phone, code, expires_at, consumed_at, created_at)
        VALUES (?, ?, ?, NULL, ?)
        "#,
    )
    .bind(phone)
    .bind(code)
    .bind(expires_at)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_fast_lane_code(pool: &SqlitePool, phone: &str) -> Result<Option<FastLaneCode>> {
    let row = sqlx::query(
        r#"
        SELECT id, target_phone, code, expires_at, consumed_at, created_at
        FROM fast_lane_codes
        WHERE target_phone = ? AND consumed_at IS NULL
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(phone)
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        Ok(FastLaneCode {
            id: row.try_get("id")?,
            target_phone: row.try_get("target_phone")?,
            code: row.try_get("code")?,
            expires_at: row.try_get("expires_at")?,
            consumed_at: row.try_get("consumed_at")?,
            created_at: row.try_get("created_at")?,
        })
    })
    .transpose()
}

/// Delete consumed and expired codes. Neither can ever unlock again, so
/// the sweep reclaims them.
pub async fn purge_stale_fast_lane_codes(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM fast_lane_codes WHERE consumed_at IS NOT NULL OR expires_at <= ?",
    )
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Outcome of the single fast-unlock transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastUnlockOutcome {
    /// Code consumed and message disclosed, in the same transaction
    Unlocked,
    /// No unconsumed, unexpired code matched; nothing changed
    NoCode,
    /// Message already terminal; transaction rolled back, code not burned
    AlreadyTerminal(Phase),
}

/// Atomically consume a fast-lane code and disclose the target message.
/// Both writes land in one transaction: a code is never burned without the
/// unlock, and a message never unlocks without burning the code.
pub async fn consume_code_and_disclose(
    pool: &SqlitePool,
    message_id: &Uuid,
    phone: &str,
    code: &str,
    now: DateTime<Utc>,
) -> Result<FastUnlockOutcome> {
    let mut tx = pool.begin().await?;

    let consumed = sqlx::query(
        r#"
        UPDATE fast_lane_codes
        SET consumed_at = ?
        WHERE target_phone = ? AND code = ? AND consumed_at IS NULL AND expires_at > ?
        "#,
    )
    .bind(now)
    .bind(phone)
    .bind(code)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    if consumed.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(FastUnlockOutcome::NoCode);
    }

    let disclosed = sqlx::query(
        r#"
        UPDATE protected_messages
        SET phase = 'disclosed',
            disclosed = 1,
            escalation_active = 1,
            phase_entered_at = ?,
            advance_count = advance_count + 1,
            updated_at = ?
        WHERE id = ? AND phase NOT IN ('disclosed', 'confirmed_alive')
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(message_id.to_string())
    .execute(&mut *tx)
    .await?;

    if disclosed.rows_affected() == 0 {
        // Terminal already; undo the code consumption as well
        let phase: Option<String> =
            sqlx::query_scalar("SELECT phase FROM protected_messages WHERE id = ?")
                .bind(message_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        tx.rollback().await?;

        return match phase {
            Some(p) => {
                let phase = p
                    .parse::<Phase>()
                    .map_err(VaultError::Internal)?;
                Ok(FastUnlockOutcome::AlreadyTerminal(phase))
            },
            None => Err(VaultError::NotFound(message_id.to_string())),
        };
    }

    tx.commit().await?;
    Ok(FastUnlockOutcome::Unlocked)
}

// ============================================================================
// Row hydration
// ============================================================================

fn hydrate_message(row: SqliteRow) -> Result<ProtectedMessage> {
    let id: String = row.try_get("id")?;
    let phase: String = row.try_get("phase")?;

    Ok(ProtectedMessage {
        id: Uuid::parse_str(&id)
            .map_err(|e| VaultError::Internal(format!("bad message id {}: {}", id, e)))?,
        owner_id: row.try_get("owner_id")?,
        owner_email: row.try_get("owner_email")?,
        owner_phone: row.try_get("owner_phone")?,
        recipient_email: row.try_get("recipient_email")?,
        recipient_phone: row.try_get("recipient_phone")?,
        content: row.try_get("content")?,
        phase: phase.parse().map_err(VaultError::Internal)?,
        phase_entered_at: row.try_get("phase_entered_at")?,
        escalation_active: row.try_get("escalation_active")?,
        advance_count: row.try_get("advance_count")?,
        disclosed: row.try_get("disclosed")?,
        presence_confirmed: row.try_get("presence_confirmed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProtectedMessage;

    async fn setup() -> SqlitePool {
        let pool = connect_in_memory().await.unwrap();
        init_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let pool = setup().await;
        let mut msg = ProtectedMessage::new("owner-1", "sealed");
        msg.recipient_email = Some("r@example.com".to_string());
        insert_message(&pool, &msg).await.unwrap();

        let loaded = get_message(&pool, &msg.id).await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, "owner-1");
        assert_eq!(loaded.phase, Phase::Idle);
        assert_eq!(loaded.recipient_email.as_deref(), Some("r@example.com"));
        assert!(!loaded.disclosed);
    }

    #[tokio::test]
    async fn test_cas_start_only_from_idle() {
        let pool = setup().await;
        let msg = ProtectedMessage::new("owner-1", "sealed");
        insert_message(&pool, &msg).await.unwrap();

        let now = Utc::now();
        assert!(cas_start(&pool, &msg.id, now).await.unwrap());
        // Second start loses the phase predicate
        assert!(!cas_start(&pool, &msg.id, now).await.unwrap());

        let loaded = get_message(&pool, &msg.id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Stage(1));
        assert!(loaded.escalation_active);
        assert_eq!(loaded.advance_count, 1);
    }

    #[tokio::test]
    async fn test_cas_advance_detects_lost_race() {
        let pool = setup().await;
        let msg = ProtectedMessage::new("owner-1", "sealed");
        insert_message(&pool, &msg).await.unwrap();
        let now = Utc::now();
        cas_start(&pool, &msg.id, now).await.unwrap();

        // First advance wins, replay of the same read loses
        assert!(cas_advance(&pool, &msg.id, Phase::Stage(1), Phase::Stage(2), now)
            .await
            .unwrap());
        assert!(!cas_advance(&pool, &msg.id, Phase::Stage(1), Phase::Stage(2), now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_file_backed_pool_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");

        let pool = connect(&path, 2).await.unwrap();
        init_schema(&pool).await.unwrap();

        let msg = ProtectedMessage::new("owner-1", "sealed");
        insert_message(&pool, &msg).await.unwrap();
        pool.close().await;

        // A fresh pool over the same file sees the committed row
        let pool = connect(&path, 2).await.unwrap();
        init_schema(&pool).await.unwrap();
        let loaded = get_message(&pool, &msg.id).await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, "owner-1");
        assert_eq!(loaded.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_purge_drops_only_dead_codes() {
        let pool = setup().await;
        let now = Utc::now();
        let live = now + chrono::Duration::minutes(10);

        insert_fast_lane_code(&pool, "+15550001", "111111", now - chrono::Duration::minutes(1), now)
            .await
            .unwrap();
        insert_fast_lane_code(&pool, "+15550002", "222222", live, now)
            .await
            .unwrap();
        insert_fast_lane_code(&pool, "+15550003", "333333", live, now)
            .await
            .unwrap();

        // Consume one of the live codes
        let msg = ProtectedMessage::new("owner-1", "sealed");
        insert_message(&pool, &msg).await.unwrap();
        consume_code_and_disclose(&pool, &msg.id, "+15550003", "333333", now)
            .await
            .unwrap();

        // Expired and consumed rows go, the live one stays
        assert_eq!(purge_stale_fast_lane_codes(&pool, now).await.unwrap(), 2);
        assert!(get_fast_lane_code(&pool, "+15550001").await.unwrap().is_none());
        assert!(get_fast_lane_code(&pool, "+15550002").await.unwrap().is_some());
        assert_eq!(purge_stale_fast_lane_codes(&pool, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fast_unlock_transaction_is_atomic() {
        let pool = setup().await;
        let msg = ProtectedMessage::new("owner-1", "sealed");
        insert_message(&pool, &msg).await.unwrap();

        let now = Utc::now();
        insert_fast_lane_code(&pool, "+15550001", "123456", now + chrono::Duration::minutes(10), now)
            .await
            .unwrap();

        // Wrong code: nothing changes, code stays live
        let outcome = consume_code_and_disclose(&pool, &msg.id, "+15550001", "999999", now)
            .await
            .unwrap();
        assert_eq!(outcome, FastUnlockOutcome::NoCode);
        assert!(get_fast_lane_code(&pool, "+15550001").await.unwrap().is_some());

        // Right code: both writes land together
        let outcome = consume_code_and_disclose(&pool, &msg.id, "+15550001", "123456", now)
            .await
            .unwrap();
        assert_eq!(outcome, FastUnlockOutcome::Unlocked);
        assert!(get_fast_lane_code(&pool, "+15550001").await.unwrap().is_none());
        let loaded = get_message(&pool, &msg.id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Disclosed);
        assert!(loaded.disclosed);
        // Unlock straight from IDLE still marks the escalation flag
        assert!(loaded.escalation_active);
    }

    #[tokio::test]
    async fn test_fast_unlock_rolls_back_on_terminal_message() {
        let pool = setup().await;
        let msg = ProtectedMessage::new("owner-1", "sealed");
        insert_message(&pool, &msg).await.unwrap();
        let now = Utc::now();
        cas_start(&pool, &msg.id, now).await.unwrap();
        cas_confirm_alive(&pool, &msg.id, Phase::Stage(1), now)
            .await
            .unwrap();

        insert_fast_lane_code(&pool, "+15550001", "123456", now + chrono::Duration::minutes(10), now)
            .await
            .unwrap();

        let outcome = consume_code_and_disclose(&pool, &msg.id, "+15550001", "123456", now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FastUnlockOutcome::AlreadyTerminal(Phase::ConfirmedAlive)
        );
        // Rollback kept the code unconsumed
        assert!(get_fast_lane_code(&pool, "+15550001").await.unwrap().is_some());
    }
}
