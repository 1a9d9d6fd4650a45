//! Chat persistence store.
//!
//! One SQLite database (shared across sessions) holding committed Q&A
//! rows in the `thread_qa` table. The HTTP layer and the CLI both read
//! and write through these functions; session memories are rehydrated
//! from here on restart.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::models::{ChatRow, NewChatRow};

/// Open (creating if needed) the chat database at `path`.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;

    Ok(pool)
}

/// Create the chat schema if it does not exist yet.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS thread_qa (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id      TEXT NOT NULL,
            label           TEXT NOT NULL,
            question        TEXT NOT NULL,
            answer          TEXT,
            original_msg_id INTEGER,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create thread_qa table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_thread_qa_session ON thread_qa(session_id)")
        .execute(pool)
        .await
        .context("Failed to create session index")?;

    Ok(())
}

fn row_from(row: &sqlx::sqlite::SqliteRow) -> ChatRow {
    ChatRow {
        id: row.get("id"),
        session_id: row.get("session_id"),
        label: row.get("label"),
        question: row.get("question"),
        answer: row.get("answer"),
        original_msg_id: row.get("original_msg_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Insert a committed Q&A row and return it with its assigned id.
pub async fn insert_turn(pool: &SqlitePool, new: &NewChatRow) -> Result<ChatRow> {
    let now = Utc::now().timestamp();
    let row = sqlx::query(
        r#"
        INSERT INTO thread_qa (session_id, label, question, answer, original_msg_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id, session_id, label, question, answer, original_msg_id, created_at, updated_at
        "#,
    )
    .bind(&new.session_id)
    .bind(&new.label)
    .bind(&new.question)
    .bind(&new.answer)
    .bind(new.original_msg_id)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("Failed to insert chat row")?;

    Ok(row_from(&row))
}

/// All rows for a session in insertion order. An unknown session yields
/// an empty list, not an error.
pub async fn list_by_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<ChatRow>> {
    let rows = sqlx::query(
        "SELECT id, session_id, label, question, answer, original_msg_id, created_at, updated_at
         FROM thread_qa WHERE session_id = ? ORDER BY id",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("Failed to list chat rows")?;

    Ok(rows.iter().map(row_from).collect())
}

/// Fields a PUT may change. Absent fields keep their stored value.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRowUpdate {
    pub label: Option<String>,
    pub question: Option<String>,
    pub answer: Option<String>,
}

/// Update a row in place; returns `None` when the id does not exist.
pub async fn update_row(
    pool: &SqlitePool,
    id: i64,
    update: &ChatRowUpdate,
) -> Result<Option<ChatRow>> {
    let now = Utc::now().timestamp();
    let row = sqlx::query(
        r#"
        UPDATE thread_qa SET
            label      = COALESCE(?, label),
            question   = COALESCE(?, question),
            answer     = COALESCE(?, answer),
            updated_at = ?
        WHERE id = ?
        RETURNING id, session_id, label, question, answer, original_msg_id, created_at, updated_at
        "#,
    )
    .bind(&update.label)
    .bind(&update.question)
    .bind(&update.answer)
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to update chat row")?;

    Ok(row.as_ref().map(row_from))
}

/// Delete a row; returns `false` when the id does not exist.
pub async fn delete_row(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM thread_qa WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to delete chat row")?;
    Ok(result.rows_affected() > 0)
}
