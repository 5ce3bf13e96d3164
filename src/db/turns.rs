//! Turn log repository

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::DbPool;
use crate::agent::{BackendKind, TurnRecord};
use crate::{Error, Result};

/// A logged turn
#[derive(Debug, Clone)]
pub struct StoredTurn {
    pub id: String,
    pub backend: BackendKind,
    pub routed: bool,
    pub user_text: String,
    pub reply_text: String,
    pub iterations: usize,
    pub prompt_tokens: u32,
    pub created_at: DateTime<Utc>,
}

/// Turn log repository
#[derive(Clone)]
pub struct TurnRepo {
    pool: DbPool,
}

impl TurnRepo {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append a turn, returning its id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, turn: &TurnRecord) -> Result<String> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let iterations = i64::try_from(turn.iterations).unwrap_or(i64::MAX);
        conn.execute(
            "INSERT INTO turns (id, backend, routed, user_text, reply_text, iterations, prompt_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                id,
                turn.backend.as_str(),
                turn.routed,
                turn.user_text,
                turn.reply_text,
                iterations,
                turn.prompt_tokens,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(id)
    }

    /// Most recent turns, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredTurn>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT id, backend, routed, user_text, reply_text, iterations, prompt_tokens, created_at
             FROM turns ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let turns = stmt
            .query_map([limit], |row| {
                let backend: String = row.get(1)?;
                let iterations: i64 = row.get(5)?;
                Ok(StoredTurn {
                    id: row.get(0)?,
                    backend: backend.parse().unwrap_or(BackendKind::LocalInference),
                    routed: row.get(2)?,
                    user_text: row.get(3)?,
                    reply_text: row.get(4)?,
                    iterations: usize::try_from(iterations).unwrap_or_default(),
                    prompt_tokens: row.get(6)?,
                    created_at: parse_datetime(&row.get::<_, String>(7)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(turns)
    }

    /// Number of logged turns
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

/// Drain turn records into the database until the channel closes
///
/// Write failures are logged and dropped.
pub fn spawn_turn_logger(
    repo: TurnRepo,
    mut rx: mpsc::UnboundedReceiver<TurnRecord>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(turn) = rx.recv().await {
            let repo = repo.clone();
            let result = tokio::task::spawn_blocking(move || repo.insert(&turn)).await;
            match result {
                Ok(Ok(id)) => tracing::debug!(id = %id, "turn logged"),
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to log turn"),
                Err(e) => tracing::warn!(error = %e, "turn logger task failed"),
            }
        }
        tracing::debug!("turn logger stopped");
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
