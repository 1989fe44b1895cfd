use std::path::{Path, PathBuf};
use std::str::FromStr;

use convo_core::{ConversationRecord, ConversationState};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::coverage::CoverageSpan;
use super::range::TimeRange;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RECORD_COLUMNS: &str =
    "id, created_at, updated_at, state, title, customer_id, assignee_id, team_id, tags";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid conversation state: {0}")]
    InvalidState(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Optional predicates applied on top of the time range in [`Store::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub state: Option<ConversationState>,
    pub assignee_id: Option<String>,
    pub customer_id: Option<String>,
    pub tag: Option<String>,
    /// Case-insensitive substring of the title.
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOutcome {
    pub applied: u64,
    pub skipped: u64,
}

impl PageOutcome {
    fn record(&mut self, applied: bool) {
        if applied {
            self.applied += 1;
        } else {
            self.skipped += 1;
        }
    }
}

/// Durable cache of conversations and coverage metadata.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_path(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::open_path(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Inserts or replaces `record` unless the stored copy is newer.
    ///
    /// Returns whether the row changed.
    pub async fn upsert(&self, record: &ConversationRecord) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        apply_record(&mut conn, record).await
    }

    /// Applies a whole page in one transaction; either every record is merged
    /// or none is.
    pub async fn upsert_page(
        &self,
        records: &[ConversationRecord],
    ) -> Result<PageOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = PageOutcome::default();
        for record in records {
            outcome.record(apply_record(&mut tx, record).await?);
        }
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM conversations WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| record_from_row(&row)).transpose()
    }

    /// Records with `updated_at` inside `range`, newest first.
    pub async fn search(
        &self,
        range: TimeRange,
        filters: &SearchFilters,
        limit: u32,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let text = filters
            .text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_lowercase);
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM conversations
             WHERE updated_at >= ?1 AND updated_at <= ?2
               AND (?3 IS NULL OR state = ?3)
               AND (?4 IS NULL OR assignee_id = ?4)
               AND (?5 IS NULL OR customer_id = ?5)
               AND (?6 IS NULL OR EXISTS (SELECT 1 FROM json_each(conversations.tags) WHERE value = ?6))
               AND (?7 IS NULL OR instr(lower(coalesce(title, '')), ?7) > 0)
             ORDER BY updated_at DESC, id ASC
             LIMIT ?8"
        ))
        .bind(range.start())
        .bind(range.end())
        .bind(filters.state.map(|state| state.as_str()))
        .bind(filters.assignee_id.as_deref())
        .bind(filters.customer_id.as_deref())
        .bind(filters.tag.as_deref())
        .bind(text)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM conversations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn coverage_streams(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT stream_id FROM coverage ORDER BY stream_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("stream_id").map_err(StoreError::from))
            .collect()
    }

    pub async fn load_coverage(&self, stream_id: &str) -> Result<Vec<CoverageSpan>, StoreError> {
        let rows = sqlx::query(
            "SELECT range_start, range_end, verified_at FROM coverage
             WHERE stream_id = ?1 ORDER BY range_start ASC",
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let start: i64 = row.try_get("range_start")?;
            let end: i64 = row.try_get("range_end")?;
            // Rows written by hand may be inverted; skip rather than fail startup.
            let Ok(range) = TimeRange::new(start, end) else {
                tracing::warn!(stream = stream_id, start, end, "ignoring inverted coverage row");
                continue;
            };
            out.push(CoverageSpan {
                range,
                verified_at: row.try_get("verified_at")?,
            });
        }
        Ok(out)
    }

    /// Swaps the persisted coverage of `stream_id` for `spans` atomically.
    pub async fn replace_coverage(
        &self,
        stream_id: &str,
        spans: &[CoverageSpan],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM coverage WHERE stream_id = ?1")
            .bind(stream_id)
            .execute(&mut *tx)
            .await?;
        for span in spans {
            sqlx::query(
                "INSERT INTO coverage (stream_id, range_start, range_end, verified_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(stream_id)
            .bind(span.range.start())
            .bind(span.range.end())
            .bind(span.verified_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn apply_record(
    conn: &mut SqliteConnection,
    record: &ConversationRecord,
) -> Result<bool, StoreError> {
    let tags = serde_json::to_string(&record.tags)?;
    let result = sqlx::query(
        "INSERT INTO conversations (
            id, created_at, updated_at, state, title, customer_id, assignee_id, team_id, tags
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            state = excluded.state,
            title = excluded.title,
            customer_id = excluded.customer_id,
            assignee_id = excluded.assignee_id,
            team_id = excluded.team_id,
            tags = excluded.tags
         WHERE excluded.updated_at >= conversations.updated_at",
    )
    .bind(&record.id)
    .bind(record.created_at)
    .bind(record.updated_at)
    .bind(record.state.as_str())
    .bind(&record.title)
    .bind(&record.customer_id)
    .bind(&record.assignee_id)
    .bind(&record.team_id)
    .bind(tags)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn record_from_row(row: &SqliteRow) -> Result<ConversationRecord, StoreError> {
    let state: String = row.try_get("state")?;
    let tags: String = row.try_get("tags")?;
    Ok(ConversationRecord {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        state: ConversationState::parse(&state).ok_or(StoreError::InvalidState(state))?,
        title: row.try_get("title")?,
        customer_id: row.try_get("customer_id")?,
        assignee_id: row.try_get("assignee_id")?,
        team_id: row.try_get("team_id")?,
        tags: serde_json::from_str(&tags)?,
    })
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("convod");
    path.push("cache.db");
    Ok(path)
}
