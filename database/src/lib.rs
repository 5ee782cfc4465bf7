//! SQLite history of runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvester_core::{
    CoreError, DatabaseError, KeywordMode, RunId, RunOutcome, RunProgress, RunRequest, RunResult,
    RunSink, RunState,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};


/// One row of the `runs` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: RunId,
    pub channel: String,
    pub posts_limit: u32,
    pub keywords: Vec<String>,
    pub keyword_mode: KeywordMode,
    pub state: RunState,
    pub progress: Option<RunProgress>,
    pub result: Option<RunResult>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn db_error(e: sqlx::Error) -> CoreError {
    CoreError::Database(DatabaseError::from(e))
}

fn state_name(state: RunState) -> String {
    state.to_string()
}

fn parse_state(name: &str) -> Result<RunState, CoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(
        name.to_string(),
    ))?)
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>, CoreError> {
    raw.map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(CoreError::from)
}

impl RunRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, CoreError> {
        let id: String = row.try_get("id").map_err(db_error)?;
        let keywords: String = row.try_get("keywords").map_err(db_error)?;
        let mode: String = row.try_get("keyword_mode").map_err(db_error)?;
        let state: String = row.try_get("state").map_err(db_error)?;
        let posts_limit: i64 = row.try_get("posts_limit").map_err(db_error)?;

        Ok(Self {
            id: RunId::from_str(&id).map_err(|e| CoreError::Internal {
                message: format!("corrupt run id '{}': {}", id, e),
            })?,
            channel: row.try_get("channel").map_err(db_error)?,
            posts_limit: u32::try_from(posts_limit).unwrap_or(u32::MAX),
            keywords: serde_json::from_str(&keywords)?,
            keyword_mode: KeywordMode::from_str(&mode)?,
            state: parse_state(&state)?,
            progress: decode_json(row.try_get("progress").map_err(db_error)?)?,
            result: decode_json(row.try_get("result").map_err(db_error)?)?,
            error_code: row.try_get("error_code").map_err(db_error)?,
            error_message: row.try_get("error_message").map_err(db_error)?,
            created_at: row.try_get("created_at").map_err(db_error)?,
            updated_at: row.try_get("updated_at").map_err(db_error)?,
            finished_at: row.try_get("finished_at").map_err(db_error)?,
        })
    }
}

pub struct Database {
    connection_string: String,
    pool: Option<SqlitePool>,
}

impl Database {
    pub fn new(connection_string: String) -> Self {
        Self {
            connection_string,
            pool: None,
        }
    }

    /// Connect and migrate in one step.
    pub async fn open(connection_string: &str) -> Result<Self, CoreError> {
        let mut db = Self::new(connection_string.to_string());
        db.connect().await?;
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn connect(&mut self) -> Result<(), CoreError> {
        let options = SqliteConnectOptions::from_str(&self.connection_string)
            .map_err(|e| {
                CoreError::Database(DatabaseError::ConnectionFailed {
                    reason: format!("{}: {}", self.connection_string, e),
                })
            })?
            .create_if_missing(true);

        // Every connection to an in-memory database sees its own database
        let max_connections = if self.connection_string.contains(":memory:") {
            1
        } else {
            4
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| {
                CoreError::Database(DatabaseError::ConnectionFailed {
                    reason: e.to_string(),
                })
            })?;

        info!("Connected to database {}", self.connection_string);
        self.pool = Some(pool);
        Ok(())
    }

    fn pool(&self) -> Result<&SqlitePool, CoreError> {
        self.pool.as_ref().ok_or_else(|| {
            CoreError::Database(DatabaseError::ConnectionFailed {
                reason: "database is not connected".to_string(),
            })
        })
    }

    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations")
            .run(self.pool()?)
            .await
            .map_err(|e| {
                CoreError::Database(DatabaseError::MigrationFailed {
                    migration: e.to_string(),
                })
            })?;
        debug!("Database migrations applied");
        Ok(())
    }

    pub async fn record_run(&self, run_id: RunId, request: &RunRequest) -> Result<(), CoreError> {
        let keywords: Vec<&str> = request.keywords.iter().map(|k| k.as_str()).collect();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO runs (id, channel, posts_limit, keywords, keyword_mode, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(request.channel.username())
        .bind(i64::from(request.posts_limit))
        .bind(serde_json::to_string(&keywords)?)
        .bind(request.keywords.mode().to_string())
        .bind(state_name(RunState::Idle))
        .bind(now)
        .bind(now)
        .execute(self.pool()?)
        .await
        .map_err(db_error)?;

        debug!("Recorded run {}", run_id);
        Ok(())
    }

    pub async fn update_progress(
        &self,
        run_id: RunId,
        progress: &RunProgress,
    ) -> Result<(), CoreError> {
        let updated = sqlx::query(
            "UPDATE runs SET state = ?, progress = ?, updated_at = ? WHERE id = ? AND finished_at IS NULL",
        )
        .bind(state_name(progress.state))
        .bind(serde_json::to_string(progress)?)
        .bind(Utc::now())
        .bind(run_id.to_string())
        .execute(self.pool()?)
        .await
        .map_err(db_error)?;

        if updated.rows_affected() == 0 {
            debug!("No open run {} to update", run_id);
        }
        Ok(())
    }

    pub async fn complete_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<(), CoreError> {
        let (progress, result, error_code, error_message) = match outcome {
            RunOutcome::Done(result) => (None, Some(serde_json::to_string(result)?), None, None),
            RunOutcome::Failed { failure, progress } => (
                Some(serde_json::to_string(progress)?),
                None,
                Some(failure.code.clone()),
                Some(failure.message.clone()),
            ),
            RunOutcome::Cancelled { progress } => {
                (Some(serde_json::to_string(progress)?), None, None, None)
            }
        };
        let now = Utc::now();

        let updated = sqlx::query(
            "UPDATE runs SET state = ?, progress = COALESCE(?, progress), result = ?,
                 error_code = ?, error_message = ?, updated_at = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(state_name(outcome.state()))
        .bind(progress)
        .bind(result)
        .bind(error_code)
        .bind(error_message)
        .bind(now)
        .bind(now)
        .bind(run_id.to_string())
        .execute(self.pool()?)
        .await
        .map_err(db_error)?;

        if updated.rows_affected() == 0 {
            return Err(CoreError::NotFound {
                resource: format!("run {}", run_id),
            });
        }
        info!("Run {} stored as {}", run_id, outcome.state());
        Ok(())
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, CoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(self.pool()?)
            .await
            .map_err(db_error)?;

        row.as_ref().map(RunRecord::from_row).transpose()
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>, CoreError> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(self.pool()?)
            .await
            .map_err(db_error)?;

        rows.iter().map(RunRecord::from_row).collect()
    }

    pub async fn delete_run(&self, run_id: RunId) -> Result<bool, CoreError> {
        let deleted = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .execute(self.pool()?)
            .await
            .map_err(db_error)?;

        Ok(deleted.rows_affected() > 0)
    }

    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

#[async_trait]
impl RunSink for Database {
    async fn run_started(&self, run_id: RunId, request: &RunRequest) -> Result<(), CoreError> {
        self.record_run(run_id, request).await
    }

    async fn progress_updated(
        &self,
        run_id: RunId,
        progress: &RunProgress,
    ) -> Result<(), CoreError> {
        self.update_progress(run_id, progress).await
    }

    async fn run_finished(&self, run_id: RunId, outcome: &RunOutcome) -> Result<(), CoreError> {
        self.complete_run(run_id, outcome).await
    }
}
