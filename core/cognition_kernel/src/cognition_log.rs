//! Durable cognition log.
//!
//! Every execute call appends exactly one row, success or failure. All
//! SQLite work runs on the blocking pool behind an r2d2 connection pool so
//! the cooperative scheduler never touches the database directly. Append
//! failure is reported to the caller, who logs it without changing the
//! user-visible result.

use std::sync::Arc;

use ail_types::{CognitionError, CognitionLogRecord};
use chrono::DateTime;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tokio::task;
use uuid::Uuid;

type DbPool = r2d2::Pool<SqliteConnectionManager>;

pub struct CognitionLog {
    pool: Arc<DbPool>,
}

impl CognitionLog {
    /// Open (or create) the log database and its schema.
    pub fn open(db_path: &str) -> Result<Self, CognitionError> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = r2d2::Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| CognitionError::Internal(format!("log pool creation failed: {e}")))?;

        let conn = pool
            .get()
            .map_err(|e| CognitionError::Internal(format!("log connection failed: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cognition_log (
                cognition_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                input_serialized TEXT NOT NULL,
                result_serialized TEXT NOT NULL,
                success INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                parent_id TEXT,
                causality_json TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| CognitionError::Internal(format!("log schema creation failed: {e}")))?;

        Ok(CognitionLog {
            pool: Arc::new(pool),
        })
    }

    /// Append one record.
    pub async fn append(&self, record: CognitionLogRecord) -> Result<(), CognitionError> {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| CognitionError::Internal(format!("log connection failed: {e}")))?;
            conn.execute(
                "INSERT OR REPLACE INTO cognition_log (
                    cognition_id, agent_id, operation, input_serialized,
                    result_serialized, success, started_at, finished_at,
                    parent_id, causality_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.cognition_id.to_string(),
                    record.agent_id,
                    record.operation,
                    record.input_serialized,
                    record.result_serialized,
                    record.success,
                    record.started_at.to_rfc3339(),
                    record.finished_at.to_rfc3339(),
                    record.parent_id.map(|id| id.to_string()),
                    record.causality_json,
                ],
            )
            .map_err(|e| CognitionError::Internal(format!("log append failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| CognitionError::Internal(format!("log append task failed: {e}")))?
    }

    /// Most recent records, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<CognitionLogRecord>, CognitionError> {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| CognitionError::Internal(format!("log connection failed: {e}")))?;
            let mut stmt = conn
                .prepare(
                    "SELECT cognition_id, agent_id, operation, input_serialized,
                            result_serialized, success, started_at, finished_at,
                            parent_id, causality_json
                     FROM cognition_log ORDER BY finished_at DESC LIMIT ?1",
                )
                .map_err(|e| CognitionError::Internal(format!("log query failed: {e}")))?;

            let rows = stmt
                .query_map([limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                })
                .map_err(|e| CognitionError::Internal(format!("log query failed: {e}")))?;

            let mut records = Vec::new();
            for row in rows {
                let (
                    cognition_id,
                    agent_id,
                    operation,
                    input_serialized,
                    result_serialized,
                    success,
                    started_at,
                    finished_at,
                    parent_id,
                    causality_json,
                ) = row.map_err(|e| CognitionError::Internal(format!("log row failed: {e}")))?;

                records.push(CognitionLogRecord {
                    cognition_id: parse_uuid(&cognition_id)?,
                    agent_id,
                    operation,
                    input_serialized,
                    result_serialized,
                    success,
                    started_at: parse_timestamp(&started_at)?,
                    finished_at: parse_timestamp(&finished_at)?,
                    parent_id: match parent_id {
                        Some(id) => Some(parse_uuid(&id)?),
                        None => None,
                    },
                    causality_json,
                });
            }
            Ok(records)
        })
        .await
        .map_err(|e| CognitionError::Internal(format!("log query task failed: {e}")))?
    }

    pub async fn count(&self) -> Result<u64, CognitionError> {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| CognitionError::Internal(format!("log connection failed: {e}")))?;
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM cognition_log", [], |row| row.get(0))
                .map_err(|e| CognitionError::Internal(format!("log count failed: {e}")))?;
            Ok(count as u64)
        })
        .await
        .map_err(|e| CognitionError::Internal(format!("log count task failed: {e}")))?
    }
}

fn parse_uuid(text: &str) -> Result<Uuid, CognitionError> {
    Uuid::parse_str(text)
        .map_err(|e| CognitionError::Internal(format!("corrupt log record id '{text}': {e}")))
}

fn parse_timestamp(text: &str) -> Result<chrono::DateTime<chrono::Utc>, CognitionError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| CognitionError::Internal(format!("corrupt log timestamp '{text}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_record(success: bool) -> CognitionLogRecord {
        CognitionLogRecord {
            cognition_id: Uuid::new_v4(),
            agent_id: "agent-1".to_string(),
            operation: "EXECUTE".to_string(),
            input_serialized: r#"(EXECUTE [kv] ["1"])"#.to_string(),
            result_serialized: r#"{"success":true}"#.to_string(),
            success,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            parent_id: None,
            causality_json: "[]".to_string(),
        }
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("log.db");
        let log = CognitionLog::open(db_path.to_str().expect("utf8 path")).expect("open log");

        log.append(sample_record(true)).await.expect("append");
        log.append(sample_record(false)).await.expect("append");

        assert_eq!(log.count().await.expect("count"), 2);

        let records = log.recent(10).await.expect("recent");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].agent_id, "agent-1");
        assert_eq!(records[0].operation, "EXECUTE");
    }

    #[tokio::test]
    async fn recent_respects_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("log.db");
        let log = CognitionLog::open(db_path.to_str().expect("utf8 path")).expect("open log");

        for _ in 0..5 {
            log.append(sample_record(true)).await.expect("append");
        }
        let records = log.recent(3).await.expect("recent");
        assert_eq!(records.len(), 3);
    }
}
