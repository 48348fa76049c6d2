//! Run repository over the MLflow `runs` table.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use sqlx::PgPool;
use tracing::debug;
use tracksweep_core::{Error, Result, Run, RunFilter, RunId, RunStore, RunTimestamp};

use crate::{DbError, DbResult};

/// Tables holding per-run rows keyed by `run_uuid`, removed before the run itself.
const CHILD_TABLES: [&str; 4] = ["latest_metrics", "metrics", "params", "tags"];

/// A run record as stored by the tracking server.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRow {
    pub run_uuid: String,
    pub lifecycle_stage: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub artifact_uri: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self> {
        let state = row
            .lifecycle_stage
            .as_deref()
            .ok_or_else(|| {
                Error::MalformedRecord(format!("run {} has no lifecycle stage", row.run_uuid))
            })?
            .parse()?;
        let created_at = row.start_time.map(RunTimestamp::from_millis).ok_or_else(|| {
            Error::MalformedRecord(format!("run {} has no start time", row.run_uuid))
        })?;

        Ok(Run {
            id: RunId::new(row.run_uuid),
            state,
            created_at,
            ended_at: row.end_time.map(RunTimestamp::from_millis),
            artifact_uri: row.artifact_uri.filter(|uri| !uri.trim().is_empty()),
        })
    }
}

/// PostgreSQL implementation of RunStore.
pub struct PgRunStore {
    pool: PgPool,
    page_size: u32,
}

impl PgRunStore {
    pub fn new(pool: PgPool, page_size: u32) -> Self {
        Self {
            pool,
            page_size: page_size.max(1),
        }
    }

    /// Keyset page: runs ordered by id, strictly after `after`.
    ///
    /// Paging by key rather than offset keeps the cursor stable while the
    /// caller soft-deletes or purges runs it has already seen.
    async fn fetch_page(&self, states: &[String], after: Option<&str>) -> DbResult<Vec<RunRow>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_uuid, lifecycle_stage, start_time, end_time, artifact_uri
            FROM runs
            WHERE lifecycle_stage = ANY($1)
              AND ($2::text IS NULL OR run_uuid > $2)
            ORDER BY run_uuid
            LIMIT $3
            "#,
        )
        .bind(states)
        .bind(after)
        .bind(i64::from(self.page_size))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn purge_inner(&self, run_id: &RunId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        for table in CHILD_TABLES {
            sqlx::query(&format!("DELETE FROM {} WHERE run_uuid = $1", table))
                .bind(run_id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        let deleted =
            sqlx::query("DELETE FROM runs WHERE run_uuid = $1 AND lifecycle_stage = 'deleted'")
                .bind(run_id.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();

        if deleted == 0 {
            tx.rollback().await?;
            return Err(DbError::NotFound(format!("deleted run {}", run_id)));
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    fn list_runs(&self, filter: RunFilter) -> BoxStream<'_, Result<Run>> {
        let states: Vec<String> = filter
            .states
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        // State: None once the last page has been read.
        stream::unfold(Some(None::<String>), move |cursor| {
            let states = states.clone();
            async move {
                let after = cursor?;
                match self.fetch_page(&states, after.as_deref()).await {
                    Ok(rows) => {
                        debug!(rows = rows.len(), after = ?after, "Fetched run page");
                        let next = if rows.len() < self.page_size as usize {
                            None
                        } else {
                            rows.last().map(|row| Some(row.run_uuid.clone()))
                        };
                        let page: Vec<Result<Run>> = rows.into_iter().map(Run::try_from).collect();
                        Some((page, next))
                    }
                    Err(e) => Some((vec![Err(e.into())], None)),
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    async fn soft_delete(&self, run_id: &RunId) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET lifecycle_stage = 'deleted',
                deleted_time = COALESCE(deleted_time, $2)
            WHERE run_uuid = $1 AND lifecycle_stage IN ('active', 'deleted')
            "#,
        )
        .bind(run_id.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?
        .rows_affected();

        if updated == 0 {
            return Err(Error::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }

    async fn purge(&self, run_id: &RunId) -> Result<()> {
        self.purge_inner(run_id).await.map_err(Error::from)
    }
}
