//! PostgreSQL implementations of the link store and the job channel
//!
//! Link tables belong to the host application; only `archive_jobs` is created
//! by this crate's migrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    ArchiveError, ArchivePreferences, ArtifactSet, Delivery, FailureDisposition, JobChannel,
    JobId, JobOptions, Link, LinkId, LinkStore, QueueCounts,
};

const MAX_CONNECTIONS: u32 = 10;
const STALLED_ERROR: &str = "job stalled";

pub async fn connect_pool(url: &str) -> Result<PgPool, ArchiveError> {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(url)
        .await
        .map_err(|e| ArchiveError::Persistence(format!("cannot connect to database: {e}")))
}

/// Apply the bundled migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), ArchiveError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[derive(Clone)]
pub struct PgLinkStore {
    pool: PgPool,
}

impl PgLinkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, ArchiveError> {
        Ok(Self::new(connect_pool(url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn link_from_row(row: &PgRow) -> Result<Link, sqlx::Error> {
        Ok(Link {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            name: row.try_get("name")?,
            collection_id: row.try_get("collection_id")?,
            owner_id: row.try_get("owner_id")?,
            tags: Vec::new(),
            preferences: ArchivePreferences {
                screenshot: row.try_get("archive_as_screenshot")?,
                pdf: row.try_get("archive_as_pdf")?,
                readable: row.try_get("archive_as_readable")?,
                monolith: row.try_get("archive_as_monolith")?,
            },
            image: row.try_get("image")?,
            pdf: row.try_get("pdf")?,
            readable: row.try_get("readable")?,
            monolith: row.try_get("monolith")?,
            preview: row.try_get("preview")?,
            last_preserved: row.try_get("last_preserved")?,
            index_version: row.try_get("index_version")?,
            client_side: row.try_get("client_side")?,
        })
    }
}

#[async_trait]
impl LinkStore for PgLinkStore {
    async fn find_link(&self, id: LinkId) -> Result<Option<Link>, ArchiveError> {
        let row = sqlx::query(
            r"
            SELECT l.id, l.url, l.name, l.collection_id, c.owner_id,
                   u.archive_as_screenshot, u.archive_as_pdf,
                   u.archive_as_readable, u.archive_as_monolith,
                   l.image, l.pdf, l.readable, l.monolith, l.preview,
                   l.last_preserved, l.index_version, l.client_side
            FROM links l
            JOIN collections c ON c.id = l.collection_id
            JOIN users u ON u.id = c.owner_id
            WHERE l.id = $1
            ",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut link = Self::link_from_row(&row)?;

        link.tags = sqlx::query_scalar::<_, String>(
            r"
            SELECT t.name
            FROM tags t
            JOIN link_tags lt ON lt.tag_id = t.id
            WHERE lt.link_id = $1
            ORDER BY t.name
            ",
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(link))
    }

    async fn reset_preservation(&self, id: LinkId) -> Result<bool, ArchiveError> {
        let result = sqlx::query(
            r"
            UPDATE links
            SET image = NULL, pdf = NULL, readable = NULL, monolith = NULL,
                preview = NULL, last_preserved = NULL, index_version = NULL,
                client_side = FALSE
            WHERE id = $1
            ",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit_preservation(
        &self,
        id: LinkId,
        artifacts: &ArtifactSet,
        preserved_at: DateTime<Utc>,
    ) -> Result<bool, ArchiveError> {
        // NULL parameters keep the stored value.
        let result = sqlx::query(
            r"
            UPDATE links
            SET image = COALESCE($2, image),
                pdf = COALESCE($3, pdf),
                readable = COALESCE($4, readable),
                monolith = COALESCE($5, monolith),
                preview = COALESCE($6, preview),
                last_preserved = $7,
                index_version = COALESCE(index_version, 0) + 1,
                client_side = FALSE
            WHERE id = $1
            ",
        )
        .bind(id.get())
        .bind(artifacts.image.as_deref())
        .bind(artifacts.pdf.as_deref())
        .bind(artifacts.readable.as_deref())
        .bind(artifacts.monolith.as_deref())
        .bind(artifacts.preview.as_deref())
        .bind(preserved_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_due(&self) -> Result<i64, ArchiveError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM links WHERE last_preserved IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// Durable job channel on top of the `archive_jobs` table.
///
/// Reservation uses `FOR UPDATE SKIP LOCKED`, so any number of consumers can
/// poll the same queue. A reservation older than `stalled_after` is treated
/// as abandoned by a dead consumer: it counts as a failed attempt and the job
/// is handed out again, or marked failed once its attempts are used up.
#[derive(Clone)]
pub struct PgJobChannel {
    pool: PgPool,
    stalled_after: Duration,
}

impl PgJobChannel {
    pub fn new(pool: PgPool, stalled_after: Duration) -> Self {
        Self {
            pool,
            stalled_after,
        }
    }

    pub async fn connect(url: &str, stalled_after: Duration) -> Result<Self, ArchiveError> {
        let pool = connect_pool(url).await.map_err(|e| {
            ArchiveError::Broker(format!("cannot reach broker: {e}"))
        })?;
        Ok(Self::new(pool, stalled_after))
    }

    fn delivery_from_row(row: &PgRow) -> Result<Delivery, ArchiveError> {
        let options: Value = row.try_get("options")?;
        let attempts_made: i32 = row.try_get("attempts_made")?;
        Ok(Delivery {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            name: row.try_get("name")?,
            payload: row.try_get("data")?,
            attempts_made: attempts_made.max(0) as u32,
            options: serde_json::from_value::<JobOptions>(options)?,
        })
    }

    fn not_active(id: JobId) -> ArchiveError {
        ArchiveError::Broker(format!("job {id} is not active"))
    }
}

#[async_trait]
impl JobChannel for PgJobChannel {
    async fn push(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: &JobOptions,
    ) -> Result<JobId, ArchiveError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO archive_jobs (queue, name, data, options) VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(queue)
        .bind(name)
        .bind(payload)
        .bind(serde_json::to_value(options)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn reserve(&self, queue: &str) -> Result<Option<Delivery>, ArchiveError> {
        // A stalled reservation costs the job an attempt; the last one fails it.
        let exhausted = sqlx::query(
            r"
            UPDATE archive_jobs
            SET attempts_made = attempts_made + 1, locked_at = NULL,
                failed_at = NOW(), last_error = $3
            WHERE queue = $1
              AND completed_at IS NULL
              AND failed_at IS NULL
              AND locked_at < NOW() - make_interval(secs => $2)
              AND attempts_made + 1 >= (options->>'attempts')::int
            ",
        )
        .bind(queue)
        .bind(seconds(self.stalled_after))
        .bind(STALLED_ERROR)
        .execute(&self.pool)
        .await?;

        if exhausted.rows_affected() > 0 {
            warn!(
                queue,
                count = exhausted.rows_affected(),
                "Stalled jobs ran out of attempts"
            );
        }

        let row = sqlx::query(
            r"
            UPDATE archive_jobs
            SET attempts_made = CASE WHEN locked_at IS NULL THEN attempts_made
                                     ELSE attempts_made + 1 END,
                last_error = CASE WHEN locked_at IS NULL THEN last_error ELSE $3 END,
                locked_at = NOW()
            WHERE id = (
                SELECT id FROM archive_jobs
                WHERE queue = $1
                  AND completed_at IS NULL
                  AND failed_at IS NULL
                  AND run_at <= NOW()
                  AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $2))
                ORDER BY run_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, queue, name, data, options, attempts_made
            ",
        )
        .bind(queue)
        .bind(seconds(self.stalled_after))
        .bind(STALLED_ERROR)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::delivery_from_row).transpose()
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), ArchiveError> {
        let statement = if delivery.options.remove_on_complete {
            "DELETE FROM archive_jobs WHERE id = $1 AND locked_at IS NOT NULL"
        } else {
            "UPDATE archive_jobs SET completed_at = NOW(), locked_at = NULL WHERE id = $1 AND locked_at IS NOT NULL"
        };

        let result = sqlx::query(statement)
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Self::not_active(delivery.id));
        }
        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, ArchiveError> {
        let attempts_made = delivery.attempts_made + 1;
        let disposition = if retryable {
            delivery.options.disposition(attempts_made)
        } else {
            FailureDisposition::Exhausted
        };

        let result = match disposition {
            FailureDisposition::Retry { delay, .. } => {
                sqlx::query(
                    r"
                    UPDATE archive_jobs
                    SET attempts_made = $2, last_error = $3, locked_at = NULL,
                        run_at = NOW() + make_interval(secs => $4)
                    WHERE id = $1 AND locked_at IS NOT NULL
                    ",
                )
                .bind(delivery.id)
                .bind(attempts_made as i32)
                .bind(error)
                .bind(seconds(delay))
                .execute(&self.pool)
                .await?
            }
            FailureDisposition::Exhausted => {
                sqlx::query(
                    r"
                    UPDATE archive_jobs
                    SET attempts_made = $2, last_error = $3, locked_at = NULL,
                        failed_at = NOW()
                    WHERE id = $1 AND locked_at IS NOT NULL
                    ",
                )
                .bind(delivery.id)
                .bind(attempts_made as i32)
                .bind(error)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            warn!(job_id = delivery.id, "Failed job was no longer reserved");
            return Err(Self::not_active(delivery.id));
        }
        debug!(job_id = delivery.id, ?disposition, "Recorded failed attempt");
        Ok(disposition)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, ArchiveError> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) FILTER (WHERE completed_at IS NULL AND failed_at IS NULL
                                   AND locked_at IS NULL AND run_at <= NOW()) AS waiting,
                COUNT(*) FILTER (WHERE completed_at IS NULL AND failed_at IS NULL
                                   AND locked_at IS NULL AND run_at > NOW()) AS delayed,
                COUNT(*) FILTER (WHERE completed_at IS NULL AND failed_at IS NULL
                                   AND locked_at IS NOT NULL) AS active,
                COUNT(*) FILTER (WHERE failed_at IS NOT NULL) AS failed,
                COUNT(*) FILTER (WHERE completed_at IS NOT NULL) AS completed
            FROM archive_jobs
            WHERE queue = $1
            ",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64, sqlx::Error> {
            Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
        };

        Ok(QueueCounts {
            waiting: count("waiting")?,
            delayed: count("delayed")?,
            active: count("active")?,
            failed: count("failed")?,
            completed: count("completed")?,
        })
    }
}
