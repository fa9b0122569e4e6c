// =============================================================================
// store/postgres.rs: THE PRODUCTION STORE
// =============================================================================
//
// Two tables. `popularity_subjects` holds one row per curation or playlist
// with its counters; `popularity_likes` is the join table the reconciler
// fills from the live like sets. Both are keyed by kind first, so curations
// and playlists never collide even when their ids do.
//
// Queries are plain `sqlx::query` with binds. Counters are BIGINT in the
// database and u64 here; a negative value coming back is reported, not
// wrapped.
// =============================================================================

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::SubjectStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{ActorId, Subject, SubjectId, SubjectKind};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS popularity_subjects (
        kind        TEXT        NOT NULL,
        id          BIGINT      NOT NULL,
        title       TEXT        NOT NULL DEFAULT '',
        like_count  BIGINT      NOT NULL DEFAULT 0,
        view_count  BIGINT      NOT NULL DEFAULT 0,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (kind, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS popularity_likes (
        kind        TEXT        NOT NULL,
        subject_id  BIGINT      NOT NULL,
        actor_id    BIGINT      NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (kind, subject_id, actor_id),
        FOREIGN KEY (kind, subject_id)
            REFERENCES popularity_subjects (kind, id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS popularity_subjects_views
        ON popularity_subjects (kind, view_count DESC, id ASC)
    "#,
];

#[derive(Clone)]
pub struct PgSubjectStore {
    pool: PgPool,
}

impl PgSubjectStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        info!(max_connections, "Subject store connected");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables this store reads and writes, if missing.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn to_db(field: &'static str, value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange {
        field,
        value: i64::MAX,
    })
}

fn from_db(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange { field, value })
}

fn subject_from_row(kind: SubjectKind, row: &PgRow) -> StoreResult<Subject> {
    Ok(Subject {
        kind,
        id: SubjectId(row.try_get("id")?),
        title: row.try_get("title")?,
        like_count: from_db("like_count", row.try_get("like_count")?)?,
        view_count: from_db("view_count", row.try_get("view_count")?)?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl SubjectStore for PgSubjectStore {
    async fn find_subject(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<Option<Subject>> {
        let row = sqlx::query(
            "SELECT id, title, like_count, view_count, created_at \
             FROM popularity_subjects WHERE kind = $1 AND id = $2",
        )
        .bind(kind.as_str())
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| subject_from_row(kind, &row)).transpose()
    }

    async fn exists(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM popularity_subjects WHERE kind = $1 AND id = $2)",
        )
        .bind(kind.as_str())
        .bind(id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn save(&self, subject: &Subject) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO popularity_subjects (kind, id, title, like_count, view_count, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (kind, id) DO UPDATE SET \
                title = EXCLUDED.title, \
                like_count = EXCLUDED.like_count, \
                view_count = EXCLUDED.view_count",
        )
        .bind(subject.kind.as_str())
        .bind(subject.id.0)
        .bind(&subject.title)
        .bind(to_db("like_count", subject.like_count)?)
        .bind(to_db("view_count", subject.view_count)?)
        .bind(subject.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_like_count(&self, kind: SubjectKind, id: SubjectId, like_count: u64) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE popularity_subjects SET like_count = $3 WHERE kind = $1 AND id = $2",
        )
        .bind(kind.as_str())
        .bind(id.0)
        .bind(to_db("like_count", like_count)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_view_count(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE popularity_subjects SET view_count = view_count + 1 WHERE kind = $1 AND id = $2",
        )
        .bind(kind.as_str())
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM popularity_likes WHERE kind = $1 AND subject_id = $2")
            .bind(kind.as_str())
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM popularity_subjects WHERE kind = $1 AND id = $2")
            .bind(kind.as_str())
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn top_by_view_count(&self, kind: SubjectKind, limit: usize) -> StoreResult<Vec<Subject>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT id, title, like_count, view_count, created_at \
             FROM popularity_subjects WHERE kind = $1 \
             ORDER BY view_count DESC, id ASC LIMIT $2",
        )
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| subject_from_row(kind, row)).collect()
    }

    async fn like_exists(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM popularity_likes \
             WHERE kind = $1 AND subject_id = $2 AND actor_id = $3)",
        )
        .bind(kind.as_str())
        .bind(subject.0)
        .bind(actor.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn insert_like(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<()> {
        // Conditional so a subject deleted mid-pass gets no orphan record
        // and no foreign key violation.
        sqlx::query(
            "INSERT INTO popularity_likes (kind, subject_id, actor_id) \
             SELECT $1, $2, $3 WHERE EXISTS \
                 (SELECT 1 FROM popularity_subjects WHERE kind = $1 AND id = $2) \
             ON CONFLICT (kind, subject_id, actor_id) DO NOTHING",
        )
        .bind(kind.as_str())
        .bind(subject.0)
        .bind(actor.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_like(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM popularity_likes WHERE kind = $1 AND subject_id = $2 AND actor_id = $3",
        )
        .bind(kind.as_str())
        .bind(subject.0)
        .bind(actor.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn liked_actor_ids(&self, kind: SubjectKind, subject: SubjectId) -> StoreResult<Vec<ActorId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT actor_id FROM popularity_likes \
             WHERE kind = $1 AND subject_id = $2 ORDER BY actor_id",
        )
        .bind(kind.as_str())
        .bind(subject.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ActorId).collect())
    }
}
