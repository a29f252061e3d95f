//! Collaborator stores backed by `PostgreSQL`.
//!
//! Every write is a single statement whose conflict clause applies the same
//! monotonic rules as [`ProgressRecord::merge`], so concurrent or replayed
//! updates converge without explicit locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engagement_core::event::{CourseId, LessonId, UserId};
use engagement_core::store::{
    AuditEntry, CertificateStore, CourseCatalog, EngagementLog, Enrollment, EnrollmentStatus,
    EnrollmentStore, ProgressRecord, ProgressStore, StoreError, StoreResult, UserStore,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

/// Map a driver error onto the store taxonomy.
///
/// Connection-level failures are transient; everything else is not.
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(error.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(error.to_string())
        },
        other => StoreError::Database(other.to_string()),
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

const PROGRESS_COLUMNS: &str =
    "user_id, lesson_id, is_completed, watched_seconds, completed_at, last_watched_at";

const ENROLLMENT_COLUMNS: &str =
    "user_id, course_id, status, progress_percentage, completed_at, updated_at";

fn progress_from_row(row: &PgRow) -> StoreResult<ProgressRecord> {
    let watched: i32 = row.try_get("watched_seconds").map_err(store_error)?;
    Ok(ProgressRecord {
        user_id: UserId::new(row.try_get("user_id").map_err(store_error)?),
        lesson_id: LessonId::new(row.try_get("lesson_id").map_err(store_error)?),
        is_completed: row.try_get("is_completed").map_err(store_error)?,
        watched_seconds: u32::try_from(watched).unwrap_or(0),
        completed_at: row.try_get("completed_at").map_err(store_error)?,
        last_watched_at: row.try_get("last_watched_at").map_err(store_error)?,
    })
}

fn enrollment_from_row(row: &PgRow) -> StoreResult<Enrollment> {
    let status: String = row.try_get("status").map_err(store_error)?;
    let status = EnrollmentStatus::parse(&status)
        .ok_or_else(|| StoreError::Serialization(format!("Unknown enrollment status: {status}")))?;
    let percentage: i16 = row.try_get("progress_percentage").map_err(store_error)?;
    let progress_percentage = u8::try_from(percentage)
        .map_err(|_| StoreError::Serialization(format!("Percentage out of range: {percentage}")))?;

    Ok(Enrollment {
        user_id: UserId::new(row.try_get("user_id").map_err(store_error)?),
        course_id: CourseId::new(row.try_get("course_id").map_err(store_error)?),
        status,
        progress_percentage,
        completed_at: row.try_get("completed_at").map_err(store_error)?,
        updated_at: row.try_get("updated_at").map_err(store_error)?,
    })
}

/// Every collaborator store over one connection pool.
///
/// # Example
///
/// ```no_run
/// use engagement_postgres::PostgresEngagementStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresEngagementStore::connect("postgres://localhost/engagement", 5).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresEngagementStore {
    pool: PgPool,
}

impl PostgresEngagementStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Create or update the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ProgressStore for PostgresEngagementStore {
    async fn get(&self, user_id: UserId, lesson_id: LessonId) -> StoreResult<Option<ProgressRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM student_progress WHERE user_id = $1 AND lesson_id = $2"
        ))
        .bind(user_id.get())
        .bind(lesson_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.as_ref().map(progress_from_row).transpose()
    }

    async fn upsert(&self, record: &ProgressRecord) -> StoreResult<ProgressRecord> {
        let row = sqlx::query(&format!(
            r"
            INSERT INTO student_progress ({PROGRESS_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, lesson_id) DO UPDATE SET
                is_completed = student_progress.is_completed OR EXCLUDED.is_completed,
                watched_seconds = GREATEST(student_progress.watched_seconds, EXCLUDED.watched_seconds),
                completed_at = COALESCE(student_progress.completed_at, EXCLUDED.completed_at),
                last_watched_at = GREATEST(student_progress.last_watched_at, EXCLUDED.last_watched_at)
            RETURNING {PROGRESS_COLUMNS}
            "
        ))
        .bind(record.user_id.get())
        .bind(record.lesson_id.get())
        .bind(record.is_completed)
        .bind(to_i32(record.watched_seconds))
        .bind(record.completed_at)
        .bind(record.last_watched_at)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        progress_from_row(&row)
    }

    async fn count_completed_in_course(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM student_progress sp
            JOIN lessons l ON l.id = sp.lesson_id
            JOIN modules m ON m.id = l.module_id
            WHERE sp.user_id = $1 AND m.course_id = $2 AND sp.is_completed
            ",
        )
        .bind(user_id.get())
        .bind(course_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(to_u64(count))
    }
}

#[async_trait]
impl CourseCatalog for PostgresEngagementStore {
    async fn lesson_count(&self, course_id: CourseId) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM lessons l
            JOIN modules m ON m.id = l.module_id
            WHERE m.course_id = $1
            ",
        )
        .bind(course_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(to_u64(count))
    }
}

#[async_trait]
impl EnrollmentStore for PostgresEngagementStore {
    async fn find_active(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> StoreResult<Option<Enrollment>> {
        let row = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments
             WHERE user_id = $1 AND course_id = $2 AND status = 'active'"
        ))
        .bind(user_id.get())
        .bind(course_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.as_ref().map(enrollment_from_row).transpose()
    }

    async fn save(&self, enrollment: &Enrollment) -> StoreResult<()> {
        sqlx::query(&format!(
            r"
            INSERT INTO enrollments ({ENROLLMENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, course_id) DO UPDATE SET
                status = EXCLUDED.status,
                progress_percentage = GREATEST(
                    enrollments.progress_percentage,
                    EXCLUDED.progress_percentage
                ),
                completed_at = COALESCE(enrollments.completed_at, EXCLUDED.completed_at),
                updated_at = GREATEST(enrollments.updated_at, EXCLUDED.updated_at)
            WHERE enrollments.status = 'active'
            "
        ))
        .bind(enrollment.user_id.get())
        .bind(enrollment.course_id.get())
        .bind(enrollment.status.as_str())
        .bind(i16::from(enrollment.progress_percentage))
        .bind(enrollment.completed_at)
        .bind(enrollment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn stale_enrollments(
        &self,
        user_id: UserId,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Enrollment>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {ENROLLMENT_COLUMNS} FROM enrollments
            WHERE user_id = $1
              AND status = 'active'
              AND progress_percentage < 100
              AND updated_at < $2
            ORDER BY course_id
            "
        ))
        .bind(user_id.get())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(enrollment_from_row).collect()
    }
}

#[async_trait]
impl CertificateStore for PostgresEngagementStore {
    async fn has_certificate(&self, user_id: UserId, course_id: CourseId) -> StoreResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM certificates WHERE user_id = $1 AND course_id = $2)",
        )
        .bind(user_id.get())
        .bind(course_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(exists)
    }

    async fn claim_request(&self, user_id: UserId, course_id: CourseId) -> StoreResult<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO certificate_requests (user_id, course_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, course_id) DO NOTHING
            ",
        )
        .bind(user_id.get())
        .bind(course_id.get())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl UserStore for PostgresEngagementStore {
    async fn touch_last_login(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()> {
        // GREATEST keeps a replayed older login from moving the timestamp back
        let result = sqlx::query(
            "UPDATE users SET last_login_at = GREATEST(last_login_at, $2) WHERE id = $1",
        )
        .bind(user_id.get())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            tracing::debug!(user_id = %user_id, "Login for unknown user");
        }
        Ok(())
    }
}

#[async_trait]
impl EngagementLog for PostgresEngagementStore {
    async fn append(&self, entry: &AuditEntry) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO engagement_events (user_id, course_id, event_type, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(entry.user_id.get())
        .bind(entry.course_id.map(CourseId::get))
        .bind(entry.kind.as_str())
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }
}
