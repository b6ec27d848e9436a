use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{info, instrument};

use crate::error::AppError;
use crate::models::Enrollment;

const ENROLLMENT_COLUMNS: &str =
    "user_id, course_id, progress_percentage, completed_at, enrolled_at, last_accessed_at";

#[instrument(skip(conn))]
pub async fn find_enrollment(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<Option<Enrollment>, AppError> {
    let row = sqlx::query_as::<_, Enrollment>(&format!(
        "SELECT {} FROM course_enrollments WHERE user_id = ? AND course_id = ?",
        ENROLLMENT_COLUMNS
    ))
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

/// Fails with `Forbidden` when the user is not enrolled in the course.
pub async fn require_enrollment(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<Enrollment, AppError> {
    find_enrollment(conn, user_id, course_id)
        .await?
        .ok_or_else(|| {
            AppError::Forbidden(format!(
                "User {} is not enrolled in course {}",
                user_id, course_id
            ))
        })
}

#[instrument(skip(conn))]
pub async fn list_enrollments(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Vec<Enrollment>, AppError> {
    let rows = sqlx::query_as::<_, Enrollment>(&format!(
        "SELECT {} FROM course_enrollments WHERE user_id = ? ORDER BY course_id",
        ENROLLMENT_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

/// Idempotent. Returns true when a new enrollment row was created.
#[instrument(skip(conn))]
pub async fn create_enrollment(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    info!("Enrolling user in course");
    let result = sqlx::query(
        "INSERT INTO course_enrollments (user_id, course_id, progress_percentage, enrolled_at, last_accessed_at)
         VALUES (?, ?, 0, ?, ?)
         ON CONFLICT (user_id, course_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(course_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Recomputes `progress_percentage` from the ledger in a single statement,
/// so concurrent completions cannot lose each other's update.
#[instrument(skip(conn))]
pub async fn refresh_progress(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
    now: DateTime<Utc>,
) -> Result<i64, AppError> {
    let percentage = sqlx::query_scalar::<_, i64>(
        "UPDATE course_enrollments
         SET progress_percentage = (
                 SELECT CASE WHEN COUNT(l.id) = 0 THEN 0
                             ELSE CAST(ROUND(100.0 * COUNT(up.lesson_id) / COUNT(l.id)) AS INTEGER)
                        END
                 FROM lessons l
                 JOIN modules m ON m.id = l.module_id
                 LEFT JOIN user_progress up
                        ON up.lesson_id = l.id AND up.user_id = course_enrollments.user_id
                       AND up.is_completed = 1
                 WHERE m.course_id = course_enrollments.course_id),
             last_accessed_at = ?
         WHERE user_id = ? AND course_id = ?
         RETURNING progress_percentage",
    )
    .bind(now)
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(&mut *conn)
    .await?;

    percentage.ok_or_else(|| {
        AppError::Forbidden(format!(
            "User {} is not enrolled in course {}",
            user_id, course_id
        ))
    })
}

/// Sets `completed_at` once. Returns true only on the transition.
#[instrument(skip(conn))]
pub async fn mark_enrollment_completed(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE course_enrollments
         SET completed_at = ?
         WHERE user_id = ? AND course_id = ? AND completed_at IS NULL AND progress_percentage = 100",
    )
    .bind(now)
    .bind(user_id)
    .bind(course_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[instrument(skip(conn))]
pub async fn reset_enrollment(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<u64, AppError> {
    let result = sqlx::query(
        "UPDATE course_enrollments
         SET progress_percentage = 0, completed_at = NULL
         WHERE user_id = ? AND course_id = ?",
    )
    .bind(user_id)
    .bind(course_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

#[instrument(skip(conn))]
pub async fn count_completed_enrollments(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<i64, AppError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM course_enrollments WHERE user_id = ? AND completed_at IS NOT NULL",
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

/// Overwrites the cached percentage; used only when repairing drift.
#[instrument(skip(conn))]
pub async fn set_progress_percentage(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
    percentage: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE course_enrollments SET progress_percentage = ? WHERE user_id = ? AND course_id = ?",
    )
    .bind(percentage)
    .bind(user_id)
    .bind(course_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
