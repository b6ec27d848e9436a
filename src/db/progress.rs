use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{info, instrument};

use crate::error::AppError;
use crate::models::LessonCompletion;

#[instrument(skip(conn))]
pub async fn completed_lesson_ids(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<HashSet<i64>, AppError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT up.lesson_id
         FROM user_progress up
         JOIN lessons l ON l.id = up.lesson_id
         JOIN modules m ON m.id = l.module_id
         WHERE up.user_id = ? AND m.course_id = ? AND up.is_completed = 1",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ids.into_iter().collect())
}

#[instrument(skip(conn))]
pub async fn find_completion(
    conn: &mut SqliteConnection,
    user_id: i64,
    lesson_id: i64,
) -> Result<Option<LessonCompletion>, AppError> {
    let row = sqlx::query_as::<_, LessonCompletion>(
        "SELECT user_id, lesson_id, is_completed, completed_at, watch_time_seconds
         FROM user_progress
         WHERE user_id = ? AND lesson_id = ?",
    )
    .bind(user_id)
    .bind(lesson_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

/// Marks the lesson completed. The unique (user_id, lesson_id) index makes
/// this the single point of idempotency: returns false when the lesson was
/// already completed and nothing was written.
#[instrument(skip(conn))]
pub async fn record_completion(
    conn: &mut SqliteConnection,
    user_id: i64,
    lesson_id: i64,
    watch_time_seconds: i64,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "INSERT INTO user_progress (user_id, lesson_id, is_completed, completed_at, watch_time_seconds)
         VALUES (?, ?, 1, ?, ?)
         ON CONFLICT (user_id, lesson_id) DO UPDATE SET
             is_completed = 1,
             completed_at = excluded.completed_at,
             watch_time_seconds = MAX(user_progress.watch_time_seconds, excluded.watch_time_seconds)
         WHERE user_progress.is_completed = 0",
    )
    .bind(user_id)
    .bind(lesson_id)
    .bind(now)
    .bind(watch_time_seconds)
    .execute(&mut *conn)
    .await?;

    let inserted = result.rows_affected() == 1;
    info!(inserted, "Recorded lesson completion");
    Ok(inserted)
}

#[instrument(skip(conn))]
pub async fn count_completed_lessons(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<i64, AppError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM user_progress WHERE user_id = ? AND is_completed = 1",
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

#[instrument(skip(conn))]
pub async fn delete_course_completions(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<u64, AppError> {
    let result = sqlx::query(
        "DELETE FROM user_progress
         WHERE user_id = ?
           AND lesson_id IN (SELECT l.id FROM lessons l
                             JOIN modules m ON m.id = l.module_id
                             WHERE m.course_id = ?)",
    )
    .bind(user_id)
    .bind(course_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}
