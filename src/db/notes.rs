use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{info, instrument};

use crate::error::AppError;
use crate::models::LessonNote;

#[instrument(skip(conn, content))]
pub async fn save_note(
    conn: &mut SqliteConnection,
    user_id: i64,
    lesson_id: i64,
    content: &str,
    now: DateTime<Utc>,
) -> Result<LessonNote, AppError> {
    info!("Saving lesson note");
    let note = sqlx::query_as::<_, LessonNote>(
        "INSERT INTO lesson_notes (user_id, lesson_id, content, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (user_id, lesson_id) DO UPDATE SET
             content = excluded.content,
             updated_at = excluded.updated_at
         RETURNING user_id, lesson_id, content, updated_at",
    )
    .bind(user_id)
    .bind(lesson_id)
    .bind(content)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(note)
}

#[instrument(skip(conn))]
pub async fn count_course_notes(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<i64, AppError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM lesson_notes
         WHERE user_id = ?
           AND lesson_id IN (SELECT l.id FROM lessons l
                             JOIN modules m ON m.id = l.module_id
                             WHERE m.course_id = ?)",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

#[instrument(skip(conn))]
pub async fn delete_course_notes(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<u64, AppError> {
    let result = sqlx::query(
        "DELETE FROM lesson_notes
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
