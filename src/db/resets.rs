use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

use crate::error::AppError;

/// Persisted marker for one run of the course reset saga.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResetRun {
    pub id: i64,
    pub user_id: i64,
    pub course_id: i64,
    pub preserve_notes: bool,
    pub status: String,
    pub last_completed_step: i64,
    pub xp_to_deduct: i64,
    pub lessons_completed_before: i64,
    pub was_completed: bool,
    pub had_certificate: bool,
    pub lessons_reset: i64,
    pub quiz_attempts_reset: i64,
    pub certificate_deleted: bool,
    pub notes_deleted: i64,
    pub error: Option<String>,
}

const RUN_COLUMNS: &str = "id, user_id, course_id, preserve_notes, status, last_completed_step, xp_to_deduct, lessons_completed_before, was_completed, had_certificate, lessons_reset, quiz_attempts_reset, certificate_deleted, notes_deleted, error";

#[instrument(skip(conn))]
pub async fn find_unfinished_reset(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<Option<ResetRun>, AppError> {
    let row = sqlx::query_as::<_, ResetRun>(&format!(
        "SELECT {} FROM course_resets
         WHERE user_id = ? AND course_id = ? AND status != 'completed'",
        RUN_COLUMNS
    ))
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

/// Values captured by steps 1-3 before anything is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSnapshot {
    pub xp_to_deduct: i64,
    pub lessons_completed_before: i64,
    pub was_completed: bool,
    pub had_certificate: bool,
}

#[instrument(skip(conn))]
pub async fn create_reset_run(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
    preserve_notes: bool,
    snapshot: ResetSnapshot,
    last_completed_step: i64,
    now: DateTime<Utc>,
) -> Result<ResetRun, AppError> {
    info!("Starting course reset run");
    let run = sqlx::query_as::<_, ResetRun>(&format!(
        "INSERT INTO course_resets
             (user_id, course_id, preserve_notes, status, last_completed_step, xp_to_deduct,
              lessons_completed_before, was_completed, had_certificate, started_at)
         VALUES (?, ?, ?, 'running', ?, ?, ?, ?, ?, ?)
         RETURNING {}",
        RUN_COLUMNS
    ))
    .bind(user_id)
    .bind(course_id)
    .bind(preserve_notes)
    .bind(last_completed_step)
    .bind(snapshot.xp_to_deduct)
    .bind(snapshot.lessons_completed_before)
    .bind(snapshot.was_completed)
    .bind(snapshot.had_certificate)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(run)
}

#[instrument(skip(conn))]
pub async fn resume_reset_run(conn: &mut SqliteConnection, run_id: i64) -> Result<(), AppError> {
    sqlx::query("UPDATE course_resets SET status = 'running', error = NULL WHERE id = ?")
        .bind(run_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Counters a step may record alongside its progress marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepCounts {
    pub lessons_reset: Option<i64>,
    pub quiz_attempts_reset: Option<i64>,
    pub certificate_deleted: Option<bool>,
    pub notes_deleted: Option<i64>,
}

/// Moves the marker from `step - 1` to `step`. Must run in the same
/// transaction as the step's own writes so a step is applied at most once.
#[instrument(skip(conn))]
pub async fn advance_reset_run(
    conn: &mut SqliteConnection,
    run_id: i64,
    step: i64,
    counts: StepCounts,
) -> Result<(), AppError> {
    let result = sqlx::query(
        "UPDATE course_resets
         SET last_completed_step = ?,
             lessons_reset = COALESCE(?, lessons_reset),
             quiz_attempts_reset = COALESCE(?, quiz_attempts_reset),
             certificate_deleted = COALESCE(?, certificate_deleted),
             notes_deleted = COALESCE(?, notes_deleted)
         WHERE id = ? AND last_completed_step = ?",
    )
    .bind(step)
    .bind(counts.lessons_reset)
    .bind(counts.quiz_attempts_reset)
    .bind(counts.certificate_deleted)
    .bind(counts.notes_deleted)
    .bind(run_id)
    .bind(step - 1)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != 1 {
        return Err(AppError::Inconsistency(format!(
            "Reset run {} was not at step {} when completing step {}",
            run_id,
            step - 1,
            step
        )));
    }

    Ok(())
}

#[instrument(skip(conn))]
pub async fn fail_reset_run(
    conn: &mut SqliteConnection,
    run_id: i64,
    error: &str,
) -> Result<(), AppError> {
    warn!(error = %error, "Marking reset run as failed");
    sqlx::query("UPDATE course_resets SET status = 'failed', error = ? WHERE id = ?")
        .bind(error)
        .bind(run_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[instrument(skip(conn))]
pub async fn finish_reset_run(
    conn: &mut SqliteConnection,
    run_id: i64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE course_resets SET status = 'completed', error = NULL, finished_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(run_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
