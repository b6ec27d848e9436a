use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{info, instrument};

use crate::error::AppError;
use crate::models::{AnswerRecord, DbQuizAttempt, DbQuizQuestion, QuizAttempt, QuizQuestion};

const ATTEMPT_COLUMNS: &str = "id, user_id, module_id, score, total_questions, correct_answers, passed, answers_json, completed_at";

#[instrument(skip(conn))]
pub async fn get_questions(
    conn: &mut SqliteConnection,
    module_id: i64,
) -> Result<Vec<QuizQuestion>, AppError> {
    let rows = sqlx::query_as::<_, DbQuizQuestion>(
        "SELECT id, module_id, question, options, correct_answer, explanation, order_index, difficulty, points
         FROM quiz_questions
         WHERE module_id = ?
         ORDER BY order_index, id",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(QuizQuestion::try_from).collect()
}

pub struct NewQuizAttempt<'a> {
    pub user_id: i64,
    pub module_id: i64,
    pub score: i64,
    pub total_questions: i64,
    pub correct_answers: i64,
    pub passed: bool,
    pub answers: &'a [AnswerRecord],
    pub completed_at: DateTime<Utc>,
}

/// Attempts are append-only.
#[instrument(skip_all, fields(user_id = attempt.user_id, module_id = attempt.module_id))]
pub async fn insert_quiz_attempt(
    conn: &mut SqliteConnection,
    attempt: NewQuizAttempt<'_>,
) -> Result<QuizAttempt, AppError> {
    info!(score = attempt.score, passed = attempt.passed, "Recording quiz attempt");
    let answers_json = serde_json::to_string(attempt.answers)?;

    let row = sqlx::query_as::<_, DbQuizAttempt>(&format!(
        "INSERT INTO quiz_attempts
             (user_id, module_id, score, total_questions, correct_answers, passed, answers_json, completed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING {}",
        ATTEMPT_COLUMNS
    ))
    .bind(attempt.user_id)
    .bind(attempt.module_id)
    .bind(attempt.score)
    .bind(attempt.total_questions)
    .bind(attempt.correct_answers)
    .bind(attempt.passed)
    .bind(answers_json)
    .bind(attempt.completed_at)
    .fetch_one(&mut *conn)
    .await?;

    QuizAttempt::try_from(row)
}

/// Most recent first.
#[instrument(skip(conn))]
pub async fn list_quiz_attempts(
    conn: &mut SqliteConnection,
    user_id: i64,
    module_id: i64,
) -> Result<Vec<QuizAttempt>, AppError> {
    let rows = sqlx::query_as::<_, DbQuizAttempt>(&format!(
        "SELECT {} FROM quiz_attempts
         WHERE user_id = ? AND module_id = ?
         ORDER BY completed_at DESC, id DESC",
        ATTEMPT_COLUMNS
    ))
    .bind(user_id)
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(QuizAttempt::try_from).collect()
}

#[instrument(skip(conn))]
pub async fn passed_module_ids(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<HashSet<i64>, AppError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT DISTINCT qa.module_id
         FROM quiz_attempts qa
         JOIN modules m ON m.id = qa.module_id
         WHERE qa.user_id = ? AND m.course_id = ? AND qa.passed = 1",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ids.into_iter().collect())
}

#[instrument(skip(conn))]
pub async fn count_course_quiz_attempts(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<i64, AppError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM quiz_attempts
         WHERE user_id = ?
           AND module_id IN (SELECT id FROM modules WHERE course_id = ?)",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

#[instrument(skip(conn))]
pub async fn delete_course_quiz_attempts(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<u64, AppError> {
    let result = sqlx::query(
        "DELETE FROM quiz_attempts
         WHERE user_id = ?
           AND module_id IN (SELECT id FROM modules WHERE course_id = ?)",
    )
    .bind(user_id)
    .bind(course_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}
