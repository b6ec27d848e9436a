use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{info, instrument};

use crate::error::AppError;
use crate::models::Certificate;

const CERTIFICATE_COLUMNS: &str =
    "id, user_id, course_id, module_id, type, certificate_number, title, description, issued_at";

#[instrument(skip(conn))]
pub async fn find_certificate(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
    kind: &str,
) -> Result<Option<Certificate>, AppError> {
    let row = sqlx::query_as::<_, Certificate>(&format!(
        "SELECT {} FROM certificates WHERE user_id = ? AND course_id = ? AND type = ?",
        CERTIFICATE_COLUMNS
    ))
    .bind(user_id)
    .bind(course_id)
    .bind(kind)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

#[instrument(skip(conn))]
pub async fn find_certificate_by_number(
    conn: &mut SqliteConnection,
    certificate_number: &str,
) -> Result<Option<Certificate>, AppError> {
    let row = sqlx::query_as::<_, Certificate>(&format!(
        "SELECT {} FROM certificates WHERE certificate_number = ?",
        CERTIFICATE_COLUMNS
    ))
    .bind(certificate_number)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

#[instrument(skip(conn))]
pub async fn list_certificates(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Vec<Certificate>, AppError> {
    let rows = sqlx::query_as::<_, Certificate>(&format!(
        "SELECT {} FROM certificates WHERE user_id = ? ORDER BY issued_at DESC, id DESC",
        CERTIFICATE_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

pub struct NewCertificate<'a> {
    pub user_id: i64,
    pub course_id: i64,
    pub kind: &'a str,
    pub certificate_number: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub issued_at: DateTime<Utc>,
}

/// A duplicate (user, course, type) or certificate number surfaces as
/// `AppError::Conflict` through the unique indexes.
#[instrument(skip_all, fields(user_id = certificate.user_id, course_id = certificate.course_id))]
pub async fn insert_certificate(
    conn: &mut SqliteConnection,
    certificate: NewCertificate<'_>,
) -> Result<Certificate, AppError> {
    info!(number = %certificate.certificate_number, "Issuing certificate");
    let row = sqlx::query_as::<_, Certificate>(&format!(
        "INSERT INTO certificates (user_id, course_id, module_id, type, certificate_number, title, description, issued_at)
         VALUES (?, ?, NULL, ?, ?, ?, ?, ?)
         RETURNING {}",
        CERTIFICATE_COLUMNS
    ))
    .bind(certificate.user_id)
    .bind(certificate.course_id)
    .bind(certificate.kind)
    .bind(certificate.certificate_number)
    .bind(certificate.title)
    .bind(certificate.description)
    .bind(certificate.issued_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row)
}

#[instrument(skip(conn))]
pub async fn delete_course_certificates(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM certificates WHERE user_id = ? AND course_id = ?")
        .bind(user_id)
        .bind(course_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

#[instrument(skip(conn))]
pub async fn count_certificates(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<i64, AppError> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM certificates WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(count)
}
