use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, instrument};

use crate::db::{self, CounterDelta, NewCertificate};
use crate::engine::{CourseState, Engine, load_course_state};
use crate::env::EngineConfig;
use crate::error::AppError;
use crate::gamification::{apply_counters, award_xp, evaluate_badges};
use crate::models::{COURSE_CERTIFICATE, Certificate, XpEventType};
use crate::reset::ensure_no_pending_reset;

pub const CERTIFICATE_PREFIX: &str = "NODO360";

/// `NODO360-{year}-{8 uppercase hex chars}`.
pub fn certificate_number(issued_at: DateTime<Utc>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!("{}-{}-{}", CERTIFICATE_PREFIX, issued_at.year(), &id[..8])
}

pub fn is_certificate_number(candidate: &str) -> bool {
    let mut parts = candidate.split('-');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some(CERTIFICATE_PREFIX), Some(year), Some(id), None)
            if year.len() == 4
                && year.chars().all(|c| c.is_ascii_digit())
                && id.len() == 8
                && id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
    )
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub course_completed: bool,
    pub certificate: Option<Certificate>,
    pub xp_awarded: i64,
}

/// Issues the course certificate once the learner is eligible. Returns the
/// existing certificate when one was already issued and `None` when the
/// learner is not eligible yet.
#[instrument(skip(conn, config, state))]
pub async fn issue_if_eligible(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    user_id: i64,
    course_id: i64,
    state: &CourseState,
    now: DateTime<Utc>,
) -> Result<Option<(Certificate, bool)>, AppError> {
    if let Some(existing) = db::find_certificate(conn, user_id, course_id, COURSE_CERTIFICATE).await? {
        return Ok(Some((existing, false)));
    }

    let enrollment = db::require_enrollment(conn, user_id, course_id).await?;
    if enrollment.progress_percentage != 100 || !state.is_course_complete() {
        debug!(
            progress = enrollment.progress_percentage,
            "Not eligible for a certificate yet"
        );
        return Ok(None);
    }

    let course = db::get_course(conn, course_id).await?;
    let user = db::get_user(conn, user_id).await?;
    let learner = if user.display_name.trim().is_empty() {
        user.username.as_str()
    } else {
        user.display_name.as_str()
    };

    let number = certificate_number(now);
    let title = format!("Certificate of Completion: {}", course.title);
    let description = format!(
        "Awarded to {} for completing all {} lessons of {}",
        learner, course.total_lessons, course.title
    );

    let certificate = db::insert_certificate(
        conn,
        NewCertificate {
            user_id,
            course_id,
            kind: COURSE_CERTIFICATE,
            certificate_number: &number,
            title: &title,
            description: &description,
            issued_at: now,
        },
    )
    .await?;

    apply_counters(
        conn,
        config,
        user_id,
        CounterDelta {
            certificates_earned: 1,
            ..CounterDelta::default()
        },
    )
    .await?;

    info!(user_id, course_id, number = %certificate.certificate_number, "Certificate issued");
    Ok(Some((certificate, true)))
}

/// Marks the enrollment completed, grants course XP and issues the
/// certificate when the course has just become complete. Safe to call after
/// every completion or passing quiz.
#[instrument(skip(conn, config, state))]
pub async fn settle_course_completion(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    user_id: i64,
    course_id: i64,
    state: &CourseState,
    now: DateTime<Utc>,
) -> Result<Settlement, AppError> {
    if !state.is_course_complete() {
        return Ok(Settlement::default());
    }

    let mut settlement = Settlement::default();

    if db::mark_enrollment_completed(conn, user_id, course_id, now).await? {
        let course = db::get_course(conn, course_id).await?;
        let award = award_xp(
            conn,
            config,
            user_id,
            Some(course_id),
            XpEventType::CourseCompleted,
            config.xp.course_completed,
            &format!("Completed course: {}", course.title),
            now,
        )
        .await?;
        apply_counters(
            conn,
            config,
            user_id,
            CounterDelta {
                courses_completed: 1,
                ..CounterDelta::default()
            },
        )
        .await?;

        settlement.course_completed = true;
        settlement.xp_awarded = award.amount;
        info!(user_id, course_id, "Course completed");
    }

    if let Some((certificate, issued)) =
        issue_if_eligible(conn, config, user_id, course_id, state, now).await?
    {
        if issued {
            settlement.certificate = Some(certificate);
        }
    }

    Ok(settlement)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateClaim {
    pub issued: bool,
    pub certificate: Option<Certificate>,
}

impl Engine {
    #[instrument(skip(self))]
    pub async fn claim_certificate(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<CertificateClaim, AppError> {
        db::get_course(&mut *self.pool().acquire().await?, course_id).await?;
        let _guard = self.lock_course(user_id, course_id).await;

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        db::require_enrollment(&mut *tx, user_id, course_id).await?;
        ensure_no_pending_reset(&mut *tx, user_id, course_id).await?;

        let state = load_course_state(&mut *tx, user_id, course_id).await?;
        let settlement =
            settle_course_completion(&mut *tx, self.config(), user_id, course_id, &state, now)
                .await?;

        let claim = match settlement.certificate {
            Some(certificate) => CertificateClaim {
                issued: true,
                certificate: Some(certificate),
            },
            None => CertificateClaim {
                issued: false,
                certificate: db::find_certificate(&mut *tx, user_id, course_id, COURSE_CERTIFICATE)
                    .await?,
            },
        };

        evaluate_badges(&mut *tx, self.config(), user_id, now).await?;
        tx.commit().await?;

        Ok(claim)
    }

    #[instrument(skip(self))]
    pub async fn certificates(&self, user_id: i64) -> Result<Vec<Certificate>, AppError> {
        db::list_certificates(&mut *self.pool().acquire().await?, user_id).await
    }

    #[instrument(skip(self))]
    pub async fn verify_certificate(&self, number: &str) -> Result<Certificate, AppError> {
        if !is_certificate_number(number) {
            return Err(AppError::NotFound(format!("Certificate {} not found", number)));
        }

        db::find_certificate_by_number(&mut *self.pool().acquire().await?, number)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Certificate {} not found", number)))
    }
}
