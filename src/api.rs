use std::future::Future;
use std::time::Duration;

use rocket::State;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize, json::Json};
use tracing::warn;
use validator::Validate;

use crate::auth::{Permission, User};
use crate::certification::CertificateClaim;
use crate::engine::Engine;
use crate::error::AppError;
use crate::gamification::{GamificationSummary, ReconcileReport, XpAward};
use crate::models::{Certificate, Enrollment, LessonNote, XpEvent};
use crate::progress::{CompletionOutcome, CourseProgress};
use crate::quiz::{AttemptHistory, QuizResult, ServedQuestion, SubmittedAnswer};
use crate::reset::ResetReport;
use crate::validation::JsonValidateExt;

const TRANSIENT_RETRY_BACKOFF: Duration = Duration::from_millis(50);
const DEFAULT_EVENT_PAGE: i64 = 50;

/// Runs `operation` again once when SQLite reports lock contention.
async fn retry_transient<T, F, Fut>(name: &str, mut operation: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    match operation().await {
        Err(err) if err.is_transient() => {
            warn!(operation = %name, error = %err, "Transient database error, retrying once");
            rocket::tokio::time::sleep(TRANSIENT_RETRY_BACKOFF).await;
            operation().await
        }
        result => result,
    }
}

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CompleteLessonRequest {
    lesson_id: i64,
    #[validate(range(min = 0, message = "must not be negative"))]
    watch_time_seconds: Option<i64>,
}

#[post("/progress/complete", data = "<request>")]
pub async fn api_complete_lesson(
    request: Json<CompleteLessonRequest>,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<CompletionOutcome>, AppError> {
    user.require_permission(Permission::CompleteLessons)?;
    let request = request.validated()?;
    let engine = engine.inner();

    let outcome = retry_transient("complete_lesson", || {
        engine.complete_lesson(user.id, request.lesson_id, request.watch_time_seconds)
    })
    .await?;

    Ok(Json(outcome))
}

#[get("/courses/<course_id>/progress")]
pub async fn api_course_progress(
    course_id: i64,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<CourseProgress>, AppError> {
    user.require_permission(Permission::ViewOwnProgress)?;

    Ok(Json(engine.course_progress(user.id, course_id).await?))
}

#[post("/courses/<course_id>/enroll")]
pub async fn api_enroll(
    course_id: i64,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<Enrollment>, AppError> {
    user.require_permission(Permission::CompleteLessons)?;

    Ok(Json(engine.enroll(user.id, course_id).await?))
}

#[derive(FromForm)]
pub struct QuestionsQueryParams {
    #[field(name = "includeAnswers")]
    include_answers: Option<bool>,
    #[field(name = "shuffleSeed")]
    shuffle_seed: Option<u64>,
}

#[get("/quiz/<module_id>/questions?<params..>")]
pub async fn api_quiz_questions(
    module_id: i64,
    params: QuestionsQueryParams,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<Vec<ServedQuestion>>, AppError> {
    user.require_permission(Permission::TakeQuizzes)?;

    let include_answers = params.include_answers.unwrap_or(false);
    if include_answers {
        user.require_permission(Permission::ViewQuizAnswers)?;
    }

    let questions = engine
        .quiz_questions(module_id, include_answers, params.shuffle_seed)
        .await?;

    Ok(Json(questions))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitQuizRequest {
    #[validate(length(min = 1, message = "at least one answer is required"))]
    answers: Vec<SubmittedAnswer>,
    shuffle_seed: Option<u64>,
}

#[post("/quiz/<module_id>/submit", data = "<request>")]
pub async fn api_submit_quiz(
    module_id: i64,
    request: Json<SubmitQuizRequest>,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<QuizResult>, AppError> {
    user.require_permission(Permission::TakeQuizzes)?;
    let request = request.validated()?;
    let engine = engine.inner();
    let answers = &request.answers;

    let result = retry_transient("submit_quiz", || {
        engine.submit_quiz(user.id, module_id, answers, request.shuffle_seed)
    })
    .await?;

    Ok(Json(result))
}

#[get("/quiz/<module_id>/attempts")]
pub async fn api_quiz_attempts(
    module_id: i64,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<AttemptHistory>, AppError> {
    user.require_permission(Permission::TakeQuizzes)?;

    Ok(Json(engine.quiz_attempts(user.id, module_id).await?))
}

#[get("/gamification/me")]
pub async fn api_gamification_me(
    user: User,
    engine: &State<Engine>,
) -> Result<Json<GamificationSummary>, AppError> {
    user.require_permission(Permission::ViewOwnProgress)?;

    Ok(Json(engine.gamification_summary(user.id).await?))
}

#[get("/gamification/me/events?<limit>")]
pub async fn api_gamification_events(
    limit: Option<i64>,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<Vec<XpEvent>>, AppError> {
    user.require_permission(Permission::ViewOwnProgress)?;

    let events = engine
        .xp_events(user.id, limit.unwrap_or(DEFAULT_EVENT_PAGE))
        .await?;

    Ok(Json(events))
}

#[post("/certificates/course/<course_id>")]
pub async fn api_claim_certificate(
    course_id: i64,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<CertificateClaim>, AppError> {
    user.require_permission(Permission::ClaimCertificates)?;

    Ok(Json(engine.claim_certificate(user.id, course_id).await?))
}

#[get("/certificates")]
pub async fn api_certificates(
    user: User,
    engine: &State<Engine>,
) -> Result<Json<Vec<Certificate>>, AppError> {
    user.require_permission(Permission::ViewOwnProgress)?;

    Ok(Json(engine.certificates(user.id).await?))
}

#[get("/certificates/verify/<number>")]
pub async fn api_verify_certificate(
    number: &str,
    engine: &State<Engine>,
) -> Result<Json<Certificate>, AppError> {
    Ok(Json(engine.verify_certificate(number).await?))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SaveNoteRequest {
    #[validate(length(max = 10000, message = "must be at most 10000 characters"))]
    content: String,
}

#[put("/lessons/<lesson_id>/note", data = "<request>")]
pub async fn api_save_note(
    lesson_id: i64,
    request: Json<SaveNoteRequest>,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<LessonNote>, AppError> {
    user.require_permission(Permission::EditOwnNotes)?;
    let request = request.validated()?;

    Ok(Json(
        engine.save_note(user.id, lesson_id, &request.content).await?,
    ))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResetCourseRequest {
    course_id: i64,
    #[serde(default)]
    preserve_notes: bool,
}

#[post("/admin/users/<user_id>/reset-course", data = "<request>")]
pub async fn api_reset_course(
    user_id: i64,
    request: Json<ResetCourseRequest>,
    user: User,
    engine: &State<Engine>,
) -> Result<Custom<Json<ResetReport>>, AppError> {
    user.require_permission(Permission::ResetProgress)?;
    let request = request.validated()?;

    let report = engine
        .reset_course(user_id, request.course_id, request.preserve_notes)
        .await?;

    let status = if report.completed {
        Status::Ok
    } else {
        Status::InternalServerError
    };

    Ok(Custom(status, Json(report)))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct XpAdjustmentRequest {
    amount: i64,
    #[validate(length(min = 1, max = 500, message = "must be between 1 and 500 characters"))]
    description: String,
    course_id: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XpAdjustmentResponse {
    pub user_id: i64,
    #[serde(flatten)]
    pub award: XpAward,
}

#[post("/admin/users/<user_id>/xp-adjustment", data = "<request>")]
pub async fn api_adjust_xp(
    user_id: i64,
    request: Json<XpAdjustmentRequest>,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<XpAdjustmentResponse>, AppError> {
    user.require_permission(Permission::AdjustXp)?;
    let request = request.validated()?;

    let award = engine
        .adjust_xp(user_id, request.amount, &request.description, request.course_id)
        .await?;

    Ok(Json(XpAdjustmentResponse { user_id, award }))
}

#[derive(Deserialize, Validate, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    #[serde(default)]
    repair: bool,
}

#[post("/admin/users/<user_id>/reconcile", data = "<request>")]
pub async fn api_reconcile(
    user_id: i64,
    request: Json<ReconcileRequest>,
    user: User,
    engine: &State<Engine>,
) -> Result<Json<ReconcileReport>, AppError> {
    user.require_permission(Permission::ReconcileStats)?;
    let request = request.validated()?;

    Ok(Json(engine.reconcile(user_id, request.repair).await?))
}
