//! Administrative course reset.
//!
//! Steps 1-3 take a snapshot that is persisted in a `course_resets` row.
//! Steps 4-11 then each run in their own transaction together with the
//! update of the run's progress marker, so a failed or interrupted run picks
//! up at the first step that did not commit.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{error, info, instrument};

use crate::db::{self, CounterDelta, NewXpEvent, ResetRun, ResetSnapshot, StepCounts};
use crate::engine::Engine;
use crate::error::AppError;
use crate::gamification::{apply_counters, refresh_level};
use crate::models::{COURSE_CERTIFICATE, XpEventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStep {
    ComputeScope = 1,
    SumCourseXp = 2,
    SnapshotCompletion = 3,
    DeleteCompletions = 4,
    DeleteXpEvents = 5,
    DeleteQuizAttempts = 6,
    DeleteCertificate = 7,
    ResetEnrollment = 8,
    AdjustStats = 9,
    DeleteNotes = 10,
    AppendAudit = 11,
}

impl ResetStep {
    pub const ALL: [ResetStep; 11] = [
        ResetStep::ComputeScope,
        ResetStep::SumCourseXp,
        ResetStep::SnapshotCompletion,
        ResetStep::DeleteCompletions,
        ResetStep::DeleteXpEvents,
        ResetStep::DeleteQuizAttempts,
        ResetStep::DeleteCertificate,
        ResetStep::ResetEnrollment,
        ResetStep::AdjustStats,
        ResetStep::DeleteNotes,
        ResetStep::AppendAudit,
    ];

    pub fn number(self) -> i64 {
        self as i64
    }

    /// Steps that mutate state, in execution order.
    pub fn mutating() -> impl Iterator<Item = ResetStep> {
        Self::ALL
            .into_iter()
            .filter(|step| step.number() > ResetStep::SnapshotCompletion.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Committed by an earlier run of the same reset.
    Resumed,
    Completed,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step: ResetStep,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetSummary {
    pub xp_deducted: i64,
    pub lessons_reset: i64,
    pub quiz_attempts_reset: i64,
    pub certificate_deleted: bool,
    pub notes_deleted: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub user_id: i64,
    pub course_id: i64,
    pub completed: bool,
    pub resumed: bool,
    pub summary: ResetSummary,
    pub steps: Vec<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResetReport {
    fn noop(user_id: i64, course_id: i64) -> Self {
        Self {
            user_id,
            course_id,
            completed: true,
            resumed: false,
            summary: ResetSummary::default(),
            steps: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    snapshot: ResetSnapshot,
    quiz_attempts: i64,
    notes: i64,
    xp_events: i64,
    progress_percentage: i64,
}

impl Scope {
    fn is_empty(&self, preserve_notes: bool) -> bool {
        self.snapshot.xp_to_deduct == 0
            && self.xp_events == 0
            && self.snapshot.lessons_completed_before == 0
            && !self.snapshot.was_completed
            && !self.snapshot.had_certificate
            && self.quiz_attempts == 0
            && self.progress_percentage == 0
            && (preserve_notes || self.notes == 0)
    }
}

/// Fails with `Conflict` while a reset of the pair is unfinished. Callers
/// hold the course lock.
pub async fn ensure_no_pending_reset(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<(), AppError> {
    match db::find_unfinished_reset(conn, user_id, course_id).await? {
        Some(run) => Err(AppError::Conflict(format!(
            "Reset {} of course {} for user {} stopped after step {}; run the reset again first",
            run.id, course_id, user_id, run.last_completed_step
        ))),
        None => Ok(()),
    }
}

/// Steps 1-3.
#[instrument(skip(conn))]
async fn capture_scope(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<Scope, AppError> {
    let lessons_completed_before = db::completed_lesson_ids(conn, user_id, course_id).await?.len() as i64;
    let (xp_to_deduct, xp_events) = db::course_xp_summary(conn, user_id, course_id).await?;
    let enrollment = db::find_enrollment(conn, user_id, course_id).await?;
    let had_certificate = db::find_certificate(conn, user_id, course_id, COURSE_CERTIFICATE)
        .await?
        .is_some();

    Ok(Scope {
        snapshot: ResetSnapshot {
            xp_to_deduct,
            lessons_completed_before,
            was_completed: enrollment.as_ref().is_some_and(|e| e.is_completed()),
            had_certificate,
        },
        quiz_attempts: db::count_course_quiz_attempts(conn, user_id, course_id).await?,
        notes: db::count_course_notes(conn, user_id, course_id).await?,
        xp_events,
        progress_percentage: enrollment.map(|e| e.progress_percentage).unwrap_or(0),
    })
}

impl Engine {
    async fn run_reset_step(
        &self,
        conn: &mut SqliteConnection,
        run: &ResetRun,
        step: ResetStep,
    ) -> Result<StepCounts, AppError> {
        let (user_id, course_id) = (run.user_id, run.course_id);
        let mut counts = StepCounts::default();

        match step {
            ResetStep::ComputeScope | ResetStep::SumCourseXp | ResetStep::SnapshotCompletion => {}
            ResetStep::DeleteCompletions => {
                let deleted = db::delete_course_completions(conn, user_id, course_id).await?;
                counts.lessons_reset = Some(deleted as i64);
            }
            ResetStep::DeleteXpEvents => {
                db::delete_course_xp_events(conn, user_id, course_id).await?;
            }
            ResetStep::DeleteQuizAttempts => {
                let deleted = db::delete_course_quiz_attempts(conn, user_id, course_id).await?;
                counts.quiz_attempts_reset = Some(deleted as i64);
            }
            ResetStep::DeleteCertificate => {
                let deleted = db::delete_course_certificates(conn, user_id, course_id).await?;
                counts.certificate_deleted = Some(deleted > 0);
            }
            ResetStep::ResetEnrollment => {
                db::reset_enrollment(conn, user_id, course_id).await?;
            }
            ResetStep::AdjustStats => {
                apply_counters(
                    conn,
                    self.config(),
                    user_id,
                    CounterDelta {
                        lessons_completed: -run.lessons_completed_before,
                        courses_completed: -i64::from(run.was_completed),
                        certificates_earned: -i64::from(run.had_certificate),
                    },
                )
                .await?;
                db::apply_xp_delta(conn, user_id, -run.xp_to_deduct, Utc::now()).await?;
                refresh_level(conn, self.config(), user_id).await?;
            }
            ResetStep::DeleteNotes => {
                let deleted = if run.preserve_notes {
                    0
                } else {
                    db::delete_course_notes(conn, user_id, course_id).await?
                };
                counts.notes_deleted = Some(deleted as i64);
            }
            ResetStep::AppendAudit => {
                db::insert_xp_event(
                    conn,
                    NewXpEvent {
                        user_id,
                        course_id: Some(course_id),
                        event_type: XpEventType::AdminAdjustment,
                        xp_earned: -run.xp_to_deduct,
                        description: &format!(
                            "Course reset: {} XP removed, {} lessons reset",
                            run.xp_to_deduct, run.lessons_completed_before
                        ),
                        audit_only: true,
                        created_at: Utc::now(),
                    },
                )
                .await?;
            }
        }

        db::advance_reset_run(conn, run.id, step.number(), counts).await?;
        Ok(counts)
    }

    /// Reverses every derived effect of one learner's work in a course.
    /// Earned badges are kept. A reset with nothing left to undo is a no-op.
    #[instrument(skip(self))]
    pub async fn reset_course(
        &self,
        user_id: i64,
        course_id: i64,
        preserve_notes: bool,
    ) -> Result<ResetReport, AppError> {
        {
            let mut conn = self.pool().acquire().await?;
            db::get_user(&mut *conn, user_id).await?;
            db::get_course(&mut *conn, course_id).await?;
        }
        let _guard = self.lock_course(user_id, course_id).await;

        let mut tx = self.pool().begin().await?;
        let (run, resumed) = match db::find_unfinished_reset(&mut *tx, user_id, course_id).await? {
            Some(run) => {
                info!(run_id = run.id, step = run.last_completed_step, "Resuming course reset");
                db::resume_reset_run(&mut *tx, run.id).await?;
                (run, true)
            }
            None => {
                let scope = capture_scope(&mut *tx, user_id, course_id).await?;
                if scope.is_empty(preserve_notes) {
                    tx.commit().await?;
                    info!(user_id, course_id, "Nothing to reset");
                    return Ok(ResetReport::noop(user_id, course_id));
                }
                let run = db::create_reset_run(
                    &mut *tx,
                    user_id,
                    course_id,
                    preserve_notes,
                    scope.snapshot,
                    ResetStep::SnapshotCompletion.number(),
                    Utc::now(),
                )
                .await?;
                (run, false)
            }
        };
        tx.commit().await?;

        let mut summary = ResetSummary {
            xp_deducted: run.xp_to_deduct,
            lessons_reset: run.lessons_reset,
            quiz_attempts_reset: run.quiz_attempts_reset,
            certificate_deleted: run.certificate_deleted,
            notes_deleted: run.notes_deleted,
        };
        let mut steps: Vec<StepOutcome> = ResetStep::ALL
            .into_iter()
            .map(|step| StepOutcome {
                step,
                status: if step.number() <= run.last_completed_step {
                    StepStatus::Resumed
                } else {
                    StepStatus::Pending
                },
            })
            .collect();
        if !resumed {
            for outcome in steps.iter_mut().take(3) {
                outcome.status = StepStatus::Completed;
            }
        }

        for step in ResetStep::mutating().filter(|s| s.number() > run.last_completed_step) {
            let result = async {
                let mut tx = self.pool().begin().await?;
                let counts = self.run_reset_step(&mut *tx, &run, step).await?;
                tx.commit().await?;
                Ok::<StepCounts, AppError>(counts)
            }
            .await;

            let index = (step.number() - 1) as usize;
            match result {
                Ok(counts) => {
                    steps[index].status = StepStatus::Completed;
                    if let Some(lessons) = counts.lessons_reset {
                        summary.lessons_reset = lessons;
                    }
                    if let Some(attempts) = counts.quiz_attempts_reset {
                        summary.quiz_attempts_reset = attempts;
                    }
                    if let Some(deleted) = counts.certificate_deleted {
                        summary.certificate_deleted = deleted;
                    }
                    if let Some(notes) = counts.notes_deleted {
                        summary.notes_deleted = notes;
                    }
                }
                Err(err) => {
                    steps[index].status = StepStatus::Failed;
                    err.log_and_record(&format!("Course reset step {:?}", step));

                    let message = err.to_string();
                    match self.pool().acquire().await {
                        Ok(mut conn) => {
                            if let Err(mark_err) = db::fail_reset_run(&mut *conn, run.id, &message).await {
                                error!(run_id = run.id, error = %mark_err, "Failed to mark reset run as failed");
                            }
                        }
                        Err(acquire_err) => {
                            error!(run_id = run.id, error = %acquire_err, "Failed to mark reset run as failed");
                        }
                    }

                    return Ok(ResetReport {
                        user_id,
                        course_id,
                        completed: false,
                        resumed,
                        summary,
                        steps,
                        error: Some(message),
                    });
                }
            }
        }

        db::finish_reset_run(&mut *self.pool().acquire().await?, run.id, Utc::now()).await?;
        info!(
            user_id,
            course_id,
            xp_deducted = summary.xp_deducted,
            lessons_reset = summary.lessons_reset,
            "Course reset completed"
        );

        Ok(ResetReport {
            user_id,
            course_id,
            completed: true,
            resumed,
            summary,
            steps,
            error: None,
        })
    }
}
