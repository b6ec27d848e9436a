use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use crate::certification::settle_course_completion;
use crate::db::{self, CounterDelta};
use crate::engine::{Engine, load_course_state};
use crate::error::AppError;
use crate::gamification::{apply_counters, award_xp, evaluate_badges};
use crate::models::{Certificate, Enrollment, LessonNote, XpEventType};
use crate::reset::ensure_no_pending_reset;
use crate::unlock::{self, ModuleState};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub already_completed: bool,
    pub progress_percentage: i64,
    pub newly_unlocked_modules: Vec<i64>,
    pub course_completed: bool,
    pub certificate: Option<Certificate>,
    pub xp_awarded: i64,
    pub badges_unlocked: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseProgress {
    pub enrollment: Enrollment,
    pub completed_lessons: i64,
    pub total_lessons: i64,
    pub modules: Vec<ModuleState>,
}

impl Engine {
    /// Records a lesson completion and everything derived from it. A repeat
    /// completion changes nothing and reports `already_completed`.
    #[instrument(skip(self))]
    pub async fn complete_lesson(
        &self,
        user_id: i64,
        lesson_id: i64,
        watch_time_seconds: Option<i64>,
    ) -> Result<CompletionOutcome, AppError> {
        let (lesson, module) = {
            let mut conn = self.pool().acquire().await?;
            let lesson = db::get_lesson(&mut *conn, lesson_id).await?;
            let module = db::get_module(&mut *conn, lesson.module_id).await?;
            (lesson, module)
        };
        let course_id = module.course_id;
        let _guard = self.lock_course(user_id, course_id).await;

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        let enrollment = db::require_enrollment(&mut *tx, user_id, course_id).await?;
        ensure_no_pending_reset(&mut *tx, user_id, course_id).await?;
        let before = load_course_state(&mut *tx, user_id, course_id).await?;

        if before.completions.contains(&lesson.id) {
            tx.commit().await?;
            return Ok(CompletionOutcome {
                already_completed: true,
                progress_percentage: enrollment.progress_percentage,
                ..CompletionOutcome::default()
            });
        }

        if !before.is_module_unlocked(module.id) {
            return Err(AppError::Forbidden(format!(
                "Module {} is locked for user {}",
                module.id, user_id
            )));
        }

        let watch_time = watch_time_seconds.unwrap_or(0).max(0);
        if !db::record_completion(&mut *tx, user_id, lesson.id, watch_time, now).await? {
            tx.commit().await?;
            return Ok(CompletionOutcome {
                already_completed: true,
                progress_percentage: enrollment.progress_percentage,
                ..CompletionOutcome::default()
            });
        }

        let progress_percentage = db::refresh_progress(&mut *tx, user_id, course_id, now).await?;

        let award = award_xp(
            &mut *tx,
            self.config(),
            user_id,
            Some(course_id),
            XpEventType::LessonCompleted,
            self.config().xp.lesson_completed,
            &format!("Completed lesson: {}", lesson.title),
            now,
        )
        .await?;
        apply_counters(
            &mut *tx,
            self.config(),
            user_id,
            CounterDelta {
                lessons_completed: 1,
                ..CounterDelta::default()
            },
        )
        .await?;

        let after = load_course_state(&mut *tx, user_id, course_id).await?;
        let newly_unlocked_modules = unlock::newly_unlocked(&before.modules, &after.modules);
        let settlement =
            settle_course_completion(&mut *tx, self.config(), user_id, course_id, &after, now)
                .await?;
        let badges_unlocked = evaluate_badges(&mut *tx, self.config(), user_id, now).await?;

        tx.commit().await?;

        info!(
            user_id,
            lesson_id,
            progress_percentage,
            course_completed = settlement.course_completed,
            "Lesson completed"
        );

        Ok(CompletionOutcome {
            already_completed: false,
            progress_percentage,
            newly_unlocked_modules,
            course_completed: settlement.course_completed,
            certificate: settlement.certificate,
            xp_awarded: award.amount + settlement.xp_awarded,
            badges_unlocked,
        })
    }

    /// Idempotent.
    #[instrument(skip(self))]
    pub async fn enroll(&self, user_id: i64, course_id: i64) -> Result<Enrollment, AppError> {
        let _guard = self.lock_course(user_id, course_id).await;

        let mut tx = self.pool().begin().await?;
        db::get_course(&mut *tx, course_id).await?;
        if db::create_enrollment(&mut *tx, user_id, course_id, Utc::now()).await? {
            info!(user_id, course_id, "User enrolled");
        }
        let enrollment = db::require_enrollment(&mut *tx, user_id, course_id).await?;
        tx.commit().await?;

        Ok(enrollment)
    }

    #[instrument(skip(self))]
    pub async fn course_progress(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<CourseProgress, AppError> {
        let mut conn = self.pool().acquire().await?;
        db::get_course(&mut *conn, course_id).await?;
        let enrollment = db::require_enrollment(&mut *conn, user_id, course_id).await?;
        let state = load_course_state(&mut *conn, user_id, course_id).await?;

        Ok(CourseProgress {
            enrollment,
            completed_lessons: unlock::completed_lessons(&state.outline, &state.completions) as i64,
            total_lessons: state.outline.total_lessons() as i64,
            modules: state.modules,
        })
    }

    #[instrument(skip(self, content))]
    pub async fn save_note(
        &self,
        user_id: i64,
        lesson_id: i64,
        content: &str,
    ) -> Result<LessonNote, AppError> {
        let mut conn = self.pool().acquire().await?;
        let lesson = db::get_lesson(&mut *conn, lesson_id).await?;
        let module = db::get_module(&mut *conn, lesson.module_id).await?;
        drop(conn);

        let _guard = self.lock_course(user_id, module.course_id).await;
        let mut tx = self.pool().begin().await?;
        db::require_enrollment(&mut *tx, user_id, module.course_id).await?;
        ensure_no_pending_reset(&mut *tx, user_id, module.course_id).await?;
        let note = db::save_note(&mut *tx, user_id, lesson_id, content, Utc::now()).await?;
        tx.commit().await?;

        Ok(note)
    }
}
