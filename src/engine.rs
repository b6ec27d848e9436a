use std::collections::HashSet;
use std::sync::Arc;

use sqlx::{Pool, Sqlite, SqliteConnection};
use tokio::sync::OwnedMutexGuard;
use tracing::instrument;

use crate::db;
use crate::env::EngineConfig;
use crate::error::AppError;
use crate::locks::CourseLocks;
use crate::unlock::{self, CourseOutline, ModuleState};

/// Shared handle to the progression engine. Cheap to clone; Rocket manages
/// one instance and every route borrows it.
#[derive(Clone)]
pub struct Engine {
    pool: Pool<Sqlite>,
    config: Arc<EngineConfig>,
    locks: Arc<CourseLocks>,
}

impl Engine {
    pub fn new(pool: Pool<Sqlite>, config: EngineConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            locks: Arc::new(CourseLocks::new()),
        }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Serializes mutations of one learner's state in one course.
    pub(crate) async fn lock_course(&self, user_id: i64, course_id: i64) -> OwnedMutexGuard<()> {
        self.locks.lock(user_id, course_id).await
    }
}

/// Everything the unlock policy needs for one (user, course) pair.
#[derive(Debug, Clone)]
pub struct CourseState {
    pub outline: CourseOutline,
    pub completions: HashSet<i64>,
    pub passed_quizzes: HashSet<i64>,
    pub modules: Vec<ModuleState>,
}

impl CourseState {
    pub fn is_module_unlocked(&self, module_id: i64) -> bool {
        unlock::is_module_unlocked(&self.modules, module_id)
    }

    pub fn is_course_complete(&self) -> bool {
        unlock::is_course_complete(&self.outline, &self.completions, &self.passed_quizzes)
    }

    pub fn percentage(&self) -> i64 {
        unlock::course_percentage(&self.outline, &self.completions)
    }
}

#[instrument(skip(conn))]
pub async fn load_course_state(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<CourseState, AppError> {
    let outline = db::get_course_outline(conn, course_id).await?;
    let completions = db::completed_lesson_ids(conn, user_id, course_id).await?;
    let passed_quizzes = db::passed_module_ids(conn, user_id, course_id).await?;
    let modules = unlock::evaluate(&outline, &completions, &passed_quizzes);

    Ok(CourseState {
        outline,
        completions,
        passed_quizzes,
        modules,
    })
}
