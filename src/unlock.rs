//! Sequential, quiz-gated unlocking.
//!
//! Everything here is a pure function of the course outline, the set of
//! completed lesson ids and the set of module ids with a passing quiz
//! attempt. Nothing is persisted: callers re-run [`evaluate`] after every
//! completion or quiz submission.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ModuleOutline {
    pub id: i64,
    pub order_index: i64,
    pub requires_quiz: bool,
    pub lesson_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct CourseOutline {
    pub course_id: i64,
    pub modules: Vec<ModuleOutline>,
}

impl CourseOutline {
    pub fn total_lessons(&self) -> usize {
        self.modules.iter().map(|m| m.lesson_ids.len()).sum()
    }

    pub fn quiz_gated_modules(&self) -> impl Iterator<Item = &ModuleOutline> {
        self.modules.iter().filter(|m| m.requires_quiz)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleState {
    pub module_id: i64,
    pub order_index: i64,
    pub requires_quiz: bool,
    pub completed_lessons: i64,
    pub total_lessons: i64,
    pub percentage: i64,
    pub is_completed: bool,
    pub quiz_passed: bool,
    pub is_unlocked: bool,
}

/// `round(100 * completed / total)`; zero of zero is reported as 100 so that
/// an empty module counts as complete.
pub fn module_percentage(completed: usize, total: usize) -> i64 {
    if total == 0 {
        return 100;
    }
    (100.0 * completed as f64 / total as f64).round() as i64
}

/// Course-level progress. Unlike modules, an empty course reports 0 and can
/// never complete.
pub fn course_percentage(outline: &CourseOutline, completions: &HashSet<i64>) -> i64 {
    let total = outline.total_lessons();
    if total == 0 {
        return 0;
    }
    let completed = completed_lessons(outline, completions);
    (100.0 * completed as f64 / total as f64).round() as i64
}

pub fn evaluate(
    outline: &CourseOutline,
    completions: &HashSet<i64>,
    passed_quizzes: &HashSet<i64>,
) -> Vec<ModuleState> {
    let mut modules: Vec<&ModuleOutline> = outline.modules.iter().collect();
    modules.sort_by_key(|m| m.order_index);

    let mut states: Vec<ModuleState> = Vec::with_capacity(modules.len());

    for module in modules {
        let total = module.lesson_ids.len();
        let completed = module
            .lesson_ids
            .iter()
            .filter(|id| completions.contains(id))
            .count();

        if total == 0 {
            // Open product question: an empty module is vacuously complete
            // and can unlock everything after it.
            debug!(
                module_id = module.id,
                "Module has no lessons and counts as complete"
            );
        }

        let percentage = module_percentage(completed, total);
        let is_unlocked = match states.last() {
            None => true,
            Some(previous) => {
                previous.is_completed && (!previous.requires_quiz || previous.quiz_passed)
            }
        };

        states.push(ModuleState {
            module_id: module.id,
            order_index: module.order_index,
            requires_quiz: module.requires_quiz,
            completed_lessons: completed as i64,
            total_lessons: total as i64,
            percentage,
            is_completed: percentage == 100,
            quiz_passed: passed_quizzes.contains(&module.id),
            is_unlocked,
        });
    }

    states
}

pub fn is_module_unlocked(states: &[ModuleState], module_id: i64) -> bool {
    states
        .iter()
        .any(|s| s.module_id == module_id && s.is_unlocked)
}

/// Module ids that are unlocked in `after` but were locked in `before`.
pub fn newly_unlocked(before: &[ModuleState], after: &[ModuleState]) -> Vec<i64> {
    after
        .iter()
        .filter(|s| s.is_unlocked && !is_module_unlocked(before, s.module_id))
        .map(|s| s.module_id)
        .collect()
}

pub fn completed_lessons(outline: &CourseOutline, completions: &HashSet<i64>) -> usize {
    outline
        .modules
        .iter()
        .flat_map(|m| m.lesson_ids.iter())
        .filter(|id| completions.contains(id))
        .count()
}

/// Course progress reads 100 and every quiz gate has a passing attempt.
/// Completion follows the rounded percentage, so it agrees with the
/// persisted `progress_percentage`.
pub fn is_course_complete(
    outline: &CourseOutline,
    completions: &HashSet<i64>,
    passed_quizzes: &HashSet<i64>,
) -> bool {
    course_percentage(outline, completions) == 100
        && outline
            .quiz_gated_modules()
            .all(|m| passed_quizzes.contains(&m.id))
}
