use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub total_modules: i64,
    pub total_lessons: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
    pub order_index: i64,
    pub requires_quiz: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: i64,
    pub module_id: i64,
    pub title: String,
    pub order_index: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LessonCompletion {
    pub user_id: i64,
    pub lesson_id: i64,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub watch_time_seconds: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub user_id: i64,
    pub course_id: i64,
    pub progress_percentage: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Sentinel placed in `correct_answer` when a question is served without
/// its answer key.
pub const HIDDEN_ANSWER: i64 = -1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub id: i64,
    pub module_id: i64,
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: i64,
    pub explanation: Option<String>,
    pub order_index: i64,
    pub difficulty: String,
    pub points: i64,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbQuizQuestion {
    pub id: i64,
    pub module_id: i64,
    pub question: String,
    pub options: String,
    pub correct_answer: i64,
    pub explanation: Option<String>,
    pub order_index: i64,
    pub difficulty: String,
    pub points: i64,
}

impl TryFrom<DbQuizQuestion> for QuizQuestion {
    type Error = AppError;

    fn try_from(row: DbQuizQuestion) -> Result<Self, Self::Error> {
        let options: Vec<String> = serde_json::from_str(&row.options)?;
        if options.is_empty() {
            return Err(AppError::Internal(format!(
                "Quiz question {} has no options",
                row.id
            )));
        }
        if row.correct_answer < 0 || row.correct_answer as usize >= options.len() {
            return Err(AppError::Internal(format!(
                "Quiz question {} has correct answer {} outside its {} options",
                row.id,
                row.correct_answer,
                options.len()
            )));
        }

        Ok(Self {
            id: row.id,
            module_id: row.module_id,
            question: row.question,
            options,
            correct_answer: row.correct_answer,
            explanation: row.explanation,
            order_index: row.order_index,
            difficulty: row.difficulty,
            points: row.points,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub question_id: i64,
    pub selected_answer: i64,
    pub is_correct: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttempt {
    pub id: i64,
    pub user_id: i64,
    pub module_id: i64,
    pub score: i64,
    pub total_questions: i64,
    pub correct_answers: i64,
    pub passed: bool,
    pub answers: Vec<AnswerRecord>,
    pub completed_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbQuizAttempt {
    pub id: i64,
    pub user_id: i64,
    pub module_id: i64,
    pub score: i64,
    pub total_questions: i64,
    pub correct_answers: i64,
    pub passed: bool,
    pub answers_json: String,
    pub completed_at: DateTime<Utc>,
}

impl TryFrom<DbQuizAttempt> for QuizAttempt {
    type Error = AppError;

    fn try_from(row: DbQuizAttempt) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            module_id: row.module_id,
            score: row.score,
            total_questions: row.total_questions,
            correct_answers: row.correct_answers,
            passed: row.passed,
            answers: serde_json::from_str(&row.answers_json)?,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum XpEventType {
    LessonCompleted,
    QuizPassed,
    CourseCompleted,
    AdminAdjustment,
}

impl XpEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            XpEventType::LessonCompleted => "lesson_completed",
            XpEventType::QuizPassed => "quiz_passed",
            XpEventType::CourseCompleted => "course_completed",
            XpEventType::AdminAdjustment => "admin_adjustment",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "lesson_completed" => Ok(XpEventType::LessonCompleted),
            "quiz_passed" => Ok(XpEventType::QuizPassed),
            "course_completed" => Ok(XpEventType::CourseCompleted),
            "admin_adjustment" => Ok(XpEventType::AdminAdjustment),
            other => Err(AppError::Internal(format!("Unknown XP event type: {}", other))),
        }
    }

    /// Learner activity keeps the daily streak alive; admin entries do not.
    pub fn is_activity(&self) -> bool {
        !matches!(self, XpEventType::AdminAdjustment)
    }
}

impl fmt::Display for XpEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XpEvent {
    pub id: i64,
    pub user_id: i64,
    pub course_id: Option<i64>,
    pub event_type: XpEventType,
    pub xp_earned: i64,
    pub description: String,
    pub audit_only: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbXpEvent {
    pub id: i64,
    pub user_id: i64,
    pub course_id: Option<i64>,
    pub event_type: String,
    pub xp_earned: i64,
    pub description: String,
    pub audit_only: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbXpEvent> for XpEvent {
    type Error = AppError;

    fn try_from(row: DbXpEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            course_id: row.course_id,
            event_type: XpEventType::parse(&row.event_type)?,
            xp_earned: row.xp_earned,
            description: row.description,
            audit_only: row.audit_only,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GamificationStats {
    pub user_id: i64,
    pub total_xp: i64,
    pub current_level: i64,
    pub xp_to_next_level: i64,
    pub lessons_completed: i64,
    pub courses_completed: i64,
    pub certificates_earned: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_activity_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub id: i64,
    pub user_id: i64,
    pub course_id: i64,
    pub module_id: Option<i64>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub certificate_number: String,
    pub title: String,
    pub description: String,
    pub issued_at: DateTime<Utc>,
}

pub const COURSE_CERTIFICATE: &str = "course";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub requirement_type: String,
    pub requirement_value: i64,
    pub is_active: bool,
    pub order_index: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserBadge {
    pub badge_id: i64,
    pub name: String,
    pub description: String,
    pub unlocked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LessonNote {
    pub user_id: i64,
    pub lesson_id: i64,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}
