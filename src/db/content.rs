use std::collections::HashMap;

use sqlx::SqliteConnection;
use tracing::{debug, info, instrument};

use crate::error::AppError;
use crate::models::{Course, Lesson, Module};
use crate::unlock::{CourseOutline, ModuleOutline};

#[instrument(skip(conn))]
pub async fn get_course(conn: &mut SqliteConnection, id: i64) -> Result<Course, AppError> {
    sqlx::query_as::<_, Course>(
        "SELECT id, title, total_modules, total_lessons FROM courses WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Course {} not found", id)))
}

#[instrument(skip(conn))]
pub async fn get_module(conn: &mut SqliteConnection, id: i64) -> Result<Module, AppError> {
    sqlx::query_as::<_, Module>(
        "SELECT id, course_id, title, order_index, requires_quiz FROM modules WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Module {} not found", id)))
}

#[instrument(skip(conn))]
pub async fn get_lesson(conn: &mut SqliteConnection, id: i64) -> Result<Lesson, AppError> {
    sqlx::query_as::<_, Lesson>(
        "SELECT id, module_id, title, order_index FROM lessons WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Lesson {} not found", id)))
}

/// Modules in order with their lesson ids, also in order.
#[instrument(skip(conn))]
pub async fn get_course_outline(
    conn: &mut SqliteConnection,
    course_id: i64,
) -> Result<CourseOutline, AppError> {
    let modules = sqlx::query_as::<_, Module>(
        "SELECT id, course_id, title, order_index, requires_quiz
         FROM modules
         WHERE course_id = ?
         ORDER BY order_index",
    )
    .bind(course_id)
    .fetch_all(&mut *conn)
    .await?;

    let lessons = sqlx::query_as::<_, (i64, i64)>(
        "SELECT l.id, l.module_id
         FROM lessons l
         JOIN modules m ON m.id = l.module_id
         WHERE m.course_id = ?
         ORDER BY m.order_index, l.order_index",
    )
    .bind(course_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut lessons_by_module: HashMap<i64, Vec<i64>> = HashMap::new();
    for (lesson_id, module_id) in lessons {
        lessons_by_module.entry(module_id).or_default().push(lesson_id);
    }

    let modules: Vec<ModuleOutline> = modules
        .into_iter()
        .map(|m| ModuleOutline {
            lesson_ids: lessons_by_module.remove(&m.id).unwrap_or_default(),
            id: m.id,
            order_index: m.order_index,
            requires_quiz: m.requires_quiz,
        })
        .collect();

    debug!(modules = modules.len(), "Loaded course outline");

    Ok(CourseOutline { course_id, modules })
}

/// Recomputes the denormalized module and lesson counts in one statement.
/// Returns true when the stored counts were stale.
#[instrument(skip(conn))]
pub async fn refresh_course_totals(
    conn: &mut SqliteConnection,
    course_id: i64,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE courses
         SET total_modules = (SELECT COUNT(*) FROM modules WHERE course_id = courses.id),
             total_lessons = (SELECT COUNT(*) FROM lessons l
                              JOIN modules m ON m.id = l.module_id
                              WHERE m.course_id = courses.id)
         WHERE id = ?
           AND (total_modules != (SELECT COUNT(*) FROM modules WHERE course_id = courses.id)
                OR total_lessons != (SELECT COUNT(*) FROM lessons l
                                     JOIN modules m ON m.id = l.module_id
                                     WHERE m.course_id = courses.id))",
    )
    .bind(course_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[instrument(skip(conn))]
pub async fn create_course(conn: &mut SqliteConnection, title: &str) -> Result<Course, AppError> {
    info!("Creating course");
    let course = sqlx::query_as::<_, Course>(
        "INSERT INTO courses (title) VALUES (?)
         RETURNING id, title, total_modules, total_lessons",
    )
    .bind(title)
    .fetch_one(&mut *conn)
    .await?;

    Ok(course)
}

#[instrument(skip(conn))]
pub async fn create_module(
    conn: &mut SqliteConnection,
    course_id: i64,
    title: &str,
    order_index: i64,
    requires_quiz: bool,
) -> Result<Module, AppError> {
    info!("Creating module");
    let module = sqlx::query_as::<_, Module>(
        "INSERT INTO modules (course_id, title, order_index, requires_quiz)
         VALUES (?, ?, ?, ?)
         RETURNING id, course_id, title, order_index, requires_quiz",
    )
    .bind(course_id)
    .bind(title)
    .bind(order_index)
    .bind(requires_quiz)
    .fetch_one(&mut *conn)
    .await?;

    refresh_course_totals(conn, course_id).await?;
    Ok(module)
}

#[instrument(skip(conn))]
pub async fn create_lesson(
    conn: &mut SqliteConnection,
    module_id: i64,
    title: &str,
    order_index: i64,
) -> Result<Lesson, AppError> {
    info!("Creating lesson");
    let lesson = sqlx::query_as::<_, Lesson>(
        "INSERT INTO lessons (module_id, title, order_index)
         VALUES (?, ?, ?)
         RETURNING id, module_id, title, order_index",
    )
    .bind(module_id)
    .bind(title)
    .bind(order_index)
    .fetch_one(&mut *conn)
    .await?;

    let course_id = get_module(conn, module_id).await?.course_id;
    refresh_course_totals(conn, course_id).await?;
    Ok(lesson)
}

pub struct NewQuizQuestion<'a> {
    pub module_id: i64,
    pub question: &'a str,
    pub options: &'a [&'a str],
    pub correct_answer: i64,
    pub explanation: Option<&'a str>,
    pub order_index: i64,
}

#[instrument(skip_all, fields(module_id = new.module_id))]
pub async fn create_quiz_question(
    conn: &mut SqliteConnection,
    new: NewQuizQuestion<'_>,
) -> Result<i64, AppError> {
    if new.correct_answer < 0 || new.correct_answer as usize >= new.options.len() {
        return Err(AppError::Validation(format!(
            "Correct answer {} is not one of the {} options",
            new.correct_answer,
            new.options.len()
        )));
    }

    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO quiz_questions (module_id, question, options, correct_answer, explanation, order_index)
         VALUES (?, ?, ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(new.module_id)
    .bind(new.question)
    .bind(serde_json::to_string(new.options)?)
    .bind(new.correct_answer)
    .bind(new.explanation)
    .bind(new.order_index)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

#[instrument(skip(conn))]
pub async fn create_badge(
    conn: &mut SqliteConnection,
    name: &str,
    requirement_type: &str,
    requirement_value: i64,
    order_index: i64,
) -> Result<i64, AppError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO badges (name, description, requirement_type, requirement_value, order_index)
         VALUES (?, ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(name)
    .bind(format!("Reach {} {}", requirement_value, requirement_type.replace('_', " ")))
    .bind(requirement_type)
    .bind(requirement_value)
    .bind(order_index)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}
