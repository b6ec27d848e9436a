use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{info, instrument};

use crate::error::AppError;
use crate::models::{Badge, DbXpEvent, GamificationStats, UserBadge, XpEvent, XpEventType};

const STATS_COLUMNS: &str = "user_id, total_xp, current_level, xp_to_next_level, lessons_completed, courses_completed, certificates_earned, current_streak, longest_streak, last_activity_date";

/// Creates the stats row on first use; a no-op afterwards.
#[instrument(skip(conn))]
pub async fn ensure_stats(
    conn: &mut SqliteConnection,
    user_id: i64,
    xp_to_first_level: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO user_gamification_stats (user_id, xp_to_next_level)
         VALUES (?, ?)
         ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(xp_to_first_level)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[instrument(skip(conn))]
pub async fn find_stats(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Option<GamificationStats>, AppError> {
    let row = sqlx::query_as::<_, GamificationStats>(&format!(
        "SELECT {} FROM user_gamification_stats WHERE user_id = ?",
        STATS_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

pub struct NewXpEvent<'a> {
    pub user_id: i64,
    pub course_id: Option<i64>,
    pub event_type: XpEventType,
    pub xp_earned: i64,
    pub description: &'a str,
    pub audit_only: bool,
    pub created_at: DateTime<Utc>,
}

/// Appends to the ledger. Ledger rows are never updated.
#[instrument(skip_all, fields(user_id = event.user_id, event_type = %event.event_type, xp = event.xp_earned))]
pub async fn insert_xp_event(
    conn: &mut SqliteConnection,
    event: NewXpEvent<'_>,
) -> Result<i64, AppError> {
    if event.xp_earned < 0 && event.event_type != XpEventType::AdminAdjustment {
        return Err(AppError::Validation(format!(
            "Negative XP is only allowed for admin adjustments, got {} for {}",
            event.xp_earned, event.event_type
        )));
    }

    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO xp_events (user_id, course_id, event_type, xp_earned, description, audit_only, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(event.user_id)
    .bind(event.course_id)
    .bind(event.event_type.as_str())
    .bind(event.xp_earned)
    .bind(event.description)
    .bind(event.audit_only)
    .bind(event.created_at)
    .fetch_one(&mut *conn)
    .await?;

    info!(event_id = id, "Appended XP event");
    Ok(id)
}

/// Atomic `total_xp = max(0, total_xp + delta)`. Returns the new total.
#[instrument(skip(conn))]
pub async fn apply_xp_delta(
    conn: &mut SqliteConnection,
    user_id: i64,
    delta: i64,
    now: DateTime<Utc>,
) -> Result<i64, AppError> {
    let total = sqlx::query_scalar::<_, i64>(
        "UPDATE user_gamification_stats
         SET total_xp = MAX(0, total_xp + ?), updated_at = ?
         WHERE user_id = ?
         RETURNING total_xp",
    )
    .bind(delta)
    .bind(now)
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(total)
}

#[instrument(skip(conn))]
pub async fn set_level(
    conn: &mut SqliteConnection,
    user_id: i64,
    level: i64,
    xp_to_next_level: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE user_gamification_stats SET current_level = ?, xp_to_next_level = ? WHERE user_id = ?",
    )
    .bind(level)
    .bind(xp_to_next_level)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[instrument(skip(conn))]
pub async fn set_streak(
    conn: &mut SqliteConnection,
    user_id: i64,
    current_streak: i64,
    longest_streak: i64,
    last_activity_date: NaiveDate,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE user_gamification_stats
         SET current_streak = ?, longest_streak = ?, last_activity_date = ?
         WHERE user_id = ?",
    )
    .bind(current_streak)
    .bind(longest_streak)
    .bind(last_activity_date)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Signed, atomic counter deltas; every counter is floored at zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub lessons_completed: i64,
    pub courses_completed: i64,
    pub certificates_earned: i64,
}

#[instrument(skip(conn))]
pub async fn apply_counter_delta(
    conn: &mut SqliteConnection,
    user_id: i64,
    delta: CounterDelta,
) -> Result<(), AppError> {
    if delta == CounterDelta::default() {
        return Ok(());
    }

    sqlx::query(
        "UPDATE user_gamification_stats
         SET lessons_completed = MAX(0, lessons_completed + ?),
             courses_completed = MAX(0, courses_completed + ?),
             certificates_earned = MAX(0, certificates_earned + ?)
         WHERE user_id = ?",
    )
    .bind(delta.lessons_completed)
    .bind(delta.courses_completed)
    .bind(delta.certificates_earned)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Overwrites the derived counters and total; used only by reconciliation.
#[instrument(skip(conn))]
pub async fn overwrite_stats(
    conn: &mut SqliteConnection,
    stats: &GamificationStats,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE user_gamification_stats
         SET total_xp = ?, current_level = ?, xp_to_next_level = ?,
             lessons_completed = ?, courses_completed = ?, certificates_earned = ?
         WHERE user_id = ?",
    )
    .bind(stats.total_xp)
    .bind(stats.current_level)
    .bind(stats.xp_to_next_level)
    .bind(stats.lessons_completed)
    .bind(stats.courses_completed)
    .bind(stats.certificates_earned)
    .bind(stats.user_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Net XP and number of counted ledger entries scoped to one course.
#[instrument(skip(conn))]
pub async fn course_xp_summary(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<(i64, i64), AppError> {
    let summary = sqlx::query_as::<_, (i64, i64)>(
        "SELECT COALESCE(SUM(xp_earned), 0), COUNT(*)
         FROM xp_events
         WHERE user_id = ? AND course_id = ? AND audit_only = 0",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(summary)
}

/// Removes the counted entries for one course; audit entries survive.
#[instrument(skip(conn))]
pub async fn delete_course_xp_events(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<u64, AppError> {
    let result = sqlx::query(
        "DELETE FROM xp_events WHERE user_id = ? AND course_id = ? AND audit_only = 0",
    )
    .bind(user_id)
    .bind(course_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Counted ledger amounts in the order they were appended.
#[instrument(skip(conn))]
pub async fn counted_xp_amounts(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Vec<i64>, AppError> {
    let amounts = sqlx::query_scalar::<_, i64>(
        "SELECT xp_earned FROM xp_events
         WHERE user_id = ? AND audit_only = 0
         ORDER BY created_at, id",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(amounts)
}

#[instrument(skip(pool))]
pub async fn list_xp_events(
    pool: &Pool<Sqlite>,
    user_id: i64,
    limit: i64,
) -> Result<Vec<XpEvent>, AppError> {
    let rows = sqlx::query_as::<_, DbXpEvent>(
        "SELECT id, user_id, course_id, event_type, xp_earned, description, audit_only, created_at
         FROM xp_events
         WHERE user_id = ?
         ORDER BY created_at DESC, id DESC
         LIMIT ?",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(XpEvent::try_from).collect()
}

#[instrument(skip(conn))]
pub async fn active_badges(conn: &mut SqliteConnection) -> Result<Vec<Badge>, AppError> {
    let rows = sqlx::query_as::<_, Badge>(
        "SELECT id, name, description, requirement_type, requirement_value, is_active, order_index
         FROM badges
         WHERE is_active = 1
         ORDER BY order_index, id",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

#[instrument(skip(conn))]
pub async fn owned_badge_ids(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<HashSet<i64>, AppError> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT badge_id FROM user_badges WHERE user_id = ?")
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(ids.into_iter().collect())
}

/// Returns true when the badge was newly recorded.
#[instrument(skip(conn))]
pub async fn insert_user_badge(
    conn: &mut SqliteConnection,
    user_id: i64,
    badge_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "INSERT INTO user_badges (user_id, badge_id, unlocked_at)
         VALUES (?, ?, ?)
         ON CONFLICT (user_id, badge_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(badge_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[instrument(skip(conn))]
pub async fn list_user_badges(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Vec<UserBadge>, AppError> {
    let rows = sqlx::query_as::<_, UserBadge>(
        "SELECT ub.badge_id, b.name, b.description, ub.unlocked_at
         FROM user_badges ub
         JOIN badges b ON b.id = ub.badge_id
         WHERE ub.user_id = ?
         ORDER BY ub.unlocked_at, b.order_index",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}
