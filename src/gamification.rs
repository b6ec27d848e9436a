//! XP ledger, level curve, streaks and badges.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

use crate::db::{self, CounterDelta, NewXpEvent};
use crate::engine::{Engine, load_course_state};
use crate::env::EngineConfig;
use crate::error::AppError;
use crate::models::{GamificationStats, UserBadge, XpEvent, XpEventType};
use crate::reset::ensure_no_pending_reset;

const DEFAULT_THRESHOLDS: [i64; 10] = [0, 100, 250, 500, 1000, 2000, 3500, 5500, 8000, 11000];

/// Cumulative XP needed for each level, starting at level 1 with 0 XP.
/// Past the last threshold levels keep coming at the final step size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelCurve {
    thresholds: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelInfo {
    pub level: i64,
    pub xp_to_next_level: i64,
}

impl Default for LevelCurve {
    fn default() -> Self {
        Self {
            thresholds: DEFAULT_THRESHOLDS.to_vec(),
        }
    }
}

impl LevelCurve {
    pub fn new(thresholds: Vec<i64>) -> Result<Self, AppError> {
        if thresholds.len() < 2 {
            return Err(AppError::Validation(
                "A level curve needs at least two thresholds".to_string(),
            ));
        }
        if thresholds[0] != 0 {
            return Err(AppError::Validation(format!(
                "The first level threshold must be 0, got {}",
                thresholds[0]
            )));
        }
        if thresholds.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(AppError::Validation(format!(
                "Level thresholds must be strictly increasing: {:?}",
                thresholds
            )));
        }

        Ok(Self { thresholds })
    }

    pub fn level_for(&self, total_xp: i64) -> LevelInfo {
        let xp = total_xp.max(0);
        let reached = self.thresholds.partition_point(|threshold| *threshold <= xp);

        if reached < self.thresholds.len() {
            return LevelInfo {
                level: reached as i64,
                xp_to_next_level: self.thresholds[reached] - xp,
            };
        }

        let last = self.thresholds[self.thresholds.len() - 1];
        let step = last - self.thresholds[self.thresholds.len() - 2];
        let extra = (xp - last) / step;

        LevelInfo {
            level: self.thresholds.len() as i64 + extra,
            xp_to_next_level: last + (extra + 1) * step - xp,
        }
    }
}

/// Streak after activity on `today` given the previous activity date.
pub fn next_streak(
    current: i64,
    longest: i64,
    last_activity: Option<NaiveDate>,
    today: NaiveDate,
) -> (i64, i64) {
    let current = match last_activity {
        Some(last) if last == today => current.max(1),
        Some(last) if last + Duration::days(1) == today => current + 1,
        _ => 1,
    };
    (current, longest.max(current))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementType {
    TotalXp,
    Level,
    LessonsCompleted,
    CoursesCompleted,
    CertificatesEarned,
    StreakDays,
}

impl RequirementType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "total_xp" => Some(RequirementType::TotalXp),
            "level" => Some(RequirementType::Level),
            "lessons_completed" => Some(RequirementType::LessonsCompleted),
            "courses_completed" => Some(RequirementType::CoursesCompleted),
            "certificates_earned" => Some(RequirementType::CertificatesEarned),
            "streak_days" => Some(RequirementType::StreakDays),
            _ => None,
        }
    }

    pub fn current_value(&self, stats: &GamificationStats) -> i64 {
        match self {
            RequirementType::TotalXp => stats.total_xp,
            RequirementType::Level => stats.current_level,
            RequirementType::LessonsCompleted => stats.lessons_completed,
            RequirementType::CoursesCompleted => stats.courses_completed,
            RequirementType::CertificatesEarned => stats.certificates_earned,
            RequirementType::StreakDays => stats.longest_streak,
        }
    }
}

/// Replays counted ledger amounts with the same clamping the live total uses.
pub fn replay_total(amounts: &[i64]) -> i64 {
    amounts
        .iter()
        .fold(0i64, |total, amount| (total + amount).max(0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XpAward {
    pub amount: i64,
    pub total_xp: i64,
    pub level: LevelInfo,
    pub leveled_up: bool,
}

async fn load_stats(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    user_id: i64,
) -> Result<GamificationStats, AppError> {
    let first_level = config.level_curve.level_for(0);
    db::ensure_stats(conn, user_id, first_level.xp_to_next_level).await?;
    db::find_stats(conn, user_id).await?.ok_or_else(|| {
        AppError::Inconsistency(format!("Stats row for user {} vanished", user_id))
    })
}

/// Appends one ledger entry and applies it to the cached total. Runs inside
/// the caller's transaction.
#[instrument(skip(conn, config, description))]
pub async fn award_xp(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    user_id: i64,
    course_id: Option<i64>,
    event_type: XpEventType,
    amount: i64,
    description: &str,
    now: DateTime<Utc>,
) -> Result<XpAward, AppError> {
    let before = load_stats(conn, config, user_id).await?;

    db::insert_xp_event(
        conn,
        NewXpEvent {
            user_id,
            course_id,
            event_type,
            xp_earned: amount,
            description,
            audit_only: false,
            created_at: now,
        },
    )
    .await?;

    let total_xp = db::apply_xp_delta(conn, user_id, amount, now).await?;
    let level = config.level_curve.level_for(total_xp);
    db::set_level(conn, user_id, level.level, level.xp_to_next_level).await?;

    if event_type.is_activity() {
        let (current, longest) = next_streak(
            before.current_streak,
            before.longest_streak,
            before.last_activity_date,
            now.date_naive(),
        );
        db::set_streak(conn, user_id, current, longest, now.date_naive()).await?;
    }

    let leveled_up = level.level > before.current_level;
    if leveled_up {
        info!(user_id, level = level.level, "User reached a new level");
    }

    Ok(XpAward {
        amount,
        total_xp,
        level,
        leveled_up,
    })
}

#[instrument(skip(conn, config))]
pub async fn apply_counters(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    user_id: i64,
    delta: CounterDelta,
) -> Result<(), AppError> {
    load_stats(conn, config, user_id).await?;
    db::apply_counter_delta(conn, user_id, delta).await
}

/// Recomputes the level from the cached total.
#[instrument(skip(conn, config))]
pub async fn refresh_level(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    user_id: i64,
) -> Result<LevelInfo, AppError> {
    let stats = load_stats(conn, config, user_id).await?;
    let level = config.level_curve.level_for(stats.total_xp);
    db::set_level(conn, user_id, level.level, level.xp_to_next_level).await?;
    Ok(level)
}

/// Records every active badge whose requirement the current stats meet.
/// Returns the names of badges unlocked by this call.
#[instrument(skip(conn, config))]
pub async fn evaluate_badges(
    conn: &mut SqliteConnection,
    config: &EngineConfig,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<String>, AppError> {
    let stats = load_stats(conn, config, user_id).await?;
    let owned = db::owned_badge_ids(conn, user_id).await?;
    let mut unlocked = Vec::new();

    for badge in db::active_badges(conn).await? {
        if owned.contains(&badge.id) {
            continue;
        }

        let Some(requirement) = RequirementType::parse(&badge.requirement_type) else {
            warn!(badge_id = badge.id, requirement = %badge.requirement_type, "Skipping badge with unknown requirement");
            continue;
        };

        if requirement.current_value(&stats) >= badge.requirement_value
            && db::insert_user_badge(conn, user_id, badge.id, now).await?
        {
            info!(user_id, badge = %badge.name, "Badge unlocked");
            unlocked.push(badge.name);
        }
    }

    Ok(unlocked)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GamificationSummary {
    pub stats: GamificationStats,
    pub level: LevelInfo,
    pub badges: Vec<UserBadge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Drift {
    pub field: String,
    pub cached: i64,
    pub recomputed: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub user_id: i64,
    pub drift: Vec<Drift>,
    pub repaired: bool,
}

impl Engine {
    #[instrument(skip(self))]
    pub async fn gamification_summary(&self, user_id: i64) -> Result<GamificationSummary, AppError> {
        let mut conn = self.pool().acquire().await?;
        let stats = load_stats(&mut *conn, self.config(), user_id).await?;
        let badges = db::list_user_badges(&mut *conn, user_id).await?;

        Ok(GamificationSummary {
            level: self.config().level_curve.level_for(stats.total_xp),
            stats,
            badges,
        })
    }

    #[instrument(skip(self))]
    pub async fn xp_events(&self, user_id: i64, limit: i64) -> Result<Vec<XpEvent>, AppError> {
        db::list_xp_events(self.pool(), user_id, limit.clamp(1, 200)).await
    }

    /// Signed manual correction. The ledger keeps the full amount while the
    /// cached total is clamped at zero.
    #[instrument(skip(self, description))]
    pub async fn adjust_xp(
        &self,
        user_id: i64,
        amount: i64,
        description: &str,
        course_id: Option<i64>,
    ) -> Result<XpAward, AppError> {
        if amount == 0 {
            return Err(AppError::Validation(
                "An XP adjustment must not be zero".to_string(),
            ));
        }

        let _guard = match course_id {
            Some(course_id) => Some(self.lock_course(user_id, course_id).await),
            None => None,
        };

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        db::get_user(&mut *tx, user_id).await?;
        if let Some(course_id) = course_id {
            db::get_course(&mut *tx, course_id).await?;
            ensure_no_pending_reset(&mut *tx, user_id, course_id).await?;
        }

        let award = award_xp(
            &mut *tx,
            self.config(),
            user_id,
            course_id,
            XpEventType::AdminAdjustment,
            amount,
            description,
            now,
        )
        .await?;
        evaluate_badges(&mut *tx, self.config(), user_id, now).await?;
        tx.commit().await?;

        info!(user_id, amount, total_xp = award.total_xp, "Applied admin XP adjustment");
        Ok(award)
    }

    /// Recomputes every derived cache for a user from the source-of-truth
    /// rows and reports where the caches disagree.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, user_id: i64, repair: bool) -> Result<ReconcileReport, AppError> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        db::get_user(&mut *tx, user_id).await?;

        let cached = load_stats(&mut *tx, self.config(), user_id).await?;
        let mut drift = Vec::new();
        let mut stale_enrollments = Vec::new();

        for enrollment in db::list_enrollments(&mut *tx, user_id).await? {
            let state = load_course_state(&mut *tx, user_id, enrollment.course_id).await?;
            let recomputed = state.percentage();
            if recomputed != enrollment.progress_percentage {
                drift.push(Drift {
                    field: format!("course:{}:progressPercentage", enrollment.course_id),
                    cached: enrollment.progress_percentage,
                    recomputed,
                });
                stale_enrollments.push((enrollment.course_id, recomputed));
            }
        }

        let total_xp = replay_total(&db::counted_xp_amounts(&mut *tx, user_id).await?);
        let level = self.config().level_curve.level_for(total_xp);
        let recomputed = GamificationStats {
            total_xp,
            current_level: level.level,
            xp_to_next_level: level.xp_to_next_level,
            lessons_completed: db::count_completed_lessons(&mut *tx, user_id).await?,
            courses_completed: db::count_completed_enrollments(&mut *tx, user_id).await?,
            certificates_earned: db::count_certificates(&mut *tx, user_id).await?,
            ..cached.clone()
        };

        let fields = [
            ("totalXp", cached.total_xp, recomputed.total_xp),
            ("currentLevel", cached.current_level, recomputed.current_level),
            ("xpToNextLevel", cached.xp_to_next_level, recomputed.xp_to_next_level),
            ("lessonsCompleted", cached.lessons_completed, recomputed.lessons_completed),
            ("coursesCompleted", cached.courses_completed, recomputed.courses_completed),
            ("certificatesEarned", cached.certificates_earned, recomputed.certificates_earned),
        ];
        drift.extend(
            fields
                .into_iter()
                .filter(|(_, cached, recomputed)| cached != recomputed)
                .map(|(field, cached, recomputed)| Drift {
                    field: field.to_string(),
                    cached,
                    recomputed,
                }),
        );

        if drift.is_empty() {
            tx.commit().await?;
            return Ok(ReconcileReport {
                user_id,
                drift,
                repaired: false,
            });
        }

        AppError::Inconsistency(format!(
            "User {} has {} drifting derived values",
            user_id,
            drift.len()
        ))
        .log_and_record("Reconciling derived state");

        if repair {
            for (course_id, percentage) in stale_enrollments {
                db::set_progress_percentage(&mut *tx, user_id, course_id, percentage).await?;
            }
            db::overwrite_stats(&mut *tx, &recomputed).await?;

            let xp_delta = recomputed.total_xp - cached.total_xp;
            if xp_delta != 0 {
                db::insert_xp_event(
                    &mut *tx,
                    NewXpEvent {
                        user_id,
                        course_id: None,
                        event_type: XpEventType::AdminAdjustment,
                        xp_earned: xp_delta,
                        description: "Reconciliation repair",
                        audit_only: true,
                        created_at: now,
                    },
                )
                .await?;
            }
            evaluate_badges(&mut *tx, self.config(), user_id, now).await?;
            info!(user_id, fields = drift.len(), "Repaired derived state");
        }

        tx.commit().await?;
        Ok(ReconcileReport {
            user_id,
            drift,
            repaired: repair,
        })
    }
}
