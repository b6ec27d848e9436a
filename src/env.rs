use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, bail};
use tracing::{info, warn};

use crate::gamification::LevelCurve;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/progress.db?mode=rwc";

pub fn load_environment() -> anyhow::Result<()> {
    let is_production =
        dotenvy::var("ROCKET_PROFILE").unwrap_or("development".to_string()) == "production";

    let env_files = if is_production {
        vec!["config/common.env", "config/prod.env", ".secrets.env"]
    } else {
        vec!["config/common.env", "config/dev.env", ".secrets.env"]
    };

    for env_file in env_files {
        load_env_file(env_file)?;
    }

    Ok(())
}

fn load_env_file(path: &str) -> anyhow::Result<()> {
    if !Path::new(path).exists() {
        warn!("Environment file {} not found, skipping", path);
        return Ok(());
    }

    dotenvy::from_filename_override(path)
        .with_context(|| format!("Failed to load environment file {}", path))?;
    info!("Loaded environment from: {}", path);
    Ok(())
}

/// XP granted per event type. Only first occurrences are rewarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XpRewards {
    pub lesson_completed: i64,
    pub quiz_passed: i64,
    pub course_completed: i64,
}

impl Default for XpRewards {
    fn default() -> Self {
        Self {
            lesson_completed: 10,
            quiz_passed: 50,
            course_completed: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pass_threshold: i64,
    pub xp: XpRewards,
    pub level_curve: LevelCurve,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 70,
            xp: XpRewards::default(),
            level_curve: LevelCurve::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let pass_threshold = read_var("QUIZ_PASS_THRESHOLD", defaults.pass_threshold)?;
        if !(0..=100).contains(&pass_threshold) {
            bail!(
                "QUIZ_PASS_THRESHOLD must be between 0 and 100, got {}",
                pass_threshold
            );
        }

        let xp = XpRewards {
            lesson_completed: read_var("XP_LESSON_COMPLETED", defaults.xp.lesson_completed)?,
            quiz_passed: read_var("XP_QUIZ_PASSED", defaults.xp.quiz_passed)?,
            course_completed: read_var("XP_COURSE_COMPLETED", defaults.xp.course_completed)?,
        };
        if xp.lesson_completed < 0 || xp.quiz_passed < 0 || xp.course_completed < 0 {
            bail!("XP rewards must not be negative: {:?}", xp);
        }

        let level_curve = match dotenvy::var("LEVEL_THRESHOLDS") {
            Ok(raw) if !raw.trim().is_empty() => {
                let thresholds = raw
                    .split(',')
                    .map(|part| part.trim().parse::<i64>())
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("LEVEL_THRESHOLDS is not a number list: {}", raw))?;
                LevelCurve::new(thresholds)?
            }
            _ => defaults.level_curve,
        };

        Ok(Self {
            pass_threshold,
            xp,
            level_curve,
        })
    }
}

fn read_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenvy::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}
