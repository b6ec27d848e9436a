#[macro_use]
extern crate rocket;

mod api;
mod auth;
mod certification;
mod db;
mod engine;
mod env;
mod error;
mod gamification;
mod locks;
mod models;
mod progress;
mod quiz;
mod reset;
mod telemetry;
#[cfg(test)]
mod test;
mod unlock;
mod validation;

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use api::{
    api_adjust_xp, api_certificates, api_claim_certificate, api_complete_lesson,
    api_course_progress, api_enroll, api_gamification_events, api_gamification_me,
    api_quiz_attempts, api_quiz_questions, api_reconcile, api_reset_course, api_save_note,
    api_submit_quiz, api_verify_certificate, health,
};
use auth::{forbidden_api, not_found_api, unauthorized_api, unprocessable_api};
use engine::Engine;
use env::{DEFAULT_DATABASE_URL, EngineConfig, load_environment};
use error::AppError;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use telemetry::{TelemetryFairing, init_tracing, shutdown_telemetry};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("{0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Application error: {0}")]
    App(#[from] AppError),
    #[error("{0}")]
    Rocket(Box<rocket::Error>),
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Error::Anyhow(value)
    }
}

impl From<rocket::Error> for Error {
    fn from(value: rocket::Error) -> Self {
        Error::Rocket(Box::new(value))
    }
}

async fn connect_database(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("Invalid DATABASE_URL: {}", database_url))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("Failed to connect to SQLite database")?;

    Ok(pool)
}

#[rocket::main]
async fn main() -> Result<(), Error> {
    load_environment()?;
    init_tracing()?;

    let config = EngineConfig::from_env()?;
    info!(
        pass_threshold = config.pass_threshold,
        lesson_xp = config.xp.lesson_completed,
        quiz_xp = config.xp.quiz_passed,
        course_xp = config.xp.course_completed,
        "Loaded engine configuration"
    );

    let database_url =
        dotenvy::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let pool = connect_database(&database_url).await?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(AppError::from)?;
    info!("Migrations completed successfully");

    let _rocket = init_rocket(pool, config).launch().await?;

    Ok(())
}

pub fn init_rocket(pool: SqlitePool, config: EngineConfig) -> Rocket<Build> {
    info!("Starting course progress engine");

    let engine = Engine::new(pool.clone(), config);

    rocket::build()
        .manage(pool)
        .manage(engine)
        .mount(
            "/api",
            routes![
                health,
                api_complete_lesson,
                api_course_progress,
                api_enroll,
                api_quiz_questions,
                api_submit_quiz,
                api_quiz_attempts,
                api_gamification_me,
                api_gamification_events,
                api_claim_certificate,
                api_certificates,
                api_verify_certificate,
                api_save_note,
                api_reset_course,
                api_adjust_xp,
                api_reconcile,
            ],
        )
        .register(
            "/api",
            catchers![unauthorized_api, forbidden_api, not_found_api, unprocessable_api],
        )
        .attach(TelemetryFairing)
        .attach(AdHoc::on_shutdown("Telemetry shutdown", |_| {
            Box::pin(async move {
                info!("Flushing telemetry");
                shutdown_telemetry();
            })
        }))
}
