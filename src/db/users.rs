use sqlx::SqliteConnection;
use tracing::{info, instrument};

use crate::auth::{DbUser, User};
use crate::error::AppError;

#[instrument(skip(conn))]
pub async fn get_user(conn: &mut SqliteConnection, id: i64) -> Result<User, AppError> {
    info!("Fetching user by ID");
    let row = sqlx::query_as::<_, DbUser>(
        "SELECT id, username, role, display_name FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(user) => User::try_from(user),
        _ => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}
