use chrono::{DateTime, Utc};
use common::error::{AppError, Res};
use sqlx::{Executor, Postgres};

use crate::models::settings::Settings;

pub async fn ensure_settings<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    project: &str,
) -> Res<()> {
    sqlx::query("INSERT INTO settings (project, updated) VALUES ($1, $2) ON CONFLICT (project) DO NOTHING")
        .bind(project)
        .bind(Utc::now())
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn get_settings_for_update<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    project: &str,
) -> Res<Settings> {
    sqlx::query_as::<_, Settings>("SELECT * FROM settings WHERE project = $1 FOR UPDATE")
        .bind(project)
        .fetch_one(executor)
        .await
        .map_err(AppError::from)
}

pub async fn update_settings<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    project: &str,
    reset_started: Option<DateTime<Utc>>,
    next_reset: Option<DateTime<Utc>>,
) -> Res<()> {
    sqlx::query(
        r#"
        UPDATE settings
        SET reset_started = COALESCE($1, reset_started),
            next_reset = COALESCE($2, next_reset),
            updated = $3
        WHERE project = $4
        "#,
    )
    .bind(reset_started)
    .bind(next_reset)
    .bind(Utc::now())
    .bind(project)
    .execute(executor)
    .await?;
    Ok(())
}
