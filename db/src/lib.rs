use common::error::{AppError, Res};
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::{str::FromStr, sync::Arc};

pub mod key;
pub mod log;
pub mod memory;
pub mod operation;
pub mod postgres;
pub mod settings;
pub mod store;

pub mod models {
    pub mod key;
    pub mod log;
    pub mod operation;
    pub mod settings;
}

pub mod dtos {
    pub mod key;
    pub mod ledger;
    pub mod log;
}

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::Store;

/// Connects to Postgres, creating the database if it does not exist yet,
/// and runs the migrations.
pub async fn setup(database_url: &str, max_connections: u32) -> Res<Arc<PgPool>> {
    let url = url::Url::parse(database_url)
        .map_err(|e| AppError::Validation(format!("wrong DATABASE_URL: {}", e)))?;
    let db_name = url.path().trim_start_matches('/');

    let mut admin_url = url.clone();
    admin_url.set_path("/postgres");
    let admin_options = PgConnectOptions::from_str(admin_url.as_str())?;
    let admin_pool = PgPool::connect_with(admin_options).await?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&admin_pool)
            .await?;

    if !exists {
        sqlx::query(&format!("CREATE DATABASE \"{}\"", db_name))
            .execute(&admin_pool)
            .await?;
    }

    admin_pool.close().await;

    let options = PgConnectOptions::from_str(database_url)?;
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::Internal(format!("migration failed: {}", e)))?;

    Ok(Arc::new(pool))
}
