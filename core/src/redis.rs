use common::error::{AppError, Res};

pub fn setup_redis(url: &str) -> Res<deadpool_redis::Pool> {
    let cfg = deadpool_redis::Config::from_url(url);
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| AppError::Internal(format!("Failed to create pool of Redis connections: {}", e)))
}
