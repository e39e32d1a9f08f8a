use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Idempotency record of a credit grant, unique per `(key_id, id)`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct Operation {
    pub id: String,
    pub key_id: Uuid,
    pub date: DateTime<Utc>,
    pub quota_value: f64,
    pub msg: String,
}
