use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct Log {
    pub request_id: Uuid,
    pub key_id: Option<Uuid>,
    pub url: String,
    pub quota_value: f64,
    pub date: DateTime<Utc>,
    pub ip: String,
    pub value: Option<String>,
    pub fail: bool,
    pub response_code: i32,
    pub error_msg: Option<String>,
}
