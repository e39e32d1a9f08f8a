use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub key_id: Option<Uuid>,
    pub fail: Option<bool>,
    pub ending_before: Option<DateTime<Utc>>,
    pub starting_after: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}
