use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-project reset bookkeeping.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct Settings {
    pub project: String,
    pub reset_started: Option<DateTime<Utc>>,
    pub next_reset: Option<DateTime<Utc>>,
    pub updated: DateTime<Utc>,
}
