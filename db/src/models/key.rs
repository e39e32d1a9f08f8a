use chrono::{DateTime, TimeZone, Utc};
use common::error::{AppError, Res};
use serde::Serialize;
use uuid::Uuid;

/// A quota account: an explicit API key or an IP-derived identity.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub project: String,
    /// Keyed hash of the secret, or the literal IP for IP identities.
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub manual: bool,
    pub quota_limit: f64,
    pub quota_value: f64,
    pub quota_value_failed: f64,
    pub valid_to: DateTime<Utc>,
    pub disabled: bool,
    /// Comma separated CIDR list; empty allows every address.
    pub ip_white_list: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_ip: Option<String>,
    pub reset_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub description: String,
    pub external_id: Option<String>,
}

impl ApiKey {
    pub fn remaining(&self) -> f64 {
        self.quota_limit - self.quota_value
    }

    /// Limit after granting `amount`. Corrections may not push the limit
    /// below zero or below what was already consumed.
    pub fn granted_limit(&self, amount: f64) -> Res<f64> {
        let limit = self.quota_limit + amount;
        if limit < 0.0 {
            return Err(AppError::Validation(format!(
                "limit would become negative ({})",
                limit
            )));
        }
        if amount < 0.0 && limit < self.quota_value {
            return Err(AppError::Validation(format!(
                "limit {} would fall below used {}",
                limit, self.quota_value
            )));
        }
        Ok(limit)
    }
}

/// Expiry given to auto-provisioned IP identities.
pub fn ip_key_valid_to() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
