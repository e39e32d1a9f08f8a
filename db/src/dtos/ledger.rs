use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::key::ApiKey;

/// Outcome of a reserve call. A rejection is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    pub admitted: bool,
    pub key_id: Uuid,
    /// Post-update balance when admitted, pre-attempt balance otherwise.
    pub remaining: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub remaining: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Grant {
    Applied(ApiKey),
    /// The operation id was seen before; the key is returned unchanged.
    AlreadyApplied(ApiKey),
}

impl Grant {
    pub fn key(&self) -> &ApiKey {
        match self {
            Grant::Applied(key) | Grant::AlreadyApplied(key) => key,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, Grant::Applied(_))
    }
}

/// Mutual exclusion decision for a project's periodic reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetGate {
    /// This period was already reset.
    Done { next_reset: DateTime<Utc> },
    /// Another run started within the grace window.
    InProgress { started: DateTime<Utc> },
    /// Caller owns the run; keys stamped before `period_start` are due.
    Proceed { period_start: DateTime<Utc> },
}
