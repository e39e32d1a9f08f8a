use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use common::{
    date::start_of_month,
    error::{AppError, Res},
    ip::parse_white_list,
    tag,
};
use uuid::Uuid;

use crate::{
    dtos::{
        key::{KeyCreateRequest, KeyRef},
        ledger::{Balance, Grant, Reservation, ResetGate},
        log::LogFilter,
    },
    models::{key::ApiKey, log::Log, operation::Operation, settings::Settings},
};

pub const CREATE_KEY_MSG: &str = "Create Key";
pub const RESET_MSG: &str = "monthly reset";

/// Top-ups smaller than this are rounding noise.
const MIN_TOP_UP: f64 = 1e-9;

/// Persistence of keys, the credit ledger, request logs and reset state.
///
/// Every ledger operation is atomic per key row. Implementations may be
/// shared by many gateway instances, so no correctness may depend on
/// in-process state.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_key(&self, key: &KeyRef) -> Res<Option<ApiKey>>;

    async fn get_key(&self, key_id: Uuid) -> Res<ApiKey>;

    /// Returns the IP identity of `ip`, creating it with `limit` credits on
    /// first sight. Concurrent first hits end up on one row.
    async fn check_create_ip_key(&self, project: &str, ip: &str, limit: f64) -> Res<Uuid>;

    /// Creates an explicit key together with the operation for its initial credits.
    async fn create_key(&self, data: KeyCreateRequest) -> Res<ApiKey>;

    async fn set_disabled(&self, key_id: Uuid, disabled: bool) -> Res<ApiKey>;

    /// Merges `tags` into the key's tags; an empty value removes a name.
    async fn update_tags(&self, key_id: Uuid, tags: &[String]) -> Res<ApiKey>;

    /// Atomically charges `cost` if it fits into the remaining balance.
    ///
    /// A rejection books `cost` into the failed counter and reports the
    /// balance as it was before the attempt.
    async fn reserve(&self, key: &KeyRef, ip: &str, cost: f64) -> Res<Reservation>;

    /// Moves `cost` from the used to the failed counter, without re-validation.
    async fn restore(&self, key: &KeyRef, cost: f64) -> Res<Balance>;

    /// Restores the cost of a logged request once. A second call is a `Conflict`.
    async fn restore_usage(&self, request_id: Uuid, error_msg: &str) -> Res<ApiKey>;

    /// Raises (or lowers) the limit by `amount`, once per `operation_id`.
    async fn grant_credits(
        &self,
        key_id: Uuid,
        operation_id: &str,
        amount: f64,
        msg: &str,
    ) -> Res<Grant>;

    async fn get_operations(&self, key_id: Uuid) -> Res<Vec<Operation>>;

    async fn save_log(&self, log: &Log) -> Res<()>;

    async fn get_logs(&self, filter: LogFilter) -> Res<Vec<Log>>;

    /// Claims the project's reset run for `now`, or says why not.
    async fn begin_reset(&self, project: &str, now: DateTime<Utc>, grace: Duration)
    -> Res<ResetGate>;

    async fn resettable_keys(
        &self,
        project: &str,
        now: DateTime<Utc>,
        period_start: DateTime<Utc>,
    ) -> Res<Vec<ApiKey>>;

    /// Brings the key back to `target` remaining credits and stamps `reset_at`,
    /// in one unit under the key's lock.
    ///
    /// The top-up is computed from the locked row. `None` when the key was
    /// already reset in the period starting at `period_start`, or when it
    /// holds at least `target`; such a key is left untouched.
    async fn reset_key(
        &self,
        key_id: Uuid,
        operation_id: &str,
        target: f64,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Res<Option<Grant>>;

    async fn finish_reset(&self, project: &str, next_reset: DateTime<Utc>) -> Res<()>;
}

pub(crate) fn check_operation_id(operation_id: &str) -> Res<()> {
    if operation_id.trim().is_empty() {
        return Err(AppError::BadRequest("no operation id".to_string()));
    }
    Ok(())
}

pub(crate) fn check_new_key(data: &KeyCreateRequest) -> Res<()> {
    if data.key_hash.is_empty() {
        return Err(AppError::BadRequest("no key hash".to_string()));
    }
    if data.limit < 0.0 {
        return Err(AppError::Validation(format!("negative limit {}", data.limit)));
    }
    tag::validate(&data.tags)?;
    parse_white_list(&data.ip_white_list)?;
    Ok(())
}

pub(crate) fn reset_top_up(key: &ApiKey, target: f64, period_start: DateTime<Utc>) -> Option<f64> {
    if key.reset_at.is_some_and(|at| at >= period_start) {
        return None;
    }
    let top_up = target - key.remaining();
    (top_up > MIN_TOP_UP).then_some(top_up)
}

pub(crate) fn reset_gate(settings: &Settings, now: DateTime<Utc>, grace: Duration) -> Res<ResetGate> {
    let grace = TimeDelta::from_std(grace)
        .map_err(|e| AppError::Validation(format!("wrong reset grace: {}", e)))?;

    if let Some(next_reset) = settings.next_reset {
        if next_reset > now {
            return Ok(ResetGate::Done { next_reset });
        }
    }
    if let Some(started) = settings.reset_started {
        let unfinished = settings.next_reset.is_none_or(|next| started >= next);
        if unfinished && started > now - grace {
            return Ok(ResetGate::InProgress { started });
        }
    }
    Ok(ResetGate::Proceed {
        period_start: settings.next_reset.unwrap_or_else(|| start_of_month(now, 0)),
    })
}
