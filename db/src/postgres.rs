use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    error::{AppError, Res},
    tag,
};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    dtos::{
        key::{KeyCreateRequest, KeyRef},
        ledger::{Balance, Grant, Reservation, ResetGate},
        log::LogFilter,
    },
    key, log as logs,
    models::{key::ApiKey, log::Log, operation::Operation},
    operation, settings,
    store::{
        CREATE_KEY_MSG, RESET_MSG, Store, check_new_key, check_operation_id, reset_gate,
        reset_top_up,
    },
};

/// [`Store`] backed by Postgres. Row locks provide the per-key atomicity.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn key_missing(key: &KeyRef) -> AppError {
    AppError::NotFound(format!("key in project '{}'", key.project))
}

async fn apply_grant(
    conn: &mut PgConnection,
    key_id: &Uuid,
    operation_id: &str,
    amount: f64,
    msg: &str,
) -> Res<Grant> {
    check_operation_id(operation_id)?;
    let current = key::get_key_by_id_for_update(&mut *conn, key_id).await?;
    if !operation::insert_operation(&mut *conn, key_id, operation_id, amount, msg).await? {
        return Ok(Grant::AlreadyApplied(current));
    }
    let limit = current.granted_limit(amount)?;
    let updated = key::update_limit(&mut *conn, key_id, limit).await?;
    Ok(Grant::Applied(updated))
}

#[async_trait]
impl Store for PgStore {
    async fn find_key(&self, key: &KeyRef) -> Res<Option<ApiKey>> {
        key::find_key(self.pool(), key).await
    }

    async fn get_key(&self, key_id: Uuid) -> Res<ApiKey> {
        key::get_key_by_id(self.pool(), &key_id).await
    }

    async fn check_create_ip_key(&self, project: &str, ip: &str, limit: f64) -> Res<Uuid> {
        let key_ref = KeyRef::ip(project, ip);
        if let Some(found) = key::find_key(self.pool(), &key_ref).await? {
            return Ok(found.id);
        }
        if let Some(id) = key::insert_ip_key(self.pool(), project, ip, limit).await? {
            log::info!("Created IP key {} in project '{}'", id, project);
            return Ok(id);
        }
        // lost the insert race, the winner's row is committed
        key::find_key(self.pool(), &key_ref)
            .await?
            .map(|k| k.id)
            .ok_or_else(|| AppError::Internal(format!("IP key for {} vanished", ip)))
    }

    async fn create_key(&self, data: KeyCreateRequest) -> Res<ApiKey> {
        check_new_key(&data)?;
        let mut tx = self.pool.begin().await?;
        let created = key::insert_key(&mut *tx, &data).await.map_err(|e| match e {
            AppError::Database(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                AppError::BadRequest("key already exists".to_string())
            }
            other => other,
        })?;
        let operation_id = Uuid::new_v4().to_string();
        operation::insert_operation(&mut *tx, &created.id, &operation_id, data.limit, CREATE_KEY_MSG)
            .await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn set_disabled(&self, key_id: Uuid, disabled: bool) -> Res<ApiKey> {
        key::update_key_status(self.pool(), &key_id, disabled).await
    }

    async fn update_tags(&self, key_id: Uuid, tags: &[String]) -> Res<ApiKey> {
        let mut tx = self.pool.begin().await?;
        let current = key::get_key_by_id_for_update(&mut *tx, &key_id).await?;
        let merged = tag::merge(&current.tags, tags)?;
        let updated = key::update_key_tags(&mut *tx, &key_id, &merged).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn reserve(&self, key_ref: &KeyRef, ip: &str, cost: f64) -> Res<Reservation> {
        let mut tx = self.pool.begin().await?;
        let current = key::find_key_for_update(&mut *tx, key_ref)
            .await?
            .ok_or_else(|| key_missing(key_ref))?;
        let now = Utc::now();

        if current.remaining() - cost < 0.0 {
            key::record_failed(&mut *tx, &current.id, cost, ip, now).await?;
            tx.commit().await?;
            return Ok(Reservation {
                admitted: false,
                key_id: current.id,
                remaining: current.remaining(),
                limit: current.quota_limit,
            });
        }

        let updated = key::consume(&mut *tx, &current.id, cost, ip, now).await?;
        tx.commit().await?;
        Ok(Reservation {
            admitted: true,
            key_id: updated.id,
            remaining: updated.remaining(),
            limit: updated.quota_limit,
        })
    }

    async fn restore(&self, key_ref: &KeyRef, cost: f64) -> Res<Balance> {
        let updated = key::move_to_failed(self.pool(), key_ref, cost)
            .await?
            .ok_or_else(|| key_missing(key_ref))?;
        Ok(Balance {
            remaining: updated.remaining(),
            limit: updated.quota_limit,
        })
    }

    async fn restore_usage(&self, request_id: Uuid, error_msg: &str) -> Res<ApiKey> {
        let mut tx = self.pool.begin().await?;
        let entry = logs::get_log_for_update(&mut *tx, &request_id).await?;
        if entry.fail {
            return Err(AppError::Conflict(format!("request {}", request_id)));
        }
        let key_id = entry
            .key_id
            .ok_or_else(|| AppError::BadRequest(format!("request {} has no key", request_id)))?;
        logs::mark_failed(&mut *tx, &request_id, error_msg).await?;
        let updated = key::move_to_failed_by_id(&mut *tx, &key_id, entry.quota_value).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn grant_credits(
        &self,
        key_id: Uuid,
        operation_id: &str,
        amount: f64,
        msg: &str,
    ) -> Res<Grant> {
        let mut tx = self.pool.begin().await?;
        let grant = apply_grant(&mut *tx, &key_id, operation_id, amount, msg).await?;
        tx.commit().await?;
        Ok(grant)
    }

    async fn get_operations(&self, key_id: Uuid) -> Res<Vec<Operation>> {
        operation::get_operations(self.pool(), &key_id).await
    }

    async fn save_log(&self, log: &Log) -> Res<()> {
        logs::insert_log(self.pool(), log).await
    }

    async fn get_logs(&self, filter: LogFilter) -> Res<Vec<Log>> {
        logs::get_logs(self.pool(), filter).await
    }

    async fn begin_reset(
        &self,
        project: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Res<ResetGate> {
        let mut tx = self.pool.begin().await?;
        settings::ensure_settings(&mut *tx, project).await?;
        let current = settings::get_settings_for_update(&mut *tx, project).await?;
        let gate = reset_gate(&current, now, grace)?;
        if let ResetGate::Proceed { .. } = gate {
            settings::update_settings(&mut *tx, project, Some(now), None).await?;
        }
        tx.commit().await?;
        Ok(gate)
    }

    async fn resettable_keys(
        &self,
        project: &str,
        now: DateTime<Utc>,
        period_start: DateTime<Utc>,
    ) -> Res<Vec<ApiKey>> {
        key::get_resettable_keys(self.pool(), project, now, period_start).await
    }

    async fn reset_key(
        &self,
        key_id: Uuid,
        operation_id: &str,
        target: f64,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Res<Option<Grant>> {
        let mut tx = self.pool.begin().await?;
        let current = key::get_key_by_id_for_update(&mut *tx, &key_id).await?;
        let Some(top_up) = reset_top_up(&current, target, period_start) else {
            tx.rollback().await?;
            return Ok(None);
        };
        let grant = apply_grant(&mut *tx, &key_id, operation_id, top_up, RESET_MSG).await?;
        let stamped = key::stamp_reset(&mut *tx, &key_id, now).await?;
        tx.commit().await?;
        Ok(Some(match grant {
            Grant::Applied(_) => Grant::Applied(stamped),
            Grant::AlreadyApplied(_) => Grant::AlreadyApplied(stamped),
        }))
    }

    async fn finish_reset(&self, project: &str, next_reset: DateTime<Utc>) -> Res<()> {
        settings::update_settings(self.pool(), project, None, Some(next_reset)).await
    }
}
