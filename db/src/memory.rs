use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    error::{AppError, Res},
    tag,
};
use uuid::Uuid;

use crate::{
    dtos::{
        key::{KeyCreateRequest, KeyRef},
        ledger::{Balance, Grant, Reservation, ResetGate},
        log::LogFilter,
    },
    models::{
        key::{ApiKey, ip_key_valid_to},
        log::Log,
        operation::Operation,
        settings::Settings,
    },
    store::{
        CREATE_KEY_MSG, RESET_MSG, Store, check_new_key, check_operation_id, reset_gate,
        reset_top_up,
    },
};

#[derive(Default)]
struct State {
    keys: HashMap<Uuid, ApiKey>,
    operations: Vec<Operation>,
    logs: HashMap<Uuid, Log>,
    settings: HashMap<String, Settings>,
}

impl State {
    fn find(&self, key: &KeyRef) -> Option<&ApiKey> {
        self.keys
            .values()
            .find(|k| k.project == key.project && k.key_hash == key.hash && k.manual == key.manual)
    }

    fn find_id(&self, key: &KeyRef) -> Res<Uuid> {
        self.find(key)
            .map(|k| k.id)
            .ok_or_else(|| AppError::NotFound(format!("key in project '{}'", key.project)))
    }

    fn key_mut(&mut self, key_id: &Uuid) -> Res<&mut ApiKey> {
        self.keys
            .get_mut(key_id)
            .ok_or_else(|| AppError::NotFound(format!("key {}", key_id)))
    }

    fn insert(&mut self, key: ApiKey) -> Res<ApiKey> {
        let key_ref = KeyRef {
            project: key.project.clone(),
            hash: key.key_hash.clone(),
            manual: key.manual,
        };
        if self.find(&key_ref).is_some() {
            return Err(AppError::BadRequest("key already exists".to_string()));
        }
        self.keys.insert(key.id, key.clone());
        Ok(key)
    }

    fn apply_grant(&mut self, key_id: &Uuid, operation_id: &str, amount: f64, msg: &str) -> Res<Grant> {
        check_operation_id(operation_id)?;
        let current = self.key_mut(key_id)?.clone();
        if self
            .operations
            .iter()
            .any(|o| &o.key_id == key_id && o.id == operation_id)
        {
            return Ok(Grant::AlreadyApplied(current));
        }
        let limit = current.granted_limit(amount)?;
        let now = Utc::now();
        self.operations.push(Operation {
            id: operation_id.to_string(),
            key_id: *key_id,
            date: now,
            quota_value: amount,
            msg: msg.to_string(),
        });
        let key = self.key_mut(key_id)?;
        key.quota_limit = limit;
        key.updated = now;
        Ok(Grant::Applied(key.clone()))
    }
}

pub(crate) fn new_key(project: &str, key_hash: &str, manual: bool, limit: f64, valid_to: DateTime<Utc>) -> ApiKey {
    let now = Utc::now();
    ApiKey {
        id: Uuid::new_v4(),
        project: project.to_string(),
        key_hash: key_hash.to_string(),
        manual,
        quota_limit: limit,
        quota_value: 0.0,
        quota_value_failed: 0.0,
        valid_to,
        disabled: false,
        ip_white_list: String::new(),
        created: now,
        updated: now,
        last_used: None,
        last_ip: None,
        reset_at: None,
        tags: Vec::new(),
        description: String::new(),
        external_id: None,
    }
}

/// In-process [`Store`]. One mutex guards each whole operation, which gives
/// the same per-key atomicity as the row locks of [`crate::postgres::PgStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Direct row edit for setting up scenarios.
    pub fn update_key<F: FnOnce(&mut ApiKey)>(&self, key_id: Uuid, f: F) -> Res<ApiKey> {
        let mut state = self.lock()?;
        let key = state.key_mut(&key_id)?;
        f(key);
        Ok(key.clone())
    }

    pub fn key_count(&self) -> Res<usize> {
        Ok(self.lock()?.keys.len())
    }

    fn lock(&self) -> Res<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("store is offline".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| AppError::Internal("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_key(&self, key: &KeyRef) -> Res<Option<ApiKey>> {
        Ok(self.lock()?.find(key).cloned())
    }

    async fn get_key(&self, key_id: Uuid) -> Res<ApiKey> {
        Ok(self.lock()?.key_mut(&key_id)?.clone())
    }

    async fn check_create_ip_key(&self, project: &str, ip: &str, limit: f64) -> Res<Uuid> {
        let mut state = self.lock()?;
        if let Some(found) = state.find(&KeyRef::ip(project, ip)) {
            return Ok(found.id);
        }
        let mut key = new_key(project, ip, false, limit, ip_key_valid_to());
        key.description = "IP access".to_string();
        let created = state.insert(key)?;
        log::info!("Created IP key {} in project '{}'", created.id, project);
        Ok(created.id)
    }

    async fn create_key(&self, data: KeyCreateRequest) -> Res<ApiKey> {
        check_new_key(&data)?;
        let mut state = self.lock()?;
        let mut key = new_key(&data.project, &data.key_hash, true, data.limit, data.valid_to);
        key.tags = data.tags;
        key.ip_white_list = data.ip_white_list;
        key.description = data.description;
        key.external_id = data.external_id;
        let created = state.insert(key)?;
        state.operations.push(Operation {
            id: Uuid::new_v4().to_string(),
            key_id: created.id,
            date: created.created,
            quota_value: data.limit,
            msg: CREATE_KEY_MSG.to_string(),
        });
        Ok(created)
    }

    async fn set_disabled(&self, key_id: Uuid, disabled: bool) -> Res<ApiKey> {
        let mut state = self.lock()?;
        let key = state.key_mut(&key_id)?;
        key.disabled = disabled;
        key.updated = Utc::now();
        Ok(key.clone())
    }

    async fn update_tags(&self, key_id: Uuid, tags: &[String]) -> Res<ApiKey> {
        let mut state = self.lock()?;
        let key = state.key_mut(&key_id)?;
        key.tags = tag::merge(&key.tags, tags)?;
        key.updated = Utc::now();
        Ok(key.clone())
    }

    async fn reserve(&self, key_ref: &KeyRef, ip: &str, cost: f64) -> Res<Reservation> {
        let mut state = self.lock()?;
        let key_id = state.find_id(key_ref)?;
        let key = state.key_mut(&key_id)?;
        let now = Utc::now();
        let before = key.remaining();
        key.last_used = Some(now);
        key.last_ip = Some(ip.to_string());
        key.updated = now;

        if before - cost < 0.0 {
            key.quota_value_failed += cost;
            return Ok(Reservation {
                admitted: false,
                key_id,
                remaining: before,
                limit: key.quota_limit,
            });
        }

        key.quota_value += cost;
        Ok(Reservation {
            admitted: true,
            key_id,
            remaining: key.remaining(),
            limit: key.quota_limit,
        })
    }

    async fn restore(&self, key_ref: &KeyRef, cost: f64) -> Res<Balance> {
        let mut state = self.lock()?;
        let key_id = state.find_id(key_ref)?;
        let key = state.key_mut(&key_id)?;
        key.quota_value -= cost;
        key.quota_value_failed += cost;
        key.updated = Utc::now();
        Ok(Balance {
            remaining: key.remaining(),
            limit: key.quota_limit,
        })
    }

    async fn restore_usage(&self, request_id: Uuid, error_msg: &str) -> Res<ApiKey> {
        let mut state = self.lock()?;
        let entry = state
            .logs
            .get(&request_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("request {}", request_id)))?;
        if entry.fail {
            return Err(AppError::Conflict(format!("request {}", request_id)));
        }
        let key_id = entry
            .key_id
            .ok_or_else(|| AppError::BadRequest(format!("request {} has no key", request_id)))?;
        let key = state.key_mut(&key_id)?;
        key.quota_value -= entry.quota_value;
        key.quota_value_failed += entry.quota_value;
        key.updated = Utc::now();
        let updated = key.clone();

        if let Some(stored) = state.logs.get_mut(&request_id) {
            stored.fail = true;
            stored.error_msg = Some(error_msg.to_string());
        }
        Ok(updated)
    }

    async fn grant_credits(
        &self,
        key_id: Uuid,
        operation_id: &str,
        amount: f64,
        msg: &str,
    ) -> Res<Grant> {
        self.lock()?.apply_grant(&key_id, operation_id, amount, msg)
    }

    async fn get_operations(&self, key_id: Uuid) -> Res<Vec<Operation>> {
        Ok(self
            .lock()?
            .operations
            .iter()
            .filter(|o| o.key_id == key_id)
            .cloned()
            .collect())
    }

    async fn save_log(&self, log: &Log) -> Res<()> {
        let mut state = self.lock()?;
        if state.logs.contains_key(&log.request_id) {
            return Err(AppError::BadRequest(format!("duplicate request {}", log.request_id)));
        }
        state.logs.insert(log.request_id, log.clone());
        Ok(())
    }

    async fn get_logs(&self, filter: LogFilter) -> Res<Vec<Log>> {
        let state = self.lock()?;
        let mut found: Vec<Log> = state
            .logs
            .values()
            .filter(|l| filter.key_id.is_none_or(|id| l.key_id == Some(id)))
            .filter(|l| filter.fail.is_none_or(|fail| l.fail == fail))
            .filter(|l| filter.ending_before.is_none_or(|d| l.date < d))
            .filter(|l| filter.starting_after.is_none_or(|d| l.date > d))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.date.cmp(&a.date));
        if let Some(limit) = filter.limit {
            found.truncate(limit.max(0) as usize);
        }
        Ok(found)
    }

    async fn begin_reset(
        &self,
        project: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Res<ResetGate> {
        let mut state = self.lock()?;
        let settings = state
            .settings
            .entry(project.to_string())
            .or_insert_with(|| Settings {
                project: project.to_string(),
                reset_started: None,
                next_reset: None,
                updated: now,
            });
        let gate = reset_gate(settings, now, grace)?;
        if let ResetGate::Proceed { .. } = gate {
            settings.reset_started = Some(now);
            settings.updated = now;
        }
        Ok(gate)
    }

    async fn resettable_keys(
        &self,
        project: &str,
        now: DateTime<Utc>,
        period_start: DateTime<Utc>,
    ) -> Res<Vec<ApiKey>> {
        let state = self.lock()?;
        let mut keys: Vec<ApiKey> = state
            .keys
            .values()
            .filter(|k| k.project == project && !k.manual && k.created < now)
            .filter(|k| k.reset_at.is_none_or(|at| at < period_start))
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(keys)
    }

    async fn reset_key(
        &self,
        key_id: Uuid,
        operation_id: &str,
        target: f64,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Res<Option<Grant>> {
        let mut state = self.lock()?;
        let Some(top_up) = reset_top_up(state.key_mut(&key_id)?, target, period_start) else {
            return Ok(None);
        };
        let grant = state.apply_grant(&key_id, operation_id, top_up, RESET_MSG)?;
        let key = state.key_mut(&key_id)?;
        key.reset_at = Some(now);
        key.updated = now;
        let stamped = key.clone();
        Ok(Some(match grant {
            Grant::Applied(_) => Grant::Applied(stamped),
            Grant::AlreadyApplied(_) => Grant::AlreadyApplied(stamped),
        }))
    }

    async fn finish_reset(&self, project: &str, next_reset: DateTime<Utc>) -> Res<()> {
        let mut state = self.lock()?;
        let settings = state
            .settings
            .get_mut(project)
            .ok_or_else(|| AppError::NotFound(format!("settings for '{}'", project)))?;
        settings.next_reset = Some(next_reset);
        settings.updated = Utc::now();
        Ok(())
    }
}
