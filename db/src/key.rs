use chrono::{DateTime, Utc};
use common::error::{AppError, Res};
use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::{
    dtos::key::{KeyCreateRequest, KeyRef},
    models::key::{ApiKey, ip_key_valid_to},
};

fn key_not_found(key_id: &Uuid) -> AppError {
    AppError::NotFound(format!("key {}", key_id))
}

pub async fn find_key<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key: &KeyRef,
) -> Res<Option<ApiKey>> {
    sqlx::query_as::<_, ApiKey>(
        "SELECT * FROM keys WHERE project = $1 AND key_hash = $2 AND manual = $3",
    )
    .bind(&key.project)
    .bind(&key.hash)
    .bind(key.manual)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}

/// Same as [`find_key`] but holds the row lock until the transaction ends.
pub async fn find_key_for_update<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key: &KeyRef,
) -> Res<Option<ApiKey>> {
    sqlx::query_as::<_, ApiKey>(
        "SELECT * FROM keys WHERE project = $1 AND key_hash = $2 AND manual = $3 FOR UPDATE",
    )
    .bind(&key.project)
    .bind(&key.hash)
    .bind(key.manual)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}

pub async fn get_key_by_id<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>("SELECT * FROM keys WHERE id = $1")
        .bind(key_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| key_not_found(key_id))
}

pub async fn get_key_by_id_for_update<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>("SELECT * FROM keys WHERE id = $1 FOR UPDATE")
        .bind(key_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| key_not_found(key_id))
}

pub async fn insert_key<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    data: &KeyCreateRequest,
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>(
        r#"
        INSERT INTO keys (id, project, key_hash, manual, quota_limit, valid_to, tags,
                          ip_white_list, description, external_id)
        VALUES ($1, $2, $3, TRUE, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&data.project)
    .bind(&data.key_hash)
    .bind(data.limit)
    .bind(data.valid_to)
    .bind(&data.tags)
    .bind(&data.ip_white_list)
    .bind(&data.description)
    .bind(&data.external_id)
    .fetch_one(executor)
    .await
    .map_err(AppError::from)
}

/// Inserts an IP identity unless one exists. `None` means another writer won.
pub async fn insert_ip_key<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    project: &str,
    ip: &str,
    limit: f64,
) -> Res<Option<Uuid>> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO keys (id, project, key_hash, manual, quota_limit, valid_to, description)
        VALUES ($1, $2, $3, FALSE, $4, $5, 'IP access')
        ON CONFLICT (project, key_hash, manual) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(project)
    .bind(ip)
    .bind(limit)
    .bind(ip_key_valid_to())
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}

pub async fn update_key_status<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
    disabled: bool,
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>(
        "UPDATE keys SET disabled = $1, updated = $2 WHERE id = $3 RETURNING *",
    )
    .bind(disabled)
    .bind(Utc::now())
    .bind(key_id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| key_not_found(key_id))
}

pub async fn update_key_tags<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
    tags: &[String],
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>("UPDATE keys SET tags = $1, updated = $2 WHERE id = $3 RETURNING *")
        .bind(tags)
        .bind(Utc::now())
        .bind(key_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| key_not_found(key_id))
}

/// Charges an admitted cost.
pub async fn consume<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
    cost: f64,
    ip: &str,
    now: DateTime<Utc>,
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>(
        r#"
        UPDATE keys SET quota_value = quota_value + $1, last_used = $2, last_ip = $3, updated = $2
        WHERE id = $4
        RETURNING *
        "#,
    )
    .bind(cost)
    .bind(now)
    .bind(ip)
    .bind(key_id)
    .fetch_one(executor)
    .await
    .map_err(AppError::from)
}

/// Books a rejected attempt into the failed counter only.
pub async fn record_failed<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
    cost: f64,
    ip: &str,
    now: DateTime<Utc>,
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>(
        r#"
        UPDATE keys SET quota_value_failed = quota_value_failed + $1, last_used = $2,
                        last_ip = $3, updated = $2
        WHERE id = $4
        RETURNING *
        "#,
    )
    .bind(cost)
    .bind(now)
    .bind(ip)
    .bind(key_id)
    .fetch_one(executor)
    .await
    .map_err(AppError::from)
}

/// Moves `cost` from the used to the failed counter.
pub async fn move_to_failed<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key: &KeyRef,
    cost: f64,
) -> Res<Option<ApiKey>> {
    sqlx::query_as::<_, ApiKey>(
        r#"
        UPDATE keys SET quota_value = quota_value - $1,
                        quota_value_failed = quota_value_failed + $1, updated = $2
        WHERE project = $3 AND key_hash = $4 AND manual = $5
        RETURNING *
        "#,
    )
    .bind(cost)
    .bind(Utc::now())
    .bind(&key.project)
    .bind(&key.hash)
    .bind(key.manual)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}

pub async fn move_to_failed_by_id<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
    cost: f64,
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>(
        r#"
        UPDATE keys SET quota_value = quota_value - $1,
                        quota_value_failed = quota_value_failed + $1, updated = $2
        WHERE id = $3
        RETURNING *
        "#,
    )
    .bind(cost)
    .bind(Utc::now())
    .bind(key_id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| key_not_found(key_id))
}

pub async fn update_limit<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
    limit: f64,
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>(
        "UPDATE keys SET quota_limit = $1, updated = $2 WHERE id = $3 RETURNING *",
    )
    .bind(limit)
    .bind(Utc::now())
    .bind(key_id)
    .fetch_one(executor)
    .await
    .map_err(AppError::from)
}

pub async fn stamp_reset<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
    now: DateTime<Utc>,
) -> Res<ApiKey> {
    sqlx::query_as::<_, ApiKey>("UPDATE keys SET reset_at = $1, updated = $1 WHERE id = $2 RETURNING *")
        .bind(now)
        .bind(key_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| key_not_found(key_id))
}

/// IP identities of a project not yet replenished in the current period.
pub async fn get_resettable_keys<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    project: &str,
    now: DateTime<Utc>,
    period_start: DateTime<Utc>,
) -> Res<Vec<ApiKey>> {
    sqlx::query_as::<_, ApiKey>(
        r#"
        SELECT * FROM keys
        WHERE project = $1 AND manual = FALSE AND created < $2
          AND (reset_at IS NULL OR reset_at < $3)
        ORDER BY created
        "#,
    )
    .bind(project)
    .bind(now)
    .bind(period_start)
    .fetch_all(executor)
    .await
    .map_err(AppError::from)
}
