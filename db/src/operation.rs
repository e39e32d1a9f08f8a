use chrono::Utc;
use common::error::{AppError, Res};
use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::models::operation::Operation;

/// Records a grant. Returns `false` when `(key_id, operation_id)` already exists.
pub async fn insert_operation<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
    operation_id: &str,
    amount: f64,
    msg: &str,
) -> Res<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO operations (id, key_id, date, quota_value, msg)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (key_id, id) DO NOTHING
        "#,
    )
    .bind(operation_id)
    .bind(key_id)
    .bind(Utc::now())
    .bind(amount)
    .bind(msg)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_operations<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    key_id: &Uuid,
) -> Res<Vec<Operation>> {
    sqlx::query_as::<_, Operation>("SELECT * FROM operations WHERE key_id = $1 ORDER BY date")
        .bind(key_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::from)
}
