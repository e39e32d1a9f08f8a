use crate::{dtos::log::LogFilter, models::log::Log};
use common::error::{AppError, Res};
use sqlx::{Executor, Postgres, QueryBuilder};
use uuid::Uuid;

pub async fn insert_log<'e, E: Executor<'e, Database = Postgres>>(executor: E, log: &Log) -> Res<()> {
    sqlx::query(
        r#"
        INSERT INTO logs (request_id, key_id, url, quota_value, date, ip, value, fail,
                          response_code, error_msg)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(log.request_id)
    .bind(log.key_id)
    .bind(&log.url)
    .bind(log.quota_value)
    .bind(log.date)
    .bind(&log.ip)
    .bind(&log.value)
    .bind(log.fail)
    .bind(log.response_code)
    .bind(&log.error_msg)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_log_for_update<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    request_id: &Uuid,
) -> Res<Log> {
    sqlx::query_as::<_, Log>("SELECT * FROM logs WHERE request_id = $1 FOR UPDATE")
        .bind(request_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("request {}", request_id)))
}

pub async fn mark_failed<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    request_id: &Uuid,
    error_msg: &str,
) -> Res<()> {
    sqlx::query("UPDATE logs SET fail = TRUE, error_msg = $1 WHERE request_id = $2")
        .bind(error_msg)
        .bind(request_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn get_logs<'e, E>(executor: E, filter: LogFilter) -> Res<Vec<Log>>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM logs");
    let mut conditions_added = false;

    let mut add_condition_separator = |qb: &mut QueryBuilder<Postgres>| {
        if !conditions_added {
            qb.push(" WHERE ");
            conditions_added = true;
        } else {
            qb.push(" AND ");
        }
    };

    if let Some(key_id) = filter.key_id {
        add_condition_separator(&mut qb);
        qb.push("key_id = ").push_bind(key_id);
    }

    if let Some(fail) = filter.fail {
        add_condition_separator(&mut qb);
        qb.push("fail = ").push_bind(fail);
    }

    if let Some(ending_before) = filter.ending_before {
        add_condition_separator(&mut qb);
        qb.push("date < ").push_bind(ending_before);
    }

    if let Some(starting_after) = filter.starting_after {
        add_condition_separator(&mut qb);
        qb.push("date > ").push_bind(starting_after);
    }

    qb.push(" ORDER BY date DESC");

    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit);
    }

    qb.build_query_as::<Log>()
        .fetch_all(executor)
        .await
        .map_err(AppError::from)
}
