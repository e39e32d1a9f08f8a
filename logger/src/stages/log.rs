use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use colored::Colorize;
use common::{
    context::{Reply, RequestContext},
    pipeline::{Next, Stage},
};
use db::{Store, models::log::Log};

const SAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes one log record per request after the rest of the chain is done.
pub struct LogStage {
    store: Arc<dyn Store>,
    sync: bool,
}

impl LogStage {
    pub fn new(store: Arc<dyn Store>, sync: bool) -> Self {
        Self { store, sync }
    }
}

pub fn to_log(ctx: &RequestContext) -> Log {
    Log {
        request_id: ctx.request_id,
        key_id: ctx.key_id,
        url: ctx.url(),
        quota_value: ctx.cost,
        date: Utc::now(),
        ip: ctx.ip.clone(),
        value: ctx.value.clone(),
        fail: ctx.response_code >= 400,
        response_code: i32::from(ctx.response_code),
        error_msg: ctx.error_msg.clone(),
    }
}

async fn save(store: Arc<dyn Store>, entry: Log) {
    match tokio::time::timeout(SAVE_TIMEOUT, store.save_log(&entry)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Failed to save log of request {}: {}", entry.request_id, e),
        Err(_) => log::error!("Saving log of request {} timed out", entry.request_id),
    }
}

fn console(ctx: &RequestContext, elapsed: Duration) {
    let status_code = ctx.response_code;
    let colored_status = match status_code {
        200..=299 => status_code.to_string().green(),
        300..=399 => status_code.to_string().yellow(),
        400..=499 => status_code.to_string().bright_red(),
        _ => status_code.to_string().red(),
    };
    let method = ctx.method.as_str();
    let colored_method = match method {
        "GET" => method.blue(),
        "POST" => method.yellow(),
        "PUT" => method.purple(),
        "DELETE" => method.red(),
        _ => method.normal(),
    };
    log::info!(
        "[{}] {} {} {} key_id={} cost={}",
        colored_status,
        colored_method,
        ctx.original_path.bright_white(),
        format!("({}ms)", elapsed.as_millis()).bright_black(),
        ctx.key_id
            .map_or("None".to_string(), |id| id.to_string())
            .bright_blue(),
        ctx.cost,
    );
}

#[async_trait]
impl Stage for LogStage {
    fn name(&self) -> String {
        if self.sync {
            "LogDB(sync)".to_string()
        } else {
            "LogDB".to_string()
        }
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply {
        let started = Instant::now();
        let reply = next.run(ctx).await;
        ctx.response_code = reply.status.as_u16();
        console(ctx, started.elapsed());

        let entry = to_log(ctx);
        if self.sync {
            save(self.store.clone(), entry).await;
        } else {
            tokio::spawn(save(self.store.clone(), entry));
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{
        http::{Method, StatusCode, header::HeaderMap},
        web::Bytes,
    };
    use common::pipeline::{Pipeline, Respond};
    use db::{MemoryStore, dtos::log::LogFilter};
    use uuid::Uuid;

    fn ctx() -> RequestContext {
        let mut ctx = RequestContext::new(Method::POST, "/tts", "voice=a", HeaderMap::new(), Bytes::new(), "2.2.2.2");
        ctx.key_id = Some(Uuid::new_v4());
        ctx.cost = 12.0;
        ctx.value = Some("hello".into());
        ctx
    }

    #[tokio::test]
    async fn writes_log_synchronously() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::default()
            .push(LogStage::new(store.clone(), true))
            .push(Respond(StatusCode::BAD_GATEWAY));
        let mut c = ctx();
        pipeline.handle(&mut c).await;

        let logs = store.get_logs(LogFilter::default()).await.unwrap();
        assert_eq!(logs.len(), 1);
        let entry = &logs[0];
        assert_eq!(entry.request_id, c.request_id);
        assert_eq!(entry.url, "/tts?voice=a");
        assert_eq!(entry.quota_value, 12.0);
        assert_eq!(entry.response_code, 502);
        assert!(entry.fail);
        assert_eq!(entry.value.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn log_failure_does_not_change_reply() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let pipeline = Pipeline::default()
            .push(LogStage::new(store.clone(), true))
            .push(Respond(StatusCode::OK));
        assert_eq!(pipeline.handle(&mut ctx()).await.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn spawned_write_lands_eventually() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::default()
            .push(LogStage::new(store.clone(), false))
            .push(Respond(StatusCode::OK));
        pipeline.handle(&mut ctx()).await;

        for _ in 0..50 {
            if !store.get_logs(LogFilter::default()).await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("log was not written");
    }
}
