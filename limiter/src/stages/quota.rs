use std::sync::Arc;

use async_trait::async_trait;
use common::{
    context::{Reply, RequestContext},
    error::AppError,
    hash::Hasher,
    pipeline::{Next, Stage},
};
use db::{Store, dtos::key::KeyRef};

pub const REMAINING_HEADER: &str = "x-rate-limit-remaining";
pub const LIMIT_HEADER: &str = "x-rate-limit-limit";

/// Reserves the request cost before the call and gives it back when the
/// downstream answer is a failure (status >= 400).
pub struct QuotaStage {
    store: Arc<dyn Store>,
    hasher: Arc<Hasher>,
    project: String,
}

impl QuotaStage {
    pub fn new(store: Arc<dyn Store>, hasher: Arc<Hasher>, project: &str) -> Self {
        Self {
            store,
            hasher,
            project: project.to_string(),
        }
    }
}

fn set_balance(reply: &mut Reply, remaining: f64, limit: f64) {
    reply.set_header(REMAINING_HEADER, &format!("{:.0}", remaining.max(0.0)));
    reply.set_header(LIMIT_HEADER, &format!("{:.0}", limit));
}

#[async_trait]
impl Stage for QuotaStage {
    fn name(&self) -> String {
        format!("Quota({})", self.project)
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply {
        let Some(token) = ctx.key.clone() else {
            return ctx.reject(AppError::Unauthorized("No key".to_string()));
        };
        let key_ref = KeyRef::new(&self.project, &token, ctx.manual, &self.hasher);
        let cost = ctx.cost;

        let reservation = match self.store.reserve(&key_ref, &ctx.ip, cost).await {
            Ok(r) => r,
            Err(e) => return ctx.reject(e),
        };
        if !reservation.admitted {
            log::info!(
                "Quota reached for key {}: cost {}, remaining {}",
                reservation.key_id,
                cost,
                reservation.remaining
            );
            let mut reply = ctx.reject(AppError::Forbidden(format!(
                "need {}, have {:.0}",
                cost, reservation.remaining
            )));
            set_balance(&mut reply, reservation.remaining, reservation.limit);
            return reply;
        }

        let mut reply = next.run(ctx).await;
        let (mut remaining, mut limit) = (reservation.remaining, reservation.limit);

        if reply.status.as_u16() >= 400 {
            match self.store.restore(&key_ref, cost).await {
                Ok(balance) => {
                    log::debug!("Restored {} to key {}", cost, reservation.key_id);
                    remaining = balance.remaining;
                    limit = balance.limit;
                }
                Err(e) => {
                    log::error!(
                        "UNRECONCILED key={} request={} cost={}: {}",
                        reservation.key_id,
                        ctx.request_id,
                        cost,
                        e
                    );
                }
            }
        }

        set_balance(&mut reply, remaining, limit);
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
    use chrono::{TimeDelta, Utc};
    use common::pipeline::{Pipeline, Respond};
    use db::{MemoryStore, dtos::key::KeyCreateRequest};

    const SALT: &str = "0123456789012345678901234567890123456789";

    struct Fixture {
        store: Arc<MemoryStore>,
        hasher: Arc<Hasher>,
    }

    impl Fixture {
        async fn new(limit: f64) -> Self {
            let f = Self {
                store: Arc::new(MemoryStore::new()),
                hasher: Arc::new(Hasher::new(SALT).unwrap()),
            };
            f.store
                .create_key(KeyCreateRequest {
                    project: "tts".into(),
                    key_hash: f.hasher.hash_key("secret"),
                    limit,
                    valid_to: Utc::now() + TimeDelta::days(1),
                    tags: vec![],
                    ip_white_list: String::new(),
                    description: String::new(),
                    external_id: None,
                })
                .await
                .unwrap();
            f
        }

        fn pipeline(&self, backend: StatusCode) -> Pipeline {
            Pipeline::default()
                .push(QuotaStage::new(self.store.clone(), self.hasher.clone(), "tts"))
                .push(Respond(backend))
        }

        async fn key(&self) -> db::models::key::ApiKey {
            let key_ref = KeyRef::new("tts", "secret", true, &self.hasher);
            self.store.find_key(&key_ref).await.unwrap().unwrap()
        }
    }

    fn ctx(cost: f64) -> RequestContext {
        let mut ctx = RequestContext::new(Method::POST, "/", "", HeaderMap::new(), Bytes::new(), "1.1.1.1");
        ctx.key = Some("secret".into());
        ctx.manual = true;
        ctx.cost = cost;
        ctx
    }

    #[tokio::test]
    async fn charges_successful_calls() {
        let f = Fixture::new(100.0).await;
        let p = f.pipeline(StatusCode::OK);
        for _ in 0..10 {
            assert_eq!(p.handle(&mut ctx(8.0)).await.status, StatusCode::OK);
        }
        let mut c = ctx(25.0);
        let reply = p.handle(&mut c).await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(reply.header(REMAINING_HEADER), Some("20"));
        assert_eq!(reply.header(LIMIT_HEADER), Some("100"));

        let key = f.key().await;
        assert_eq!(key.quota_value, 80.0);
        assert_eq!(key.quota_value_failed, 25.0);

        f.store.grant_credits(key.id, "op-1", 50.0, "topup").await.unwrap();
        let reply = p.handle(&mut ctx(25.0)).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.header(REMAINING_HEADER), Some("45"));
    }

    #[tokio::test]
    async fn restores_on_backend_failure() {
        let f = Fixture::new(10.0).await;
        for status in [StatusCode::BAD_GATEWAY, StatusCode::BAD_REQUEST] {
            let reply = f.pipeline(status).handle(&mut ctx(4.0)).await;
            assert_eq!(reply.status, status);
            assert_eq!(reply.header(REMAINING_HEADER), Some("10"));
        }
        let key = f.key().await;
        assert_eq!(key.quota_value, 0.0);
        assert_eq!(key.quota_value_failed, 8.0);
    }

    #[tokio::test]
    async fn store_outage_is_internal() {
        let f = Fixture::new(10.0).await;
        f.store.set_unavailable(true);
        let reply = f.pipeline(StatusCode::OK).handle(&mut ctx(1.0)).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
