use async_trait::async_trait;
use common::{
    context::{Reply, RequestContext},
    error::AppError,
    pipeline::{Next, Stage},
    tag,
};

use crate::{dtos::key::Validation, service::key::KeyValidator};

/// Validates the resolved identity, provisioning IP identities when the
/// route grants them credits.
pub struct KeyValidStage {
    validator: KeyValidator,
    /// Credits for a new IP identity; 0 requires an explicit key.
    ip_quota: f64,
}

impl KeyValidStage {
    pub fn new(validator: KeyValidator, ip_quota: f64) -> Self {
        Self { validator, ip_quota }
    }
}

#[async_trait]
impl Stage for KeyValidStage {
    fn name(&self) -> String {
        if self.ip_quota > 0.0 {
            format!("KeyValidOrIP({}, {})", self.validator.project(), self.ip_quota)
        } else {
            format!("KeyValid({})", self.validator.project())
        }
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply {
        let Some(token) = ctx.key.clone() else {
            return ctx.reject(AppError::Unauthorized("No key".to_string()));
        };

        if !ctx.manual {
            if self.ip_quota <= 0.0 {
                return ctx.reject(AppError::Unauthorized("No key".to_string()));
            }
            if let Err(e) = self.validator.check_create_ip_key(&token, self.ip_quota).await {
                return ctx.reject(e);
            }
        }

        match self.validator.is_valid(&token, ctx.manual, &ctx.ip).await {
            Ok(Validation::Valid { key_id, tags }) => {
                ctx.rate_limit = match tag::rate_limit(&tags) {
                    Ok(limit) => limit,
                    Err(e) => return ctx.reject(AppError::Internal(e.to_string())),
                };
                ctx.key_id = Some(key_id);
                ctx.tags = tags;
                next.run(ctx).await
            }
            Ok(denied) => {
                log::info!("Denied request from {}: {}", ctx.ip, denied.reason());
                ctx.reject(AppError::Unauthorized(denied.reason().to_string()))
            }
            Err(e) => ctx.reject(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dtos::key::CreateKeyRequest, service::key::create_key, stages::identity::IdentityStage};
    use actix_web::{
        http::{Method, StatusCode, header::HeaderMap},
        web::Bytes,
    };
    use chrono::{TimeDelta, Utc};
    use common::{
        hash::Hasher,
        pipeline::{Pipeline, Respond},
    };
    use db::{MemoryStore, Store, dtos::key::KeyRef};
    use std::sync::Arc;

    const SALT: &str = "0123456789012345678901234567890123456789";

    struct Fixture {
        store: Arc<MemoryStore>,
        hasher: Arc<Hasher>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                hasher: Arc::new(Hasher::new(SALT).unwrap()),
            }
        }

        fn pipeline(&self, ip_quota: f64) -> Pipeline {
            let validator = KeyValidator::new(self.store.clone(), self.hasher.clone(), "tts");
            Pipeline::default()
                .push(IdentityStage)
                .push(KeyValidStage::new(validator, ip_quota))
                .push(Respond(StatusCode::OK))
        }

        async fn key(&self, tags: Vec<String>) -> String {
            let created = create_key(
                self.store.as_ref(),
                &self.hasher,
                "tts",
                CreateKeyRequest {
                    limit: 10.0,
                    valid_to: Utc::now() + TimeDelta::days(1),
                    tags,
                    ip_white_list: String::new(),
                    description: String::new(),
                    external_id: None,
                },
            )
            .await
            .unwrap();
            created.secret
        }
    }

    fn ctx(query: &str) -> RequestContext {
        RequestContext::new(Method::POST, "/tts", query, HeaderMap::new(), Bytes::new(), "7.7.7.7")
    }

    #[tokio::test]
    async fn explicit_key_passes_with_tags() {
        let f = Fixture::new();
        let secret = f.key(vec!["x-rate-limit:3".into(), "x-voice:olga".into()]).await;
        let mut c = ctx(&format!("key={}", secret));

        let reply = f.pipeline(0.0).handle(&mut c).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(c.manual);
        assert!(c.key_id.is_some());
        assert_eq!(c.rate_limit, Some(3));
        assert_eq!(c.tags.len(), 2);
    }

    #[tokio::test]
    async fn unknown_key_is_unauthorized() {
        let f = Fixture::new();
        let mut c = ctx("key=nope");
        let reply = f.pipeline(100.0).handle(&mut c).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(f.store.key_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn ip_identity_is_provisioned() {
        let f = Fixture::new();
        let mut c = ctx("");
        let reply = f.pipeline(1000.0).handle(&mut c).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(!c.manual);

        let key = f.store.find_key(&KeyRef::ip("tts", "7.7.7.7")).await.unwrap().unwrap();
        assert_eq!(Some(key.id), c.key_id);
        assert_eq!(key.quota_limit, 1000.0);

        let mut again = ctx("");
        f.pipeline(1000.0).handle(&mut again).await;
        assert_eq!(again.key_id, c.key_id);
        assert_eq!(f.store.key_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn no_key_without_ip_quota() {
        let f = Fixture::new();
        let mut c = ctx("");
        let reply = f.pipeline(0.0).handle(&mut c).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_rate_tag_is_internal() {
        let f = Fixture::new();
        let secret = f.key(vec!["x-rate-limit:many".into()]).await;
        let mut c = ctx(&format!("key={}", secret));
        let reply = f.pipeline(0.0).handle(&mut c).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn store_outage_is_internal() {
        let f = Fixture::new();
        f.store.set_unavailable(true);
        let mut c = ctx("key=any");
        let reply = f.pipeline(0.0).handle(&mut c).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
