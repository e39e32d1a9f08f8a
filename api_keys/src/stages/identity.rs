use async_trait::async_trait;
use common::{
    context::{Reply, RequestContext},
    pipeline::{Next, Stage},
};

const KEY_PARAM: &str = "key";
const KEY_HEADER: &str = "x-api-key";
const KEY_AUTH_SCHEME: &str = "Key ";

/// Explicit key token of a request: query `key`, then `X-API-KEY`, then
/// `Authorization: Key <token>`. Empty values count as absent.
pub fn key_token(ctx: &RequestContext) -> Option<String> {
    let header = |name: &str| {
        ctx.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ctx.query_param(KEY_PARAM)
        .or_else(|| header(KEY_HEADER))
        .or_else(|| {
            header("authorization")
                .and_then(|v| v.strip_prefix(KEY_AUTH_SCHEME).map(str::to_string))
        })
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Decides between an explicit key and the client IP as the identity.
pub struct IdentityStage;

#[async_trait]
impl Stage for IdentityStage {
    fn name(&self) -> String {
        "Identity".to_string()
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply {
        match key_token(ctx) {
            Some(token) => {
                ctx.key = Some(token);
                ctx.manual = true;
            }
            None => {
                ctx.key = Some(ctx.ip.clone()).filter(|ip| !ip.is_empty());
                ctx.manual = false;
            }
        }
        log::debug!("Identity resolved, manual={}", ctx.manual);
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{
        http::{
            Method,
            header::{HeaderMap, HeaderName, HeaderValue},
        },
        web::Bytes,
    };

    fn ctx(query: &str, headers: &[(&'static str, &'static str)]) -> RequestContext {
        let mut map = HeaderMap::new();
        for &(k, v) in headers {
            map.insert(HeaderName::from_static(k), HeaderValue::from_static(v));
        }
        RequestContext::new(Method::POST, "/tts", query, map, Bytes::new(), "5.6.7.8")
    }

    #[test]
    fn finds_key_in_all_sources() {
        assert_eq!(key_token(&ctx("key=q1", &[("x-api-key", "h1")])).as_deref(), Some("q1"));
        assert_eq!(key_token(&ctx("", &[("x-api-key", "h1")])).as_deref(), Some("h1"));
        assert_eq!(key_token(&ctx("", &[("authorization", "Key a1")])).as_deref(), Some("a1"));
        assert_eq!(key_token(&ctx("", &[("authorization", "Bearer a1")])), None);
        assert_eq!(key_token(&ctx("key=", &[])), None);
    }
}
