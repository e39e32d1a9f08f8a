use async_trait::async_trait;
use common::{
    context::{Reply, RequestContext},
    pipeline::{Next, Stage},
};

/// Removes a fixed prefix from the forwarded path.
pub struct StripPrefix {
    prefix: String,
}

impl StripPrefix {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl Stage for StripPrefix {
    fn name(&self) -> String {
        format!("StripPrefix({})", self.prefix)
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply {
        match ctx.path.strip_prefix(&self.prefix) {
            Some(rest) => ctx.path = rest.to_string(),
            None => log::warn!("Path '{}' was not stripped by '{}'", ctx.path, self.prefix),
        }
        next.run(ctx).await
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

    #[tokio::test]
    async fn strips_only_matching_prefix() {
        let pipeline = Pipeline::default()
            .push(StripPrefix::new("/tts"))
            .push(Respond(StatusCode::OK));

        let mut ctx = RequestContext::new(Method::GET, "/tts/synth", "", HeaderMap::new(), Bytes::new(), "ip");
        pipeline.handle(&mut ctx).await;
        assert_eq!(ctx.path, "/synth");
        assert_eq!(ctx.original_path, "/tts/synth");

        let mut ctx = RequestContext::new(Method::GET, "/asr/x", "", HeaderMap::new(), Bytes::new(), "ip");
        pipeline.handle(&mut ctx).await;
        assert_eq!(ctx.path, "/asr/x");
    }
}
