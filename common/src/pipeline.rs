use std::sync::Arc;

use actix_web::http::StatusCode;
use async_trait::async_trait;

use crate::{
    context::{Reply, RequestContext},
    error::AppError,
};

/// One step of the request chain.
///
/// A stage either answers the request itself (short-circuit) or calls
/// `next.run(ctx)` and may post-process the reply it gets back.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Human readable description, used when printing the assembled chain.
    fn name(&self) -> String;

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply;
}

/// The remainder of the chain after the current stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut RequestContext) -> Reply {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.handle(ctx, Next { stages: rest }).await,
            None => ctx.reject(AppError::Internal(
                "request chain ended without a terminal stage".to_string(),
            )),
        }
    }
}

/// An ordered list of stages assembled once at startup.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn push(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn describe(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn handle(&self, ctx: &mut RequestContext) -> Reply {
        Next {
            stages: &self.stages,
        }
        .run(ctx)
        .await
    }
}

/// Terminal stage answering with a fixed status.
pub struct Respond(pub StatusCode);

#[async_trait]
impl Stage for Respond {
    fn name(&self) -> String {
        format!("Respond({})", self.0.as_u16())
    }

    async fn handle(&self, ctx: &mut RequestContext, _next: Next<'_>) -> Reply {
        ctx.response_code = self.0.as_u16();
        Reply::new(self.0)
    }
}
