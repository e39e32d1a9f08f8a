use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    context::{Reply, RequestContext},
    error::AppError,
    pipeline::{Next, Stage},
};

use crate::extractors::{CostError, CostExtractor};

/// Fills `ctx.cost` from the configured extractor, bounded by a timeout.
pub struct CostStage {
    extractor: Arc<dyn CostExtractor>,
    timeout: Duration,
}

impl CostStage {
    pub fn new(extractor: Arc<dyn CostExtractor>, timeout: Duration) -> Self {
        Self { extractor, timeout }
    }
}

#[async_trait]
impl Stage for CostStage {
    fn name(&self) -> String {
        format!("Cost({})", self.extractor.name())
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply {
        let call = self.extractor.get(&ctx.path, &ctx.body);
        let extracted = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(extracted)) => extracted,
            Ok(Err(CostError::Input(msg))) => return ctx.reject(AppError::BadRequest(msg)),
            Ok(Err(CostError::Service(msg))) => return ctx.reject(AppError::Internal(msg)),
            Err(_) => {
                return ctx.reject(AppError::Internal(format!(
                    "cost extraction timed out after {:?}",
                    self.timeout
                )));
            }
        };
        if !extracted.cost.is_finite() || extracted.cost < 0.0 {
            return ctx.reject(AppError::Internal(format!("wrong cost {}", extracted.cost)));
        }
        log::debug!("Request cost {}", extracted.cost);
        ctx.cost = extracted.cost;
        ctx.value = extracted.value;
        next.run(ctx).await
    }
}
