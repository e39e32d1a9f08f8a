use async_trait::async_trait;
use common::{
    context::{Reply, RequestContext},
    error::AppError,
    pipeline::{Next, Stage},
};

use crate::rate::RateLimiter;

pub const SHORT_REMAINING_HEADER: &str = "x-rate-limit-short-remaining";

/// Short-window request throttle per identity, independent of credits.
pub struct RateLimitStage {
    limiter: RateLimiter,
    project: String,
    /// Used when the key carries no `x-rate-limit` tag; 0 disables the check.
    default_limit: i64,
}

impl RateLimitStage {
    pub fn new(limiter: RateLimiter, project: &str, default_limit: i64) -> Self {
        Self {
            limiter,
            project: project.to_string(),
            default_limit,
        }
    }

    fn counter_key(&self, ctx: &RequestContext) -> Option<String> {
        let id = match (ctx.key_id, ctx.key.as_deref()) {
            (Some(id), _) => id.to_string(),
            (None, Some(key)) => key.to_string(),
            (None, None) => return None,
        };
        Some(format!("{}:{}:{}", self.project, id, ctx.manual))
    }
}

/// Counter units charged for a request: its cost rounded up, at least one.
fn units(cost: f64) -> i64 {
    if cost.is_finite() && cost > 1.0 {
        cost.ceil() as i64
    } else {
        1
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> String {
        format!(
            "RateLimit({}/{}s)",
            self.default_limit,
            self.limiter.window().as_secs()
        )
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply {
        let limit = ctx.rate_limit.unwrap_or(self.default_limit);
        let Some(key) = self.counter_key(ctx).filter(|_| limit > 0) else {
            return next.run(ctx).await;
        };

        let decision = match self.limiter.validate(&key, limit, units(ctx.cost)).await {
            Ok(decision) => decision,
            Err(e) => return ctx.reject(e),
        };

        if !decision.allowed {
            let retry_after = decision.retry_after.unwrap_or(1);
            log::debug!("Rate limit {} reached, retry in {}s", limit, retry_after);
            let mut reply = ctx.reject(AppError::TooManyRequests(format!(
                "limit of {} units per {}s reached",
                limit,
                self.limiter.window().as_secs()
            )));
            reply.set_header("retry-after", &retry_after.to_string());
            reply.set_header(SHORT_REMAINING_HEADER, "0");
            return reply;
        }

        let mut reply = next.run(ctx).await;
        reply.set_header(SHORT_REMAINING_HEADER, &decision.remaining.to_string());
        reply
    }
}
