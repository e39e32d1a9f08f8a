use std::{sync::Arc, time::Duration};

use common::hash::Hasher;
use db::Store;
use middleware::global::GlobalLimiter;
use rate::{CounterStore, RateLimiter};
use stages::{quota::QuotaStage, rate::RateLimitStage};

pub mod rate;

pub mod middleware {
    pub mod global;
}

pub mod stages {
    pub mod quota;
    pub mod rate;
}

pub fn global_middleware(permits_per_second: u32) -> GlobalLimiter {
    GlobalLimiter::new(permits_per_second)
}

pub fn rate_limit(
    counter: Arc<dyn CounterStore>,
    window: Duration,
    project: &str,
    default_limit: i64,
) -> RateLimitStage {
    RateLimitStage::new(RateLimiter::new(counter, window), project, default_limit)
}

pub fn quota(store: Arc<dyn Store>, hasher: Arc<Hasher>, project: &str) -> QuotaStage {
    QuotaStage::new(store, hasher, project)
}
