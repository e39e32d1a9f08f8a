use std::{sync::Arc, time::Duration};

use common::env_config::{QuotaType, RouteConfig};
use extractors::{CostExtractor, FixedCost, JsonFieldLength};
use stages::cost::CostStage;

pub mod extractors;

pub mod stages {
    pub mod cost;
}

/// Extractor selected by the route's quota type.
pub fn for_route(route: &RouteConfig) -> Arc<dyn CostExtractor> {
    match route.quota_type {
        QuotaType::Fixed => Arc::new(FixedCost(route.quota_value)),
        QuotaType::Json => Arc::new(JsonFieldLength::new(&route.quota_field)),
    }
}

pub fn cost(extractor: Arc<dyn CostExtractor>, timeout: Duration) -> CostStage {
    CostStage::new(extractor, timeout)
}
