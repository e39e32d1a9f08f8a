use std::{sync::Arc, time::Duration};

use actix_web::http::Method;
use common::{
    env_config::{Config, RouteConfig, RouteType},
    error::{AppError, Res},
    hash::Hasher,
    pipeline::Pipeline,
};
use db::Store;
use limiter::rate::CounterStore;

use crate::{
    proxy::ProxyStage,
    routes::{Route, RouteTable},
    stages::{
        headers::{CleanHeaders, FillHeaders},
        path::StripPrefix,
    },
};

const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared handles every route is built from.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub hasher: Arc<Hasher>,
    /// Rate limiting is off without a counter store.
    pub counter: Option<Arc<dyn CounterStore>>,
    pub client: reqwest::Client,
    pub log_sync: bool,
}

/// Stages between admission and the backend, shared by both route types.
fn forward(route: &RouteConfig, services: &Services, mut pipeline: Pipeline) -> Res<Pipeline> {
    if let Some(prefix) = &route.strip_prefix {
        pipeline = pipeline.push(StripPrefix::new(prefix));
    }
    if let Some(starting) = &route.clean_headers {
        pipeline = pipeline.push(CleanHeaders::new(starting)?);
    }
    Ok(pipeline
        .push(FillHeaders)
        .push(ProxyStage::new(services.client.clone(), &route.backend, route.timeout)?))
}

pub fn build_route(route: &RouteConfig, services: &Services) -> Res<Route> {
    let ip_quota = match route.kind {
        RouteType::Quota => route.quota_default,
        RouteType::Simple => 0.0,
    };
    let mut pipeline = Pipeline::default()
        .push(api_keys::identity())
        .push(api_keys::key_valid(
            services.store.clone(),
            services.hasher.clone(),
            &route.project,
            ip_quota,
        ))
        .push(logger::log_stage(services.store.clone(), services.log_sync));

    if route.kind == RouteType::Quota {
        pipeline = pipeline.push(extractor::cost(extractor::for_route(route), route.cost_timeout));
        match &services.counter {
            Some(counter) if route.rate_limit_default != 0 => {
                pipeline = pipeline.push(limiter::rate_limit(
                    counter.clone(),
                    route.rate_limit_window,
                    &route.project,
                    route.rate_limit_default,
                ));
            }
            Some(_) => log::info!("No rate limit for {}", route.name),
            None if route.rate_limit_default != 0 => {
                log::warn!("Rate limit for {} is configured but no Redis is set", route.name)
            }
            None => {}
        }
        pipeline = pipeline.push(limiter::quota(
            services.store.clone(),
            services.hasher.clone(),
            &route.project,
        ));
    }

    let methods = route
        .methods
        .iter()
        .map(|m| {
            Method::from_bytes(m.as_bytes())
                .map_err(|e| AppError::Validation(format!("wrong method '{}' for {}: {}", m, route.name, e)))
        })
        .collect::<Res<Vec<_>>>()?;

    Ok(Route::new(
        &route.name,
        &route.prefix,
        methods,
        forward(route, services, pipeline)?,
    ))
}

/// Assembles all configured routes. Unmatched requests go to the default
/// backend unmetered, or get 404 when there is none.
pub fn build_table(config: &Config, services: &Services) -> Res<RouteTable> {
    let routes = config
        .routes
        .iter()
        .map(|r| build_route(r, services))
        .collect::<Res<Vec<_>>>()?;
    let fallback = config
        .default_backend
        .as_deref()
        .map(|backend| {
            ProxyStage::new(services.client.clone(), backend, DEFAULT_BACKEND_TIMEOUT)
                .map(|proxy| Pipeline::default().push(proxy))
        })
        .transpose()?;
    Ok(RouteTable::new(routes, fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryStore;
    use limiter::rate::MemoryCounter;
    use std::collections::HashMap;

    const SALT: &str = "0123456789012345678901234567890123456789";

    fn config(pairs: &[(&str, &str)]) -> Config {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.insert("DATABASE_URL".into(), "postgres://x".into());
        map.insert("HASH_SALT".into(), SALT.into());
        Config::from_lookup(move |name| map.get(name).cloned()).unwrap()
    }

    fn services(counter: bool) -> Services {
        Services {
            store: Arc::new(MemoryStore::new()),
            hasher: Arc::new(Hasher::new(SALT).unwrap()),
            counter: counter.then(|| Arc::new(MemoryCounter::new()) as Arc<dyn CounterStore>),
            client: reqwest::Client::new(),
            log_sync: true,
        }
    }

    #[test]
    fn assembles_quota_route() {
        let cfg = config(&[
            ("PROXY_HANDLERS", "tts"),
            ("PROXY_TTS_PREFIX_URL", "/tts"),
            ("PROXY_TTS_BACKEND", "http://tts:8000"),
            ("PROXY_TTS_TYPE", "quota"),
            ("PROXY_TTS_DB", "tts"),
            ("PROXY_TTS_QUOTA_TYPE", "json"),
            ("PROXY_TTS_QUOTA_FIELD", "text"),
            ("PROXY_TTS_RATE_LIMIT_DEFAULT", "5"),
            ("PROXY_TTS_STRIP_PREFIX", "/tts"),
            ("PROXY_TTS_CLEAN_HEADERS", "x-doorman-"),
        ]);
        let route = build_route(&cfg.routes[0], &services(true)).unwrap();
        let names = route.pipeline.describe();
        let kinds: Vec<&str> = names.iter().map(|n| n.split('(').next().unwrap_or("")).collect();
        assert_eq!(
            kinds,
            vec![
                "Identity",
                "KeyValid",
                "LogDB",
                "Cost",
                "RateLimit",
                "Quota",
                "StripPrefix",
                "CleanHeaders",
                "FillHeaders",
                "Proxy"
            ]
        );
    }

    #[test]
    fn simple_route_has_no_metering() {
        let cfg = config(&[
            ("PROXY_HANDLERS", "info"),
            ("PROXY_INFO_PREFIX_URL", "/info"),
            ("PROXY_INFO_BACKEND", "http://info:8000"),
            ("PROXY_INFO_TYPE", "simple"),
            ("PROXY_INFO_RATE_LIMIT_DEFAULT", "5"),
        ]);
        let route = build_route(&cfg.routes[0], &services(false)).unwrap();
        assert_eq!(route.pipeline.len(), 5);
        assert!(!route.pipeline.describe().iter().any(|n| n.starts_with("Quota")));
    }

    #[test]
    fn default_backend_is_unmetered() {
        let cfg = config(&[("PROXY_DEFAULT_BACKEND", "http://fallback:80")]);
        let table = build_table(&cfg, &services(false)).unwrap();
        assert_eq!(table.describe(), vec!["default -> Proxy(http://fallback/)"]);
    }
}
