use std::{env, str::FromStr, sync::Arc, time::Duration};

use crate::{
    error::{AppError, Res},
    ip::IpExtractor,
};

#[derive(Clone, Debug)]
/// Configuration struct for the gateway.
///
/// Holds everything needed to start the server: storage connections,
/// listener settings, logging preferences, the reset schedule and the
/// table of proxied routes.
pub struct Config {
    /// The URL of the database to connect to.
    pub database_url: String,
    /// The URL of Redis server to connect to. Rate limiting is off without it.
    pub redis_url: Option<String>,
    /// The hostname or IP address the server will bind to.
    pub server_host: String,
    /// The port number the server will listen on.
    pub server_port: u16,
    /// The number of worker threads to spawn for handling requests.
    pub num_workers: usize,
    pub db_max_connections: u32,
    pub log_level: String,
    pub log_file: String,
    /// Write request logs inline instead of on a spawned task.
    pub log_sync: bool,
    /// Secret for hashing API keys.
    pub hash_salt: String,
    pub ip_extractor: IpExtractor,
    /// Process-wide requests per second, 0 disables the guard.
    pub global_rps: u32,
    pub reset: ResetConfig,
    pub routes: Vec<RouteConfig>,
    /// Backend for requests no route matches.
    pub default_backend: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ResetConfig {
    /// Projects to replenish together with their monthly credit target.
    pub projects: Vec<(String, f64)>,
    /// Delay before retrying a failed reset run.
    pub retry: Duration,
    /// Age after which an unfinished run of another instance is taken over.
    pub grace: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteType {
    /// Full chain: identity, rate limit, cost, credit reservation, log.
    Quota,
    /// Validates the key and logs, without metering.
    Simple,
}

impl FromStr for RouteType {
    type Err = AppError;

    fn from_str(s: &str) -> Res<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "quota" => Ok(RouteType::Quota),
            "simple" => Ok(RouteType::Simple),
            other => Err(AppError::Validation(format!("Unknown route type '{}'", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaType {
    /// Every call costs `quota_value`.
    Fixed,
    /// Cost is the character length of a JSON string field.
    Json,
}

impl FromStr for QuotaType {
    type Err = AppError;

    fn from_str(s: &str) -> Res<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "fixed" => Ok(QuotaType::Fixed),
            "json" => Ok(QuotaType::Json),
            other => Err(AppError::Validation(format!("Unknown quota type '{}'", other))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RouteConfig {
    pub name: String,
    /// Lower-cased path prefix.
    pub prefix: String,
    pub backend: String,
    /// Upper-cased methods; empty matches any.
    pub methods: Vec<String>,
    pub kind: RouteType,
    pub project: String,
    pub quota_type: QuotaType,
    pub quota_field: String,
    pub quota_value: f64,
    /// Credits granted to a freshly seen IP; 0 disables IP identities.
    pub quota_default: f64,
    /// Requests per window, 0 disables the short-window limit.
    pub rate_limit_default: i64,
    pub rate_limit_window: Duration,
    pub strip_prefix: Option<String>,
    pub clean_headers: Option<String>,
    pub timeout: Duration,
    pub cost_timeout: Duration,
}

impl Config {
    /// Creates a new `Config` instance from environment variables.
    ///
    /// Loads `.env` first when present. See [`Config::from_lookup`] for the
    /// variables read.
    pub fn from_env() -> Res<Arc<Self>> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok()).map(Arc::new)
    }

    /// Builds the configuration from an arbitrary variable source.
    ///
    /// Required:
    /// - `DATABASE_URL`
    /// - `HASH_SALT`: at least 30 characters
    ///
    /// Optional (with defaults):
    /// - `REDIS_URL`: none, rate limiting disabled
    /// - `IP` / `PORT` / `WORKERS`: "127.0.0.1" / 8080 / 4
    /// - `LOG_LEVEL` / `LOG_FILE` / `LOG_SYNC`: "info" / "gateway.log" / false
    /// - `IP_EXTRACT_TYPE`: "firstForwardFor"
    /// - `GLOBAL_RPS`: 0
    /// - `DB_MAX_CONNECTIONS`: 10
    /// - `RESET_PROJECTS`: empty, `project:limit,...`
    /// - `RESET_RETRY_SECS` / `RESET_GRACE_SECS`: 3600 / 3600
    /// - `PROXY_HANDLERS` plus `PROXY_<NAME>_*` per route
    /// - `PROXY_DEFAULT_BACKEND`
    pub fn from_lookup<F>(lookup: F) -> Res<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let hash_salt = vars.required("HASH_SALT")?;
        if hash_salt.len() < 30 {
            return Err(AppError::Validation(
                "HASH_SALT must be at least 30 characters".to_string(),
            ));
        }

        let routes = vars
            .get("PROXY_HANDLERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|name| RouteConfig::from_vars(&vars, name))
            .collect::<Res<Vec<_>>>()?;

        Ok(Config {
            database_url: vars.required("DATABASE_URL")?,
            redis_url: vars.get("REDIS_URL"),
            server_host: vars.get("IP").unwrap_or_else(|| "127.0.0.1".to_string()),
            server_port: vars.parse("PORT", 8080)?,
            num_workers: vars.parse("WORKERS", 4)?,
            db_max_connections: vars.parse("DB_MAX_CONNECTIONS", 10)?,
            log_level: vars.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file: vars.get("LOG_FILE").unwrap_or_else(|| "gateway.log".to_string()),
            log_sync: vars.flag("LOG_SYNC"),
            hash_salt,
            ip_extractor: vars.get("IP_EXTRACT_TYPE").unwrap_or_default().parse()?,
            global_rps: vars.parse("GLOBAL_RPS", 0)?,
            reset: ResetConfig {
                projects: parse_reset_projects(&vars.get("RESET_PROJECTS").unwrap_or_default())?,
                retry: Duration::from_secs(vars.parse("RESET_RETRY_SECS", 3600)?),
                grace: Duration::from_secs(vars.parse("RESET_GRACE_SECS", 3600)?),
            },
            routes,
            default_backend: vars.get("PROXY_DEFAULT_BACKEND"),
        })
    }
}

impl RouteConfig {
    fn from_vars(vars: &Vars<'_>, name: &str) -> Res<Self> {
        let key = |suffix: &str| format!("PROXY_{}_{}", name.to_uppercase(), suffix);

        let backend = vars.required(&key("BACKEND"))?;
        url::Url::parse(&backend)
            .map_err(|e| AppError::Validation(format!("{}: wrong backend url: {}", name, e)))?;

        let window: u64 = vars.parse(&key("RATE_LIMIT_WINDOW"), 1)?;
        if window < 1 {
            return Err(AppError::Validation(format!(
                "{}: rate limit window must be at least 1s",
                name
            )));
        }

        let quota_type: QuotaType = vars.get(&key("QUOTA_TYPE")).unwrap_or_default().parse()?;
        let quota_field = vars.get(&key("QUOTA_FIELD")).unwrap_or_default();
        if quota_type == QuotaType::Json && quota_field.is_empty() {
            return Err(AppError::Validation(format!("{}: json quota needs a field", name)));
        }

        Ok(RouteConfig {
            name: name.to_string(),
            prefix: vars.required(&key("PREFIX_URL"))?.to_lowercase(),
            backend,
            methods: vars
                .get(&key("METHOD"))
                .unwrap_or_default()
                .split(',')
                .map(|m| m.trim().to_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
            kind: vars.get(&key("TYPE")).unwrap_or_default().parse()?,
            project: vars.get(&key("DB")).unwrap_or_else(|| "default".to_string()),
            quota_type,
            quota_field,
            quota_value: vars.parse(&key("QUOTA_VALUE"), 1.0)?,
            quota_default: vars.parse(&key("QUOTA_DEFAULT"), 0.0)?,
            rate_limit_default: vars.parse(&key("RATE_LIMIT_DEFAULT"), 0)?,
            rate_limit_window: Duration::from_secs(window),
            strip_prefix: vars.get(&key("STRIP_PREFIX")),
            clean_headers: vars.get(&key("CLEAN_HEADERS")),
            timeout: Duration::from_secs(vars.parse(&key("TIMEOUT_SECS"), 60)?),
            cost_timeout: Duration::from_secs(vars.parse(&key("COST_TIMEOUT_SECS"), 10)?),
        })
    }
}

fn parse_reset_projects(s: &str) -> Res<Vec<(String, f64)>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (project, limit) = p.split_once(':').ok_or_else(|| {
                AppError::Validation(format!("RESET_PROJECTS entry '{}' needs project:limit", p))
            })?;
            let limit = limit.trim().parse::<f64>().map_err(|e| {
                AppError::Validation(format!("RESET_PROJECTS limit '{}': {}", limit, e))
            })?;
            if limit <= 0.0 {
                return Err(AppError::Validation(format!(
                    "RESET_PROJECTS limit for '{}' must be positive",
                    project
                )));
            }
            Ok((project.trim().to_string(), limit))
        })
        .collect()
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Res<String> {
        self.get(name)
            .ok_or_else(|| AppError::Validation(format!("{} must be set", name)))
    }

    fn parse<T>(&self, name: &str, default: T) -> Res<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(v) => v
                .parse()
                .map_err(|e| AppError::Validation(format!("{} must be a valid number: {}", name, e))),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str) -> bool {
        matches!(
            self.get(name).map(|v| v.to_lowercase()).as_deref(),
            Some("1" | "true" | "yes")
        )
    }
}
