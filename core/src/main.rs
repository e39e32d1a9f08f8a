use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use common::{env_config::Config, hash::Hasher};
use db::{PgStore, Store};
use gateway::{
    chain::Services,
    redis::setup_redis,
    server::{self, Gateway},
};
use limiter::rate::{CounterStore, RedisCounter};
use reset::Resetter;
use tokio::sync::watch;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // get env vars
    let config = Config::from_env().expect("Failed to load configuration");

    // init logger
    logger::setup(&config.log_level, &config.log_file).expect("Failed to set up logger");

    // init db connection
    let pool = db::setup(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to set up database");
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    // init Redis
    let counter = match &config.redis_url {
        Some(url) => {
            let pool = setup_redis(url).expect("Failed to set up Redis");
            Some(Arc::new(RedisCounter::new(pool)) as Arc<dyn CounterStore>)
        }
        None => {
            log::warn!("REDIS_URL is not set, rate limiting is disabled");
            None
        }
    };

    let services = Services {
        store: store.clone(),
        hasher: Arc::new(Hasher::new(&config.hash_salt).expect("Failed to init key hasher")),
        counter,
        client: reqwest::Client::new(),
        log_sync: config.log_sync,
    };
    let gateway = Gateway::from_config(&config, &services).expect("Failed to build routes");
    for line in gateway.describe() {
        log::info!("{}", line);
    }
    let gateway = web::Data::new(gateway);

    // monthly reset
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reset_task = if config.reset.projects.is_empty() {
        log::info!("No projects to reset");
        None
    } else {
        let resetter = Resetter::new(store, config.reset.projects.clone(), config.reset.grace);
        Some(tokio::spawn(reset::run(resetter, config.reset.retry, shutdown_rx)))
    };

    let global_limiter = limiter::global_middleware(config.global_rps);
    log::info!("Listening on {}:{}", config.server_host, config.server_port);
    let result = HttpServer::new(move || {
        App::new()
            .wrap(global_limiter.clone())
            .configure(server::configure(gateway.clone()))
    })
    .bind((config.server_host.as_str(), config.server_port))?
    .workers(config.num_workers)
    .run()
    .await;

    // server stopped on a signal, let the reset loop finish its iteration
    let _ = shutdown_tx.send(true);
    if let Some(task) = reset_task {
        if let Err(e) = task.await {
            log::error!("Reset task failed: {}", e);
        }
    }
    result
}
