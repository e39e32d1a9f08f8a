use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, web};
use common::{
    context::RequestContext,
    env_config::Config,
    error::{AppError, Res},
    ip::IpExtractor,
};

use crate::{
    chain::{Services, build_table},
    routes::RouteTable,
};

/// Largest accepted request body.
pub const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Everything a request needs, shared by all workers.
pub struct Gateway {
    routes: RouteTable,
    ip_extractor: IpExtractor,
}

impl Gateway {
    pub fn new(routes: RouteTable, ip_extractor: IpExtractor) -> Self {
        Self {
            routes,
            ip_extractor,
        }
    }

    pub fn from_config(config: &Config, services: &Services) -> Res<Self> {
        Ok(Self::new(build_table(config, services)?, config.ip_extractor))
    }

    pub fn describe(&self) -> Vec<String> {
        self.routes.describe()
    }
}

/// Catch-all handler running the matched pipeline.
///
/// The pipeline runs on its own task so a client disconnect cannot cut it
/// between reservation and reconciliation.
pub async fn handle(req: HttpRequest, body: web::Bytes, gateway: web::Data<Gateway>) -> HttpResponse {
    let peer = req.peer_addr().map(|a| a.to_string());
    let ip = gateway.ip_extractor.extract(req.headers(), peer.as_deref());
    let mut ctx = RequestContext::new(
        req.method().clone(),
        req.path(),
        req.query_string(),
        req.headers().clone(),
        body,
        &ip,
    );

    let gateway: Arc<Gateway> = gateway.into_inner();
    let task = actix_web::rt::spawn(async move {
        let pipeline = gateway.routes.find(&ctx.method, &ctx.path);
        pipeline.handle(&mut ctx).await
    });
    match task.await {
        Ok(reply) => reply.into_http_response(),
        Err(e) => AppError::Internal(format!("request task failed: {}", e)).to_http_response(),
    }
}

/// Registers the gateway on an app. Used by the binary and by tests.
pub fn configure(gateway: web::Data<Gateway>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(gateway)
            .app_data(web::PayloadConfig::new(MAX_BODY_SIZE))
            .default_service(web::to(handle));
    }
}
