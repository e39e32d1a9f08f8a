use actix_web::{
    Error,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header::{HeaderValue, RETRY_AFTER},
};
use common::error::AppError;
use governor::{
    Quota, RateLimiter,
    clock::{Clock, QuantaClock},
    state::{InMemoryState, NotKeyed},
};
use std::{future::Future, num::NonZeroU32, pin::Pin, rc::Rc, sync::Arc};

type Limiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// This limiter works for each request coming in (not per key).
/// Zero permits turns it into a pass-through.
#[derive(Clone)]
pub struct GlobalLimiter {
    limiter: Option<Arc<Limiter>>,
}

impl GlobalLimiter {
    pub fn new(permits_per_sec: u32) -> Self {
        let limiter = NonZeroU32::new(permits_per_sec)
            .map(|permits| Arc::new(RateLimiter::direct(Quota::per_second(permits))));
        Self { limiter }
    }
}

impl<S, B> Transform<S, ServiceRequest> for GlobalLimiter
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<actix_web::body::BoxBody>;
    type Error = Error;
    type Transform = GlobalLimiterService<S>;
    type InitError = ();
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(GlobalLimiterService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct GlobalLimiterService<S> {
    service: Rc<S>,
    limiter: Option<Arc<Limiter>>,
}

impl<S, B> Service<ServiceRequest> for GlobalLimiterService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<actix_web::body::BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let srv = Rc::clone(&self.service);
        let limiter = self.limiter.clone();
        Box::pin(async move {
            let Some(limiter) = limiter else {
                return srv.call(req).await.map(|res| res.map_into_boxed_body());
            };
            match limiter.check() {
                Ok(()) => srv.call(req).await.map(|res| res.map_into_boxed_body()),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(QuantaClock::default().now());
                    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                    let mut res = req.error_response(AppError::TooManyRequests(
                        "Server overloaded. Please try again later.".to_string(),
                    ));
                    res.headers_mut()
                        .insert(RETRY_AFTER, HeaderValue::from(secs.max(1)));
                    Ok(res)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpResponse, http::StatusCode, test, web};

    #[actix_web::test]
    async fn rejects_over_budget() {
        let app = test::init_service(
            App::new()
                .wrap(GlobalLimiter::new(1))
                .route("/", web::get().to(HttpResponse::Ok)),
        )
        .await;

        let first = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(first.status(), StatusCode::OK);
        let second = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(RETRY_AFTER));
    }

    #[actix_web::test]
    async fn zero_permits_passes_everything() {
        let app = test::init_service(
            App::new()
                .wrap(GlobalLimiter::new(0))
                .route("/", web::get().to(HttpResponse::Ok)),
        )
        .await;
        for _ in 0..5 {
            let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
            assert_eq!(res.status(), StatusCode::OK);
        }
    }
}
