use std::time::Duration;

use actix_web::{
    http::{
        StatusCode,
        header::{HeaderName, HeaderValue},
    },
    web::Bytes,
};
use async_trait::async_trait;
use common::{
    context::{Reply, RequestContext},
    error::{AppError, Res},
    pipeline::{Next, Stage},
};
use url::Url;

/// Connection scoped headers that must not be forwarded in either direction.
const HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.contains(&name)
}

/// Terminal stage forwarding the request to one backend.
///
/// Only the status code is interpreted; body and headers pass through.
pub struct ProxyStage {
    client: reqwest::Client,
    backend: Url,
    timeout: Duration,
}

impl ProxyStage {
    pub fn new(client: reqwest::Client, backend: &str, timeout: Duration) -> Res<Self> {
        let backend = Url::parse(backend)
            .map_err(|e| AppError::Validation(format!("wrong backend '{}': {}", backend, e)))?;
        Ok(Self {
            client,
            backend,
            timeout,
        })
    }

    /// Backend URL with the backend path joined to the forwarded path.
    fn target(&self, path: &str, query: &str) -> String {
        let base = self.backend.as_str().trim_end_matches('/');
        let mut url = match path {
            "" => format!("{}/", base),
            p if p.starts_with('/') => format!("{}{}", base, p),
            p => format!("{}/{}", base, p),
        };
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    async fn forward(&self, ctx: &RequestContext) -> Res<Reply> {
        let method = reqwest::Method::from_bytes(ctx.method.as_str().as_bytes())
            .map_err(|e| AppError::BadRequest(format!("wrong method: {}", e)))?;
        let mut request = self
            .client
            .request(method, self.target(&ctx.path, &ctx.query))
            .timeout(self.timeout)
            .body(ctx.body.clone());

        for (name, value) in ctx.headers.iter() {
            if is_hop_header(name.as_str()) || name.as_str() == "host" {
                continue;
            }
            request = request.header(name.as_str(), value.as_bytes());
        }
        if let Some(host) = ctx.headers.get("host") {
            request = request.header("x-forwarded-host", host.as_bytes());
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| AppError::BadGateway(format!("wrong status: {}", e)))?;

        let mut reply = Reply::new(status);
        for (name, value) in response.headers() {
            if is_hop_header(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                reply.headers.append(name, value);
            }
        }
        let body: Bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        reply.body = body;
        Ok(reply)
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::GatewayTimeout(format!("no answer in {}s", self.timeout.as_secs()))
        } else {
            log::error!("Proxy error to {}: {}", self.backend, e);
            AppError::BadGateway("backend unreachable".to_string())
        }
    }
}

#[async_trait]
impl Stage for ProxyStage {
    fn name(&self) -> String {
        format!("Proxy({})", self.backend)
    }

    async fn handle(&self, ctx: &mut RequestContext, _next: Next<'_>) -> Reply {
        match self.forward(ctx).await {
            Ok(reply) => {
                ctx.response_code = reply.status.as_u16();
                reply
            }
            Err(e) => {
                log::warn!("Request {} to {} failed: {}", ctx.request_id, self.backend, e);
                ctx.reject(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(backend: &str) -> ProxyStage {
        ProxyStage::new(reqwest::Client::new(), backend, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn joins_backend_and_path() {
        assert_eq!(proxy("http://tts:8000").target("/synth", ""), "http://tts:8000/synth");
        assert_eq!(proxy("http://tts:8000/api/").target("/synth", "a=1"), "http://tts:8000/api/synth?a=1");
        assert_eq!(proxy("http://tts:8000/api").target("", ""), "http://tts:8000/api/");
        assert_eq!(proxy("http://tts:8000").target("synth", ""), "http://tts:8000/synth");
    }

    #[test]
    fn rejects_bad_backend() {
        assert!(ProxyStage::new(reqwest::Client::new(), "not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn skips_connection_headers() {
        assert!(is_hop_header("connection"));
        assert!(is_hop_header("transfer-encoding"));
        assert!(!is_hop_header("content-type"));
    }
}
