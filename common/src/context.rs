use actix_web::{
    HttpResponse,
    http::{
        Method, StatusCode,
        header::{HeaderMap, HeaderName, HeaderValue},
    },
    web::Bytes,
};
use uuid::Uuid;

use crate::error::AppError;

/// Per-request state shared by every stage of a pipeline.
///
/// Created once when the request enters the gateway and dropped after the
/// request log is written. Nothing here is persisted directly.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub method: Method,
    /// Path forwarded to the backend; stages may rewrite it.
    pub path: String,
    /// Path as received, used for logging.
    pub original_path: String,
    pub query: String,
    /// Headers forwarded to the backend; stages may add or drop entries.
    pub headers: HeaderMap,
    pub body: Bytes,
    pub ip: String,

    /// Explicit key token, or the IP literal for IP-derived identities.
    pub key: Option<String>,
    pub key_id: Option<Uuid>,
    pub manual: bool,
    pub tags: Vec<String>,
    pub cost: f64,
    /// Per-key override of the short-window rate limit.
    pub rate_limit: Option<i64>,
    /// Excerpt of the metered payload, stored with the request log.
    pub value: Option<String>,

    pub response_code: u16,
    pub error_msg: Option<String>,
}

impl RequestContext {
    pub fn new(method: Method, path: &str, query: &str, headers: HeaderMap, body: Bytes, ip: &str) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method,
            path: path.to_string(),
            original_path: path.to_string(),
            query: query.to_string(),
            headers,
            body,
            ip: ip.to_string(),
            key: None,
            key_id: None,
            manual: false,
            tags: Vec::new(),
            cost: 0.0,
            rate_limit: None,
            value: None,
            response_code: 0,
            error_msg: None,
        }
    }

    /// Original path plus query string.
    pub fn url(&self) -> String {
        if self.query.is_empty() {
            self.original_path.clone()
        } else {
            format!("{}?{}", self.original_path, self.query)
        }
    }

    /// Records a terminal failure on the context and turns it into a reply.
    pub fn reject(&mut self, err: AppError) -> Reply {
        let reply = Reply::error(&err);
        self.response_code = reply.status.as_u16();
        self.error_msg = Some(err.to_string());
        reply
    }

    /// Query parameter lookup on the raw query string.
    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

/// Response produced by a pipeline.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn error(err: &AppError) -> Self {
        let body = serde_json::json!({ "error": err.public_message() }).to_string();
        let mut reply = Self::new(err.status());
        reply.body = Bytes::from(body);
        reply.set_header("content-type", "application/json");
        reply
    }

    /// Sets a header, silently skipping values that are not valid header text.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => log::warn!("Skipping invalid response header '{}'", name),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn into_http_response(self) -> HttpResponse {
        let mut res = HttpResponse::build(self.status);
        for (name, value) in self.headers.iter() {
            res.append_header((name.clone(), value.clone()));
        }
        res.body(self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(query: &str) -> RequestContext {
        RequestContext::new(Method::GET, "/tts", query, HeaderMap::new(), Bytes::new(), "1.2.3.4")
    }

    #[test]
    fn reads_query_params() {
        let plain = ctx("a=1&key=abc%2Bd&empty=");
        assert_eq!(plain.query_param("key").as_deref(), Some("abc+d"));
        assert_eq!(plain.query_param("empty").as_deref(), Some(""));
        assert_eq!(plain.query_param("missing"), None);

        let encoded = ctx("voice=a+b%20c&key=%E2%9C%93%41&key=second&bad=%zz");
        assert_eq!(encoded.query_param("voice").as_deref(), Some("a b c"));
        assert_eq!(encoded.query_param("key").as_deref(), Some("\u{2713}A"));
        assert_eq!(encoded.query_param("bad").as_deref(), Some("%zz"));
    }

    #[test]
    fn url_includes_query() {
        assert_eq!(ctx("").url(), "/tts");
        assert_eq!(ctx("x=1").url(), "/tts?x=1");
    }

    #[test]
    fn reject_records_status_and_message() {
        let mut ctx = ctx("");
        let reply = ctx.reject(AppError::Forbidden("no credits".into()));
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(ctx.response_code, 403);
        assert!(ctx.error_msg.unwrap().contains("no credits"));
        assert_eq!(reply.header("content-type"), Some("application/json"));
    }
}
