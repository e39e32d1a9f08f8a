use actix_web::http::header::{HeaderName, HeaderValue};
use async_trait::async_trait;
use common::{
    context::{Reply, RequestContext},
    error::{AppError, Res},
    pipeline::{Next, Stage},
    tag,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Tag prefix for headers added to the client response instead of the
/// forwarded request, e.g. `x-header-out:x-plan:gold`.
const OUT_HEADER_TAG: &str = "x-header-out";

/// Drops incoming headers starting with a prefix, so clients cannot send
/// what the gateway injects from tags.
pub struct CleanHeaders {
    starting: String,
}

impl CleanHeaders {
    pub fn new(starting: &str) -> Res<Self> {
        let starting = starting.trim().to_lowercase();
        if starting.is_empty() {
            return Err(AppError::Validation("no clean header prefix".to_string()));
        }
        Ok(Self { starting })
    }
}

#[async_trait]
impl Stage for CleanHeaders {
    fn name(&self) -> String {
        format!("CleanHeaders({})", self.starting)
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply {
        let dropped: Vec<HeaderName> = ctx
            .headers
            .keys()
            .filter(|name| name.as_str().starts_with(&self.starting))
            .cloned()
            .collect();
        for name in dropped {
            ctx.headers.remove(name);
        }
        next.run(ctx).await
    }
}

fn header(name: &str, value: &str) -> Res<(HeaderName, HeaderValue)> {
    let name = HeaderName::try_from(name)
        .map_err(|e| AppError::Internal(format!("wrong header name '{}': {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| AppError::Internal(format!("wrong header value for '{}': {}", name, e)))?;
    Ok((name, value))
}

type Headers = Vec<(HeaderName, HeaderValue)>;

/// Headers derived from the key's tags, split into request and response ones.
fn tag_headers(tags: &[String]) -> Res<(Headers, Headers)> {
    let (mut request, mut response) = (Vec::new(), Vec::new());
    for t in tags {
        let Some((name, value)) = tag::parse(t)? else {
            continue;
        };
        if name == OUT_HEADER_TAG {
            if let Some((out_name, out_value)) = tag::parse(&value)? {
                response.push(header(&out_name, &out_value)?);
            }
            continue;
        }
        request.push(header(&name, &value)?);
    }
    Ok((request, response))
}

/// Forwards the request id and the key's tags as headers.
pub struct FillHeaders;

#[async_trait]
impl Stage for FillHeaders {
    fn name(&self) -> String {
        "FillHeaders".to_string()
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Reply {
        let (request, response) = match tag_headers(&ctx.tags) {
            Ok(headers) => headers,
            Err(e) => {
                log::error!("Can't build headers from tags of key {:?}: {}", ctx.key_id, e);
                return ctx.reject(AppError::Internal("Service error".to_string()));
            }
        };
        for (name, value) in request {
            ctx.headers.insert(name, value);
        }
        if let Ok(id) = HeaderValue::from_str(&ctx.request_id.to_string()) {
            ctx.headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), id);
        }

        let mut reply = next.run(ctx).await;
        for (name, value) in response {
            reply.headers.insert(name, value);
        }
        reply
    }
}
