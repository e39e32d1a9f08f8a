use actix_web::http::{Method, StatusCode};
use common::pipeline::{Pipeline, Respond};

/// A pipeline bound to a path prefix and an optional method set.
pub struct Route {
    pub name: String,
    prefix: String,
    methods: Vec<Method>,
    pub pipeline: Pipeline,
}

impl Route {
    /// `prefix` is matched case-insensitively; no methods means any method.
    pub fn new(name: &str, prefix: &str, methods: Vec<Method>, pipeline: Pipeline) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_lowercase(),
            methods,
            pipeline,
        }
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        path.starts_with(&self.prefix) && (self.methods.is_empty() || self.methods.contains(method))
    }
}

pub struct RouteTable {
    /// Longest prefix first.
    routes: Vec<Route>,
    fallback: Pipeline,
}

impl RouteTable {
    /// Without a `fallback` unmatched requests get 404.
    pub fn new(mut routes: Vec<Route>, fallback: Option<Pipeline>) -> Self {
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            routes,
            fallback: fallback.unwrap_or_else(|| Pipeline::default().push(Respond(StatusCode::NOT_FOUND))),
        }
    }

    pub fn find(&self, method: &Method, path: &str) -> &Pipeline {
        let path = path.to_lowercase();
        self.routes
            .iter()
            .find(|r| r.matches(method, &path))
            .map(|r| &r.pipeline)
            .unwrap_or(&self.fallback)
    }

    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for route in &self.routes {
            let methods = if route.methods.is_empty() {
                "*".to_string()
            } else {
                route
                    .methods
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(",")
            };
            lines.push(format!(
                "{} [{}] {} -> {}",
                route.name,
                methods,
                route.prefix,
                route.pipeline.describe().join(" -> ")
            ));
        }
        lines.push(format!("default -> {}", self.fallback.describe().join(" -> ")));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, prefix: &str, methods: Vec<Method>, code: StatusCode) -> Route {
        Route::new(name, prefix, methods, Pipeline::default().push(Respond(code)))
    }

    fn answer(table: &RouteTable, method: Method, path: &str) -> String {
        table.find(&method, path).describe().join(",")
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new(
            vec![
                route("all", "/tts", vec![], StatusCode::OK),
                route("key", "/tts/key", vec![], StatusCode::ACCEPTED),
            ],
            None,
        );
        assert_eq!(answer(&table, Method::GET, "/tts/key/1"), "Respond(202)");
        assert_eq!(answer(&table, Method::GET, "/TTS/synth"), "Respond(200)");
        assert_eq!(answer(&table, Method::GET, "/other"), "Respond(404)");
    }

    #[test]
    fn filters_by_method() {
        let table = RouteTable::new(
            vec![
                route("post", "/tts", vec![Method::POST], StatusCode::OK),
                route("any", "/", vec![], StatusCode::ACCEPTED),
            ],
            Some(Pipeline::default().push(Respond(StatusCode::BAD_GATEWAY))),
        );
        assert_eq!(answer(&table, Method::POST, "/tts"), "Respond(200)");
        assert_eq!(answer(&table, Method::GET, "/tts"), "Respond(202)");
        assert_eq!(table.describe().len(), 3);
        assert_eq!(table.describe()[2], "default -> Respond(502)");
    }
}
