//! HTTP transport: an axum router that controllers register patterns into.

use axum::{
    handler::Handler,
    http::Method,
    middleware::from_fn,
    routing::{any, on, MethodFilter},
    Router,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    any::Any,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
};
use tokio::net::TcpListener;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::request_id;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("route '{pattern}' conflicts with the already registered '{existing}'")]
    Conflict { pattern: String, existing: String },

    #[error("router rejected route '{pattern}': {reason}")]
    Rejected { pattern: String, reason: String },

    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server on {addr} failed")]
    Serve {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A parsed `"[METHOD ]/path"` pattern. No method means every method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePattern {
    pub method: Option<Method>,
    pub path: String,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, ServerError> {
        let invalid = |reason: &str| ServerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = pattern.trim();
        let (method, path) = match trimmed.split_once(' ') {
            Some((m, p)) => {
                let m = Method::from_bytes(m.as_bytes()).map_err(|_| invalid("invalid method"))?;
                (Some(m), p.trim())
            }
            None => (None, trimmed),
        };

        if !path.starts_with('/') {
            return Err(invalid("path must start with '/'"));
        }
        validate_segments(path).map_err(invalid)?;
        if let Some(m) = &method {
            MethodFilter::try_from(m.clone())
                .map_err(|_| invalid("method cannot be routed"))?;
        }

        Ok(Self {
            method,
            path: path.to_string(),
        })
    }

    fn method_label(&self) -> &str {
        self.method.as_ref().map(Method::as_str).unwrap_or("*")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment<'a> {
    Static(&'a str),
    Param(&'a str),
    CatchAll(&'a str),
}

impl<'a> Segment<'a> {
    /// Assumes a segment that passed [`validate_segments`].
    fn of(seg: &'a str) -> Self {
        match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(inner) => match inner.strip_prefix('*') {
                Some(name) => Segment::CatchAll(name),
                None => Segment::Param(inner),
            },
            None => Segment::Static(seg),
        }
    }
}

/// Parameters must span a whole segment (`{id}`), a catch-all (`{*rest}`) must be
/// the last segment, and a name may appear once per path.
fn validate_segments(path: &str) -> Result<(), &'static str> {
    let segments: Vec<&str> = path.split('/').collect();
    let mut names = Vec::new();
    for (idx, seg) in segments.iter().enumerate() {
        if seg.starts_with(':') {
            return Err("`:param` segments are not supported, use `{param}`");
        }
        if !seg.contains(['{', '}']) {
            continue;
        }
        let inner = seg
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .filter(|inner| !inner.contains(['{', '}']))
            .ok_or("parameters must span a whole segment, like `{id}`")?;
        let (catch_all, name) = match inner.strip_prefix('*') {
            Some(name) => (true, name),
            None => (false, inner),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err("parameter names must be non-empty and alphanumeric");
        }
        if catch_all && idx + 1 != segments.len() {
            return Err("a `{*catch_all}` parameter must be the last segment");
        }
        if names.contains(&name) {
            return Err("parameter names must be unique within a path");
        }
        names.push(name);
    }
    Ok(())
}

/// Whether the router would refuse to hold both paths: walking the shared prefix,
/// two parameters in one position must agree on their name, and a catch-all
/// cannot sit beside a named parameter.
fn paths_clash(a: &str, b: &str) -> bool {
    for (x, y) in a.split('/').zip(b.split('/')) {
        match (Segment::of(x), Segment::of(y)) {
            (Segment::Static(s), Segment::Static(t)) if s == t => continue,
            (Segment::Param(m), Segment::Param(n))
            | (Segment::CatchAll(m), Segment::CatchAll(n)) => {
                if m != n {
                    return true;
                }
            }
            (Segment::Param(_), Segment::CatchAll(_)) | (Segment::CatchAll(_), Segment::Param(_)) => {
                return true
            }
            _ => return false,
        }
    }
    false
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "route insertion panicked".to_string())
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(m) => write!(f, "{m} {}", self.path),
            None => f.write_str(&self.path),
        }
    }
}

/// Collects handlers by pattern and serves them.
///
/// Conflicts that axum would reject with a panic (same method and path twice,
/// a catch-all route next to a method route, differently named parameters or a
/// catch-all beside a parameter in the same position) are reported as
/// [`ServerError::Conflict`] instead. A rejected registration leaves the
/// router as it was.
pub struct HttpServer {
    router: Mutex<Router>,
    // (method label, path) -> pattern as registered
    registered_routes: DashMap<(String, String), String>,
    patterns: Mutex<Vec<String>>,
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("patterns", &*self.patterns.lock())
            .finish()
    }
}

impl HttpServer {
    pub fn new() -> Self {
        Self {
            router: Mutex::new(Router::new()),
            registered_routes: DashMap::new(),
            patterns: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler` under `pattern` (`"GET /users/{id}"`, or `"/path"` for any method).
    pub fn register_handler<H, T>(&self, pattern: &str, handler: H) -> Result<(), ServerError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        let parsed = RoutePattern::parse(pattern)?;
        self.check_conflicts(&parsed)?;

        let method_router = match &parsed.method {
            Some(m) => {
                let filter = MethodFilter::try_from(m.clone()).map_err(|_| {
                    ServerError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: "method cannot be routed".to_string(),
                    }
                })?;
                on(filter, handler)
            }
            None => any(handler),
        };

        {
            let mut router = self.router.lock();
            let candidate = router.clone();
            let path = parsed.path.as_str();
            // axum panics on anything the checks above missed
            let built = panic::catch_unwind(AssertUnwindSafe(move || {
                candidate.route(path, method_router)
            }))
            .map_err(|payload| ServerError::Rejected {
                pattern: parsed.to_string(),
                reason: panic_message(payload.as_ref()),
            })?;
            *router = built;
        }

        let display = parsed.to_string();
        self.registered_routes.insert(
            (parsed.method_label().to_string(), parsed.path.clone()),
            display.clone(),
        );
        self.patterns.lock().push(display);
        Ok(())
    }

    fn check_conflicts(&self, parsed: &RoutePattern) -> Result<(), ServerError> {
        let conflict = |existing: String| ServerError::Conflict {
            pattern: parsed.to_string(),
            existing,
        };

        let label = parsed.method_label();
        if let Some(existing) = self
            .registered_routes
            .get(&(label.to_string(), parsed.path.clone()))
        {
            return Err(conflict(existing.value().clone()));
        }

        // a method-less route owns the whole path
        let clash = self.registered_routes.iter().find(|entry| {
            let (m, p) = entry.key();
            p == &parsed.path && (m == "*" || label == "*")
        });
        if let Some(entry) = clash {
            return Err(conflict(entry.value().clone()));
        }

        let clash = self
            .registered_routes
            .iter()
            .find(|entry| paths_clash(&entry.key().1, &parsed.path));
        if let Some(entry) = clash {
            return Err(conflict(entry.value().clone()));
        }
        Ok(())
    }

    /// Registered patterns in registration order.
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.lock().clone()
    }

    /// The routes wrapped in request-id and tracing middleware.
    pub fn router(&self) -> Router {
        let x_request_id = request_id::header();
        self.router
            .lock()
            .clone()
            // innermost first: the request id is set, then propagated, then traced
            .layer(from_fn(request_id::push_req_id_to_extensions))
            .layer(request_id::create_trace_layer())
            .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
            .layer(SetRequestIdLayer::new(x_request_id, request_id::MakeReqId))
    }

    /// Serve on `listener` until `shutdown` resolves, then wait for in-flight
    /// requests to finish.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let router = self.router();
        tracing::info!(%addr, routes = self.patterns.lock().len(), "HTTP server serving");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|source| ServerError::Serve { addr, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    #[test]
    fn parse_accepts_method_and_any() {
        let p = RoutePattern::parse("  POST /auth/signin ").unwrap();
        assert_eq!(p.method, Some(Method::POST));
        assert_eq!(p.path, "/auth/signin");
        assert_eq!(p.to_string(), "POST /auth/signin");

        let p = RoutePattern::parse("/health").unwrap();
        assert_eq!(p.method, None);
        assert_eq!(p.to_string(), "/health");
    }

    #[test]
    fn parse_rejects_bad_patterns() {
        for bad in [
            "GET users",
            "",
            "GET /users/:id",
            "G(T /x",
            "GET /bad/{",
            "GET /bad/}",
            "GET /x{id}",
            "GET /a/{}",
            "GET /a/{*}",
            "GET /a/{{id}}",
            "GET /a/{id}/{id}",
            "GET /files/{*rest}/x",
        ] {
            assert!(
                matches!(RoutePattern::parse(bad), Err(ServerError::InvalidPattern { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn duplicate_and_overlapping_routes_are_conflicts() {
        let s = HttpServer::new();
        s.register_handler("GET /users", || async { "list" }).unwrap();
        s.register_handler("POST /users", || async { "create" }).unwrap();
        s.register_handler("GET /users/{id}", || async { "one" }).unwrap();

        let dup = s.register_handler("GET /users", || async { "again" }).unwrap_err();
        assert!(matches!(dup, ServerError::Conflict { ref existing, .. } if existing == "GET /users"));

        let any_route = s.register_handler("/users", || async { "any" }).unwrap_err();
        assert!(matches!(any_route, ServerError::Conflict { .. }));

        let renamed = s.register_handler("DELETE /users/{name}", || async { "x" }).unwrap_err();
        assert!(matches!(renamed, ServerError::Conflict { ref existing, .. } if existing == "GET /users/{id}"));

        assert_eq!(s.patterns(), vec!["GET /users", "POST /users", "GET /users/{id}"]);
    }

    #[test]
    fn parse_accepts_trailing_catch_all() {
        let p = RoutePattern::parse("GET /files/{dir}/{*rest}").unwrap();
        assert_eq!(p.path, "/files/{dir}/{*rest}");
    }

    #[test]
    fn catch_all_beside_a_parameter_is_a_conflict() {
        let s = HttpServer::new();
        s.register_handler("GET /files/{*rest}", || async { "all" }).unwrap();
        let err = s.register_handler("GET /files/{id}", || async { "one" }).unwrap_err();
        assert!(matches!(err, ServerError::Conflict { ref existing, .. } if existing == "GET /files/{*rest}"));

        let s = HttpServer::new();
        s.register_handler("GET /files/{id}", || async { "one" }).unwrap();
        let err = s.register_handler("POST /files/{*rest}", || async { "all" }).unwrap_err();
        assert!(matches!(err, ServerError::Conflict { ref existing, .. } if existing == "GET /files/{id}"));
    }

    #[test]
    fn nested_parameter_rename_is_a_conflict() {
        let s = HttpServer::new();
        s.register_handler("GET /users/{id}/posts", || async { "posts" }).unwrap();
        let err = s.register_handler("GET /users/{name}", || async { "one" }).unwrap_err();
        assert!(matches!(err, ServerError::Conflict { ref existing, .. } if existing == "GET /users/{id}/posts"));

        // same names on a shared prefix are fine
        s.register_handler("GET /users/{id}", || async { "one" }).unwrap();
    }

    #[test]
    fn static_segment_beside_a_parameter_is_allowed() {
        let s = HttpServer::new();
        s.register_handler("GET /u/{id}", || async { "one" }).unwrap();
        s.register_handler("GET /u/me", || async { "me" }).unwrap();
        s.register_handler("DELETE /u/{id}", || async { "gone" }).unwrap();
        assert_eq!(s.patterns(), vec!["GET /u/{id}", "GET /u/me", "DELETE /u/{id}"]);
    }

    #[tokio::test]
    async fn rejected_route_keeps_earlier_routes_served() {
        let s = HttpServer::new();
        s.register_handler("GET /files/{*rest}", || async { "all" }).unwrap();
        s.register_handler("GET /ping", || async { "pong" }).unwrap();

        assert!(s.register_handler("GET /files/{id}", || async { "one" }).is_err());
        assert!(s.register_handler("GET /bad/{", || async { "bad" }).is_err());
        assert!(s.register_handler("GET /files/{*rest}/x", || async { "x" }).is_err());

        for uri in ["/ping", "/files/a/b"] {
            let resp = s
                .router()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
        }
        assert_eq!(s.patterns(), vec!["GET /files/{*rest}", "GET /ping"]);
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&42u8), "route insertion panicked");
    }

    #[tokio::test]
    async fn router_dispatches_and_sets_request_id() {
        let s = HttpServer::new();
        s.register_handler("GET /ping", || async { "pong" }).unwrap();

        let resp = s
            .router()
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));

        let resp = s
            .router()
            .oneshot(Request::post("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
