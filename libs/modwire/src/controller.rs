//! Controllers group routes under a base pattern and share controller-level guards.

use axum::{
    extract::Request,
    handler::Handler,
    http::Method,
    response::Response,
};
use futures::future::{BoxFuture, FutureExt};
use std::{fmt, sync::Arc};

use crate::container::{Container, Resolver, ScopeId};
use crate::dispatch::RouteDispatcher;
use crate::error::ControllerError;
use crate::guard::{aggregate, Guard, GuardChain, GuardSet, Metadata};
use crate::server::HttpServer;

/// Group label under which a module's controllers are registered.
pub const CONTROLLERS_GROUP: &str = "controllers";

pub(crate) type BoxedHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

fn erase<H, T>(handler: H) -> BoxedHandler
where
    H: Handler<T, ()> + Sync,
    T: 'static,
{
    Arc::new(move |req: Request| handler.clone().call(req, ()).boxed())
}

/// A capability that declares its routes. Registered through `ModuleConfig::controller*`.
pub trait Controller: Send + Sync + 'static {
    fn config(&self) -> ControllerConfig;

    fn token(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Declaration of a controller: base pattern, metadata, routes and guards.
pub struct ControllerConfig {
    pattern: String,
    metadata: Metadata,
    routes: Vec<RouteConfig>,
    guards: GuardSet,
}

impl ControllerConfig {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            metadata: Metadata::Null,
            routes: Vec::new(),
            guards: GuardSet::default(),
        }
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn route(mut self, route: RouteConfig) -> Self {
        self.routes.push(route);
        self
    }

    /// Guard every route of this controller with a ready instance.
    pub fn guard(mut self, guard: Arc<dyn Guard>) -> Self {
        self.guards.push(guard);
        self
    }

    /// Guard every route of this controller with an instance built from the module scope.
    pub fn guard_with<F>(mut self, ctor: F) -> Self
    where
        F: Fn(&Resolver<'_>) -> anyhow::Result<Arc<dyn Guard>> + Send + Sync + 'static,
    {
        self.guards.push_constructor(ctor);
        self
    }
}

/// Declaration of one route.
pub struct RouteConfig {
    method: Option<Method>,
    pattern: String,
    handler: BoxedHandler,
    metadata: Metadata,
    guards: GuardSet,
}

macro_rules! method_ctor {
    ($($name:ident => $method:ident),* $(,)?) => {
        $(
            pub fn $name<H, T>(pattern: impl Into<String>, handler: H) -> Self
            where
                H: Handler<T, ()> + Sync,
                T: 'static,
            {
                Self::new(Some(Method::$method), pattern, handler)
            }
        )*
    };
}

impl RouteConfig {
    /// `method = None` matches every method.
    pub fn new<H, T>(method: Option<Method>, pattern: impl Into<String>, handler: H) -> Self
    where
        H: Handler<T, ()> + Sync,
        T: 'static,
    {
        Self {
            method,
            pattern: pattern.into(),
            handler: erase(handler),
            metadata: Metadata::Null,
            guards: GuardSet::default(),
        }
    }

    method_ctor! {
        get => GET,
        post => POST,
        put => PUT,
        patch => PATCH,
        delete => DELETE,
    }

    pub fn any<H, T>(pattern: impl Into<String>, handler: H) -> Self
    where
        H: Handler<T, ()> + Sync,
        T: 'static,
    {
        Self::new(None, pattern, handler)
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn guard(mut self, guard: Arc<dyn Guard>) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn guard_with<F>(mut self, ctor: F) -> Self
    where
        F: Fn(&Resolver<'_>) -> anyhow::Result<Arc<dyn Guard>> + Send + Sync + 'static,
    {
        self.guards.push_constructor(ctor);
        self
    }
}

/// Join a controller base and a route pattern into a dispatch pattern.
///
/// Empty segments are dropped, so `""` + `""` is `/` and `/auth/` + `/signup` is
/// `/auth/signup`. With a method the result is `"<METHOD> <path>"`.
///
/// A trailing `/` is dropped too: the router matches paths exactly and has no
/// subtree matching, so `/static/` could never stand for everything below it.
/// Use a `{*rest}` segment for that.
pub fn join_pattern(method: Option<&Method>, base: &str, route: &str) -> String {
    let segments: Vec<&str> = base
        .trim()
        .split('/')
        .chain(route.trim().split('/'))
        .filter(|s| !s.is_empty())
        .collect();
    let path = format!("/{}", segments.join("/"));
    match method {
        Some(m) => format!("{m} {path}"),
        None => path,
    }
}

/// A built controller: resolved controller guards and its registered routes.
pub struct ControllerInstance {
    token: &'static str,
    pattern: String,
    metadata: Arc<Metadata>,
    guards: Vec<Arc<dyn Guard>>,
    routes: Vec<RouteInstance>,
}

impl ControllerInstance {
    pub fn token(&self) -> &'static str {
        self.token
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn guards(&self) -> &[Arc<dyn Guard>] {
        &self.guards
    }

    pub fn routes(&self) -> &[RouteInstance] {
        &self.routes
    }
}

impl fmt::Debug for ControllerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerInstance")
            .field("token", &self.token)
            .field("pattern", &self.pattern)
            .field("guards", &self.guards.iter().map(|g| g.name()).collect::<Vec<_>>())
            .field("routes", &self.routes)
            .finish()
    }
}

/// A registered route with its resolved route guards and effective chain.
pub struct RouteInstance {
    pattern: String,
    method: Option<Method>,
    path: String,
    metadata: Arc<Metadata>,
    guards: Vec<Arc<dyn Guard>>,
    chain: GuardChain,
}

impl RouteInstance {
    /// The full dispatch pattern, e.g. `POST /auth/signin`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// The joined path without the method, e.g. `/auth/signin`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Route-level guards only.
    pub fn guards(&self) -> &[Arc<dyn Guard>] {
        &self.guards
    }

    /// Controller guards followed by route guards.
    pub fn chain(&self) -> &GuardChain {
        &self.chain
    }
}

impl fmt::Debug for RouteInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteInstance")
            .field("pattern", &self.pattern)
            .field("chain", &self.chain)
            .finish()
    }
}

/// Resolve guards for `controller` and register each of its routes with `server`.
///
/// `site` identifies the controller inside its module scope; guard groups are
/// labelled from it so no two sites share a group.
pub(crate) fn build_controller(
    controller: &dyn Controller,
    site: &str,
    scope: ScopeId,
    container: &Container,
    server: &HttpServer,
) -> Result<ControllerInstance, ControllerError> {
    let token = controller.token();
    let ControllerConfig {
        pattern: base,
        metadata,
        routes,
        guards,
    } = controller.config();

    let controller_guards =
        aggregate(container, scope, site, guards).map_err(|source| ControllerError::Guards {
            site: "controller".to_string(),
            source,
        })?;
    let controller_metadata = Arc::new(metadata);

    let mut instances = Vec::with_capacity(routes.len());
    for (idx, route) in routes.into_iter().enumerate() {
        let path = join_pattern(None, &base, &route.pattern);
        let pattern = join_pattern(route.method.as_ref(), &base, &route.pattern);
        let route_guards = aggregate(container, scope, &format!("{site}/{idx}"), route.guards)
            .map_err(|source| ControllerError::Guards {
                site: format!("route '{pattern}'"),
                source,
            })?;

        let chain = GuardChain::concat(&controller_guards, &route_guards);
        let route_metadata = Arc::new(route.metadata);
        let dispatcher = RouteDispatcher::new(
            pattern.clone(),
            chain.clone(),
            controller_metadata.clone(),
            route_metadata.clone(),
            route.handler,
        );

        server
            .register_handler(&pattern, move |req: Request| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.dispatch(req).await }
            })
            .map_err(|source| ControllerError::Route {
                pattern: pattern.clone(),
                source,
            })?;

        tracing::debug!(
            controller = token,
            pattern = %pattern,
            guards = ?chain.names(),
            "route registered"
        );

        instances.push(RouteInstance {
            pattern,
            method: route.method,
            path,
            metadata: route_metadata,
            guards: route_guards,
            chain,
        });
    }

    Ok(ControllerInstance {
        token,
        pattern: base,
        metadata: controller_metadata,
        guards: controller_guards,
        routes: instances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_pattern_rules() {
        let post = Method::POST;
        assert_eq!(join_pattern(Some(&post), "", "/signin"), "POST /signin");
        assert_eq!(join_pattern(Some(&post), "/auth", "/signup"), "POST /auth/signup");
        assert_eq!(join_pattern(Some(&post), "/auth/", "/signup/"), "POST /auth/signup");
        assert_eq!(join_pattern(Some(&Method::GET), "", ""), "GET /");
        assert_eq!(join_pattern(None, "/", "/"), "/");
        assert_eq!(join_pattern(None, " api ", "v1//users"), "/api/v1/users");
        assert_eq!(join_pattern(Some(&Method::GET), "/users", "{id}"), "GET /users/{id}");
        assert_eq!(join_pattern(None, "/static/", ""), "/static");
    }

    struct Hello;

    impl Controller for Hello {
        fn config(&self) -> ControllerConfig {
            ControllerConfig::new("/hello")
                .metadata(serde_json::json!({ "area": "greeting" }))
                .route(RouteConfig::get("", || async { "hi" }))
                .route(
                    RouteConfig::post("/{name}", || async { "hi you" })
                        .guard(crate::guard::guard_fn("open", |_| Ok(true))),
                )
        }
    }

    #[test]
    fn build_controller_registers_every_route() {
        let container = Container::new();
        let server = HttpServer::new();
        let scope = container.child(container.root(), "m").unwrap();

        let built = build_controller(&Hello, "hello#0", scope, &container, &server).unwrap();

        assert!(built.token().ends_with("Hello"));
        assert_eq!(built.metadata()["area"], "greeting");
        let patterns: Vec<_> = built.routes().iter().map(|r| r.pattern()).collect();
        assert_eq!(patterns, vec!["GET /hello", "POST /hello/{name}"]);
        assert_eq!(built.routes()[1].path(), "/hello/{name}");
        assert_eq!(built.routes()[1].chain().names(), vec!["open"]);
        assert_eq!(server.patterns(), vec!["GET /hello", "POST /hello/{name}"]);
    }

    #[test]
    fn route_conflicts_surface_as_controller_errors() {
        let container = Container::new();
        let server = HttpServer::new();
        let scope = container.child(container.root(), "m").unwrap();

        build_controller(&Hello, "hello#0", scope, &container, &server).unwrap();
        let err = build_controller(&Hello, "hello#1", scope, &container, &server).unwrap_err();
        assert!(matches!(err, ControllerError::Route { ref pattern, .. } if pattern == "GET /hello"));
    }
}
