//! Guards: request predicates evaluated before a route handler.
//!
//! Guards are declared at two tiers, on a controller and on a route. Each tier is
//! resolved once at build time through a named container group, and the route's
//! effective chain is `controller guards ++ route guards`.

use async_trait::async_trait;
use axum::http::{request::Parts, Extensions, HeaderMap, Method, Uri};
use std::{fmt, sync::Arc};

use crate::container::{Container, ContainerError, ProvideOptions, Resolver, ScopeId};

/// Free-form metadata attached to controllers and routes, readable by guards.
pub type Metadata = serde_json::Value;

/// Group label prefix under which guards are registered in a module scope.
pub const GUARDS_GROUP: &str = "guards";

/// Constructor for a guard that needs dependencies from the module scope.
pub type GuardConstructor =
    Box<dyn Fn(&Resolver<'_>) -> anyhow::Result<Arc<dyn Guard>> + Send + Sync>;

/// Per-request view handed to every guard of a chain.
pub struct GuardContext<'a> {
    parts: &'a Parts,
    pattern: &'a str,
    controller_metadata: &'a Metadata,
    route_metadata: &'a Metadata,
}

impl<'a> GuardContext<'a> {
    pub fn new(
        parts: &'a Parts,
        pattern: &'a str,
        controller_metadata: &'a Metadata,
        route_metadata: &'a Metadata,
    ) -> Self {
        Self {
            parts,
            pattern,
            controller_metadata,
            route_metadata,
        }
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Header value as UTF-8, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn extensions(&self) -> &Extensions {
        &self.parts.extensions
    }

    /// The registered pattern of the matched route, e.g. `POST /auth/signin`.
    pub fn pattern(&self) -> &str {
        self.pattern
    }

    pub fn controller_metadata(&self) -> &Metadata {
        self.controller_metadata
    }

    pub fn route_metadata(&self) -> &Metadata {
        self.route_metadata
    }
}

/// Access-control predicate.
///
/// `Ok(true)` lets the request through, `Ok(false)` denies it and `Err(_)` fails it.
/// The same instance serves every matching request, possibly concurrently.
#[async_trait]
pub trait Guard: Send + Sync + 'static {
    async fn allow(&self, ctx: &GuardContext<'_>) -> anyhow::Result<bool>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

struct FnGuard<F> {
    name: &'static str,
    f: F,
}

#[async_trait]
impl<F> Guard for FnGuard<F>
where
    F: Fn(&GuardContext<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    async fn allow(&self, ctx: &GuardContext<'_>) -> anyhow::Result<bool> {
        (self.f)(ctx)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Wrap a synchronous closure as a guard.
pub fn guard_fn<F>(name: &'static str, f: F) -> Arc<dyn Guard>
where
    F: Fn(&GuardContext<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnGuard { name, f })
}

/// Guards declared at one tier: ready instances and constructors.
#[derive(Default)]
pub struct GuardSet {
    values: Vec<Arc<dyn Guard>>,
    ctors: Vec<GuardConstructor>,
}

impl GuardSet {
    pub fn push(&mut self, guard: Arc<dyn Guard>) {
        self.values.push(guard);
    }

    pub fn push_constructor<F>(&mut self, ctor: F)
    where
        F: Fn(&Resolver<'_>) -> anyhow::Result<Arc<dyn Guard>> + Send + Sync + 'static,
    {
        self.ctors.push(Box::new(ctor));
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.ctors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Register the guards of one site under their own group in `scope`, then resolve
/// the group. Instances come first, constructors after, each in declaration order.
pub(crate) fn aggregate(
    container: &Container,
    scope: ScopeId,
    site: &str,
    set: GuardSet,
) -> Result<Vec<Arc<dyn Guard>>, ContainerError> {
    if set.is_empty() {
        return Ok(Vec::new());
    }

    let group = format!("{GUARDS_GROUP}:{site}");
    let opts = ProvideOptions::new().in_group(group.as_str());

    for guard in set.values {
        container.provide_value::<dyn Guard>(scope, opts.clone(), guard)?;
    }
    for ctor in set.ctors {
        container.provide::<dyn Guard, _>(scope, opts.clone(), ctor)?;
    }

    container.invoke(scope, |r| Ok(r.group::<dyn Guard>(&group)?))
}

/// Outcome of evaluating a guard chain.
#[derive(Debug)]
pub enum Verdict {
    Allowed,
    Denied { guard: &'static str },
    Failed {
        guard: &'static str,
        error: anyhow::Error,
    },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Immutable, ordered guard chain shared by every request of a route.
#[derive(Clone)]
pub struct GuardChain(Arc<[Arc<dyn Guard>]>);

impl Default for GuardChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Debug for GuardChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl GuardChain {
    pub fn new(guards: Vec<Arc<dyn Guard>>) -> Self {
        Self(guards.into())
    }

    /// Controller guards always run before route guards.
    pub fn concat(controller: &[Arc<dyn Guard>], route: &[Arc<dyn Guard>]) -> Self {
        Self::new(controller.iter().chain(route).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(|g| g.name()).collect()
    }

    /// Evaluate in order, stopping at the first denial or error.
    pub async fn evaluate(&self, ctx: &GuardContext<'_>) -> Verdict {
        for guard in self.0.iter() {
            match guard.allow(ctx).await {
                Ok(true) => continue,
                Ok(false) => return Verdict::Denied { guard: guard.name() },
                Err(error) => {
                    return Verdict::Failed {
                        guard: guard.name(),
                        error,
                    }
                }
            }
        }
        Verdict::Allowed
    }
}
