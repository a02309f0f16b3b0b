//! Hierarchical, type-safe provider container.
//!
//! Design goals:
//! - Providers register once per scope, keyed by the *produced type*: `provide::<T>()`.
//!   `T` can be a trait object (`dyn my::Api`), which is how a provider is registered
//!   "as" a capability.
//! - Scopes form a tree. A scope sees its own providers, then its ancestors', then the
//!   globally exported table.
//! - Named groups collect many values of one type under a label, in registration order.
//!
//! Implementation details:
//! - Key = `type_name::<T>()`, which works for `T = dyn Trait`.
//! - Value = `Arc<T>` stored as `Box<dyn Any + Send + Sync>` (downcast on read).
//! - Scopes live in one arena (`Vec`) and refer to each other by `ScopeId`.
//! - Constructors run lazily on first resolution, once per registration, and resolve
//!   their own dependencies from the scope they were registered in.
//!
//! Notes:
//! - Writes only happen while the application graph is built; afterwards the container
//!   is read-only and safe to share.

use parking_lot::{Mutex, RwLock};
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

/// Stable provider identity: the fully-qualified `type_name::<T>()`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TypeKey(&'static str);

impl TypeKey {
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeKey(std::any::type_name::<T>())
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Index of a scope inside its container.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ScopeId(usize);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// Per-registration options.
#[derive(Clone, Debug, Default)]
pub struct ProvideOptions {
    export: bool,
    group: Option<Arc<str>>,
}

impl ProvideOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the provider visible from every scope of the container.
    pub fn exported(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    /// Append the value to a named group instead of registering it as the
    /// single provider of its type. Groups ignore `exported`.
    pub fn in_group(mut self, group: impl Into<Arc<str>>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn is_exported(&self) -> bool {
        self.export
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("no provider for `{type_key}` is visible from scope '{scope}'")]
    NotFound { type_key: TypeKey, scope: String },

    #[error("`{type_key}` is already provided in scope '{scope}'")]
    DuplicateProvider { type_key: TypeKey, scope: String },

    #[error("`{type_key}` is already exported globally by scope '{first}'")]
    DuplicateGlobal { type_key: TypeKey, first: String },

    #[error("type mismatch in container for `{type_key}`, scope '{scope}'")]
    TypeMismatch { type_key: TypeKey, scope: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<&'static str> },

    #[error("constructor for `{type_key}` failed")]
    Constructor {
        type_key: TypeKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("invocation in scope '{scope}' failed")]
    Invoke {
        scope: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unknown scope #{0}")]
    UnknownScope(usize),
}

type Boxed = Box<dyn Any + Send + Sync>;
type ErasedCtor = Box<dyn Fn(&Resolver<'_>) -> anyhow::Result<Boxed> + Send + Sync>;

enum Source {
    Value(Boxed),
    Constructor(ErasedCtor),
    /// Delegates to the provider of the same key registered locally in another scope.
    Alias(ScopeId),
}

struct Slot {
    key: TypeKey,
    origin: ScopeId,
    source: Source,
    instance: OnceLock<Boxed>,
}

struct ScopeNode {
    name: Arc<str>,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    providers: HashMap<TypeKey, Arc<Slot>>,
    groups: HashMap<(Arc<str>, TypeKey), Vec<Arc<Slot>>>,
}

impl ScopeNode {
    fn new(name: Arc<str>, parent: Option<ScopeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            providers: HashMap::new(),
            groups: HashMap::new(),
        }
    }
}

struct State {
    scopes: Vec<ScopeNode>,
    globals: HashMap<TypeKey, Arc<Slot>>,
}

impl State {
    fn node(&self, id: ScopeId) -> Result<&ScopeNode, ContainerError> {
        self.scopes
            .get(id.0)
            .ok_or(ContainerError::UnknownScope(id.0))
    }

    fn node_mut(&mut self, id: ScopeId) -> Result<&mut ScopeNode, ContainerError> {
        self.scopes
            .get_mut(id.0)
            .ok_or(ContainerError::UnknownScope(id.0))
    }

    fn path(&self, id: ScopeId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            match self.scopes.get(cur.0) {
                Some(node) => {
                    names.push(node.name.as_ref());
                    cursor = node.parent;
                }
                None => break,
            }
        }
        names.reverse();
        names.join(" > ")
    }
}

/// Scoped registry of providers keyed by (produced type, scope).
pub struct Container {
    state: RwLock<State>,
    // (key, slot address) of constructors currently running, outermost first
    resolving: Mutex<Vec<(TypeKey, usize)>>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Container")
            .field("scopes", &state.scopes.len())
            .field("globals", &state.globals.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Container {
    pub const ROOT_NAME: &'static str = "root";

    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                scopes: vec![ScopeNode::new(Arc::from(Self::ROOT_NAME), None)],
                globals: HashMap::new(),
            }),
            resolving: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn root(&self) -> ScopeId {
        ScopeId::ROOT
    }

    /// Create a child scope of `parent`.
    pub fn child(
        &self,
        parent: ScopeId,
        name: impl Into<Arc<str>>,
    ) -> Result<ScopeId, ContainerError> {
        let mut w = self.state.write();
        let id = ScopeId(w.scopes.len());
        w.node_mut(parent)?.children.push(id);
        w.scopes.push(ScopeNode::new(name.into(), Some(parent)));
        Ok(id)
    }

    pub fn scope_name(&self, id: ScopeId) -> Option<Arc<str>> {
        self.state.read().scopes.get(id.0).map(|n| n.name.clone())
    }

    /// Human-readable path from the root, e.g. `root > app::AppModule > app::UsersModule`.
    pub fn scope_path(&self, id: ScopeId) -> String {
        self.state.read().path(id)
    }

    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.state.read().scopes.get(id.0).and_then(|n| n.parent)
    }

    pub fn children(&self, id: ScopeId) -> Vec<ScopeId> {
        self.state
            .read()
            .scopes
            .get(id.0)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn scope_count(&self) -> usize {
        self.state.read().scopes.len()
    }

    /// Register a constructor for `T` in `scope`.
    pub fn provide<T, F>(
        &self,
        scope: ScopeId,
        opts: ProvideOptions,
        ctor: F,
    ) -> Result<(), ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let erased: ErasedCtor = Box::new(move |r: &Resolver<'_>| {
            let value: Boxed = Box::new(ctor(r)?);
            Ok(value)
        });
        self.insert(scope, TypeKey::of::<T>(), Source::Constructor(erased), opts)
    }

    /// Register a ready-made value for `T` in `scope`.
    pub fn provide_value<T>(
        &self,
        scope: ScopeId,
        opts: ProvideOptions,
        value: Arc<T>,
    ) -> Result<(), ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.insert(scope, TypeKey::of::<T>(), Source::Value(Box::new(value)), opts)
    }

    /// Make `key` resolvable in `scope` by delegating to the provider registered
    /// locally in `target`. The instance is shared, never constructed twice.
    pub fn alias(
        &self,
        scope: ScopeId,
        key: TypeKey,
        target: ScopeId,
    ) -> Result<(), ContainerError> {
        {
            let r = self.state.read();
            if !r.node(target)?.providers.contains_key(&key) {
                return Err(ContainerError::NotFound {
                    type_key: key,
                    scope: r.path(target),
                });
            }
        }
        self.insert(scope, key, Source::Alias(target), ProvideOptions::default())
    }

    fn insert(
        &self,
        scope: ScopeId,
        key: TypeKey,
        source: Source,
        opts: ProvideOptions,
    ) -> Result<(), ContainerError> {
        let mut w = self.state.write();
        let slot = Arc::new(Slot {
            key,
            origin: scope,
            source,
            instance: OnceLock::new(),
        });

        if let Some(group) = opts.group {
            w.node_mut(scope)?
                .groups
                .entry((group, key))
                .or_default()
                .push(slot);
            return Ok(());
        }

        if opts.export {
            if let Some(existing) = w.globals.get(&key) {
                return Err(ContainerError::DuplicateGlobal {
                    type_key: key,
                    first: w.path(existing.origin),
                });
            }
            // validate the scope before publishing
            w.node(scope)?;
            w.globals.insert(key, slot);
            return Ok(());
        }

        if w.node(scope)?.providers.contains_key(&key) {
            return Err(ContainerError::DuplicateProvider {
                type_key: key,
                scope: w.path(scope),
            });
        }
        w.node_mut(scope)?.providers.insert(key, slot);
        Ok(())
    }

    /// Resolve `T` as seen from `scope`.
    pub fn resolve<T>(&self, scope: ScopeId) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let slot = self.lookup(scope, TypeKey::of::<T>())?;
        self.materialize::<T>(&slot)
    }

    /// Resolve every member of `group` registered for `T` in exactly `scope`,
    /// in registration order. An unknown group yields an empty list.
    pub fn resolve_group<T>(&self, scope: ScopeId, group: &str) -> Result<Vec<Arc<T>>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let slots = {
            let r = self.state.read();
            r.node(scope)?
                .groups
                .get(&(Arc::<str>::from(group), TypeKey::of::<T>()))
                .cloned()
                .unwrap_or_default()
        };
        slots.iter().map(|slot| self.materialize::<T>(slot)).collect()
    }

    /// Run `f` with a resolver bound to `scope`.
    pub fn invoke<R, F>(&self, scope: ScopeId, f: F) -> Result<R, ContainerError>
    where
        F: FnOnce(&Resolver<'_>) -> anyhow::Result<R>,
    {
        let resolver = Resolver {
            container: self,
            scope,
        };
        f(&resolver).map_err(|source| ContainerError::Invoke {
            scope: self.scope_path(scope),
            source,
        })
    }

    /// Non-constructing probe: is a provider of `T` visible from `scope`?
    pub fn is_visible<T: ?Sized + 'static>(&self, scope: ScopeId) -> bool {
        self.is_key_visible(scope, TypeKey::of::<T>())
    }

    pub fn is_key_visible(&self, scope: ScopeId, key: TypeKey) -> bool {
        self.lookup(scope, key).is_ok()
    }

    fn lookup(&self, scope: ScopeId, key: TypeKey) -> Result<Arc<Slot>, ContainerError> {
        let r = self.state.read();
        let mut cursor = Some(scope);
        while let Some(id) = cursor {
            let node = r.node(id)?;
            if let Some(slot) = node.providers.get(&key) {
                return Ok(slot.clone());
            }
            cursor = node.parent;
        }
        r.globals
            .get(&key)
            .cloned()
            .ok_or_else(|| ContainerError::NotFound {
                type_key: key,
                scope: r.path(scope),
            })
    }

    fn materialize<T>(&self, slot: &Arc<Slot>) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        match &slot.source {
            Source::Value(boxed) => self.downcast::<T>(slot, boxed),
            Source::Alias(target) => {
                let local = {
                    let r = self.state.read();
                    r.node(*target)?.providers.get(&slot.key).cloned()
                };
                let local = local.ok_or_else(|| ContainerError::NotFound {
                    type_key: slot.key,
                    scope: self.scope_path(*target),
                })?;
                self.materialize::<T>(&local)
            }
            Source::Constructor(ctor) => {
                if let Some(boxed) = slot.instance.get() {
                    return self.downcast::<T>(slot, boxed);
                }

                let addr = Arc::as_ptr(slot) as usize;
                {
                    let mut stack = self.resolving.lock();
                    if let Some(pos) = stack.iter().position(|(_, a)| *a == addr) {
                        let mut path: Vec<&'static str> =
                            stack[pos..].iter().map(|(k, _)| k.name()).collect();
                        path.push(slot.key.name());
                        return Err(ContainerError::Cycle { path });
                    }
                    stack.push((slot.key, addr));
                }

                let resolver = Resolver {
                    container: self,
                    scope: slot.origin,
                };
                let built = ctor(&resolver);
                self.resolving.lock().pop();

                let boxed = built.map_err(|source| ContainerError::Constructor {
                    type_key: slot.key,
                    source,
                })?;
                // Build is single-threaded; a lost race would only drop a duplicate.
                let _ = slot.instance.set(boxed);
                match slot.instance.get() {
                    Some(boxed) => self.downcast::<T>(slot, boxed),
                    None => Err(ContainerError::TypeMismatch {
                        type_key: slot.key,
                        scope: self.scope_path(slot.origin),
                    }),
                }
            }
        }
    }

    fn downcast<T>(&self, slot: &Slot, boxed: &Boxed) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        // Stored value is exactly `Arc<T>`; downcast is safe and cheap.
        boxed
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or_else(|| ContainerError::TypeMismatch {
                type_key: slot.key,
                scope: self.scope_path(slot.origin),
            })
    }
}

/// Handle given to constructors and `invoke` callbacks.
#[derive(Clone, Copy)]
pub struct Resolver<'c> {
    container: &'c Container,
    scope: ScopeId,
}

impl<'c> Resolver<'c> {
    pub fn resolve<T>(&self) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.container.resolve::<T>(self.scope)
    }

    pub fn group<T>(&self, group: &str) -> Result<Vec<Arc<T>>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.container.resolve_group::<T>(self.scope, group)
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn container(&self) -> &'c Container {
        self.container
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;
    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    #[derive(Debug)]
    struct Settings {
        name: &'static str,
    }

    struct Service {
        settings: Arc<Settings>,
    }

    #[test]
    fn register_and_resolve_dyn_trait() {
        let c = Container::new();
        let root = c.root();
        c.provide::<dyn Greeter, _>(root, ProvideOptions::new(), |_| Ok(Arc::new(English)))
            .unwrap();

        let g = c.resolve::<dyn Greeter>(root).unwrap();
        assert_eq!(g.greet(), "hello");
    }

    #[test]
    fn constructor_runs_once_per_registration() {
        let c = Container::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        c.provide::<Settings, _>(c.root(), ProvideOptions::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Settings { name: "a" }))
        })
        .unwrap();

        let a = c.resolve::<Settings>(c.root()).unwrap();
        let b = c.resolve::<Settings>(c.root()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_sees_parent_but_not_the_reverse() {
        let c = Container::new();
        let child = c.child(c.root(), "child").unwrap();
        c.provide_value(c.root(), ProvideOptions::new(), Arc::new(Settings { name: "root" }))
            .unwrap();
        c.provide::<Service, _>(child, ProvideOptions::new(), |r| {
            Ok(Arc::new(Service {
                settings: r.resolve::<Settings>()?,
            }))
        })
        .unwrap();

        let svc = c.resolve::<Service>(child).unwrap();
        assert_eq!(svc.settings.name, "root");
        assert!(!c.is_visible::<Service>(c.root()));
    }

    #[test]
    fn exported_provider_is_visible_from_unrelated_scopes() {
        let c = Container::new();
        let a = c.child(c.root(), "a").unwrap();
        let b = c.child(c.root(), "b").unwrap();
        let deep = c.child(b, "deep").unwrap();
        c.provide_value(a, ProvideOptions::new().exported(true), Arc::new(Settings { name: "g" }))
            .unwrap();

        assert_eq!(c.resolve::<Settings>(deep).unwrap().name, "g");
        assert!(c.is_visible::<Settings>(c.root()));
    }

    #[test]
    fn duplicates_are_rejected() {
        let c = Container::new();
        let s = c.child(c.root(), "s").unwrap();
        c.provide_value(s, ProvideOptions::new(), Arc::new(Settings { name: "1" }))
            .unwrap();
        let err = c
            .provide_value(s, ProvideOptions::new(), Arc::new(Settings { name: "2" }))
            .unwrap_err();
        assert!(matches!(err, ContainerError::DuplicateProvider { .. }));

        c.provide_value(s, ProvideOptions::new().exported(true), Arc::new(English))
            .unwrap();
        let err = c
            .provide_value(c.root(), ProvideOptions::new().exported(true), Arc::new(English))
            .unwrap_err();
        match err {
            ContainerError::DuplicateGlobal { first, .. } => assert_eq!(first, "root > s"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn alias_shares_the_instance() {
        let c = Container::new();
        let child = c.child(c.root(), "child").unwrap();
        c.provide::<Settings, _>(child, ProvideOptions::new(), |_| {
            Ok(Arc::new(Settings { name: "owned" }))
        })
        .unwrap();
        c.alias(c.root(), TypeKey::of::<Settings>(), child).unwrap();

        let from_parent = c.resolve::<Settings>(c.root()).unwrap();
        let from_child = c.resolve::<Settings>(child).unwrap();
        assert!(Arc::ptr_eq(&from_parent, &from_child));
    }

    #[test]
    fn alias_requires_a_local_provider() {
        let c = Container::new();
        let child = c.child(c.root(), "child").unwrap();
        let err = c
            .alias(c.root(), TypeKey::of::<Settings>(), child)
            .unwrap_err();
        assert!(matches!(err, ContainerError::NotFound { .. }));
    }

    #[test]
    fn groups_keep_registration_order_and_do_not_inherit() {
        let c = Container::new();
        let child = c.child(c.root(), "child").unwrap();
        for name in ["first", "second", "third"] {
            c.provide_value(
                child,
                ProvideOptions::new().in_group("settings"),
                Arc::new(Settings { name }),
            )
            .unwrap();
        }
        c.provide_value(
            c.root(),
            ProvideOptions::new().in_group("settings"),
            Arc::new(Settings { name: "root" }),
        )
        .unwrap();

        let names: Vec<_> = c
            .resolve_group::<Settings>(child, "settings")
            .unwrap()
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert!(c.resolve_group::<Settings>(child, "missing").unwrap().is_empty());
    }

    #[derive(Debug)]
    struct Left(#[allow(dead_code)] Arc<Right>);
    #[derive(Debug)]
    struct Right(#[allow(dead_code)] Arc<Left>);

    #[test]
    fn cycles_are_reported() {
        let c = Container::new();
        let root = c.root();
        c.provide::<Left, _>(root, ProvideOptions::new(), |r| Ok(Arc::new(Left(r.resolve()?))))
            .unwrap();
        c.provide::<Right, _>(root, ProvideOptions::new(), |r| Ok(Arc::new(Right(r.resolve()?))))
            .unwrap();

        let err = c.resolve::<Left>(root).unwrap_err();
        let rendered = format!("{:#}", anyhow::Error::from(err));
        assert!(rendered.contains("dependency cycle detected"), "{rendered}");
        // the stack unwinds cleanly after a failure
        assert!(c.resolving.lock().is_empty());
    }

    #[test]
    fn missing_dependency_names_type_and_scope() {
        let c = Container::new();
        let s = c.child(c.root(), "users").unwrap();
        let err = c.resolve::<Settings>(s).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Settings"), "{msg}");
        assert!(msg.contains("root > users"), "{msg}");
    }

    #[test]
    fn invoke_wraps_callback_errors() {
        let c = Container::new();
        let out = c
            .invoke(c.root(), |r| Ok(r.scope()))
            .unwrap();
        assert_eq!(out, ScopeId::ROOT);

        let err = c
            .invoke(c.root(), |r| r.resolve::<Settings>().map_err(Into::into))
            .unwrap_err();
        assert!(matches!(err, ContainerError::Invoke { .. }));
    }
}
