//! Module declarations.
//!
//! A module declares what it provides, what it exports to its importer (or to the
//! whole app when global), which modules it imports and which controllers it owns.
//! Declarations are plain data; the graph builder turns them into scopes.

use std::{fmt, sync::Arc};

use crate::container::{Container, ContainerError, ProvideOptions, Resolver, ScopeId, TypeKey};
use crate::controller::Controller;

pub(crate) type Registration =
    Box<dyn FnOnce(&Container, ScopeId, ProvideOptions) -> Result<(), ContainerError> + Send>;

pub(crate) struct ProviderDecl {
    pub(crate) key: TypeKey,
    pub(crate) register: Registration,
}

/// A unit of composition. Implementations are usually unit or config structs.
pub trait Module: Send + Sync + 'static {
    fn config(&self) -> ModuleConfig;

    /// Stable identity, used as the scope name and in diagnostics.
    fn token(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Builder for a module's declaration.
#[derive(Default)]
pub struct ModuleConfig {
    pub(crate) is_global: bool,
    pub(crate) imports: Vec<Arc<dyn Module>>,
    pub(crate) providers: Vec<ProviderDecl>,
    pub(crate) exports: Vec<TypeKey>,
    pub(crate) controllers: Vec<Registration>,
}

impl fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("is_global", &self.is_global)
            .field(
                "imports",
                &self.imports.iter().map(|m| m.token()).collect::<Vec<_>>(),
            )
            .field(
                "providers",
                &self.providers.iter().map(|p| p.key).collect::<Vec<_>>(),
            )
            .field("exports", &self.exports)
            .field("controllers", &self.controllers.len())
            .finish()
    }
}

impl ModuleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports of a global module are visible from every scope of the app.
    pub fn global(mut self) -> Self {
        self.is_global = true;
        self
    }

    pub fn import<M: Module>(self, module: M) -> Self {
        self.import_arc(Arc::new(module))
    }

    pub fn import_arc(mut self, module: Arc<dyn Module>) -> Self {
        self.imports.push(module);
        self
    }

    /// Provide `T` through a constructor resolved lazily in this module's scope.
    pub fn provide<T, F>(mut self, ctor: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.providers.push(ProviderDecl {
            key: TypeKey::of::<T>(),
            register: Box::new(move |c: &Container, scope: ScopeId, opts: ProvideOptions| {
                c.provide::<T, F>(scope, opts, ctor)
            }),
        });
        self
    }

    /// Provide a ready-made `T`.
    pub fn provide_value<T>(mut self, value: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.providers.push(ProviderDecl {
            key: TypeKey::of::<T>(),
            register: Box::new(move |c: &Container, scope: ScopeId, opts: ProvideOptions| {
                c.provide_value::<T>(scope, opts, value)
            }),
        });
        self
    }

    /// Export the provider of `T`. It must be provided by this same module.
    pub fn export<T: ?Sized + 'static>(mut self) -> Self {
        self.exports.push(TypeKey::of::<T>());
        self
    }

    /// Register a controller built in this module's scope.
    pub fn controller<C, F>(mut self, ctor: F) -> Self
    where
        C: Controller,
        F: Fn(&Resolver<'_>) -> anyhow::Result<Arc<C>> + Send + Sync + 'static,
    {
        self.controllers.push(Box::new(move |c: &Container, scope: ScopeId, opts: ProvideOptions| {
            c.provide::<dyn Controller, _>(scope, opts, move |r| {
                let controller: Arc<dyn Controller> = ctor(r)?;
                Ok(controller)
            })
        }));
        self
    }

    pub fn controller_value<C: Controller>(mut self, controller: C) -> Self {
        let controller: Arc<dyn Controller> = Arc::new(controller);
        self.controllers.push(Box::new(move |c: &Container, scope: ScopeId, opts: ProvideOptions| {
            c.provide_value::<dyn Controller>(scope, opts, controller)
        }));
        self
    }

    pub fn is_global(&self) -> bool {
        self.is_global
    }

    pub fn exports(&self) -> &[TypeKey] {
        &self.exports
    }

    pub fn provides(&self, key: TypeKey) -> bool {
        self.providers.iter().any(|p| p.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock;
    trait Tick: Send + Sync {}
    impl Tick for Clock {}

    struct Empty;
    impl Module for Empty {
        fn config(&self) -> ModuleConfig {
            ModuleConfig::new()
        }
    }

    #[test]
    fn builder_records_declarations() {
        let cfg = ModuleConfig::new()
            .global()
            .import(Empty)
            .provide(|_| Ok(Arc::new(Clock)))
            .provide_value::<dyn Tick>(Arc::new(Clock))
            .export::<dyn Tick>();

        assert!(cfg.is_global());
        assert_eq!(cfg.imports.len(), 1);
        assert!(cfg.imports[0].token().ends_with("Empty"));
        assert!(cfg.provides(TypeKey::of::<Clock>()));
        assert!(cfg.provides(TypeKey::of::<dyn Tick>()));
        assert_eq!(cfg.exports(), &[TypeKey::of::<dyn Tick>()]);
    }

    #[test]
    fn provider_registration_targets_scope() {
        let c = Container::new();
        let scope = c.child(c.root(), "m").unwrap();
        let cfg = ModuleConfig::new().provide(|_| Ok(Arc::new(Clock)));

        for p in cfg.providers {
            (p.register)(&c, scope, ProvideOptions::new()).unwrap();
        }
        assert!(c.is_visible::<Clock>(scope));
        assert!(!c.is_visible::<Clock>(c.root()));
    }
}
