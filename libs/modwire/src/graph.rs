//! Module graph construction.
//!
//! Building a module, in order:
//! 1. validate that every export names one of the module's own providers;
//! 2. register providers in the module scope (a global module's exports go to the
//!    app-wide table instead);
//! 3. register controllers into the scope's `controllers` group;
//! 4. build each import in a child scope and expose its exports here;
//! 5. resolve the controllers, their guards, and register their routes.
//!
//! Controllers are resolved after the imports so they can depend on what the
//! module imports.

use std::sync::Arc;

use crate::container::{Container, ProvideOptions, ScopeId, TypeKey};
use crate::controller::{build_controller, Controller, ControllerInstance, CONTROLLERS_GROUP};
use crate::error::BuildError;
use crate::module::Module;
use crate::server::HttpServer;

/// Index of a module node in its graph.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ModuleId(usize);

impl ModuleId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A built module. Each import site yields its own node and scope.
#[derive(Debug)]
pub struct ModuleNode {
    id: ModuleId,
    token: &'static str,
    is_global: bool,
    scope: ScopeId,
    parent: Option<ModuleId>,
    children: Vec<ModuleId>,
    exports: Vec<TypeKey>,
    controllers: Vec<ControllerInstance>,
}

impl ModuleNode {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn token(&self) -> &'static str {
        self.token
    }

    pub fn is_global(&self) -> bool {
        self.is_global
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn parent(&self) -> Option<ModuleId> {
        self.parent
    }

    /// Imported modules in declaration order.
    pub fn children(&self) -> &[ModuleId] {
        &self.children
    }

    pub fn exports(&self) -> &[TypeKey] {
        &self.exports
    }

    pub fn controllers(&self) -> &[ControllerInstance] {
        &self.controllers
    }
}

/// Arena of module nodes; index 0 is the root module.
#[derive(Debug)]
pub struct ModuleGraph {
    nodes: Vec<ModuleNode>,
}

impl ModuleGraph {
    pub(crate) fn build(
        container: &Container,
        server: &HttpServer,
        root: &dyn Module,
    ) -> Result<Self, BuildError> {
        let scope = container
            .child(container.root(), root.token())
            .map_err(|source| BuildError::Scope {
                module: root.token(),
                source,
            })?;

        let mut builder = GraphBuilder {
            container,
            server,
            nodes: Vec::new(),
        };
        builder.build_module(root, scope, None)?;

        tracing::debug!(modules = builder.nodes.len(), "module graph built");
        Ok(Self {
            nodes: builder.nodes,
        })
    }

    pub fn root(&self) -> &ModuleNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.nodes.get(id.0)
    }

    pub fn parent(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.node(id)?.parent.and_then(|p| self.node(p))
    }

    pub fn children(&self, id: ModuleId) -> impl Iterator<Item = &ModuleNode> + '_ {
        self.node(id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|c| self.node(*c))
    }

    /// Every node whose token is `token`, in build order.
    pub fn find<'a>(&'a self, token: &'a str) -> impl Iterator<Item = &'a ModuleNode> + 'a {
        self.nodes.iter().filter(move |n| n.token == token)
    }

    pub fn find_module<M: Module>(&self) -> impl Iterator<Item = &ModuleNode> + '_ {
        self.find(std::any::type_name::<M>())
    }

    /// `(pattern, guard names)` of every registered route, in registration order.
    pub fn routes(&self) -> Vec<(String, Vec<&'static str>)> {
        self.nodes
            .iter()
            .flat_map(|n| n.controllers.iter())
            .flat_map(|c| c.routes().iter())
            .map(|r| (r.pattern().to_string(), r.chain().names()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleNode> + '_ {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

struct GraphBuilder<'a> {
    container: &'a Container,
    server: &'a HttpServer,
    nodes: Vec<ModuleNode>,
}

impl GraphBuilder<'_> {
    fn build_module(
        &mut self,
        module: &dyn Module,
        scope: ScopeId,
        parent: Option<ModuleId>,
    ) -> Result<ModuleId, BuildError> {
        let token = module.token();
        let config = module.config();

        for export in &config.exports {
            if !config.provides(*export) {
                return Err(BuildError::UnmatchedExport {
                    module: token,
                    export: *export,
                });
            }
        }

        for provider in config.providers {
            let global = config.is_global && config.exports.contains(&provider.key);
            (provider.register)(self.container, scope, ProvideOptions::new().exported(global))
                .map_err(|source| BuildError::Provider {
                    module: token,
                    provider: provider.key,
                    source,
                })?;
        }

        for register in config.controllers {
            register(
                self.container,
                scope,
                ProvideOptions::new().in_group(CONTROLLERS_GROUP),
            )
            .map_err(|source| BuildError::Controllers {
                module: token,
                source,
            })?;
        }

        let id = ModuleId(self.nodes.len());
        self.nodes.push(ModuleNode {
            id,
            token,
            is_global: config.is_global,
            scope,
            parent,
            children: Vec::new(),
            exports: config.exports,
            controllers: Vec::new(),
        });
        if let Some(p) = parent {
            self.nodes[p.0].children.push(id);
        }
        tracing::debug!(
            module = token,
            scope = %self.container.scope_path(scope),
            global = config.is_global,
            "module registered"
        );

        for import in config.imports {
            let child = self.build_import(token, import, scope, id)?;
            self.expose_exports(child, scope)?;
        }

        self.build_controllers(id, token, scope)?;
        Ok(id)
    }

    fn build_import(
        &mut self,
        importer: &'static str,
        import: Arc<dyn Module>,
        parent_scope: ScopeId,
        parent: ModuleId,
    ) -> Result<ModuleId, BuildError> {
        let wrap = |source: BuildError| BuildError::Import {
            module: importer,
            import: import.token(),
            source: Box::new(source),
        };

        let scope = self
            .container
            .child(parent_scope, import.token())
            .map_err(|source| {
                wrap(BuildError::Scope {
                    module: import.token(),
                    source,
                })
            })?;
        self.build_module(import.as_ref(), scope, Some(parent))
            .map_err(wrap)
    }

    /// Make a non-global child's exports resolvable in `scope` without constructing
    /// them twice: the importer resolves the very instance the child owns.
    fn expose_exports(&self, child: ModuleId, scope: ScopeId) -> Result<(), BuildError> {
        let node = &self.nodes[child.0];
        if node.is_global {
            return Ok(());
        }
        for export in &node.exports {
            self.container
                .alias(scope, *export, node.scope)
                .map_err(|source| BuildError::Export {
                    module: node.token,
                    export: *export,
                    source,
                })?;
        }
        Ok(())
    }

    fn build_controllers(
        &mut self,
        id: ModuleId,
        token: &'static str,
        scope: ScopeId,
    ) -> Result<(), BuildError> {
        let controllers = self
            .container
            .invoke(scope, |r| Ok(r.group::<dyn Controller>(CONTROLLERS_GROUP)?))
            .map_err(|source| BuildError::Controllers {
                module: token,
                source,
            })?;

        for (idx, controller) in controllers.iter().enumerate() {
            let site = format!("{}#{idx}", controller.token());
            let instance = build_controller(
                controller.as_ref(),
                &site,
                scope,
                self.container,
                self.server,
            )
            .map_err(|source| BuildError::Controller {
                module: token,
                controller: controller.token(),
                source,
            })?;
            self.nodes[id.0].controllers.push(instance);
        }
        Ok(())
    }
}
