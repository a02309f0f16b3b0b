//! # Modwire - modular dependency injection with guarded HTTP routing
//!
//! An application is a tree of modules. Each module gets its own scope in a
//! hierarchical container, declares providers, exports some of them to its importer
//! (or app-wide when global), and owns controllers whose routes are registered on an
//! axum server behind per-route guard chains.
//!
//! ## Example
//!
//! ```rust,ignore
//! use modwire::{App, Controller, ControllerConfig, Module, ModuleConfig, RouteConfig};
//! use std::sync::Arc;
//!
//! struct Health;
//! impl Controller for Health {
//!     fn config(&self) -> ControllerConfig {
//!         ControllerConfig::new("").route(RouteConfig::get("/health", || async { "ok" }))
//!     }
//! }
//!
//! struct AppModule;
//! impl Module for AppModule {
//!     fn config(&self) -> ModuleConfig {
//!         ModuleConfig::new().controller_value(Health)
//!     }
//! }
//!
//! let app = App::new(AppModule)?;
//! app.listen("0.0.0.0", 8080).await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod container;
pub use container::{Container, ContainerError, ProvideOptions, Resolver, ScopeId, TypeKey};

pub mod module;
pub use module::{Module, ModuleConfig};

pub mod graph;
pub use graph::{ModuleGraph, ModuleId, ModuleNode};

pub mod guard;
pub use guard::{guard_fn, Guard, GuardChain, GuardContext, GuardSet, Metadata, Verdict};

pub mod controller;
pub use controller::{
    join_pattern, Controller, ControllerConfig, ControllerInstance, RouteConfig, RouteInstance,
};

mod dispatch;

pub mod server;
pub use server::{HttpServer, RoutePattern, ServerError};

pub mod request_id;
pub use request_id::XRequestId;

pub mod problem;
pub use problem::{Problem, ProblemResponse, APPLICATION_PROBLEM_JSON};

pub mod error;
pub use error::{BuildError, ControllerError};

pub mod app;
pub use app::{App, ListenOptions, DEFAULT_SHUTDOWN_TIMEOUT};

pub mod runtime;
pub use runtime::ShutdownOptions;
