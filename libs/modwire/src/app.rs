//! Application bootstrap: container + server + module graph, then listen.

use axum::Router;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::container::{Container, ProvideOptions};
use crate::error::BuildError;
use crate::graph::ModuleGraph;
use crate::module::Module;
use crate::runtime::{spawn_waiter, ShutdownOptions};
use crate::server::{HttpServer, ServerError};

/// How long in-flight requests may drain after shutdown begins.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where to listen and how to stop.
#[derive(Debug)]
pub struct ListenOptions {
    pub addr: String,
    pub shutdown: ShutdownOptions,
    pub shutdown_timeout: Duration,
}

impl ListenOptions {
    pub fn new(host: &str, port: u16) -> Self {
        let addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self {
            addr,
            shutdown: ShutdownOptions::Signals,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownOptions) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// A built application. Construction fails if any part of the module graph does.
pub struct App {
    container: Arc<Container>,
    server: Arc<HttpServer>,
    graph: ModuleGraph,
    // replaced on every shutdown so a later listen starts fresh
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("root", &self.graph.root().token())
            .field("modules", &self.graph.len())
            .field("routes", &self.server.patterns())
            .finish()
    }
}

impl App {
    pub fn new<M: Module>(root: M) -> Result<Self, BuildError> {
        Self::with_server(root, HttpServer::new())
    }

    /// Build with a caller-supplied server. The server is provided in the root scope
    /// so any module may depend on `HttpServer`.
    pub fn with_server<M: Module>(root: M, server: HttpServer) -> Result<Self, BuildError> {
        let container = Arc::new(Container::new());
        let server = Arc::new(server);
        container
            .provide_value(container.root(), ProvideOptions::new(), server.clone())
            .map_err(BuildError::Server)?;

        let graph = ModuleGraph::build(&container, &server, &root)?;
        tracing::info!(
            root = root.token(),
            modules = graph.len(),
            routes = server.patterns().len(),
            "application built"
        );

        Ok(Self {
            container,
            server,
            graph,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn server(&self) -> &HttpServer {
        &self.server
    }

    /// The complete router, for serving elsewhere or driving in tests.
    pub fn router(&self) -> Router {
        self.server.router()
    }

    /// Stop every `listen*` call running now. Later calls are unaffected.
    pub fn shutdown(&self) {
        let current = std::mem::take(&mut *self.cancel.lock());
        current.cancel();
    }

    /// Listen on `host:port` until SIGINT/SIGTERM, draining for up to five seconds.
    pub async fn listen(&self, host: &str, port: u16) -> anyhow::Result<()> {
        self.listen_with(ListenOptions::new(host, port)).await
    }

    pub async fn listen_with(&self, opts: ListenOptions) -> anyhow::Result<()> {
        let listener = TcpListener::bind(opts.addr.as_str())
            .await
            .map_err(|source| ServerError::Bind {
                addr: opts.addr.clone(),
                source,
            })?;
        self.listen_on(listener, opts.shutdown, opts.shutdown_timeout)
            .await
    }

    /// Serve on an already bound listener.
    pub async fn listen_on(
        &self,
        listener: TcpListener,
        shutdown: ShutdownOptions,
        shutdown_timeout: Duration,
    ) -> anyhow::Result<()> {
        let stop = self.cancel.lock().child_token();
        spawn_waiter(shutdown, stop.clone());

        let server = self.server.clone();
        let graceful = stop.clone().cancelled_owned();
        let mut serving =
            tokio::spawn(async move { server.serve(listener, graceful).await });

        tokio::select! {
            res = &mut serving => {
                // stopped on its own, before any shutdown request
                stop.cancel();
                let res = res?;
                if let Err(e) = &res {
                    tracing::error!(error = %e, "HTTP server failed");
                }
                return Ok(res?);
            }
            _ = stop.cancelled() => {}
        }

        tracing::info!(timeout = ?shutdown_timeout, "shutting down, draining in-flight requests");
        match tokio::time::timeout(shutdown_timeout, &mut serving).await {
            Ok(res) => res??,
            Err(_) => {
                tracing::warn!(
                    timeout = ?shutdown_timeout,
                    "in-flight requests did not finish in time; closing connections"
                );
                serving.abort();
            }
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
