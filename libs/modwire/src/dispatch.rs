//! Per-request pipeline: evaluate the route's guard chain, then run the handler.

use axum::{
    extract::Request,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::controller::BoxedHandler;
use crate::guard::{GuardChain, GuardContext, Metadata, Verdict};
use crate::problem::{forbidden, internal_error, ProblemResponse};
use crate::request_id::XRequestId;

#[derive(Clone)]
pub(crate) struct RouteDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    pattern: String,
    chain: GuardChain,
    controller_metadata: Arc<Metadata>,
    route_metadata: Arc<Metadata>,
    handler: BoxedHandler,
}

impl RouteDispatcher {
    pub(crate) fn new(
        pattern: String,
        chain: GuardChain,
        controller_metadata: Arc<Metadata>,
        route_metadata: Arc<Metadata>,
        handler: BoxedHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pattern,
                chain,
                controller_metadata,
                route_metadata,
                handler,
            }),
        }
    }

    /// Allowed requests reach the handler untouched. A denial answers 403 and a
    /// guard error answers 500; neither runs the handler or the remaining guards.
    pub(crate) async fn dispatch(&self, req: Request) -> Response {
        let inner = &*self.inner;
        let (parts, body) = req.into_parts();

        let verdict = {
            let ctx = GuardContext::new(
                &parts,
                &inner.pattern,
                &inner.controller_metadata,
                &inner.route_metadata,
            );
            inner.chain.evaluate(&ctx).await
        };

        let problem = match verdict {
            Verdict::Allowed => {
                return (inner.handler)(Request::from_parts(parts, body)).await;
            }
            Verdict::Denied { guard } => {
                tracing::debug!(pattern = %inner.pattern, guard, "request denied by guard");
                forbidden("access to this resource is denied")
            }
            Verdict::Failed { guard, error } => {
                tracing::warn!(
                    pattern = %inner.pattern,
                    guard,
                    error = %format!("{error:#}"),
                    "guard failed"
                );
                internal_error("the request could not be authorized")
            }
        };

        let mut problem = problem.with_instance(parts.uri.path());
        if let Some(XRequestId(rid)) = parts.extensions.get::<XRequestId>() {
            problem = problem.with_request_id(rid.clone());
        }
        ProblemResponse(problem).into_response()
    }
}
