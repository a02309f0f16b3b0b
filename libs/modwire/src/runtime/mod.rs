//! Process lifecycle helpers: how `App::listen` learns it should stop.

pub mod shutdown;

use std::{fmt, future::Future, pin::Pin};
use tokio_util::sync::CancellationToken;

/// How a listening app decides when to stop accepting connections.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, shutdown begins.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

impl ShutdownOptions {
    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::Future(Box::pin(fut))
    }
}

impl fmt::Debug for ShutdownOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signals => f.write_str("Signals"),
            Self::Token(_) => f.write_str("Token"),
            Self::Future(_) => f.write_str("Future"),
        }
    }
}

/// Spawn the waiter for `opts`; `cancel` is cancelled when it fires.
pub(crate) fn spawn_waiter(opts: ShutdownOptions, cancel: CancellationToken) {
    match opts {
        ShutdownOptions::Signals => {
            tokio::spawn(async move {
                tokio::select! {
                    res = shutdown::wait_for_shutdown() => match res {
                        Ok(()) => tracing::info!("shutdown: signal received"),
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                "shutdown: signal waiter failed; falling back to ctrl_c()"
                            );
                            let _ = tokio::signal::ctrl_c().await;
                        }
                    },
                    _ = cancel.cancelled() => return,
                }
                cancel.cancel();
            });
        }
        ShutdownOptions::Token(external) => {
            tokio::spawn(async move {
                tokio::select! {
                    _ = external.cancelled() => {
                        tracing::info!("shutdown: external token cancelled");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }
        ShutdownOptions::Future(waiter) => {
            tokio::spawn(async move {
                tokio::select! {
                    _ = waiter => {
                        tracing::info!("shutdown: external future completed");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_cancels_waiter_target() {
        let external = CancellationToken::new();
        let target = CancellationToken::new();
        spawn_waiter(ShutdownOptions::Token(external.clone()), target.clone());

        external.cancel();
        tokio::time::timeout(Duration::from_secs(1), target.cancelled())
            .await
            .expect("target should be cancelled");
    }

    #[tokio::test]
    async fn future_completion_cancels_target() {
        let target = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        spawn_waiter(
            ShutdownOptions::future(async move {
                let _ = rx.await;
            }),
            target.clone(),
        );

        assert!(!target.is_cancelled());
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), target.cancelled())
            .await
            .expect("target should be cancelled");
    }
}
