//! Long-running service host with graceful shutdown.
//!
//! Every background component (waitlist syncer, promoter, call worker, the
//! reconcilers) implements [`Service`]; the host spawns them and fans a
//! single cancellation token out on shutdown. Services are expected to stop
//! promptly but must NOT mass-release leases on the way down: crashed or
//! stopping workers leave their leases to TTL + janitor recovery.

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running background service.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    /// Run until completion or until `shutdown` is cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Spawns services and owns the shared shutdown token.
#[derive(Default)]
pub struct ServiceHost {
    shutdown: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a service onto the runtime.
    pub fn spawn(&mut self, service: Box<dyn Service>) {
        let name = service.name();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            info!(service = name, "service starting");
            match service.run(shutdown).await {
                Ok(()) => info!(service = name, "service stopped"),
                Err(e) => error!(service = name, error = %e, "service exited with error"),
            }
        });
        self.handles.push((name, handle));
    }

    /// Signal shutdown and wait for every service to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(service = name, error = %e, "service task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Waiter {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Service for Waiter {
        fn name(&self) -> &'static str {
            "waiter"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_stops_services() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut host = ServiceHost::new();
        host.spawn(Box::new(Waiter {
            stopped: stopped.clone(),
        }));
        host.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
    }
}
