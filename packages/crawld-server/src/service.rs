//! A small service-host abstraction so `main` can supervise several
//! independent loops (leader election, scheduler, worker pool, fetch
//! workers) the same way, each getting its own child cancellation token
//! and a bounded shutdown window.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One independently-running loop within the process (spec §5).
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}

/// Spawn every service under its own child token, then wait for the
/// parent token to fire and give each service up to `drain_timeout` to
/// return before moving on.
pub async fn run_until_shutdown(services: Vec<Box<dyn Service>>, parent_shutdown: CancellationToken, drain_timeout: Duration) {
    let mut handles = Vec::with_capacity(services.len());
    for service in services {
        let name = service.name();
        let child = parent_shutdown.child_token();
        let handle = tokio::spawn(async move {
            info!(service = name, "starting");
            if let Err(e) = service.run(child).await {
                error!(service = name, error = %e, "service exited with error");
            } else {
                info!(service = name, "stopped cleanly");
            }
        });
        handles.push((name, handle));
    }

    parent_shutdown.cancelled().await;
    info!("shutdown signal received, draining services");

    for (name, handle) in handles {
        match tokio::time::timeout(drain_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(service = name, error = %e, "service task panicked"),
            Err(_) => warn!(service = name, timeout = ?drain_timeout, "service did not stop within drain timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Stub {
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Service for Stub {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_until_shutdown_stops_services_on_cancel() {
        let ran = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let services: Vec<Box<dyn Service>> = vec![Box::new(Stub { ran: ran.clone() })];

        let shutdown_clone = shutdown.clone();
        let task = tokio::spawn(run_until_shutdown(services, shutdown_clone, Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
