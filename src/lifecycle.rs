//! Service life-cycle management
//!
//! Starts services in registration order, stops them in reverse under a
//! deadline, and turns SIGINT/SIGTERM into cancellation of a shared token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;

/// A long-lived component of the node.
///
/// `start` must return once the service is running; background work is
/// spawned and tied to the given token.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

pub struct ServiceLifecycle {
    cancel: CancellationToken,
    timeout: Duration,
    registered: Vec<Arc<dyn Service>>,
    active: Vec<Arc<dyn Service>>,
    signals_registered: AtomicBool,
}

impl ServiceLifecycle {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeout,
            registered: Vec::new(),
            active: Vec::new(),
            signals_registered: AtomicBool::new(false),
        }
    }

    /// Token cancelled on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn register(&mut self, service: Arc<dyn Service>) -> &mut Self {
        self.registered.push(service);
        self
    }

    /// Names of services started and not yet stopped, in start order.
    pub fn active_services(&self) -> Vec<String> {
        self.active.iter().map(|s| s.name().to_string()).collect()
    }

    /// Starts registered services one by one.
    ///
    /// On the first failure the shared token is cancelled, later services are
    /// not attempted and only the ones already running stay active.
    pub async fn start_services(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.registered);
        for service in pending {
            if self.cancel.is_cancelled() {
                warn!(service = service.name(), "shutdown requested, skipping start");
                break;
            }
            match service.start(self.cancel.child_token()).await {
                Ok(()) => {
                    info!(service = service.name(), "service started");
                    self.active.push(service);
                }
                Err(e) => {
                    error!(service = service.name(), error = %e, "service failed to start");
                    self.cancel.cancel();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Cancels the shared token on SIGINT or SIGTERM. Calling it again is a
    /// no-op; the listener exits once the token is cancelled.
    pub fn signals(&self) -> &Self {
        if self.signals_registered.swap(true, Ordering::SeqCst) {
            return self;
        }
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = shutdown_signal() => {
                    info!("shutdown signal received");
                    cancel.cancel();
                }
            }
        });
        self
    }

    /// Waits for cancellation, then stops every active service.
    pub async fn wait(&mut self) -> bool {
        self.cancel.cancelled().await;
        self.stop_services().await
    }

    /// Stops active services in reverse start order. Returns false if the
    /// deadline passed first; remaining stops are abandoned.
    pub async fn stop_services(&mut self) -> bool {
        self.cancel.cancel();
        let services = std::mem::take(&mut self.active);
        let stop_all = async {
            for service in services.iter().rev() {
                match service.stop().await {
                    Ok(()) => info!(service = service.name(), "service stopped"),
                    Err(e) => error!(service = service.name(), error = %e, "service failed to stop"),
                }
            }
        };
        match tokio::time::timeout(self.timeout, stop_all).await {
            Ok(()) => {
                info!("all services stopped");
                true
            }
            Err(_) => {
                error!(timeout = ?self.timeout, "timed out stopping services");
                false
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
