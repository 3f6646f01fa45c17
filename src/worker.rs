//! Periodic background worker
//!
//! One abstraction for every background loop of the node (approval GC,
//! chain height refresh, upload scanning): a cancellation token, a period and
//! a unit of work.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Unit of work run once per period.
pub type WorkFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct PeriodicWorker {
    name: String,
    period: Duration,
    cancel: CancellationToken,
    work: WorkFn,
}

impl PeriodicWorker {
    pub fn new(
        name: impl Into<String>,
        cancel: CancellationToken,
        period: Duration,
        work: WorkFn,
    ) -> Self {
        Self {
            name: name.into(),
            period,
            cancel,
            work,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs until the token is cancelled. The first tick fires immediately;
    /// errors are logged and do not stop the loop.
    pub async fn run(self) {
        info!(worker = %self.name, period = ?self.period, "worker started");
        let mut tick = interval(self.period.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    let work = (self.work)();
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        result = work => match result {
                            Ok(()) => debug!(worker = %self.name, "worker pass done"),
                            Err(e) => warn!(worker = %self.name, error = %e, "worker pass failed"),
                        },
                    }
                }
            }
        }
        info!(worker = %self.name, "worker stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>, fail: bool) -> WorkFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(Error::Internal("boom".into()))
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_runs_each_period() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let handle = PeriodicWorker::new(
            "count",
            cancel.clone(),
            Duration::from_secs(10),
            counting(counter.clone(), false),
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_survives_errors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let handle = PeriodicWorker::new(
            "fail",
            cancel.clone(),
            Duration::from_secs(1),
            counting(counter.clone(), true),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_does_nothing_long() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let worker = PeriodicWorker::new(
            "idle",
            cancel,
            Duration::from_secs(3600),
            counting(Arc::new(AtomicUsize::new(0)), false),
        );
        assert_eq!(worker.name(), "idle");
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .unwrap();
    }
}
