use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// Fire-and-forget background work with a cap on how much runs at once.
///
/// Callers get control back immediately; failures are logged, never returned.
#[derive(Clone)]
pub struct TaskQueue {
    permits: Arc<Semaphore>,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(max_concurrent.max(1))) }
    }

    pub fn spawn<F>(&self, name: impl Into<String>, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("task {name} dropped: queue closed");
                return;
            };
            debug!("task {name} started");
            match fut.await {
                Ok(()) => debug!("task {name} finished"),
                Err(e) => warn!("task {name} failed: {e}"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn bounds_concurrency_and_swallows_errors() {
        let queue = TaskQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..5 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(queue.spawn(format!("job-{i}"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                if i == 3 {
                    return Err(Error::Transient("boom".into()));
                }
                Ok(())
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
