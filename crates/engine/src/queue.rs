use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Worker {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

/// FIFO serialization of work per conversation key.
///
/// Jobs enqueued under the same key run strictly in submission order; jobs
/// under different keys run concurrently. Each key gets a dedicated worker
/// task fed by an unbounded channel; idle workers are swept so the map stays
/// bounded.
pub struct TopicQueue {
    workers: Mutex<HashMap<String, Worker>>,
}

impl TopicQueue {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn enqueue<F>(&self, key: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.workers.lock().expect("queue map poisoned");
        let worker = workers
            .entry(key.to_string())
            .or_insert_with(|| Self::spawn_worker(key));
        worker.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = worker.tx.send(Box::pin(job)) {
            // The previous worker already exited; replace it and requeue.
            let job = err.0;
            let replacement = Self::spawn_worker(key);
            replacement.pending.fetch_add(1, Ordering::SeqCst);
            let _ = replacement.tx.send(job);
            workers.insert(key.to_string(), replacement);
        }
    }

    fn spawn_worker(key: &str) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_in_worker = pending.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
                pending_in_worker.fetch_sub(1, Ordering::SeqCst);
            }
            debug!(key = %key, "Topic worker drained");
        });
        Worker { tx, pending }
    }

    /// Jobs submitted but not yet finished, across all keys.
    pub fn pending(&self) -> usize {
        let workers = self.workers.lock().expect("queue map poisoned");
        workers
            .values()
            .map(|w| w.pending.load(Ordering::SeqCst))
            .sum()
    }

    /// Drop idle workers. Enqueue and sweep both hold the map lock, so a key
    /// cannot gain work while being removed.
    pub fn sweep(&self) {
        let mut workers = self.workers.lock().expect("queue map poisoned");
        workers.retain(|_, w| w.pending.load(Ordering::SeqCst) > 0);
    }

    pub fn keys(&self) -> usize {
        self.workers.lock().expect("queue map poisoned").len()
    }

    /// Wait for all pending jobs to settle, up to `timeout`. Returns whether
    /// the queue drained in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

impl Default for TopicQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_runs_in_submission_order() {
        let queue = TopicQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            queue.enqueue("12345:root", async move {
                // Earlier jobs sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(10u64.saturating_sub(i))).await;
                order.lock().unwrap().push(i);
            });
        }

        assert!(queue.drain(Duration::from_secs(5)).await);
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let queue = TopicQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

        let tx_a = tx.clone();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        queue.enqueue("a", async move {
            // Blocks until key "b" proves it ran alongside.
            let _ = gate_rx.await;
            let _ = tx_a.send("a");
        });
        queue.enqueue("b", async move {
            let _ = tx.send("b");
            let _ = gate_tx.send(());
        });

        assert!(queue.drain(Duration::from_secs(5)).await);
        assert_eq!(rx.recv().await, Some("b"));
        assert_eq!(rx.recv().await, Some("a"));
    }

    #[tokio::test]
    async fn test_sweep_bounds_the_map() {
        let queue = TopicQueue::new();
        for i in 0..20 {
            queue.enqueue(&format!("key-{}", i), async {});
        }
        assert!(queue.drain(Duration::from_secs(5)).await);
        queue.sweep();
        assert_eq!(queue.keys(), 0);

        // The key is usable again after a sweep.
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        queue.enqueue("key-0", async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert!(queue.drain(Duration::from_secs(5)).await);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
