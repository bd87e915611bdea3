// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Async-response worker pool (§4.8.4, §5): M dedicated tasks, each
//! blocking on its own inbound queue, that await a pending call's
//! completion and then run the caller's callback off the network thread
//! that owns the call's [`crate::client::object_proxy::ObjectProxy`].

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::client::request::InvokeResult;

pub type Callback = Box<dyn FnOnce(InvokeResult) + Send + 'static>;

struct AsyncJob {
    completion: oneshot::Receiver<InvokeResult>,
    callback: Callback,
}

/// A fixed pool of async-response worker threads (§6 `asyncthread`).
/// Dispatch is round-robin; each worker processes its assigned jobs
/// strictly in arrival order but the pool as a whole runs them
/// concurrently.
pub struct AsyncWorkerPool {
    inboxes: Vec<mpsc::UnboundedSender<AsyncJob>>,
    next: AtomicUsize,
}

impl AsyncWorkerPool {
    pub fn spawn(worker_count: u32, cancel: CancellationToken) -> Self {
        let count = worker_count.max(1) as usize;
        let mut inboxes = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.push(tx);
            tokio::spawn(worker_loop(rx, cancel.clone()));
        }
        Self { inboxes, next: AtomicUsize::new(0) }
    }

    /// Hands a pending call's completion receiver and the caller's callback
    /// to one worker, chosen round-robin (§4.8.4 "dispatches ... onto one
    /// of M async-processing threads").
    pub fn dispatch(&self, completion: oneshot::Receiver<InvokeResult>, callback: Callback) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.inboxes.len();
        // A closed inbox means the worker pool is shutting down; dropping
        // the job silently matches `terminate()`'s "in-flight work finishes
        // or times out" allowance rather than panicking during shutdown.
        let _ = self.inboxes[idx].send(AsyncJob { completion, callback });
    }

    pub fn worker_count(&self) -> usize {
        self.inboxes.len()
    }
}

async fn worker_loop(mut inbox: mpsc::UnboundedReceiver<AsyncJob>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            job = inbox.recv() => {
                let Some(job) = job else { break };
                if let Ok(result) = job.completion.await {
                    (job.callback)(result);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test]
    async fn dispatched_job_runs_callback_after_completion() {
        let pool = AsyncWorkerPool::spawn(2, CancellationToken::new());
        let (tx, rx) = oneshot::channel();
        let seen: Arc<Mutex<Option<InvokeResult>>> = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        pool.dispatch(rx, Box::new(move |result| *seen2.lock().unwrap() = Some(result)));
        tx.send(InvokeResult::Response(bytes::Bytes::from_static(b"ok"))).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(*seen.lock().unwrap(), Some(InvokeResult::Response(_))));
    }

    #[tokio::test]
    async fn dispatch_round_robins_across_workers() {
        let pool = AsyncWorkerPool::spawn(3, CancellationToken::new());
        assert_eq!(pool.worker_count(), 3);
        for _ in 0..3 {
            let (_tx, rx) = oneshot::channel();
            pool.dispatch(rx, Box::new(|_| {}));
        }
        assert_eq!(pool.next.load(Ordering::Relaxed), 3);
    }
}
