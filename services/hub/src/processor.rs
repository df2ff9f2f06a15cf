//! Bounded worker pool between the read pumps and the router.
//!
//! `submit` never blocks a read pump: a full queue sheds the task and
//! records a metric.  Each worker wraps the route call in a hard timeout
//! and survives panics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chat_protocol::Envelope;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::metrics::Metrics;
use crate::router::MessageRouter;

/// One inbound envelope with its authenticated sender.
#[derive(Debug)]
pub struct InboundTask {
    pub sender_id: String,
    pub envelope: Envelope,
}

pub struct Processor {
    /// Sole Sender of the queue; `shutdown` takes it, closing the queue.
    queue_tx: std::sync::Mutex<Option<mpsc::Sender<InboundTask>>>,
    metrics: Arc<Metrics>,
}

impl Processor {
    fn new(
        queue_size: usize,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::Receiver<InboundTask>) {
        let (queue_tx, queue_rx) = mpsc::channel(queue_size);
        (
            Arc::new(Self {
                queue_tx: std::sync::Mutex::new(Some(queue_tx)),
                metrics,
            }),
            queue_rx,
        )
    }

    /// Builds the processor and spawns its workers.
    pub fn start(
        router: Arc<MessageRouter>,
        workers: usize,
        queue_size: usize,
        task_timeout: Duration,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (processor, queue_rx) = Self::new(queue_size, Arc::clone(&metrics));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker_id in 0..workers.max(1) {
            tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&router),
                Arc::clone(&queue_rx),
                task_timeout,
                Arc::clone(&metrics),
                cancel.clone(),
            ));
        }
        processor
    }

    /// Non-blocking enqueue; shed (not an error) when the queue is full.
    pub fn submit(&self, task: InboundTask) {
        let queue_tx = self.queue_tx.lock().expect("processor lock");
        let Some(tx) = queue_tx.as_ref() else {
            debug!("processor stopped, task dropped");
            return;
        };
        match tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.metrics.task_shed();
                warn!(sender = %task.sender_id, message_type = %task.envelope.message_type,
                    "processor queue full, task shed");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("processor stopped, task dropped");
            }
        }
    }

    /// Closes the queue.  Workers drain whatever is still buffered and exit;
    /// later submissions are dropped.
    pub fn shutdown(&self) {
        if self.queue_tx.lock().expect("processor lock").take().is_some() {
            debug!("processor queue closed");
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    router: Arc<MessageRouter>,
    queue_rx: Arc<Mutex<mpsc::Receiver<InboundTask>>>,
    task_timeout: Duration,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    loop {
        let task = {
            let mut rx = queue_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(task) => task,
                    // Queue closed and empty.
                    None => break,
                },
            }
        };
        process_task(worker_id, &router, task, task_timeout, &metrics).await;
    }
    // Cancelled or closed: drain the remaining tasks, then exit.
    let mut rx = queue_rx.lock().await;
    while let Ok(task) = rx.try_recv() {
        process_task(worker_id, &router, task, task_timeout, &metrics).await;
    }
}

async fn process_task(
    worker_id: usize,
    router: &MessageRouter,
    task: InboundTask,
    task_timeout: Duration,
    metrics: &Metrics,
) {
    let started = tokio::time::Instant::now();
    let message_type = task.envelope.message_type;
    let routed = timeout(
        task_timeout,
        AssertUnwindSafe(router.route(&task.sender_id, task.envelope)).catch_unwind(),
    )
    .await;
    match routed {
        Err(_) => {
            metrics.route_error();
            warn!(worker = worker_id, %message_type, "task timed out");
        }
        Ok(Err(_panic)) => {
            metrics.route_error();
            error!(worker = worker_id, %message_type, "worker recovered from panic");
        }
        Ok(Ok(Err(e))) => {
            metrics.route_error();
            debug!(worker = worker_id, %message_type, error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64, "route failed");
        }
        Ok(Ok(Ok(()))) => {
            debug!(worker = worker_id, %message_type,
                elapsed_ms = started.elapsed().as_millis() as u64, "routed");
        }
    }
}
