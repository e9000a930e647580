use crate::server::pipeline::{service_client, RequestContext};
use crate::utils::error::ProxyError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One accepted client socket awaiting service. The task owns the socket
/// until a worker takes it over; dropping an unserviced task closes it.
pub struct Task {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Outcome of handing a task to the queue. A rejected submission gives the
/// task back so the caller can answer and close the socket.
pub enum SubmitOutcome {
    Accepted,
    Rejected(Task),
}

/// Fixed-count worker pool over a bounded FIFO queue.
///
/// Each worker locks the shared receiver only long enough to dequeue, then
/// services the task with the lock released, so the queue order is the
/// hand-off order while task execution overlaps freely. An in-flight
/// semaphore, independent of the worker count, throttles how many requests
/// may run at once.
pub struct WorkerPool {
    queue_tx: mpsc::Sender<Task>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(
        worker_count: usize,
        queue_capacity: usize,
        limiter: Arc<Semaphore>,
        ctx: Arc<RequestContext>,
        shutdown: CancellationToken,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<Task>(queue_capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let workers = (0..worker_count)
            .map(|id| {
                let queue = Arc::clone(&queue_rx);
                let limiter = Arc::clone(&limiter);
                let ctx = Arc::clone(&ctx);
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    debug!(worker = id, "Worker started");

                    loop {
                        let task = {
                            let mut rx = queue.lock().await;
                            tokio::select! {
                                biased;
                                _ = shutdown.cancelled() => None,
                                task = rx.recv() => task,
                            }
                        };

                        let Some(task) = task else { break };

                        // Throttles in-flight requests independently of the
                        // worker count; released on every outcome.
                        let Ok(_permit) = limiter.acquire().await else {
                            break;
                        };

                        let peer = task.peer;
                        debug!(worker = id, %peer, "Servicing client");

                        match service_client(task.stream, peer, &ctx).await {
                            Ok(()) => {}
                            Err(ProxyError::ConnectionClosed) => {
                                debug!(%peer, "Client went away mid-request");
                            }
                            Err(e) => {
                                error!("Client error from {}: {}", peer, e);
                            }
                        }
                    }

                    debug!(worker = id, "Worker exiting");
                })
            })
            .collect();

        info!(workers = worker_count, queue_capacity, "Worker pool started");

        Self {
            queue_tx,
            queue_rx,
            workers: std::sync::Mutex::new(workers),
            shutdown,
        }
    }

    /// FIFO enqueue. Refused when the queue is full or the pool has shut
    /// down; the task comes back so the caller can close its socket.
    pub fn submit(&self, task: Task) -> SubmitOutcome {
        if self.shutdown.is_cancelled() {
            return SubmitOutcome::Rejected(task);
        }

        match self.queue_tx.try_send(task) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => {
                SubmitOutcome::Rejected(task)
            }
        }
    }

    /// Tasks currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Wake every worker, wait for each to finish its current task, then
    /// close whatever was still queued.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let workers = {
            let mut guard = self.workers.lock().expect("worker handle mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Worker task failed during shutdown: {}", e);
            }
        }

        let mut rx = self.queue_rx.lock().await;
        rx.close();
        let mut drained = 0;
        while let Ok(task) = rx.try_recv() {
            drop(task);
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "Closed queued client sockets on shutdown");
        }
    }
}
