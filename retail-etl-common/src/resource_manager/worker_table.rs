use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Error;

use super::ProvisionedWorkerStatus;

const DEFAULT_LOG_CAPACITY: usize = 500;

/// Line buffer that keeps only the most recent `capacity` lines.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn tail(&self, n: Option<usize>) -> Vec<String> {
        let len = self.lines.len();
        let start = n.map(|n| len.saturating_sub(n)).unwrap_or(0);
        self.lines.iter().skip(start).cloned().collect()
    }
}

pub type SharedLogBuffer = Arc<Mutex<LogBuffer>>;

#[derive(Debug)]
struct TrackedWorker {
    status_rx: watch::Receiver<ProvisionedWorkerStatus>,

    // Sender to signal the monitoring task to attempt cancellation.
    cancel_signal_tx: Option<oneshot::Sender<()>>,

    monitor_handle: Option<JoinHandle<()>>,
    log_buffer: SharedLogBuffer,
}

/// Bookkeeping shared by execution managers for the workers they started.
#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: Mutex<HashMap<Uuid, TrackedWorker>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(
        &self,
        worker_id: Uuid,
        status_rx: watch::Receiver<ProvisionedWorkerStatus>,
        cancel_signal_tx: oneshot::Sender<()>,
        monitor_handle: JoinHandle<()>,
        log_buffer: SharedLogBuffer,
    ) {
        self.workers.lock().await.insert(
            worker_id,
            TrackedWorker {
                status_rx,
                cancel_signal_tx: Some(cancel_signal_tx),
                monitor_handle: Some(monitor_handle),
                log_buffer,
            },
        );
    }

    fn not_found(worker_id: Uuid, op: &str) -> Error {
        Error::Internal(format!("Worker {worker_id} not found for {op}."))
    }

    pub async fn status(&self, worker_id: Uuid) -> Result<ProvisionedWorkerStatus, Error> {
        let workers = self.workers.lock().await;
        let worker = workers
            .get(&worker_id)
            .ok_or_else(|| Self::not_found(worker_id, "get_status"))?;

        Ok(worker.status_rx.borrow().clone())
    }

    pub async fn wait(&self, worker_id: Uuid) -> Result<ProvisionedWorkerStatus, Error> {
        // Clone the receiver so the table lock is not held while waiting.
        let mut status_rx = {
            let workers = self.workers.lock().await;
            workers
                .get(&worker_id)
                .ok_or_else(|| Self::not_found(worker_id, "wait"))?
                .status_rx
                .clone()
        };

        let outcome = status_rx
            .wait_for(|status| status.is_terminal())
            .await
            .map(|status| status.clone());

        match outcome {
            Ok(status) => Ok(status),
            Err(_) => {
                let last = status_rx.borrow().clone();
                if last.is_terminal() {
                    Ok(last)
                } else {
                    Ok(ProvisionedWorkerStatus::ErrorState(
                        "Monitor task exited without reporting a final status".to_string(),
                    ))
                }
            }
        }
    }

    pub async fn logs(&self, worker_id: Uuid, tail_lines: Option<usize>) -> Result<Vec<String>, Error> {
        let log_buffer = {
            let workers = self.workers.lock().await;
            workers
                .get(&worker_id)
                .ok_or_else(|| Self::not_found(worker_id, "fetch_logs"))?
                .log_buffer
                .clone()
        };

        Ok(log_buffer.lock().await.tail(tail_lines))
    }

    pub async fn cancel(&self, worker_id: Uuid) -> Result<(), Error> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .get_mut(&worker_id)
            .ok_or_else(|| Self::not_found(worker_id, "cancellation"))?;

        match worker.cancel_signal_tx.take() {
            Some(cancel_tx) => {
                if cancel_tx.send(()).is_err() {
                    // Monitor already finished and dropped its receiver.
                    warn!(
                        "Worker {}: cancel signal not delivered, monitor already exited.",
                        worker_id
                    );
                } else {
                    info!("Worker {}: cancellation signal sent to monitor.", worker_id);
                }
            }
            None => {
                info!(
                    "Worker {}: already terminating or completed, no cancel signal sent.",
                    worker_id
                );
            }
        }

        Ok(())
    }

    /// Cancels the worker if it is still running, waits briefly for the
    /// monitor to settle and stops tracking it.
    pub async fn teardown(&self, worker_id: Uuid, grace: Duration) -> Result<(), Error> {
        let still_running = !self.status(worker_id).await?.is_terminal();

        if still_running {
            self.cancel(worker_id).await?;
            if timeout(grace, self.wait(worker_id)).await.is_err() {
                warn!(
                    "Worker {}: no final status within {:?} of cancellation.",
                    worker_id, grace
                );
            }
        }

        let removed = self.workers.lock().await.remove(&worker_id);
        if let Some(mut worker) = removed {
            if let Some(handle) = worker.monitor_handle.take() {
                if !handle.is_finished() {
                    handle.abort();
                }
            }
            info!("Worker {} removed from active tracking.", worker_id);
        }

        Ok(())
    }
}
