use crate::batch::{SampleBatch, SourceId};
use crate::error::MonitorError;
use crate::monitor::{GenerateReport, HealthMonitor};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Reply = oneshot::Sender<Result<GenerateReport, MonitorError>>;

#[derive(Debug)]
pub enum BatchCommand {
    Batch {
        batch: SampleBatch,
        reply: Option<Reply>,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
pub struct MonitorStats {
    pub queue_depth: AtomicU64,
    pub batches_processed: AtomicU64,
    pub malformed_batches: AtomicU64,
    pub alarms_committed: AtomicU64,
    pub duplicate_alarms: AtomicU64,
    pub storage_failures: AtomicU64,
    pub last_batch_unix_ms: AtomicU64,
    pub average_batch_micros: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl MonitorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn record_alarm(&self) {
        self.alarms_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_alarms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_failure(&self, reason: &str) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(reason);
    }

    pub fn record_malformed(&self, reason: impl Into<String>) {
        self.malformed_batches.fetch_add(1, Ordering::Relaxed);
        self.record_error(reason);
    }

    pub fn record_batch(&self, started: Instant) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_batch_unix_ms.store(now, Ordering::Relaxed);
        let micros = started.elapsed().as_micros() as u64;
        let prev = self.average_batch_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
        self.average_batch_micros.store(avg, Ordering::Relaxed);
    }
}

struct Worker {
    tx: mpsc::Sender<BatchCommand>,
    task: JoinHandle<()>,
}

struct PipelineInner {
    monitor: Arc<HealthMonitor>,
    max_queue: usize,
    workers: Mutex<HashMap<SourceId, Worker>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<PipelineInner>,
}

impl PipelineHandle {
    pub fn new(monitor: Arc<HealthMonitor>, max_queue: usize) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                monitor,
                max_queue: max_queue.max(1),
                workers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.inner.monitor
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.inner.monitor.stats()
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<SourceId, Worker>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sender_for(&self, source_id: &SourceId) -> Result<mpsc::Sender<BatchCommand>, MonitorError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MonitorError::ShutDown);
        }
        if !self.inner.monitor.is_registered(source_id) {
            return Err(MonitorError::UnknownSource(source_id.clone()));
        }
        let mut workers = self.workers();
        // `close` flips the flag before draining; re-check so no worker outlives it.
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MonitorError::ShutDown);
        }
        let worker = workers.entry(source_id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.inner.max_queue);
            tracing::debug!(source = %source_id, "starting source worker");
            let task = spawn_worker(
                source_id.clone(),
                self.inner.monitor.clone(),
                rx,
                self.stats(),
            );
            Worker { tx, task }
        });
        Ok(worker.tx.clone())
    }

    async fn send(&self, batch: SampleBatch, reply: Option<Reply>) -> Result<(), MonitorError> {
        let tx = self.sender_for(&batch.source_id)?;
        let stats = self.stats();
        let queue_depth = stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(
            queue_depth,
            source = %batch.source_id,
            samples = batch.sample_count(),
            "queued batch"
        );
        if tx.send(BatchCommand::Batch { batch, reply }).await.is_err() {
            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(MonitorError::ShutDown);
        }
        Ok(())
    }

    pub async fn enqueue(&self, batch: SampleBatch) -> Result<(), MonitorError> {
        self.send(batch, None).await
    }

    pub async fn submit(&self, batch: SampleBatch) -> Result<GenerateReport, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.send(batch, Some(tx)).await?;
        rx.await.map_err(|_| MonitorError::ShutDown)?
    }

    pub async fn flush(&self) -> Result<(), MonitorError> {
        let senders: Vec<mpsc::Sender<BatchCommand>> =
            self.workers().values().map(|worker| worker.tx.clone()).collect();
        for tx in senders {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(BatchCommand::Flush(done_tx)).await.is_ok() {
                let _ = done_rx.await;
            }
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers().len()
    }

    /// Stops the source's worker after it drains what is already queued.
    pub async fn release(&self, source_id: &SourceId) -> bool {
        let Some(worker) = self.workers().remove(source_id) else {
            return false;
        };
        drop(worker.tx);
        if let Err(err) = worker.task.await {
            tracing::error!(source = %source_id, error = %err, "source worker panicked");
            self.stats().record_error(format!("worker {source_id}: {err}"));
        }
        tracing::debug!(source = %source_id, "released source worker");
        true
    }

    pub async fn deregister_source(&self, source_id: &SourceId) -> bool {
        self.release(source_id).await;
        self.inner.monitor.deregister_source(source_id)
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("pipeline already closed");
            return;
        }
        let workers: Vec<(SourceId, Worker)> = self.workers().drain().collect();
        tracing::info!(workers = workers.len(), "closing pipeline");
        for (source_id, worker) in workers {
            drop(worker.tx);
            if let Err(err) = worker.task.await {
                tracing::error!(source = %source_id, error = %err, "source worker panicked");
                self.stats().record_error(format!("worker {source_id}: {err}"));
            }
        }
        tracing::info!("pipeline closed");
    }
}

fn spawn_worker(
    source_id: SourceId,
    monitor: Arc<HealthMonitor>,
    mut rx: mpsc::Receiver<BatchCommand>,
    stats: Arc<MonitorStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                BatchCommand::Batch { batch, reply } => {
                    stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    let result = monitor.process_batch(batch).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(err) = result {
                                tracing::warn!(source = %source_id, error = %err, "queued batch failed");
                            }
                        }
                    }
                }
                BatchCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(source = %source_id, "source worker stopped");
    })
}
