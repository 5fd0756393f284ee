use crate::coordinator::{CaptureResult, RequestCoordinator};
use crate::error::{ClassifiedError, RenderError};
use crate::job::RenderJob;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One finished job, tagged with its position in the submitted batch
#[derive(Debug)]
pub struct BatchItem {
    pub index: usize,
    pub job_id: String,
    pub result: Result<CaptureResult, ClassifiedError>,
}

type Queue = Arc<Mutex<mpsc::Receiver<(usize, RenderJob)>>>;

#[derive(Clone)]
pub struct RenderWorker {
    id: usize,
    coordinator: Arc<RequestCoordinator>,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl RenderWorker {
    pub fn new(id: usize, coordinator: Arc<RequestCoordinator>) -> Self {
        Self {
            id,
            coordinator,
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn run_with_shared_receiver(
        &self,
        requests: Queue,
        results: mpsc::Sender<BatchItem>,
    ) {
        debug!("Starting render worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        loop {
            let next = {
                let mut receiver = requests.lock().await;
                receiver.recv().await
            };
            let Some((index, job)) = next else { break };

            let job_id = job.id.clone();
            let result = self.coordinator.execute(job).await;
            match &result {
                Ok(_) => {
                    self.processed_count.fetch_add(1, Ordering::Relaxed);
                    debug!("Worker {} finished job {}", self.id, job_id);
                }
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!("Worker {} failed job {}: {}", self.id, job_id, e);
                }
            }

            if let Err(e) = results.send(BatchItem { index, job_id, result }).await {
                error!("Worker {} failed to send result: {}", self.id, e);
                break;
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        debug!("Render worker {} stopped", self.id);
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

/// Fixed set of workers pulling from one shared queue
pub struct WorkerPool {
    workers: Vec<RenderWorker>,
    handles: Vec<JoinHandle<()>>,
    request_sender: Option<mpsc::Sender<(usize, RenderJob)>>,
    result_receiver: mpsc::Receiver<BatchItem>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers (at least one). Needs a tokio runtime.
    pub fn new(coordinator: Arc<RequestCoordinator>, concurrency: usize) -> Self {
        let worker_count = concurrency.max(1);
        let (request_sender, request_receiver) = mpsc::channel(worker_count * 2);
        let (result_sender, result_receiver) = mpsc::channel(worker_count * 2);
        let shared_receiver = Arc::new(Mutex::new(request_receiver));

        let workers: Vec<RenderWorker> = (0..worker_count)
            .map(|id| RenderWorker::new(id, coordinator.clone()))
            .collect();

        let handles = workers
            .iter()
            .map(|worker| {
                let worker = worker.clone();
                let rx = shared_receiver.clone();
                let tx = result_sender.clone();
                tokio::spawn(async move { worker.run_with_shared_receiver(rx, tx).await })
            })
            .collect();

        Self {
            workers,
            handles,
            request_sender: Some(request_sender),
            result_receiver,
        }
    }

    pub async fn submit(&self, index: usize, job: RenderJob) -> Result<(), RenderError> {
        let sender = self
            .request_sender
            .as_ref()
            .ok_or_else(|| RenderError::Engine("worker pool is closed".to_string()))?;
        sender
            .send((index, job))
            .await
            .map_err(|e| RenderError::Engine(format!("worker pool queue closed: {e}")))
    }

    /// Stop accepting jobs; workers exit once the queue drains
    pub fn close(&mut self) {
        self.request_sender = None;
    }

    pub async fn next_result(&mut self) -> Option<BatchItem> {
        self.result_receiver.recv().await
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.stats()).collect()
    }

    pub fn total_processed(&self) -> usize {
        self.workers.iter().map(|w| w.stats().processed_count).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.workers.iter().map(|w| w.stats().error_count).sum()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Run a batch through a fresh pool and return results in submission order
pub async fn process_batch(
    coordinator: Arc<RequestCoordinator>,
    jobs: Vec<RenderJob>,
    concurrency: usize,
) -> Vec<BatchItem> {
    let total = jobs.len();
    let mut pool = WorkerPool::new(coordinator, concurrency);
    info!(
        "Processing batch of {} jobs with {} workers",
        total,
        pool.workers.len()
    );

    // Feed from a separate task so a full queue never blocks draining results.
    let feeder = pool.request_sender.take().map(|sender| {
        tokio::spawn(async move {
            for (index, job) in jobs.into_iter().enumerate() {
                if sender.send((index, job)).await.is_err() {
                    error!("Worker pool queue closed after {} jobs", index);
                    break;
                }
            }
        })
    });

    let mut results = Vec::with_capacity(total);
    while let Some(item) = pool.next_result().await {
        results.push(item);
    }

    if let Some(feeder) = feeder {
        if let Err(e) = feeder.await {
            error!("Batch feeder task failed: {}", e);
        }
    }
    if results.len() < total {
        warn!("Batch ended with {} of {} results", results.len(), total);
    }
    info!(
        "Batch complete: {} succeeded, {} failed",
        pool.total_processed(),
        pool.total_errors()
    );

    results.sort_by_key(|item| item.index);
    results
}
