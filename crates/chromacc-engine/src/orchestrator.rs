//! Batch orchestration: admission, fan-out, fan-in, teardown.
//!
//! A submission validates everything it can up front, then atomically
//! claims the single batch slot and hands the work to a background
//! thread. That thread owns a dedicated rayon pool for the batch; workers
//! report start and finish events over a channel and the fan-in loop
//! applies them in completion order. Each item's deadline is anchored at
//! its own execution start, so time spent waiting in the queue behind a
//! slow item never counts against it. The pool is torn down and the batch
//! marked complete on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{error, info, warn};
use uuid::Uuid;

use chromacc_core::decoders::{self, ImageBuf, StageImages};
use chromacc_core::models::{CorrectionMethod, Stage};
use chromacc_core::pipeline::{PipelineFactory, RunConfig, StageFlags, StageMetrics};

use crate::batch::{BatchState, ItemStatus};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{self, ItemOutcome, WorkItem};
use crate::registry::SessionRegistry;
use crate::workers::{self, BULK_WORKER_CAP};

/// A bulk correction request.
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    /// Indices into the registry's image list; `None` means all.
    pub indices: Option<Vec<usize>>,
    pub stages: StageFlags,
    /// Correction method name (`pls`, `nn`, `linear`, `svm`, `conventional`).
    pub method: String,
    /// Caller override for the worker count; clamped by policy.
    pub workers: Option<usize>,
}

/// Receipt for an admitted batch. The work runs on a background thread;
/// progress is observed through [`BatchState::snapshot`].
#[derive(Debug)]
pub struct BatchTicket {
    pub batch_id: String,
    pub total: usize,
    pub workers: usize,
    handle: Option<JoinHandle<()>>,
}

impl BatchTicket {
    /// Block until the background thread finishes. Pollers do not need
    /// this; it exists for callers that want synchronous completion.
    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Result of a synchronous single-image run.
#[derive(Debug)]
pub struct SingleRunSummary {
    pub filename: String,
    pub metrics: StageMetrics,
    pub images: StageImages,
    pub final_stage: Option<Stage>,
    pub warning: Option<String>,
}

/// Marks the batch complete on drop, so the admission slot is released
/// even if the fan-in loop exits abnormally.
struct CompletionGuard {
    state: Arc<BatchState>,
    batch_id: String,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.state.mark_complete();
        let snap = self.state.snapshot();
        info!(
            batch_id = %self.batch_id,
            completed = snap.completed,
            failed = snap.failed,
            total = snap.total,
            "Batch finished"
        );
    }
}

/// Drives batches over a [`SessionRegistry`] and a [`BatchState`].
pub struct BatchOrchestrator {
    registry: Arc<SessionRegistry>,
    state: Arc<BatchState>,
    factory: Arc<dyn PipelineFactory>,
    config: EngineConfig,
}

fn new_batch_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("batch_{}", &uuid[..12])
}

impl BatchOrchestrator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn PipelineFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            state: Arc::new(BatchState::new()),
            factory,
            config,
        }
    }

    pub fn state(&self) -> Arc<BatchState> {
        Arc::clone(&self.state)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Resolve requested indices against the registry. Out-of-range
    /// indices are logged and skipped; the request fails only when no
    /// valid item remains.
    fn resolve_items(&self, requested: Option<&[usize]>) -> Result<Vec<WorkItem>, EngineError> {
        let images = self.registry.images();
        if images.is_empty() {
            return Err(EngineError::NoImages);
        }

        let indices: Vec<usize> = match requested {
            Some(list) => list.to_vec(),
            None => (0..images.len()).collect(),
        };

        let mut items = Vec::with_capacity(indices.len());
        for index in indices {
            match images.get(index) {
                Some(record) => items.push(WorkItem {
                    index,
                    path: record.path.clone(),
                    filename: record.filename.clone(),
                }),
                None => warn!(index, "Skipping out-of-range image index"),
            }
        }
        if items.is_empty() {
            return Err(EngineError::NoValidIndices);
        }
        Ok(items)
    }

    fn load_white(&self) -> Option<ImageBuf> {
        let record = self.registry.white_image()?;
        match decoders::load_image(&record.path) {
            Ok(image) => Some(image),
            Err(e) => {
                warn!(filename = %record.filename, error = %e, "White reference unusable, continuing without it");
                None
            }
        }
    }

    /// Submit a bulk correction batch.
    ///
    /// Validation happens before admission, so a rejected request leaves
    /// any running batch untouched and starts nothing. On success the
    /// batch slot is claimed atomically and a background thread takes
    /// over; the returned ticket identifies the batch.
    pub fn submit(&self, request: BatchRequest) -> Result<BatchTicket, EngineError> {
        let method = CorrectionMethod::from_name(&request.method)
            .ok_or_else(|| EngineError::InvalidMethod(request.method.clone()))?;
        if !request.stages.any() {
            return Err(EngineError::InvalidSettings(
                "At least one correction stage must be enabled".to_string(),
            ));
        }
        let items = self.resolve_items(request.indices.as_deref())?;

        let workers = workers::compute_workers_for_host(
            items.len(),
            self.config.has_gpu,
            request.workers,
            BULK_WORKER_CAP,
        );
        let run_config = RunConfig::new(request.stages, method, self.registry.settings());

        let batch_id = new_batch_id();
        let pairs: Vec<(usize, String)> = items
            .iter()
            .map(|item| (item.index, item.filename.clone()))
            .collect();
        self.state
            .try_begin(&batch_id, &pairs)
            .map_err(|running| EngineError::BatchActive { batch_id: running })?;

        info!(
            batch_id = %batch_id,
            items = items.len(),
            workers,
            method = %request.method,
            "Starting batch"
        );

        let state = Arc::clone(&self.state);
        let factory = Arc::clone(&self.factory);
        let white_record = self.registry.white_image();
        let item_timeout = self.config.item_timeout;
        let total = items.len();
        let id = batch_id.clone();

        let handle = std::thread::Builder::new()
            .name("chromacc-batch".to_string())
            .spawn(move || {
                let white = white_record.and_then(|record| {
                    match decoders::load_image(&record.path) {
                        Ok(image) => Some(Arc::new(image)),
                        Err(e) => {
                            warn!(filename = %record.filename, error = %e, "White reference unusable, continuing without it");
                            None
                        }
                    }
                });
                let run_config = Arc::new(run_config);
                let exec: Arc<dyn Fn(&WorkItem) -> ItemOutcome + Send + Sync> =
                    Arc::new(move |item| {
                        executor::execute_item(item, &factory, white.as_deref(), &run_config)
                    });
                run_batch(state, id, items, workers, item_timeout, exec);
            })
            .map_err(|e| EngineError::PoolBuild(e.to_string()))?;

        Ok(BatchTicket {
            batch_id,
            total,
            workers,
            handle: Some(handle),
        })
    }

    /// Run the pipeline synchronously on one image with full diagnostics.
    ///
    /// On success with color correction enabled the trained instance is
    /// stored in the registry for inference-only reuse.
    pub fn run_single(
        &self,
        index: usize,
        stages: StageFlags,
        method: &str,
    ) -> Result<SingleRunSummary, EngineError> {
        let method = CorrectionMethod::from_name(method)
            .ok_or_else(|| EngineError::InvalidMethod(method.to_string()))?;
        let record = self
            .registry
            .image(index)
            .ok_or(EngineError::InvalidIndex(index))?;

        let image = decoders::load_image(&record.path).map_err(EngineError::Processing)?;
        let white = self.load_white();
        let config = RunConfig::new(stages, method, self.registry.settings());

        let name = record
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| record.filename.clone());

        let mut pipeline = self.factory.create();
        let output = pipeline
            .run(&image, white.as_ref(), &name, &config)
            .map_err(EngineError::Processing)?;

        if stages.cc && pipeline.has_trained_model() {
            self.registry.set_model(Arc::new(Mutex::new(pipeline)));
            info!(filename = %record.filename, "Stored trained model for reuse");
        }

        let final_stage = output.final_corrected().map(|(stage, _)| stage);
        Ok(SingleRunSummary {
            filename: record.filename,
            metrics: output.metrics,
            images: output.images,
            final_stage,
            warning: output.warning,
        })
    }

    /// Apply the stored trained model to many images without refitting.
    ///
    /// The shared instance serializes inference behind its mutex, so the
    /// pool stays small: two workers by default, caller override capped
    /// at eight.
    pub fn apply_model(
        &self,
        indices: Option<Vec<usize>>,
        workers_override: Option<usize>,
    ) -> Result<BatchTicket, EngineError> {
        if !self.registry.has_trained_model() {
            return Err(EngineError::NoTrainedModel);
        }
        let model = self.registry.model().ok_or(EngineError::NoTrainedModel)?;
        let items = self.resolve_items(indices.as_deref())?;

        let workers = workers::shared_model_workers_for_host(
            items.len(),
            self.config.has_gpu,
            workers_override,
        );

        let batch_id = new_batch_id();
        let pairs: Vec<(usize, String)> = items
            .iter()
            .map(|item| (item.index, item.filename.clone()))
            .collect();
        self.state
            .try_begin(&batch_id, &pairs)
            .map_err(|running| EngineError::BatchActive { batch_id: running })?;

        info!(batch_id = %batch_id, items = items.len(), workers, "Applying stored model");

        let state = Arc::clone(&self.state);
        let item_timeout = self.config.item_timeout;
        let total = items.len();
        let id = batch_id.clone();

        let handle = std::thread::Builder::new()
            .name("chromacc-apply".to_string())
            .spawn(move || {
                let exec: Arc<dyn Fn(&WorkItem) -> ItemOutcome + Send + Sync> =
                    Arc::new(move |item| executor::execute_inference_item(item, &model));
                run_batch(state, id, items, workers, item_timeout, exec);
            })
            .map_err(|e| EngineError::PoolBuild(e.to_string()))?;

        Ok(BatchTicket {
            batch_id,
            total,
            workers,
            handle: Some(handle),
        })
    }
}

fn build_pool(workers: usize) -> Result<ThreadPool, String> {
    ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("chromacc-worker-{i}"))
        .panic_handler(|_| error!("Worker thread panicked"))
        .build()
        .map_err(|e| e.to_string())
}

/// What a worker reports back to the fan-in loop.
enum WorkerEvent {
    /// Execution began; the item's deadline is anchored here.
    Started { index: usize, at: Instant },
    Finished(ItemOutcome),
}

/// Fan the items out over a dedicated pool and fold outcomes back in
/// completion order. An item's deadline starts when a worker picks it
/// up, not when it was queued, so one slow item cannot eat the budget of
/// items waiting behind it.
fn run_batch(
    state: Arc<BatchState>,
    batch_id: String,
    items: Vec<WorkItem>,
    workers: usize,
    item_timeout: Duration,
    exec: Arc<dyn Fn(&WorkItem) -> ItemOutcome + Send + Sync>,
) {
    let _guard = CompletionGuard {
        state: Arc::clone(&state),
        batch_id,
    };

    let pool = match build_pool(workers) {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "Failed to build worker pool");
            let message = format!("Worker pool unavailable: {e}");
            for item in &items {
                state.update_status(item.index, ItemStatus::Failed, Some(message.clone()));
            }
            return;
        }
    };

    let (tx, rx) = crossbeam_channel::unbounded::<WorkerEvent>();
    // None until the worker reports Started
    let mut pending: HashMap<usize, Option<Instant>> = HashMap::new();

    for item in items {
        state.update_status(item.index, ItemStatus::Queued, None);
        pending.insert(item.index, None);

        let tx = tx.clone();
        let exec = Arc::clone(&exec);
        pool.spawn(move || {
            let _ = tx.send(WorkerEvent::Started {
                index: item.index,
                at: Instant::now(),
            });
            let outcome = exec(&item);
            // The fan-in side may have given up on this item already
            let _ = tx.send(WorkerEvent::Finished(outcome));
        });
    }
    drop(tx);

    while !pending.is_empty() {
        // Wait no longer than the earliest deadline among started items;
        // unstarted items have no clock running yet
        let earliest = pending.values().filter_map(|deadline| *deadline).min();
        let event = match earliest {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match event {
            Ok(WorkerEvent::Started { index, at }) => {
                if let Some(slot) = pending.get_mut(&index) {
                    *slot = Some(at + item_timeout);
                }
            }
            Ok(WorkerEvent::Finished(outcome)) => {
                if pending.remove(&outcome.index).is_none() {
                    info!(
                        index = outcome.index,
                        filename = %outcome.filename,
                        "Discarding late result for an item already marked failed"
                    );
                    continue;
                }
                match outcome.outcome {
                    Ok(result) => {
                        state.add_result(result);
                        state.update_status(outcome.index, ItemStatus::Completed, None);
                    }
                    Err(message) => {
                        warn!(index = outcome.index, filename = %outcome.filename, error = %message, "Item failed");
                        state.update_status(outcome.index, ItemStatus::Failed, Some(message));
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                let expired: Vec<usize> = pending
                    .iter()
                    .filter(|(_, deadline)| matches!(deadline, Some(d) if *d <= now))
                    .map(|(&index, _)| index)
                    .collect();
                for index in expired {
                    pending.remove(&index);
                    warn!(index, "Item exceeded its deadline");
                    state.update_status(
                        index,
                        ItemStatus::Failed,
                        Some(format!("Processing timed out after {item_timeout:?}")),
                    );
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Every worker is gone; whatever is still pending will
                // never report
                for (index, _) in pending.drain() {
                    state.update_status(
                        index,
                        ItemStatus::Failed,
                        Some("Worker exited without reporting a result".to_string()),
                    );
                }
            }
        }
    }

    // Blocks until in-flight workers return, so resources tied to the
    // batch are released before the admission slot reopens
    drop(pool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_shape() {
        let id = new_batch_id();
        assert!(id.starts_with("batch_"));
        assert_eq!(id.len(), "batch_".len() + 12);
        assert_ne!(id, new_batch_id());
    }
}
