//! Model runner - device-scoped model loading and the batched inference loop
//!
//! Workers are plain blocking threads, one per GPU or one per requested CPU
//! worker. A dispatcher pulls patches lazily from the [`Tiler`], groups them
//! into batches and hands batch `i` to worker `i mod W` through bounded
//! queues. A single aggregator (the calling thread) applies the outputs to the
//! [`Accumulator`] strictly in batch order, so results do not depend on which
//! worker finished first.

pub mod backend;
pub mod device;

pub use backend::{Backend, ClassWeights, Network, VoxelLinearBackend, VoxelLinearWeights};
pub use device::{DeviceAssignment, DevicePool, Reservation};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use crate::core::config::PipelineConfig;
use crate::core::error::{Result, SegError};
use crate::core::types::DeviceId;
use crate::hub::WeightsBlob;
use crate::patch::{Accumulator, Patch, PatchOutput, Tiler};
use crate::task::{DeviceAffinity, ModelSpec};

/// A network resident on one device, holding its weight memory
pub struct ModelHandle<N: Network> {
    spec: Arc<ModelSpec>,
    device: DeviceId,
    network: N,
    pool: Arc<DevicePool>,
    max_batch: usize,
    _weights: Reservation,
}

impl<N: Network> std::fmt::Debug for ModelHandle<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model", &self.spec.name)
            .field("device", &self.device)
            .field("max_batch", &self.max_batch)
            .finish()
    }
}

impl<N: Network> ModelHandle<N> {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Largest batch the device budget allows for each worker on this device
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Run one batch; activation memory is held only for the duration of the call
    pub fn infer(&self, batch: &[Patch]) -> Result<Vec<PatchOutput>> {
        let bytes = batch.len() as u64 * self.spec.patch_bytes();
        let _activations = self.pool.reserve(self.device, bytes, batch.len())?;

        let outputs = self.network.forward(batch)?;
        if outputs.len() != batch.len() {
            return Err(SegError::Inference {
                device: self.device,
                message: format!(
                    "network returned {} outputs for a batch of {}",
                    outputs.len(),
                    batch.len()
                ),
            });
        }
        batch
            .iter()
            .zip(outputs)
            .map(|(patch, data)| PatchOutput::for_patch(patch, self.spec.output_channels(), data))
            .collect()
    }
}

/// A model loaded on every device of an assignment
#[derive(Debug)]
pub struct LoadedModel<N: Network> {
    handles: Vec<ModelHandle<N>>,
    /// Handle index used by each worker
    workers: Vec<usize>,
    batch_size: usize,
}

impl<N: Network> LoadedModel<N> {
    pub fn handles(&self) -> &[ModelHandle<N>] {
        &self.handles
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Batch size shared by all workers
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Counters of one tiled inference pass
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct InferenceStats {
    pub patches: usize,
    pub batches: usize,
    pub batch_size: usize,
    /// Patches processed per device
    pub per_device: Vec<(DeviceId, usize)>,
}

/// Loads models onto devices and drives batches through them
pub struct ModelRunner<'a, B: Backend> {
    backend: &'a B,
    pool: Arc<DevicePool>,
    config: &'a PipelineConfig,
}

impl<'a, B: Backend> ModelRunner<'a, B> {
    pub fn new(backend: &'a B, pool: Arc<DevicePool>, config: &'a PipelineConfig) -> Self {
        Self {
            backend,
            pool,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }

    /// Load `spec` on every device of `assignment`
    ///
    /// GPUs each get their own copy of the weights. CPU workers share one
    /// copy. Dropping the returned model releases all device memory.
    pub fn load(
        &self,
        weights: &WeightsBlob,
        spec: Arc<ModelSpec>,
        assignment: &DeviceAssignment,
    ) -> Result<LoadedModel<B::Network>> {
        match (spec.device_affinity, assignment.is_cpu_only()) {
            (DeviceAffinity::PreferGpu, true) => {
                tracing::warn!(model = %spec.name, "Model prefers a GPU but only CPU workers are assigned")
            }
            (DeviceAffinity::PreferCpu, false) => {
                tracing::warn!(model = %spec.name, "Model prefers CPU but GPUs are assigned")
            }
            _ => {}
        }

        let per_device_workers = assignment.workers_per_device();
        let mut handles = Vec::new();
        let mut workers = Vec::new();

        for device in assignment.devices() {
            let network = self.backend.load(weights, &spec, device)?;
            let reservation = self.pool.reserve(device, network.weights_bytes(), 0)?;

            let per_patch = spec.patch_bytes().max(1);
            let budget = self.pool.available(device) / per_device_workers as u64;
            let max_batch = ((budget / per_patch) as usize).min(self.config.max_batch_size);
            if max_batch == 0 {
                return Err(SegError::ResourceExhaustion {
                    device,
                    batch_size: 1,
                    required_bytes: per_patch * per_device_workers as u64,
                    available_bytes: self.pool.available(device),
                });
            }

            tracing::info!(
                model = %spec.name,
                %device,
                weights_bytes = network.weights_bytes(),
                max_batch,
                workers = per_device_workers,
                "Model loaded"
            );

            let index = handles.len();
            handles.push(ModelHandle {
                spec: Arc::clone(&spec),
                device,
                network,
                pool: Arc::clone(&self.pool),
                max_batch,
                _weights: reservation,
            });
            workers.extend(std::iter::repeat(index).take(per_device_workers));
        }

        let batch_size = handles.iter().map(|h| h.max_batch).min().unwrap_or(1);
        Ok(LoadedModel {
            handles,
            workers,
            batch_size,
        })
    }

    /// Infer every patch of `tiler` and accumulate the outputs
    ///
    /// The first failing batch stops the pass; its error is returned and the
    /// accumulator must be discarded.
    pub fn run_tiles(
        &self,
        model: &LoadedModel<B::Network>,
        tiler: Tiler<'_>,
        accumulator: &mut Accumulator,
    ) -> Result<InferenceStats> {
        let batch_size = model.batch_size;
        let worker_count = model.workers.len();
        let queue_depth = self.config.queue_depth.max(1);
        let abort = AtomicBool::new(false);

        let mut stats = InferenceStats {
            batch_size,
            per_device: model.handles.iter().map(|h| (h.device, 0)).collect(),
            ..InferenceStats::default()
        };
        let mut failure: Option<SegError> = None;

        std::thread::scope(|scope| {
            let (result_tx, result_rx) =
                mpsc::sync_channel::<Result<(usize, usize, Vec<PatchOutput>)>>(worker_count * queue_depth);

            let mut batch_txs = Vec::with_capacity(worker_count);
            for &handle_index in &model.workers {
                let (batch_tx, batch_rx) = mpsc::sync_channel::<(usize, Vec<Patch>)>(queue_depth);
                batch_txs.push(batch_tx);
                let handle = &model.handles[handle_index];
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for (seq, batch) in batch_rx {
                        let result = handle.infer(&batch).map(|outs| (seq, handle_index, outs));
                        let failed = result.is_err();
                        if result_tx.send(result).is_err() || failed {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            let abort = &abort;
            scope.spawn(move || {
                let mut tiler = tiler;
                let mut seq = 0usize;
                while !abort.load(Ordering::Relaxed) {
                    let batch: Vec<Patch> = tiler.by_ref().take(batch_size).collect();
                    if batch.is_empty() {
                        break;
                    }
                    if batch_txs[seq % worker_count].send((seq, batch)).is_err() {
                        break;
                    }
                    seq += 1;
                }
            });

            let mut pending: BTreeMap<usize, (usize, Vec<PatchOutput>)> = BTreeMap::new();
            let mut next = 0usize;
            'results: for result in result_rx.iter() {
                match result {
                    Ok((seq, handle_index, outputs)) => {
                        pending.insert(seq, (handle_index, outputs));
                        while let Some((handle_index, outputs)) = pending.remove(&next) {
                            for output in &outputs {
                                if let Err(e) = accumulator.accumulate(output) {
                                    failure = Some(e);
                                    abort.store(true, Ordering::Relaxed);
                                    break 'results;
                                }
                            }
                            stats.patches += outputs.len();
                            stats.per_device[handle_index].1 += outputs.len();
                            stats.batches += 1;
                            next += 1;
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        abort.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
            // Unblocks workers still trying to hand in results
            drop(result_rx);
        });

        if let Some(e) = failure {
            tracing::error!(error = %e, "Inference pass failed");
            return Err(e);
        }
        tracing::debug!(
            patches = stats.patches,
            batches = stats.batches,
            batch_size,
            "Inference pass complete"
        );
        Ok(stats)
    }
}
