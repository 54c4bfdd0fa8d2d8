//! Task orchestrator - drives every sub-model of a task and fuses the results
//!
//! Per sub-model: resample to the model grid, normalize, tile, infer,
//! reassemble, take the argmax, map the labels back to the native grid with
//! nearest-neighbour sampling and fuse them into the global label map.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::config::{TaskConfig, TaskEntry};
use crate::core::config::PipelineConfig;
use crate::core::error::{Result, SegError};
use crate::core::types::{DeviceId, LabelId, Shape3, SpeedMode, TaskName, BACKGROUND_LABEL};
use crate::fusion::{argmax, fuse, FusionReport};
use crate::geometry::{resample, unresample};
use crate::hub::{ModelHub, WeightsBlob};
use crate::patch::{tile, Accumulator};
use crate::runner::{Backend, DeviceAssignment, DevicePool, InferenceStats, ModelRunner};
use crate::volume::{LabelMap, Volume};

/// Shared flag to stop a run between sub-models
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress of a task; the index is the sub-model position in the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    Resampling(usize),
    Inferring(usize),
    Reassembling(usize),
    Fusing(usize),
    Done,
}

/// Outcome of one sub-model
#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    pub model: String,
    pub label_offset: LabelId,
    pub model_shape: Shape3,
    pub inference: InferenceStats,
    pub fusion: FusionReport,
}

/// Everything a finished run did
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: Uuid,
    pub task: TaskName,
    pub speed: SpeedMode,
    pub states: Vec<TaskState>,
    pub models: Vec<ModelReport>,
}

impl RunReport {
    pub fn total_conflicts(&self) -> usize {
        self.models.iter().map(|m| m.fusion.conflicts).sum()
    }

    pub fn total_patches(&self) -> usize {
        self.models.iter().map(|m| m.inference.patches).sum()
    }
}

/// Native-grid labels of one sub-model, waiting to be fused
struct SubmodelOutput {
    labels: Volume<LabelId>,
    states: Vec<TaskState>,
    model_shape: Shape3,
    inference: InferenceStats,
}

/// Runs tasks against a backend and a model hub
pub struct Orchestrator<'a, B: Backend, H: ModelHub> {
    backend: &'a B,
    hub: &'a H,
    config: &'a PipelineConfig,
    cancel: CancelToken,
}

impl<'a, B: Backend, H: ModelHub> Orchestrator<'a, B, H> {
    pub fn new(backend: &'a B, hub: &'a H, config: &'a PipelineConfig) -> Self {
        Self {
            backend,
            hub,
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Segment `input` with every sub-model of `task`
    pub fn run(
        &self,
        task: TaskName,
        speed: SpeedMode,
        input: &Volume<f32>,
        assignment: &DeviceAssignment,
    ) -> Result<LabelMap> {
        self.run_with_report(task, speed, input, assignment)
            .map(|(labels, _)| labels)
    }

    pub fn run_with_report(
        &self,
        task: TaskName,
        speed: SpeedMode,
        input: &Volume<f32>,
        assignment: &DeviceAssignment,
    ) -> Result<(LabelMap, RunReport)> {
        let (specs, weights): (Vec<_>, Vec<_>) = self
            .hub
            .resolve(task, speed)?
            .into_iter()
            .map(|m| (m.spec, m.weights))
            .unzip();
        let plan = TaskConfig::new(task, speed, specs)?;
        self.run_plan(&plan, &weights, input, assignment)
    }

    /// Run an explicit plan; `weights[i]` belongs to `plan.entries()[i]`
    pub fn run_plan(
        &self,
        plan: &TaskConfig,
        weights: &[WeightsBlob],
        input: &Volume<f32>,
        assignment: &DeviceAssignment,
    ) -> Result<(LabelMap, RunReport)> {
        self.config.validate()?;
        if weights.len() != plan.len() {
            return Err(SegError::Config(format!(
                "{} weights blobs for {} models",
                weights.len(),
                plan.len()
            )));
        }

        let pool = DevicePool::new(assignment, self.config);
        let runner = ModelRunner::new(self.backend, pool, self.config);
        let mut global = LabelMap::background(input.shape(), *input.geometry())?;
        let mut report = RunReport {
            id: Uuid::new_v4(),
            task: plan.task(),
            speed: plan.speed(),
            states: Vec::new(),
            models: Vec::new(),
        };
        record(&mut report.states, TaskState::Pending);

        tracing::info!(
            run = %report.id,
            task = %plan.task(),
            speed = %plan.speed(),
            models = plan.len(),
            shape = ?input.shape(),
            devices = assignment.worker_count(),
            "Starting segmentation"
        );

        let order = plan.fusion_order();
        for group in order.chunks(self.config.concurrent_submodels.max(1)) {
            if self.cancel.is_cancelled() {
                tracing::warn!(run = %report.id, "Run cancelled");
                return Err(SegError::Cancelled(plan.entries()[group[0]].spec.name.clone()));
            }

            let outputs: Vec<Result<SubmodelOutput>> = if group.len() == 1 {
                let i = group[0];
                vec![self.run_submodel(&runner, i, &plan.entries()[i], &weights[i], input, assignment)]
            } else {
                std::thread::scope(|scope| {
                    let running: Vec<_> = group
                        .iter()
                        .map(|&i| {
                            let runner = &runner;
                            scope.spawn(move || {
                                self.run_submodel(runner, i, &plan.entries()[i], &weights[i], input, assignment)
                            })
                        })
                        .collect();
                    running
                        .into_iter()
                        .map(|handle| {
                            handle.join().unwrap_or_else(|_| {
                                Err(SegError::Inference {
                                    device: assignment.devices().first().copied().unwrap_or(DeviceId::Cpu),
                                    message: "sub-model thread panicked".to_string(),
                                })
                            })
                        })
                        .collect()
                })
            };

            // Fused in priority order whatever order they finished in
            for (&i, output) in group.iter().zip(outputs) {
                let output = output?;
                let entry = &plan.entries()[i];
                report.states.extend(output.states);
                record(&mut report.states, TaskState::Fusing(i));

                let fusion = fuse(
                    &mut global,
                    &output.labels,
                    entry.label_offset,
                    self.config.conflict_policy,
                )?;
                report.models.push(ModelReport {
                    model: entry.spec.name.clone(),
                    label_offset: entry.label_offset,
                    model_shape: output.model_shape,
                    inference: output.inference,
                    fusion,
                });
            }
        }

        record(&mut report.states, TaskState::Done);
        tracing::info!(
            run = %report.id,
            patches = report.total_patches(),
            conflicts = report.total_conflicts(),
            "Segmentation complete"
        );
        Ok((global, report))
    }

    fn run_submodel(
        &self,
        runner: &ModelRunner<'_, B>,
        index: usize,
        entry: &TaskEntry,
        weights: &WeightsBlob,
        input: &Volume<f32>,
        assignment: &DeviceAssignment,
    ) -> Result<SubmodelOutput> {
        let spec = &entry.spec;
        let mut states = Vec::with_capacity(3);

        record(&mut states, TaskState::Resampling(index));
        let (mut resampled, context) = resample(
            input,
            spec.target_spacing,
            None,
            self.config.intensity_background,
        )?;
        spec.normalization.apply(&mut resampled);
        let padding = resampled.data().iter().copied().fold(f32::INFINITY, f32::min);

        record(&mut states, TaskState::Inferring(index));
        let model = runner.load(weights, Arc::clone(spec), assignment)?;
        let tiler = tile(
            &resampled,
            spec.patch_shape,
            spec.stride,
            self.config.blend_mode,
            padding,
        )?;
        tracing::info!(
            model = %spec.name,
            grid = ?context.model_shape(),
            patches = tiler.len(),
            batch_size = model.batch_size(),
            "Inferring"
        );
        let mut accumulator = Accumulator::new(
            resampled.shape(),
            spec.output_channels(),
            *resampled.geometry(),
        );
        let inference = runner.run_tiles(&model, tiler, &mut accumulator)?;
        drop(model);
        drop(resampled);

        record(&mut states, TaskState::Reassembling(index));
        let local = argmax(&accumulator.finalize()?)?;
        let labels = unresample(&local, &context, BACKGROUND_LABEL)?;

        Ok(SubmodelOutput {
            labels,
            states,
            model_shape: context.model_shape(),
            inference,
        })
    }
}

fn record(states: &mut Vec<TaskState>, state: TaskState) {
    tracing::debug!(?state, "Task state");
    states.push(state);
}
