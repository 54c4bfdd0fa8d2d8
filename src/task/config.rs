//! Ordered sub-model list of one run and their global label ranges

use std::ops::RangeInclusive;
use std::sync::Arc;

use super::catalog;
use super::spec::ModelSpec;
use crate::core::error::{Result, SegError};
use crate::core::types::{LabelId, Shape3, Spacing3, SpeedMode, TaskName};
use crate::geometry::resample::model_shape_for;
use crate::patch::TileGrid;

/// One sub-model and the slice of the global label space it owns
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEntry {
    pub spec: Arc<ModelSpec>,
    /// Fusion order; higher priority fuses later, list position breaks ties
    pub priority: usize,
    /// Added to every non-background local label
    pub label_offset: LabelId,
}

impl TaskEntry {
    /// Global label ids this entry can write
    pub fn labels(&self) -> RangeInclusive<LabelId> {
        self.label_offset + 1..=self.label_offset + self.spec.label_count()
    }

    fn overlaps(&self, other: &TaskEntry) -> bool {
        self.labels().start() <= other.labels().end() && other.labels().start() <= self.labels().end()
    }
}

/// Immutable plan of a task: sub-models in orchestration order
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    task: TaskName,
    speed: SpeedMode,
    entries: Vec<TaskEntry>,
}

impl TaskConfig {
    /// Entries in the given order with consecutive label ranges
    pub fn new(task: TaskName, speed: SpeedMode, specs: impl IntoIterator<Item = ModelSpec>) -> Result<Self> {
        let mut offset: LabelId = 0;
        let mut with_offsets = Vec::new();
        for spec in specs {
            let count = spec.label_count();
            with_offsets.push((spec, offset));
            offset = offset.checked_add(count).ok_or_else(|| {
                SegError::Config(format!("task {} has more labels than fit a label id", task))
            })?;
        }
        Self::with_offsets(task, speed, with_offsets)
    }

    /// Entries with explicit label offsets; the ranges must not overlap
    pub fn with_offsets(
        task: TaskName,
        speed: SpeedMode,
        specs: impl IntoIterator<Item = (ModelSpec, LabelId)>,
    ) -> Result<Self> {
        let mut entries: Vec<TaskEntry> = Vec::new();
        for (priority, (spec, label_offset)) in specs.into_iter().enumerate() {
            spec.validate()?;
            if label_offset.checked_add(spec.label_count()).is_none() {
                return Err(SegError::Config(format!(
                    "labels of model {} overflow at offset {}",
                    spec.name, label_offset
                )));
            }
            let entry = TaskEntry {
                spec: Arc::new(spec),
                priority,
                label_offset,
            };
            if let Some(other) = entries.iter().find(|e| e.overlaps(&entry)) {
                return Err(SegError::Config(format!(
                    "models {} and {} claim overlapping labels {:?} and {:?}",
                    other.spec.name,
                    entry.spec.name,
                    other.labels(),
                    entry.labels()
                )));
            }
            entries.push(entry);
        }
        if entries.is_empty() {
            return Err(SegError::Config(format!("task {} has no models", task)));
        }
        Ok(Self {
            task,
            speed,
            entries,
        })
    }

    /// Change the fusion priority of model `name`; higher priorities fuse later
    pub fn with_priority(mut self, name: &str, priority: usize) -> Result<Self> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.spec.name == name)
            .ok_or_else(|| SegError::Config(format!("task {} has no model {}", self.task, name)))?;
        entry.priority = priority;
        Ok(self)
    }

    /// Entry indices in fusion order: ascending priority, ties in list order
    pub fn fusion_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| self.entries[i].priority);
        order
    }

    /// Plan of a built-in task
    pub fn from_catalog(task: TaskName, speed: SpeedMode) -> Result<Self> {
        Self::new(task, speed, catalog::model_specs(task, speed))
    }

    pub fn task(&self) -> TaskName {
        self.task
    }

    pub fn speed(&self) -> SpeedMode {
        self.speed
    }

    pub fn entries(&self) -> &[TaskEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest global label id in use
    pub fn max_label(&self) -> LabelId {
        self.entries
            .iter()
            .map(|e| *e.labels().end())
            .max()
            .unwrap_or(0)
    }

    /// Name of a global label id
    pub fn label_name(&self, label: LabelId) -> Option<&str> {
        self.entries.iter().find_map(|e| {
            e.labels()
                .contains(&label)
                .then(|| e.spec.labels[(label - e.label_offset - 1) as usize].as_str())
        })
    }

    /// Patches each sub-model will infer for an input of this shape and spacing
    pub fn planned_patches(&self, native_shape: Shape3, native_spacing: Spacing3) -> Result<Vec<usize>> {
        self.entries
            .iter()
            .map(|e| {
                let model_shape = model_shape_for(native_shape, native_spacing, e.spec.target_spacing);
                Ok(TileGrid::new(model_shape, e.spec.patch_shape, e.spec.stride)?.len())
            })
            .collect()
    }
}
