//! End-to-end pipeline tests with the voxel-linear backend

use organseg::core::config::PipelineConfig;
use organseg::core::types::{LabelId, SpeedMode, TaskName};
use organseg::geometry::Geometry;
use organseg::hub::{ResolvedModel, StaticHub, WeightsBlob};
use organseg::patch::{tile, Accumulator, BlendMode, PatchOutput, TileGrid};
use organseg::runner::{ClassWeights, DeviceAssignment, VoxelLinearBackend, VoxelLinearWeights};
use organseg::task::{DeviceAffinity, ModelSpec, Normalization, Orchestrator, TaskConfig};
use organseg::volume::{LabelMap, Volume};

fn spec(name: &str, spacing: f64) -> ModelSpec {
    ModelSpec {
        name: name.into(),
        weights_file: format!("{}.json", name),
        target_spacing: [spacing; 3],
        patch_shape: [4, 4, 4],
        stride: [2, 2, 2],
        labels: vec![format!("{}_organ", name)],
        normalization: Normalization::None,
        device_affinity: DeviceAffinity::Any,
        bytes_per_voxel: 4,
    }
}

/// Foreground where `slope * x + bias > 0`
fn linear_weights(slope: f32, bias: f32) -> WeightsBlob {
    let weights = VoxelLinearWeights {
        classes: vec![
            ClassWeights { weight: 0.0, bias: 0.0 },
            ClassWeights { weight: slope, bias },
        ],
    };
    WeightsBlob::new("linear", serde_json::to_vec(&weights).unwrap())
}

/// Three slabs along x: -1 (dark), 0, +1 (bright)
fn slab_volume() -> Volume<f32> {
    let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
    let mut volume = Volume::<f32>::zeros([12, 10, 8], geometry).unwrap();
    for k in 0..8 {
        for j in 0..10 {
            for i in 0..12 {
                let value = match i {
                    0..=3 => -1.0,
                    4..=7 => 0.0,
                    _ => 1.0,
                };
                volume.set(0, [i, j, k], value);
            }
        }
    }
    volume
}

fn run_plan(plan: &TaskConfig, weights: &[WeightsBlob], input: &Volume<f32>) -> LabelMap {
    let config = PipelineConfig::default();
    let hub = StaticHub::new();
    let orchestrator = Orchestrator::new(&VoxelLinearBackend, &hub, &config);
    let (labels, report) = orchestrator
        .run_plan(plan, weights, input, &DeviceAssignment::cpu(2))
        .unwrap();
    assert_eq!(report.total_conflicts(), 0);
    labels
}

#[test]
fn test_ten_cube_scenario_full_coverage() {
    let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
    let volume = Volume::<f32>::zeros([10, 10, 10], geometry).unwrap();
    let tiler = tile(&volume, [4, 4, 4], [2, 2, 2], BlendMode::Linear, 0.0).unwrap();
    assert_eq!(tiler.len(), 64);

    let mut acc = Accumulator::new(volume.shape(), 2, geometry);
    for patch in tiler {
        let n = patch.voxels();
        let mut data = vec![0.1; n];
        data.extend(std::iter::repeat(0.9).take(n));
        acc.accumulate(&PatchOutput::for_patch(&patch, 2, data).unwrap())
            .unwrap();
    }
    assert!(acc.min_weight() > 0.0);
    assert_eq!(acc.applied(), 64);
}

#[test]
fn test_disjoint_submodels_commute() {
    let input = slab_volume();
    let bright = spec("bright", 1.0);
    let dark = spec("dark", 1.0);
    let bright_weights = linear_weights(10.0, -5.0);
    let dark_weights = linear_weights(-10.0, -5.0);

    let forward = TaskConfig::with_offsets(
        TaskName::Total,
        SpeedMode::Normal,
        vec![(bright.clone(), 0), (dark.clone(), 1)],
    )
    .unwrap();
    let reverse = TaskConfig::with_offsets(
        TaskName::Total,
        SpeedMode::Normal,
        vec![(dark, 1), (bright, 0)],
    )
    .unwrap();

    let a = run_plan(&forward, &[bright_weights.clone(), dark_weights.clone()], &input);
    let b = run_plan(&reverse, &[dark_weights, bright_weights], &input);

    assert_eq!(a, b);
    assert_eq!(a.get(0, [10, 5, 4]), Some(1));
    assert_eq!(a.get(0, [1, 5, 4]), Some(2));
    assert_eq!(a.get(0, [5, 5, 4]), Some(0));
    assert_eq!(a.label_counts(), vec![(1, 4 * 10 * 8), (2, 4 * 10 * 8)]);
}

#[test]
fn test_repeated_runs_are_identical() {
    let input = slab_volume();
    let plan = TaskConfig::new(TaskName::Total, SpeedMode::Normal, vec![spec("bright", 1.5)]).unwrap();
    let weights = [linear_weights(10.0, -5.0)];

    let first = run_plan(&plan, &weights, &input);
    let second = run_plan(&plan, &weights, &input);
    assert_eq!(first, second);
    assert_eq!(first.geometry(), input.geometry());
}

#[test]
fn test_output_geometry_is_native_after_resampling() {
    let input = slab_volume();
    let plan = TaskConfig::new(TaskName::Total, SpeedMode::Normal, vec![spec("bright", 2.0)]).unwrap();
    let labels = run_plan(&plan, &[linear_weights(10.0, -5.0)], &input);

    assert_eq!(labels.shape(), input.shape());
    assert!(labels.same_grid(&input));
    // Deep inside each slab the coarse grid agrees with the native one
    assert_eq!(labels.get(0, [11, 0, 0]), Some(1));
    assert_eq!(labels.get(0, [0, 9, 7]), Some(0));
}

#[test]
fn test_run_through_hub() {
    let mut hub = StaticHub::new();
    hub.insert(
        TaskName::TotalMr,
        SpeedMode::Fast,
        vec![ResolvedModel {
            weights: linear_weights(10.0, -5.0),
            spec: spec("coarse", 3.0),
        }],
    );
    let config = PipelineConfig::default();
    let orchestrator = Orchestrator::new(&VoxelLinearBackend, &hub, &config);
    let labels = orchestrator
        .run(TaskName::TotalMr, SpeedMode::Fast, &slab_volume(), &DeviceAssignment::gpus([0, 1]))
        .unwrap();
    // Every bright voxel survives the 3 mm round trip, edges included
    assert_eq!(labels.label_counts(), vec![(1 as LabelId, 4 * 10 * 8)]);
    assert_eq!(labels.get(0, [11, 9, 7]), Some(1));
    assert_eq!(labels.get(0, [7, 9, 7]), Some(0));
}

#[test]
fn test_uniform_foreground_survives_non_integer_spacing_ratio() {
    let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
    for n in [10, 11, 13] {
        let input = Volume::<f32>::filled([n, n, n], 1, geometry, 1.0).unwrap();
        let plan = TaskConfig::new(TaskName::Total, SpeedMode::Fast, vec![spec("coarse", 3.0)]).unwrap();
        let labels = run_plan(&plan, &[linear_weights(10.0, -5.0)], &input);
        let background = labels.data().iter().filter(|&&l| l == 0).count();
        assert_eq!(background, 0, "{} background voxels for n = {}", background, n);
    }
}

#[test]
fn test_fast_mode_is_coarser_and_cheaper() {
    for task in TaskName::ALL {
        let normal = TaskConfig::from_catalog(task, SpeedMode::Normal).unwrap();
        let fast = TaskConfig::from_catalog(task, SpeedMode::Fast).unwrap();

        let normal_spacing = normal
            .entries()
            .iter()
            .map(|e| e.spec.max_spacing())
            .fold(f64::INFINITY, f64::min);
        assert!(fast.entries().iter().all(|e| e.spec.max_spacing() > normal_spacing));

        let shape = [300, 300, 250];
        let spacing = [0.8, 0.8, 1.5];
        let normal_patches: usize = normal.planned_patches(shape, spacing).unwrap().iter().sum();
        let fast_patches: usize = fast.planned_patches(shape, spacing).unwrap().iter().sum();
        assert!(fast_patches < normal_patches, "{}: {} vs {}", task, fast_patches, normal_patches);
    }
}

#[test]
fn test_tile_grid_counts_without_data() {
    let grid = TileGrid::new([10, 10, 10], [4, 4, 4], [2, 2, 2]).unwrap();
    assert_eq!(grid.len(), 64);
    let small = TileGrid::new([3, 2, 1], [4, 4, 4], [2, 2, 2]).unwrap();
    assert_eq!(small.len(), 1);
}
