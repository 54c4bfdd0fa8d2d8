//! Built-in task catalog
//!
//! Each task is a list of sub-models; the label sets are disjoint and their
//! concatenation in catalog order gives the global label ids of the task.
//! Fast mode swaps the list for a single coarse model covering all labels of
//! the task, so global label ids are the same in both modes.

use super::spec::{DeviceAffinity, ModelSpec, Normalization};
use crate::core::types::{Shape3, Spacing3, SpeedMode, TaskName};

const NORMAL_SPACING: Spacing3 = [1.5, 1.5, 1.5];
const FAST_SPACING: Spacing3 = [3.0, 3.0, 3.0];

const NORMAL_PATCH: Shape3 = [128, 128, 128];
const NORMAL_STRIDE: Shape3 = [64, 64, 64];
const FAST_PATCH: Shape3 = [112, 112, 128];
const FAST_STRIDE: Shape3 = [84, 84, 96];

/// Working memory per patch voxel of the 3D U-Nets (fp32 activations)
const UNET_BYTES_PER_VOXEL: u64 = 1024;

const CT_NORMALIZATION: Normalization = Normalization::Clip {
    lower: -1024.0,
    upper: 1500.0,
    mean: 0.0,
    std: 500.0,
};

const CT_ORGANS: &[&str] = &[
    "spleen",
    "kidney_right",
    "kidney_left",
    "gallbladder",
    "liver",
    "stomach",
    "pancreas",
    "adrenal_gland_right",
    "adrenal_gland_left",
    "lung_upper_lobe_left",
    "lung_lower_lobe_left",
    "lung_upper_lobe_right",
    "lung_middle_lobe_right",
    "lung_lower_lobe_right",
    "esophagus",
    "trachea",
    "thyroid_gland",
    "small_bowel",
    "duodenum",
    "colon",
    "urinary_bladder",
    "prostate",
    "kidney_cyst_left",
    "kidney_cyst_right",
];

const CT_VERTEBRAE: &[&str] = &[
    "sacrum",
    "vertebrae_S1",
    "vertebrae_L5",
    "vertebrae_L4",
    "vertebrae_L3",
    "vertebrae_L2",
    "vertebrae_L1",
    "vertebrae_T12",
    "vertebrae_T11",
    "vertebrae_T10",
    "vertebrae_T9",
    "vertebrae_T8",
    "vertebrae_T7",
    "vertebrae_T6",
    "vertebrae_T5",
    "vertebrae_T4",
    "vertebrae_T3",
    "vertebrae_T2",
    "vertebrae_T1",
    "vertebrae_C7",
    "vertebrae_C6",
    "vertebrae_C5",
    "vertebrae_C4",
    "vertebrae_C3",
    "vertebrae_C2",
    "vertebrae_C1",
];

const CT_CARDIAC: &[&str] = &[
    "heart",
    "aorta",
    "pulmonary_vein",
    "brachiocephalic_trunk",
    "subclavian_artery_right",
    "subclavian_artery_left",
    "common_carotid_artery_right",
    "common_carotid_artery_left",
    "brachiocephalic_vein_left",
    "brachiocephalic_vein_right",
    "atrial_appendage_left",
    "superior_vena_cava",
    "inferior_vena_cava",
    "portal_vein_and_splenic_vein",
    "iliac_artery_left",
    "iliac_artery_right",
    "iliac_vena_left",
    "iliac_vena_right",
];

const CT_MUSCLES: &[&str] = &[
    "humerus_left",
    "humerus_right",
    "scapula_left",
    "scapula_right",
    "clavicula_left",
    "clavicula_right",
    "femur_left",
    "femur_right",
    "hip_left",
    "hip_right",
    "spinal_cord",
    "gluteus_maximus_left",
    "gluteus_maximus_right",
    "gluteus_medius_left",
    "gluteus_medius_right",
    "gluteus_minimus_left",
    "gluteus_minimus_right",
    "autochthon_left",
    "autochthon_right",
    "iliopsoas_left",
    "iliopsoas_right",
];

const CT_RIBS: &[&str] = &[
    "brain",
    "skull",
    "rib_left_1",
    "rib_left_2",
    "rib_left_3",
    "rib_left_4",
    "rib_left_5",
    "rib_left_6",
    "rib_left_7",
    "rib_left_8",
    "rib_left_9",
    "rib_left_10",
    "rib_left_11",
    "rib_left_12",
    "rib_right_1",
    "rib_right_2",
    "rib_right_3",
    "rib_right_4",
    "rib_right_5",
    "rib_right_6",
    "rib_right_7",
    "rib_right_8",
    "rib_right_9",
    "rib_right_10",
    "rib_right_11",
    "rib_right_12",
    "sternum",
    "costal_cartilages",
];

const MR_TRUNK: &[&str] = &[
    "spleen",
    "kidney_right",
    "kidney_left",
    "gallbladder",
    "liver",
    "stomach",
    "pancreas",
    "adrenal_gland_right",
    "adrenal_gland_left",
    "lung_left",
    "lung_right",
    "esophagus",
    "small_bowel",
    "duodenum",
    "colon",
    "urinary_bladder",
    "prostate",
    "sacrum",
    "vertebrae",
    "intervertebral_discs",
    "spinal_cord",
    "heart",
    "aorta",
    "inferior_vena_cava",
    "portal_vein_and_splenic_vein",
];

const MR_LIMBS: &[&str] = &[
    "iliac_artery_left",
    "iliac_artery_right",
    "iliac_vena_left",
    "iliac_vena_right",
    "humerus_left",
    "humerus_right",
    "fibula",
    "tibia",
    "femur_left",
    "femur_right",
    "hip_left",
    "hip_right",
    "gluteus_maximus_left",
    "gluteus_maximus_right",
    "gluteus_medius_left",
    "gluteus_medius_right",
    "gluteus_minimus_left",
    "gluteus_minimus_right",
    "autochthon_left",
    "autochthon_right",
    "iliopsoas_left",
    "iliopsoas_right",
    "quadriceps_femoris_left",
    "quadriceps_femoris_right",
    "brain",
];

fn unet(name: &str, groups: &[&[&str]], normalization: Normalization, speed: SpeedMode) -> ModelSpec {
    let (target_spacing, patch_shape, stride) = match speed {
        SpeedMode::Normal => (NORMAL_SPACING, NORMAL_PATCH, NORMAL_STRIDE),
        SpeedMode::Fast => (FAST_SPACING, FAST_PATCH, FAST_STRIDE),
    };
    ModelSpec {
        name: name.to_string(),
        weights_file: format!("{}.pt", name),
        target_spacing,
        patch_shape,
        stride,
        labels: groups
            .iter()
            .flat_map(|group| group.iter().map(|l| l.to_string()))
            .collect(),
        normalization,
        device_affinity: DeviceAffinity::PreferGpu,
        bytes_per_voxel: UNET_BYTES_PER_VOXEL,
    }
}

/// Sub-models of a task in orchestration order
pub fn model_specs(task: TaskName, speed: SpeedMode) -> Vec<ModelSpec> {
    match (task, speed) {
        (TaskName::Total, SpeedMode::Normal) => vec![
            unet("M291", &[CT_ORGANS], CT_NORMALIZATION, speed),
            unet("M292", &[CT_VERTEBRAE], CT_NORMALIZATION, speed),
            unet("M293", &[CT_CARDIAC], CT_NORMALIZATION, speed),
            unet("M294", &[CT_MUSCLES], CT_NORMALIZATION, speed),
            unet("M295", &[CT_RIBS], CT_NORMALIZATION, speed),
        ],
        (TaskName::Total, SpeedMode::Fast) => vec![unet(
            "M297",
            &[CT_ORGANS, CT_VERTEBRAE, CT_CARDIAC, CT_MUSCLES, CT_RIBS],
            CT_NORMALIZATION,
            speed,
        )],
        (TaskName::TotalMr, SpeedMode::Normal) => vec![
            unet("M850", &[MR_TRUNK], Normalization::ZScore, speed),
            unet("M851", &[MR_LIMBS], Normalization::ZScore, speed),
        ],
        (TaskName::TotalMr, SpeedMode::Fast) => vec![unet(
            "M852",
            &[MR_TRUNK, MR_LIMBS],
            Normalization::ZScore,
            speed,
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_counts_match_between_modes() {
        for task in TaskName::ALL {
            let normal: usize = model_specs(task, SpeedMode::Normal)
                .iter()
                .map(|s| s.labels.len())
                .sum();
            let fast: usize = model_specs(task, SpeedMode::Fast)
                .iter()
                .map(|s| s.labels.len())
                .sum();
            assert_eq!(normal, fast, "{}", task);
        }
        let ct: usize = model_specs(TaskName::Total, SpeedMode::Normal)
            .iter()
            .map(|s| s.labels.len())
            .sum();
        assert_eq!(ct, 117);
    }

    #[test]
    fn test_catalog_specs_valid() {
        for task in TaskName::ALL {
            for speed in [SpeedMode::Normal, SpeedMode::Fast] {
                for spec in model_specs(task, speed) {
                    assert!(spec.validate().is_ok(), "{}", spec.name);
                }
            }
        }
    }

    #[test]
    fn test_fast_models_are_coarser() {
        for task in TaskName::ALL {
            let fast = model_specs(task, SpeedMode::Fast);
            for normal in model_specs(task, SpeedMode::Normal) {
                assert!(fast[0].max_spacing() > normal.max_spacing());
            }
        }
    }
}
