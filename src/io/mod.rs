//! Image I/O boundary
//!
//! Paths are dispatched on their extension. Every extension the command line
//! accepts is recognized; MetaImage and NIfTI are read and written.

pub mod metaimage;
pub mod nifti;

use derive_more::Display;
use std::path::Path;

use crate::core::error::{Result, SegError};
use crate::volume::{LabelMap, Volume};

/// Extensions accepted for input and output images
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mha", "mhd", "nii", "nii.gz", "nrrd", "nrrd.gz", "gipl", "gipl.gz",
];

/// Image container families
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    #[display(fmt = "MetaImage")]
    MetaImage,
    #[display(fmt = "NIfTI")]
    Nifti,
    #[display(fmt = "NRRD")]
    Nrrd,
    #[display(fmt = "GIPL")]
    Gipl,
}

impl ImageFormat {
    /// Format implied by a file name, matching compound extensions like `.nii.gz`
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let extension = SUPPORTED_EXTENSIONS
            .iter()
            .filter(|ext| name.ends_with(&format!(".{}", ext)))
            .max_by_key(|ext| ext.len())
            .ok_or_else(|| {
                SegError::Format(format!(
                    "unsupported extension for {} (supported: {})",
                    path.display(),
                    SUPPORTED_EXTENSIONS.join(", ")
                ))
            })?;

        Ok(match extension.trim_end_matches(".gz") {
            "mha" | "mhd" => ImageFormat::MetaImage,
            "nii" => ImageFormat::Nifti,
            "nrrd" => ImageFormat::Nrrd,
            _ => ImageFormat::Gipl,
        })
    }

    pub fn is_readable(self) -> bool {
        matches!(self, ImageFormat::MetaImage | ImageFormat::Nifti)
    }
}

/// Whether a path carries one of [`SUPPORTED_EXTENSIONS`]
pub fn has_supported_extension(path: &Path) -> bool {
    ImageFormat::from_path(path).is_ok()
}

/// Format of `path`, rejecting recognized formats this build cannot handle
fn readable_format(path: &Path) -> Result<ImageFormat> {
    let format = ImageFormat::from_path(path)?;
    if !format.is_readable() {
        return Err(SegError::Format(format!(
            "{} images ({}) are not supported by this build, convert to .nii.gz or .mha",
            format,
            path.display()
        )));
    }
    Ok(format)
}

/// Read an intensity volume with its geometry
pub fn read_volume(path: &Path) -> Result<Volume<f32>> {
    match readable_format(path)? {
        ImageFormat::Nifti => nifti::read(path),
        _ => metaimage::read(path),
    }
}

/// Write a label map with its geometry
pub fn write_labels(path: &Path, labels: &LabelMap) -> Result<()> {
    match readable_format(path)? {
        ImageFormat::Nifti => nifti::write_labels(path, labels),
        _ => metaimage::write_labels(path, labels),
    }
}

/// Write an intensity volume with its geometry
pub fn write_volume(path: &Path, volume: &Volume<f32>) -> Result<()> {
    match readable_format(path)? {
        ImageFormat::Nifti => nifti::write_volume(path, volume),
        _ => metaimage::write_volume(path, volume),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ImageFormat::from_path(Path::new("a/ct.mha")).unwrap(), ImageFormat::MetaImage);
        assert_eq!(ImageFormat::from_path(Path::new("CT.MHD")).unwrap(), ImageFormat::MetaImage);
        assert_eq!(ImageFormat::from_path(Path::new("seg.nii.gz")).unwrap(), ImageFormat::Nifti);
        assert_eq!(ImageFormat::from_path(Path::new("x.gipl.gz")).unwrap(), ImageFormat::Gipl);
        assert!(ImageFormat::from_path(Path::new("scan.dcm")).is_err());
        assert!(ImageFormat::from_path(Path::new("mha")).is_err());
    }

    #[test]
    fn test_recognized_but_unreadable_formats() {
        assert!(has_supported_extension(Path::new("Seg.nii.gz")));
        assert!(ImageFormat::Nifti.is_readable());
        assert!(!ImageFormat::Gipl.is_readable());
        let err = read_volume(Path::new("missing.nrrd")).unwrap_err();
        assert!(matches!(err, SegError::Format(_)));
    }

    #[test]
    fn test_dispatch_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let geometry = crate::geometry::Geometry::with_spacing([0.5, 0.5, 2.0]).unwrap();
        let mut labels = LabelMap::background([3, 2, 2], geometry).unwrap();
        labels.set(0, [2, 1, 1], 42);
        for name in ["Seg.nii.gz", "Seg.NII", "Seg.mha"] {
            let path = dir.path().join(name);
            write_labels(&path, &labels).unwrap();
            let back = read_volume(&path).unwrap();
            assert_eq!(back.get(0, [2, 1, 1]), Some(42.0), "{}", name);
            assert_eq!(back.geometry().spacing(), [0.5, 0.5, 2.0], "{}", name);
        }
    }
}
