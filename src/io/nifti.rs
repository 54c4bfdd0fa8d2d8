//! NIfTI-1 (`.nii` / `.nii.gz`) reader and writer
//!
//! Single-file images only: a 348 byte header, a 4 byte extension flag and
//! the voxels at `vox_offset`. NIfTI world coordinates are RAS while
//! [`Geometry`] is LPS, so the first two world axes change sign in both
//! directions. Reads prefer the sform over the qform; writes store both.
//! Header fields are `f32`, so geometry survives a round trip to single
//! precision only.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use glam::{DMat3, DQuat, DVec3};
use std::io::{Read, Write};
use std::path::Path;

use super::metaimage::{self, ElementType};
use crate::core::error::{Result, SegError};
use crate::core::types::Shape3;
use crate::geometry::Geometry;
use crate::volume::{LabelMap, Volume};

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;
const MAGIC_SINGLE: &[u8; 4] = b"n+1\0";
const MAGIC_PAIR: &[u8; 4] = b"ni1\0";
const UNITS_MM: u8 = 2;
const XFORM_SCANNER: i16 = 1;

// Field offsets
const DIM: usize = 40;
const DATATYPE: usize = 70;
const BITPIX: usize = 72;
const PIXDIM: usize = 76;
const VOX_OFFSET_FIELD: usize = 108;
const SCL_SLOPE: usize = 112;
const SCL_INTER: usize = 116;
const XYZT_UNITS: usize = 123;
const DESCRIP: usize = 148;
const QFORM_CODE: usize = 252;
const SFORM_CODE: usize = 254;
const QUATERN_B: usize = 256;
const QOFFSET_X: usize = 268;
const SROW_X: usize = 280;
const MAGIC: usize = 344;

/// RAS <-> LPS
const FLIP_XY: DVec3 = DVec3::new(-1.0, -1.0, 1.0);

fn element_type(code: i16) -> Result<ElementType> {
    Ok(match code {
        2 => ElementType::UChar,
        256 => ElementType::Char,
        512 => ElementType::UShort,
        4 => ElementType::Short,
        768 => ElementType::UInt,
        8 => ElementType::Int,
        16 => ElementType::Float,
        64 => ElementType::Double,
        other => return Err(SegError::Format(format!("unsupported NIfTI datatype {}", other))),
    })
}

fn datatype_code(element_type: ElementType) -> i16 {
    match element_type {
        ElementType::UChar => 2,
        ElementType::Char => 256,
        ElementType::UShort => 512,
        ElementType::Short => 4,
        ElementType::UInt => 768,
        ElementType::Int => 8,
        ElementType::Float => 16,
        ElementType::Double => 64,
    }
}

/// Parsed header fields the pipeline uses
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub shape: Shape3,
    pub channels: usize,
    pub geometry: Geometry,
    pub element_type: ElementType,
    pub big_endian: bool,
    pub vox_offset: usize,
    /// `(slope, intercept)` when stored values need rescaling
    pub scale: Option<(f32, f32)>,
}

impl Header {
    /// Byte length of the voxel data
    pub fn data_len(&self) -> Result<usize> {
        self.shape
            .iter()
            .chain([&self.channels, &self.element_type.size()])
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| SegError::Format(format!("NIfTI dim {:?} overflows the addressable size", self.shape)))
    }
}

/// Fixed-offset header fields in the file's byte order
struct Fields<'a> {
    bytes: &'a [u8],
    big_endian: bool,
}

impl Fields<'_> {
    fn array<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.bytes[at..at + N]);
        buf
    }

    fn i16(&self, at: usize) -> i16 {
        let buf = self.array(at);
        if self.big_endian {
            i16::from_be_bytes(buf)
        } else {
            i16::from_le_bytes(buf)
        }
    }

    fn f32(&self, at: usize) -> f32 {
        let buf = self.array(at);
        if self.big_endian {
            f32::from_be_bytes(buf)
        } else {
            f32::from_le_bytes(buf)
        }
    }

    fn vec3(&self, at: usize) -> DVec3 {
        DVec3::new(
            self.f32(at) as f64,
            self.f32(at + 4) as f64,
            self.f32(at + 8) as f64,
        )
    }
}

/// Index-to-RAS matrix and translation, sform first, then qform, then pixdim
fn ras_affine(fields: &Fields<'_>, pixdim: [f64; 4]) -> (DMat3, DVec3) {
    let spacing = DVec3::new(pixdim[1], pixdim[2], pixdim[3]).abs();
    let spacing = DVec3::select(spacing.cmpgt(DVec3::ZERO), spacing, DVec3::ONE);

    if fields.i16(SFORM_CODE) > 0 {
        let rows = [
            fields.vec3(SROW_X),
            fields.vec3(SROW_X + 16),
            fields.vec3(SROW_X + 32),
        ];
        let matrix = DMat3::from_cols(
            DVec3::new(rows[0].x, rows[1].x, rows[2].x),
            DVec3::new(rows[0].y, rows[1].y, rows[2].y),
            DVec3::new(rows[0].z, rows[1].z, rows[2].z),
        );
        let translation = DVec3::new(
            fields.f32(SROW_X + 12) as f64,
            fields.f32(SROW_X + 28) as f64,
            fields.f32(SROW_X + 44) as f64,
        );
        return (matrix, translation);
    }

    if fields.i16(QFORM_CODE) > 0 {
        let bcd = fields.vec3(QUATERN_B);
        let a = (1.0 - bcd.length_squared()).max(0.0).sqrt();
        let rotation = DMat3::from_quat(DQuat::from_xyzw(bcd.x, bcd.y, bcd.z, a).normalize());
        let qfac = if pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let matrix = rotation * DMat3::from_diagonal(spacing * DVec3::new(1.0, 1.0, qfac));
        return (matrix, fields.vec3(QOFFSET_X));
    }

    (DMat3::from_diagonal(spacing), DVec3::ZERO)
}

/// Parse a single-file NIfTI-1 header
pub fn parse_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_SIZE {
        return Err(SegError::Format(format!(
            "NIfTI header needs {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }
    let size = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let big_endian = if i32::from_le_bytes(size) == HEADER_SIZE as i32 {
        false
    } else if i32::from_be_bytes(size) == HEADER_SIZE as i32 {
        true
    } else {
        return Err(SegError::Format("sizeof_hdr is not 348, not a NIfTI-1 file".to_string()));
    };
    match &bytes[MAGIC..MAGIC + 4] {
        magic if magic == MAGIC_SINGLE => {}
        magic if magic == MAGIC_PAIR => {
            return Err(SegError::Format("two-file NIfTI (.hdr/.img) is not supported".to_string()))
        }
        _ => return Err(SegError::Format("missing NIfTI-1 magic".to_string())),
    }

    let fields = Fields { bytes, big_endian };
    let ndims = fields.i16(DIM);
    if !(2..=4).contains(&ndims) {
        return Err(SegError::Format(format!("only 2D to 4D NIfTI images are supported, got {} dims", ndims)));
    }
    let mut dims = [1usize; 4];
    for (axis, dim) in dims.iter_mut().enumerate().take(ndims as usize) {
        let n = fields.i16(DIM + 2 + 2 * axis);
        if n < 1 {
            return Err(SegError::Format(format!("invalid NIfTI dim[{}] = {}", axis + 1, n)));
        }
        *dim = n as usize;
    }

    let element_type = element_type(fields.i16(DATATYPE))?;
    let vox_offset = fields.f32(VOX_OFFSET_FIELD);
    if !vox_offset.is_finite() || vox_offset < VOX_OFFSET as f32 || vox_offset.fract() != 0.0 {
        return Err(SegError::Format(format!("invalid vox_offset {}", vox_offset)));
    }
    let slope = fields.f32(SCL_SLOPE);
    let inter = fields.f32(SCL_INTER);
    let scale = (slope.is_finite() && slope != 0.0 && (slope != 1.0 || inter != 0.0)).then_some((slope, inter));

    let mut pixdim = [0.0f64; 4];
    for (i, p) in pixdim.iter_mut().enumerate() {
        *p = fields.f32(PIXDIM + 4 * i) as f64;
    }
    let (mut matrix, translation) = ras_affine(&fields, pixdim);
    // 2D sforms may leave the slice axis empty
    if ndims == 2 && matrix.z_axis.length() == 0.0 {
        matrix.z_axis = DVec3::Z;
    }

    let lps = DMat3::from_diagonal(FLIP_XY) * matrix;
    let spacing = [lps.x_axis.length(), lps.y_axis.length(), lps.z_axis.length()];
    if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(SegError::Format(format!("degenerate NIfTI affine, voxel sizes {:?}", spacing)));
    }
    let direction = DMat3::from_cols(
        lps.x_axis / spacing[0],
        lps.y_axis / spacing[1],
        lps.z_axis / spacing[2],
    );
    let origin = (FLIP_XY * translation).to_array();

    Ok(Header {
        shape: [dims[0], dims[1], dims[2]],
        channels: dims[3],
        geometry: Geometry::new(origin, spacing, direction)?,
        element_type,
        big_endian,
        vox_offset: vox_offset as usize,
        scale,
    })
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Read a NIfTI image as an `f32` volume; a 4th dimension becomes channels
pub fn read(path: &Path) -> Result<Volume<f32>> {
    let stored = std::fs::read(path)?;
    let bytes = if is_gzip(path) {
        let mut out = Vec::new();
        GzDecoder::new(stored.as_slice()).read_to_end(&mut out)?;
        out
    } else {
        stored
    };
    let header = parse_header(&bytes)?;

    let expected = header.data_len()?;
    let raw = bytes.get(header.vox_offset..).unwrap_or(&[]);
    if raw.len() < expected {
        return Err(SegError::Format(format!(
            "{} holds {} data bytes, expected {}",
            path.display(),
            raw.len(),
            expected
        )));
    }
    let mut data = metaimage::decode(&raw[..expected], header.element_type, header.big_endian);
    if let Some((slope, inter)) = header.scale {
        data.iter_mut().for_each(|v| *v = *v * slope + inter);
    }

    tracing::debug!(
        path = %path.display(),
        shape = ?header.shape,
        channels = header.channels,
        element = header.element_type.tag(),
        "Read NIfTI"
    );
    Volume::from_data(header.shape, header.channels, header.geometry, data)
}

fn put<const N: usize>(header: &mut [u8], at: usize, bytes: [u8; N]) {
    header[at..at + N].copy_from_slice(&bytes);
}

fn put_vec3(header: &mut [u8], at: usize, v: DVec3) {
    for (i, value) in v.to_array().into_iter().enumerate() {
        put(header, at + 4 * i, (value as f32).to_le_bytes());
    }
}

/// Little-endian header plus the empty extension flag
fn header_bytes(shape: Shape3, channels: usize, geometry: &Geometry, element_type: ElementType) -> Result<Vec<u8>> {
    let mut dims = [1i16; 4];
    for (dim, n) in dims.iter_mut().zip(shape.iter().chain([&channels])) {
        *dim = i16::try_from(*n).map_err(|_| {
            SegError::Format(format!("NIfTI-1 cannot hold {} voxels along one axis", n))
        })?;
    }

    let mut header = vec![0u8; VOX_OFFSET];
    put(&mut header, 0, (HEADER_SIZE as i32).to_le_bytes());
    put(&mut header, DIM, (if channels > 1 { 4i16 } else { 3i16 }).to_le_bytes());
    for axis in 0..7 {
        let n = dims.get(axis).copied().unwrap_or(1);
        put(&mut header, DIM + 2 + 2 * axis, n.to_le_bytes());
    }
    put(&mut header, DATATYPE, datatype_code(element_type).to_le_bytes());
    put(&mut header, BITPIX, (element_type.size() as i16 * 8).to_le_bytes());

    let spacing = DVec3::from_array(geometry.spacing());
    let ras = DMat3::from_diagonal(FLIP_XY) * geometry.direction();
    let translation = FLIP_XY * DVec3::from_array(geometry.origin());

    // qform rotation must be proper; a reflection moves into qfac
    let (rotation, qfac) = if ras.determinant() < 0.0 {
        (DMat3::from_cols(ras.x_axis, ras.y_axis, -ras.z_axis), -1.0f32)
    } else {
        (ras, 1.0f32)
    };
    let quat = DQuat::from_mat3(&rotation).normalize();
    let quat = if quat.w < 0.0 { -quat } else { quat };

    put(&mut header, PIXDIM, qfac.to_le_bytes());
    put_vec3(&mut header, PIXDIM + 4, spacing);
    for i in 4..8 {
        put(&mut header, PIXDIM + 4 * i, 1.0f32.to_le_bytes());
    }
    put(&mut header, VOX_OFFSET_FIELD, (VOX_OFFSET as f32).to_le_bytes());
    put(&mut header, SCL_SLOPE, 1.0f32.to_le_bytes());
    put(&mut header, SCL_INTER, 0.0f32.to_le_bytes());
    header[XYZT_UNITS] = UNITS_MM;
    header[DESCRIP..DESCRIP + 8].copy_from_slice(b"organseg");

    put(&mut header, QFORM_CODE, XFORM_SCANNER.to_le_bytes());
    put(&mut header, SFORM_CODE, XFORM_SCANNER.to_le_bytes());
    put_vec3(&mut header, QUATERN_B, DVec3::new(quat.x, quat.y, quat.z));
    put_vec3(&mut header, QOFFSET_X, translation);

    let affine = ras * DMat3::from_diagonal(spacing);
    let rows = affine.transpose();
    for (r, row) in [rows.x_axis, rows.y_axis, rows.z_axis].into_iter().enumerate() {
        put_vec3(&mut header, SROW_X + 16 * r, row);
        put(&mut header, SROW_X + 16 * r + 12, (translation[r] as f32).to_le_bytes());
    }
    header[MAGIC..MAGIC + 4].copy_from_slice(MAGIC_SINGLE);
    Ok(header)
}

fn write_image(
    path: &Path,
    shape: Shape3,
    channels: usize,
    geometry: &Geometry,
    element_type: ElementType,
    raw: Vec<u8>,
) -> Result<()> {
    let mut bytes = header_bytes(shape, channels, geometry, element_type)?;
    bytes.extend_from_slice(&raw);
    if is_gzip(path) {
        let mut encoder = GzEncoder::new(std::fs::File::create(path)?, Compression::default());
        encoder.write_all(&bytes)?;
        encoder.finish()?;
    } else {
        std::fs::write(path, bytes)?;
    }
    tracing::debug!(path = %path.display(), shape = ?shape, element = element_type.tag(), "Wrote NIfTI");
    Ok(())
}

/// Write a label map, as `uint8` when every label fits a byte
pub fn write_labels(path: &Path, labels: &LabelMap) -> Result<()> {
    let (element_type, raw) = metaimage::label_bytes(labels);
    write_image(path, labels.shape(), 1, labels.geometry(), element_type, raw)
}

/// Write an intensity volume as `float32`; channels go to the 4th dimension
pub fn write_volume(path: &Path, volume: &Volume<f32>) -> Result<()> {
    let raw = volume.data().iter().flat_map(|v| v.to_le_bytes()).collect();
    write_image(path, volume.shape(), volume.channels(), volume.geometry(), ElementType::Float, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oblique_geometry() -> Geometry {
        // Rotation about z with the slice axis reversed
        let angle = 0.4f64;
        let direction = DMat3::from_cols(
            DVec3::new(angle.cos(), angle.sin(), 0.0),
            DVec3::new(-angle.sin(), angle.cos(), 0.0),
            DVec3::new(0.0, 0.0, -1.0),
        );
        Geometry::new([-90.5, 12.25, 300.0], [0.75, 0.75, 2.5], direction).unwrap()
    }

    fn assert_close(a: &Geometry, b: &Geometry) {
        for i in 0..3 {
            assert!((a.origin()[i] - b.origin()[i]).abs() < 1e-3, "{:?} vs {:?}", a, b);
            assert!((a.spacing()[i] - b.spacing()[i]).abs() < 1e-5, "{:?} vs {:?}", a, b);
        }
        let diff = a.direction() - b.direction();
        assert!(diff.to_cols_array().iter().all(|d| d.abs() < 1e-5), "{:?} vs {:?}", a, b);
    }

    fn labels() -> LabelMap {
        let mut labels = LabelMap::background([4, 3, 2], oblique_geometry()).unwrap();
        labels.set(0, [3, 2, 1], 117);
        labels.set(0, [1, 0, 0], 5);
        labels
    }

    #[test]
    fn test_gzip_labels_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Seg.nii.gz");
        write_labels(&path, &labels()).unwrap();

        let stored = std::fs::read(&path).unwrap();
        assert_eq!(&stored[..2], &[0x1f, 0x8b]);

        let back = read(&path).unwrap();
        assert_eq!(back.shape(), [4, 3, 2]);
        assert_close(back.geometry(), labels().geometry());
        assert_eq!(back.get(0, [3, 2, 1]), Some(117.0));
        assert_eq!(back.get(0, [1, 0, 0]), Some(5.0));
        assert_eq!(back.get(0, [0, 0, 0]), Some(0.0));
    }

    #[test]
    fn test_qform_only_header() {
        let geometry = oblique_geometry();
        let mut bytes = header_bytes([2, 2, 2], 1, &geometry, ElementType::UChar).unwrap();
        put(&mut bytes, SFORM_CODE, 0i16.to_le_bytes());
        put_vec3(&mut bytes, SROW_X, DVec3::ZERO);
        let header = parse_header(&bytes).unwrap();
        assert_close(&header.geometry, &geometry);
    }

    #[test]
    fn test_large_labels_use_uint16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.nii");
        let mut labels = labels();
        labels.set(0, [0, 1, 1], 300);
        write_labels(&path, &labels).unwrap();

        let header = parse_header(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(header.element_type, ElementType::UShort);
        assert_eq!(read(&path).unwrap().get(0, [0, 1, 1]), Some(300.0));
    }

    #[test]
    fn test_scaled_values_are_rescaled() {
        let mut bytes = header_bytes([2, 1, 1], 1, &oblique_geometry(), ElementType::Short).unwrap();
        put(&mut bytes, SCL_SLOPE, 2.0f32.to_le_bytes());
        put(&mut bytes, SCL_INTER, (-1024.0f32).to_le_bytes());
        bytes.extend_from_slice(&0i16.to_le_bytes());
        bytes.extend_from_slice(&600i16.to_le_bytes());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct.nii");
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(read(&path).unwrap().data(), &[-1024.0, 176.0]);
    }

    #[test]
    fn test_multichannel_volume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probs.nii");
        let geometry = Geometry::with_spacing([1.0, 2.0, 3.0]).unwrap();
        let data: Vec<f32> = (0..16).map(|v| v as f32 * 0.25).collect();
        let volume = Volume::from_data([2, 2, 2], 2, geometry, data).unwrap();

        write_volume(&path, &volume).unwrap();
        let back = read(&path).unwrap();
        assert_eq!(back.channels(), 2);
        assert_eq!(back.data(), volume.data());
        assert_close(back.geometry(), volume.geometry());
    }

    #[test]
    fn test_malformed_files_are_format_errors() {
        let geometry = oblique_geometry();
        let mut pair = header_bytes([2, 2, 2], 1, &geometry, ElementType::UChar).unwrap();
        pair[MAGIC..MAGIC + 4].copy_from_slice(MAGIC_PAIR);
        assert!(matches!(parse_header(&pair), Err(SegError::Format(_))));
        assert!(matches!(parse_header(&pair[..100]), Err(SegError::Format(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.nii");
        let mut truncated = header_bytes([2, 2, 2], 1, &geometry, ElementType::Float).unwrap();
        truncated.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, truncated).unwrap();
        assert!(matches!(read(&path), Err(SegError::Format(_))));
    }

    #[test]
    fn test_axis_longer_than_header_field_is_rejected() {
        let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
        let err = header_bytes([40_000, 1, 1], 1, &geometry, ElementType::UChar).unwrap_err();
        assert!(matches!(err, SegError::Format(_)));
    }
}
