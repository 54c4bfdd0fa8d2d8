//! MetaImage (`.mha` / `.mhd`) reader and writer
//!
//! Header: `Key = Value` text lines ending with `ElementDataFile`. With
//! `ElementDataFile = LOCAL` the raw voxels follow the header in the same
//! file; otherwise they live in the named file next to the header.
//! `TransformMatrix` lists the direction cosine columns one after another.

use glam::DMat3;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::core::error::{Result, SegError};
use crate::core::types::{voxel_count, LabelId, Shape3};
use crate::geometry::Geometry;
use crate::volume::{LabelMap, Volume};

/// Voxel encodings found in MetaImage files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    UChar,
    Char,
    UShort,
    Short,
    UInt,
    Int,
    Float,
    Double,
}

impl ElementType {
    fn parse(tag: &str) -> Result<Self> {
        Ok(match tag {
            "MET_UCHAR" => ElementType::UChar,
            "MET_CHAR" => ElementType::Char,
            "MET_USHORT" => ElementType::UShort,
            "MET_SHORT" => ElementType::Short,
            "MET_UINT" => ElementType::UInt,
            "MET_INT" => ElementType::Int,
            "MET_FLOAT" => ElementType::Float,
            "MET_DOUBLE" => ElementType::Double,
            other => return Err(SegError::Format(format!("unsupported ElementType {}", other))),
        })
    }

    pub fn tag(self) -> &'static str {
        match self {
            ElementType::UChar => "MET_UCHAR",
            ElementType::Char => "MET_CHAR",
            ElementType::UShort => "MET_USHORT",
            ElementType::Short => "MET_SHORT",
            ElementType::UInt => "MET_UINT",
            ElementType::Int => "MET_INT",
            ElementType::Float => "MET_FLOAT",
            ElementType::Double => "MET_DOUBLE",
        }
    }

    pub fn size(self) -> usize {
        match self {
            ElementType::UChar | ElementType::Char => 1,
            ElementType::UShort | ElementType::Short => 2,
            ElementType::UInt | ElementType::Int | ElementType::Float => 4,
            ElementType::Double => 8,
        }
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
    /// `None` for LOCAL data
    pub data_file: Option<String>,
    /// Bytes to skip at the start of a detached data file
    pub data_offset: usize,
}

impl Header {
    /// Byte length of the voxel data, rejecting sizes that overflow `usize`
    pub fn data_len(&self) -> Result<usize> {
        self.shape
            .iter()
            .chain([&self.channels, &self.element_type.size()])
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| {
                SegError::Format(format!(
                    "DimSize {:?} with {} channels of {} overflows the addressable size",
                    self.shape,
                    self.channels,
                    self.element_type.tag()
                ))
            })
    }
}

fn parse_values<const N: usize>(key: &str, value: &str, ndims: usize) -> Result<[f64; N]> {
    let parsed: Vec<f64> = value
        .split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| SegError::Format(format!("{} has a non-numeric entry '{}'", key, v)))
        })
        .collect::<Result<_>>()?;
    let expected = if N == 9 { ndims * ndims } else { ndims };
    if parsed.len() != expected {
        return Err(SegError::Format(format!(
            "{} has {} entries, expected {}",
            key,
            parsed.len(),
            expected
        )));
    }
    // 2D images are lifted to a single slice
    let mut out = [0.0; N];
    if N == 9 {
        for col in 0..3 {
            for row in 0..3 {
                out[col * 3 + row] = if col < ndims && row < ndims {
                    parsed[col * ndims + row]
                } else if col == row {
                    1.0
                } else {
                    0.0
                };
            }
        }
    } else {
        out[..ndims].copy_from_slice(&parsed);
    }
    Ok(out)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(SegError::Format(format!("{} must be True or False, got '{}'", key, other))),
    }
}

/// Parse the header; returns it with the byte offset of LOCAL data
pub fn parse_header(bytes: &[u8]) -> Result<(Header, usize)> {
    let mut ndims = 0usize;
    let mut dims: Option<[f64; 3]> = None;
    let mut spacing = [1.0; 3];
    let mut origin = [0.0; 3];
    let mut direction = DMat3::IDENTITY.to_cols_array();
    let mut element_type = None;
    let mut channels = 1usize;
    let mut big_endian = false;
    let mut data_offset = 0usize;

    let mut pos = 0usize;
    while pos < bytes.len() {
        let end = bytes[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |i| pos + i);
        let line = std::str::from_utf8(&bytes[pos..end])
            .map_err(|_| SegError::Format("header is not valid text".to_string()))?
            .trim();
        pos = end + 1;
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .ok_or_else(|| SegError::Format(format!("malformed header line '{}'", line)))?;

        match key {
            "ObjectType" if value != "Image" => {
                return Err(SegError::Format(format!("ObjectType {} is not an image", value)));
            }
            "NDims" => {
                ndims = value
                    .parse()
                    .map_err(|_| SegError::Format(format!("invalid NDims '{}'", value)))?;
                if !(2..=3).contains(&ndims) {
                    return Err(SegError::Format(format!("only 2D and 3D images are supported, got NDims = {}", ndims)));
                }
            }
            "DimSize" => dims = Some(parse_values::<3>(key, value, ndims)?),
            "ElementSpacing" | "ElementSize" => {
                spacing = parse_values::<3>(key, value, ndims)?;
                spacing[ndims..].iter_mut().for_each(|v| *v = 1.0);
            }
            "Offset" | "Origin" | "Position" => origin = parse_values::<3>(key, value, ndims)?,
            "TransformMatrix" | "Rotation" | "Orientation" => {
                direction = parse_values::<9>(key, value, ndims)?
            }
            "ElementType" => element_type = Some(ElementType::parse(value)?),
            "ElementNumberOfChannels" => {
                channels = value
                    .parse()
                    .map_err(|_| SegError::Format(format!("invalid channel count '{}'", value)))?;
            }
            "BinaryDataByteOrderMSB" | "ElementByteOrderMSB" => big_endian = parse_bool(key, value)?,
            "CompressedData" => {
                if parse_bool(key, value)? {
                    return Err(SegError::Format("compressed MetaImage data is not supported".to_string()));
                }
            }
            "HeaderSize" => {
                data_offset = value.parse().map_err(|_| {
                    SegError::Format(format!("HeaderSize must be a non-negative byte count, got '{}'", value))
                })?;
            }
            "ElementDataFile" => {
                if ndims == 0 {
                    return Err(SegError::Format("NDims missing before ElementDataFile".to_string()));
                }
                let dims = dims.ok_or_else(|| SegError::Format("DimSize missing".to_string()))?;
                let element_type =
                    element_type.ok_or_else(|| SegError::Format("ElementType missing".to_string()))?;
                let mut shape = [1usize; 3];
                for axis in 0..ndims {
                    if dims[axis] < 1.0 || dims[axis].fract() != 0.0 || dims[axis] > usize::MAX as f64 {
                        return Err(SegError::Format(format!("invalid DimSize {:?}", dims)));
                    }
                    shape[axis] = dims[axis] as usize;
                }
                let data_file = match value {
                    "LOCAL" => None,
                    "LIST" => {
                        return Err(SegError::Format("ElementDataFile = LIST is not supported".to_string()))
                    }
                    file => Some(file.to_string()),
                };
                let header = Header {
                    shape,
                    channels: channels.max(1),
                    geometry: Geometry::new(origin, spacing, DMat3::from_cols_array(&direction))?,
                    element_type,
                    big_endian,
                    data_file,
                    data_offset,
                };
                return Ok((header, pos.min(bytes.len())));
            }
            _ => {}
        }
    }
    Err(SegError::Format("header has no ElementDataFile entry".to_string()))
}

macro_rules! decode_as {
    ($ty:ty, $raw:expr, $big:expr) => {
        $raw.chunks_exact(std::mem::size_of::<$ty>())
            .map(|c| {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(c);
                (if $big { <$ty>::from_be_bytes(buf) } else { <$ty>::from_le_bytes(buf) }) as f32
            })
            .collect::<Vec<f32>>()
    };
}

pub(super) fn decode(raw: &[u8], element_type: ElementType, big_endian: bool) -> Vec<f32> {
    match element_type {
        ElementType::UChar => raw.iter().map(|&b| b as f32).collect(),
        ElementType::Char => raw.iter().map(|&b| b as i8 as f32).collect(),
        ElementType::UShort => decode_as!(u16, raw, big_endian),
        ElementType::Short => decode_as!(i16, raw, big_endian),
        ElementType::UInt => decode_as!(u32, raw, big_endian),
        ElementType::Int => decode_as!(i32, raw, big_endian),
        ElementType::Float => decode_as!(f32, raw, big_endian),
        ElementType::Double => decode_as!(f64, raw, big_endian),
    }
}

/// Read a MetaImage as an `f32` volume
pub fn read(path: &Path) -> Result<Volume<f32>> {
    let bytes = std::fs::read(path)?;
    let (header, local_offset) = parse_header(&bytes)?;

    let external;
    let raw: &[u8] = match &header.data_file {
        None => &bytes[local_offset..],
        Some(file) => {
            let data_path = path.parent().map_or_else(|| PathBuf::from(file), |dir| dir.join(file));
            external = std::fs::read(&data_path)?;
            external.get(header.data_offset..).unwrap_or(&[])
        }
    };

    let expected = header.data_len()?;
    let voxels = voxel_count(header.shape);
    if raw.len() < expected {
        return Err(SegError::Format(format!(
            "{} holds {} data bytes, expected {}",
            path.display(),
            raw.len(),
            expected
        )));
    }
    let values = decode(&raw[..expected], header.element_type, header.big_endian);

    // Channels are interleaved per voxel on disk
    let data = if header.channels == 1 {
        values
    } else {
        let mut planar = vec![0.0f32; values.len()];
        for (v, chunk) in values.chunks_exact(header.channels).enumerate() {
            for (c, &value) in chunk.iter().enumerate() {
                planar[c * voxels + v] = value;
            }
        }
        planar
    };

    tracing::debug!(
        path = %path.display(),
        shape = ?header.shape,
        channels = header.channels,
        element = header.element_type.tag(),
        "Read MetaImage"
    );
    Volume::from_data(header.shape, header.channels, header.geometry, data)
}

fn format_values(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn header_text(shape: Shape3, channels: usize, geometry: &Geometry, element_type: ElementType, data_file: &str) -> String {
    let mut text = String::new();
    let shape: Vec<String> = shape.iter().map(|n| n.to_string()).collect();
    // Writing into a String cannot fail
    let _ = writeln!(text, "ObjectType = Image");
    let _ = writeln!(text, "NDims = 3");
    let _ = writeln!(text, "BinaryData = True");
    let _ = writeln!(text, "BinaryDataByteOrderMSB = False");
    let _ = writeln!(text, "CompressedData = False");
    let _ = writeln!(
        text,
        "TransformMatrix = {}",
        format_values(&geometry.direction().to_cols_array())
    );
    let _ = writeln!(text, "Offset = {}", format_values(&geometry.origin()));
    let _ = writeln!(text, "ElementSpacing = {}", format_values(&geometry.spacing()));
    let _ = writeln!(text, "DimSize = {}", shape.join(" "));
    if channels > 1 {
        let _ = writeln!(text, "ElementNumberOfChannels = {}", channels);
    }
    let _ = writeln!(text, "ElementType = {}", element_type.tag());
    let _ = writeln!(text, "ElementDataFile = {}", data_file);
    text
}

/// Write a header plus little-endian voxel bytes; `.mhd` gets a detached `.raw`
fn write_raw(
    path: &Path,
    shape: Shape3,
    channels: usize,
    geometry: &Geometry,
    element_type: ElementType,
    raw: Vec<u8>,
) -> Result<()> {
    let detached = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mhd"));

    if detached {
        let raw_path = path.with_extension("raw");
        let raw_name = raw_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SegError::Format(format!("invalid output path {}", path.display())))?
            .to_string();
        std::fs::write(&raw_path, raw)?;
        std::fs::write(path, header_text(shape, channels, geometry, element_type, &raw_name))?;
    } else {
        let mut bytes = header_text(shape, channels, geometry, element_type, "LOCAL").into_bytes();
        bytes.extend_from_slice(&raw);
        std::fs::write(path, bytes)?;
    }
    tracing::debug!(path = %path.display(), shape = ?shape, element = element_type.tag(), "Wrote MetaImage");
    Ok(())
}

/// Little-endian label bytes, one byte per voxel when every label fits
pub(super) fn label_bytes(labels: &LabelMap) -> (ElementType, Vec<u8>) {
    let max = labels.data().iter().copied().max().unwrap_or(0);
    if max <= u8::MAX as LabelId {
        (ElementType::UChar, labels.data().iter().map(|&l| l as u8).collect())
    } else {
        (
            ElementType::UShort,
            labels.data().iter().flat_map(|l| l.to_le_bytes()).collect(),
        )
    }
}

/// Write a label map, as `MET_UCHAR` when every label fits a byte
pub fn write_labels(path: &Path, labels: &LabelMap) -> Result<()> {
    let (element_type, raw) = label_bytes(labels);
    write_raw(path, labels.shape(), 1, labels.geometry(), element_type, raw)
}

/// Write an intensity volume as `MET_FLOAT`
pub fn write_volume(path: &Path, volume: &Volume<f32>) -> Result<()> {
    let voxels = volume.voxels();
    let channels = volume.channels();
    let mut raw = Vec::with_capacity(voxels * channels * 4);
    for v in 0..voxels {
        for c in 0..channels {
            raw.extend_from_slice(&volume.data()[c * voxels + v].to_le_bytes());
        }
    }
    write_raw(path, volume.shape(), channels, volume.geometry(), ElementType::Float, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oblique_geometry() -> Geometry {
        let angle = 0.3f64;
        let direction = DMat3::from_cols_array(&[
            angle.cos(),
            angle.sin(),
            0.0,
            -angle.sin(),
            angle.cos(),
            0.0,
            0.0,
            0.0,
            1.0,
        ]);
        Geometry::new([-120.25, 33.1, 7.0], [0.8, 0.8, 2.5], direction).unwrap()
    }

    #[test]
    fn test_labels_round_trip_with_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.mha");
        let mut labels = LabelMap::background([3, 4, 2], oblique_geometry()).unwrap();
        labels.set(0, [2, 3, 1], 117);
        labels.set(0, [0, 1, 0], 5);

        write_labels(&path, &labels).unwrap();
        let back = read(&path).unwrap();
        assert_eq!(back.geometry(), labels.geometry());
        assert_eq!(back.shape(), [3, 4, 2]);
        assert_eq!(back.get(0, [2, 3, 1]), Some(117.0));
        assert_eq!(back.get(0, [0, 1, 0]), Some(5.0));
    }

    #[test]
    fn test_large_labels_use_ushort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.mhd");
        let mut labels = LabelMap::background([2, 2, 2], Geometry::with_spacing([1.0; 3]).unwrap()).unwrap();
        labels.set(0, [1, 1, 1], 300);

        write_labels(&path, &labels).unwrap();
        assert!(dir.path().join("seg.raw").is_file());
        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.contains("ElementType = MET_USHORT"));
        assert_eq!(read(&path).unwrap().get(0, [1, 1, 1]), Some(300.0));
    }

    #[test]
    fn test_reads_big_endian_short_2d() {
        let mut bytes = b"ObjectType = Image\nNDims = 2\nDimSize = 2 1\nElementSpacing = 0.5 0.7\n\
BinaryDataByteOrderMSB = True\nElementType = MET_SHORT\nElementDataFile = LOCAL\n"
            .to_vec();
        bytes.extend_from_slice(&(-1000i16).to_be_bytes());
        bytes.extend_from_slice(&(40i16).to_be_bytes());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct.mha");
        std::fs::write(&path, bytes).unwrap();

        let volume = read(&path).unwrap();
        assert_eq!(volume.shape(), [2, 1, 1]);
        assert_eq!(volume.geometry().spacing(), [0.5, 0.7, 1.0]);
        assert_eq!(volume.data(), &[-1000.0, 40.0]);
    }

    #[test]
    fn test_truncated_data_is_format_error() {
        let mut bytes = b"NDims = 3\nDimSize = 2 2 2\nElementType = MET_FLOAT\nElementDataFile = LOCAL\n".to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.mha");
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(read(&path), Err(SegError::Format(_))));
    }

    #[test]
    fn test_oversized_dims_are_format_error() {
        let bytes = b"NDims = 3\nDimSize = 4294967296 4294967296 4294967296\n\
ElementType = MET_FLOAT\nElementDataFile = LOCAL\n";
        let (header, _) = parse_header(bytes).unwrap();
        assert!(matches!(header.data_len(), Err(SegError::Format(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.mha");
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(read(&path), Err(SegError::Format(_))));
    }

    #[test]
    fn test_channel_count_overflow_is_format_error() {
        let bytes = format!(
            "NDims = 3\nDimSize = 2 2 2\nElementNumberOfChannels = {}\nElementType = MET_DOUBLE\nElementDataFile = LOCAL\n",
            usize::MAX / 4
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.mha");
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(read(&path), Err(SegError::Format(_))));
    }

    #[test]
    fn test_multichannel_volume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probs.mha");
        let geometry = Geometry::with_spacing([1.0, 2.0, 3.0]).unwrap();
        let data: Vec<f32> = (0..16).map(|v| v as f32 * 0.5).collect();
        let volume = Volume::from_data([2, 2, 2], 2, geometry, data).unwrap();

        write_volume(&path, &volume).unwrap();
        assert_eq!(read(&path).unwrap(), volume);
    }
}
