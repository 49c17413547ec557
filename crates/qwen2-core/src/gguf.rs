//! GGUF container reader.
//!
//! Parses the header, metadata key-value table, and tensor descriptor
//! block of a little-endian GGUF file from any [`std::io::Read`], then
//! hands back [`TensorInfo`] entries the caller resolves against a
//! memory-mapped byte region (see [`crate::mmap::MmapModel`]).
//!
//! https://github.com/ggml-org/ggml/blob/master/docs/gguf.md describes
//! the on-disk layout this module implements.

use std::collections::HashMap;
use std::io::Read;

use crate::error::{Error, Result};

const GGUF_MAGIC: u32 = 0x4655_4747;
const DEFAULT_ALIGNMENT: u64 = 32;

/// GGML tensor element encoding. Only F32, Q4_0 and Q8_0 are dequantized
/// by this crate; other ids are recognized (for error messages) but not
/// readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Other(u32),
}

impl GgmlType {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => GgmlType::F32,
            1 => GgmlType::F16,
            2 => GgmlType::Q4_0,
            3 => GgmlType::Q4_1,
            6 => GgmlType::Q5_0,
            7 => GgmlType::Q5_1,
            8 => GgmlType::Q8_0,
            9 => GgmlType::Q8_1,
            other => GgmlType::Other(other),
        }
    }

    /// Number of elements per quantization block (1 for unquantized types).
    pub fn block_size(&self) -> u64 {
        match self {
            GgmlType::F32 | GgmlType::F16 => 1,
            GgmlType::Q4_0
            | GgmlType::Q4_1
            | GgmlType::Q5_0
            | GgmlType::Q5_1
            | GgmlType::Q8_0
            | GgmlType::Q8_1 => 32,
            GgmlType::Other(_) => 1,
        }
    }

    /// Number of bytes a single block occupies on disk.
    pub fn type_size(&self) -> u64 {
        match self {
            GgmlType::F32 => 4,
            GgmlType::F16 => 2,
            GgmlType::Q4_0 => 18,
            GgmlType::Q4_1 => 20,
            GgmlType::Q5_0 => 22,
            GgmlType::Q5_1 => 24,
            GgmlType::Q8_0 => 34,
            GgmlType::Q8_1 => 40,
            GgmlType::Other(_) => 0,
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, GgmlType::F32 | GgmlType::Q4_0 | GgmlType::Q8_0)
    }
}

/// A single decoded GGUF metadata value. Arrays may nest.
#[derive(Debug, Clone)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
}

impl GgufValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            GgufValue::U32(v) => Some(*v),
            GgufValue::I32(v) if *v >= 0 => Some(*v as u32),
            GgufValue::U64(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            GgufValue::F32(v) => Some(*v),
            GgufValue::F64(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            GgufValue::Array(arr) => Some(arr.as_slice()),
            _ => None,
        }
    }
}

/// Tensor descriptor: name, shape and the byte window it occupies in the
/// tensor-data region (relative to [`GgufFile::data_offset`]).
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub ggml_type: GgmlType,
    /// Byte offset from the start of the tensor-data region.
    pub offset: u64,
}

impl TensorInfo {
    pub fn element_count(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Number of bytes this tensor occupies on disk.
    pub fn size_bytes(&self) -> u64 {
        let elements = self.element_count();
        let block = self.ggml_type.block_size();
        let blocks = elements.div_ceil(block);
        blocks * self.ggml_type.type_size()
    }
}

/// A fully parsed GGUF header: metadata table plus tensor index.
pub struct GgufFile {
    pub version: u32,
    pub metadata: HashMap<String, GgufValue>,
    pub tensors: Vec<TensorInfo>,
    /// Byte offset of the tensor-data region from the start of the file.
    pub data_offset: u64,
    pub alignment: u64,
}

impl GgufFile {
    /// Parse a GGUF stream up through the tensor descriptor block,
    /// leaving `data_offset` pointing at the (alignment-padded) start of
    /// the tensor-data region. The caller is responsible for mapping the
    /// actual bytes (see [`crate::mmap::MmapModel`]).
    pub fn parse<R: Read>(reader: &mut R) -> Result<Self> {
        let mut consumed = 0u64;

        let magic = read_u32(reader, &mut consumed)?;
        if magic != GGUF_MAGIC {
            return Err(Error::format(format!(
                "bad GGUF magic: expected {GGUF_MAGIC:#x}, found {magic:#x}"
            )));
        }

        let version = read_u32(reader, &mut consumed)?;
        if version != 2 && version != 3 {
            return Err(Error::format(format!("unsupported GGUF version: {version}")));
        }

        let tensor_count = read_u64(reader, &mut consumed)?;
        let metadata_count = read_u64(reader, &mut consumed)?;

        let mut metadata = HashMap::with_capacity(metadata_count as usize);
        for _ in 0..metadata_count {
            let key = read_string(reader, &mut consumed)?;
            let value = read_value(reader, &mut consumed)?;
            metadata.insert(key, value);
        }

        let alignment = metadata
            .get("general.alignment")
            .and_then(GgufValue::as_u32)
            .map(|v| v as u64)
            .unwrap_or(DEFAULT_ALIGNMENT);
        if alignment == 0 || (alignment & (alignment - 1)) != 0 {
            return Err(Error::format(format!(
                "general.alignment {alignment} is not a power of two"
            )));
        }

        let mut tensors = Vec::with_capacity(tensor_count as usize);
        for _ in 0..tensor_count {
            let name = read_string(reader, &mut consumed)?;
            if name.len() > 64 {
                return Err(Error::format(format!("tensor name too long: {name}")));
            }
            let n_dims = read_u32(reader, &mut consumed)?;
            if n_dims > 4 {
                return Err(Error::format(format!("tensor {name} has {n_dims} dims, max 4")));
            }
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(read_u64(reader, &mut consumed)?);
            }
            let type_id = read_u32(reader, &mut consumed)?;
            let ggml_type = GgmlType::from_u32(type_id);
            let offset = read_u64(reader, &mut consumed)?;
            if offset % alignment != 0 {
                return Err(Error::format(format!(
                    "tensor {name} offset {offset} is not a multiple of alignment {alignment}"
                )));
            }
            tensors.push(TensorInfo {
                name,
                dims,
                ggml_type,
                offset,
            });
        }

        let data_offset = consumed.div_ceil(alignment) * alignment;

        Ok(Self {
            version,
            metadata,
            tensors,
            data_offset,
            alignment,
        })
    }

    /// `general.architecture`, if present.
    pub fn architecture(&self) -> Option<&str> {
        self.metadata.get("general.architecture").and_then(GgufValue::as_str)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.metadata.get(key).and_then(GgufValue::as_u32)
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.metadata.get(key).and_then(GgufValue::as_f32)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(GgufValue::as_str)
    }

    pub fn get_array(&self, key: &str) -> Option<&[GgufValue]> {
        self.metadata.get(key).and_then(GgufValue::as_array)
    }

    pub fn tensor_index(&self, name: &str) -> Option<usize> {
        self.tensors.iter().position(|t| t.name == name)
    }
}

fn read_u8<R: Read>(reader: &mut R, consumed: &mut u64) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    *consumed += 1;
    Ok(buf[0])
}

fn read_u16<R: Read>(reader: &mut R, consumed: &mut u64) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    *consumed += 2;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R, consumed: &mut u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    *consumed += 4;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R, consumed: &mut u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    *consumed += 8;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R, consumed: &mut u64) -> Result<f32> {
    Ok(f32::from_bits(read_u32(reader, consumed)?))
}

fn read_f64<R: Read>(reader: &mut R, consumed: &mut u64) -> Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    *consumed += 8;
    Ok(f64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R, consumed: &mut u64) -> Result<String> {
    let len = read_u64(reader, consumed)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    *consumed += len as u64;
    String::from_utf8(buf).map_err(|e| Error::format(format!("invalid UTF-8 metadata string: {e}")))
}

/// Reads a single typed metadata value given its 32-bit type tag.
fn read_typed_value<R: Read>(reader: &mut R, consumed: &mut u64, type_id: u32) -> Result<GgufValue> {
    let value = match type_id {
        0 => GgufValue::U8(read_u8(reader, consumed)?),
        1 => GgufValue::I8(read_u8(reader, consumed)? as i8),
        2 => GgufValue::U16(read_u16(reader, consumed)?),
        3 => GgufValue::I16(read_u16(reader, consumed)? as i16),
        4 => GgufValue::U32(read_u32(reader, consumed)?),
        5 => GgufValue::I32(read_u32(reader, consumed)? as i32),
        6 => GgufValue::F32(read_f32(reader, consumed)?),
        7 => GgufValue::Bool(read_u8(reader, consumed)? != 0),
        8 => GgufValue::String(read_string(reader, consumed)?),
        9 => {
            let inner_type = read_u32(reader, consumed)?;
            let len = read_u64(reader, consumed)?;
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_typed_value(reader, consumed, inner_type)?);
            }
            GgufValue::Array(items)
        }
        10 => GgufValue::U64(read_u64(reader, consumed)?),
        11 => GgufValue::I64(read_u64(reader, consumed)? as i64),
        12 => GgufValue::F64(read_f64(reader, consumed)?),
        other => return Err(Error::format(format!("unknown GGUF value type code {other}"))),
    };
    Ok(value)
}

fn read_value<R: Read>(reader: &mut R, consumed: &mut u64) -> Result<GgufValue> {
    let type_id = read_u32(reader, consumed)?;
    read_typed_value(reader, consumed, type_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn parses_minimal_header() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&1u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&1u64.to_le_bytes()); // metadata_count

        // metadata: general.architecture = "qwen2"
        write_string(&mut buf, "general.architecture");
        buf.extend_from_slice(&8u32.to_le_bytes()); // STRING
        write_string(&mut buf, "qwen2");

        // tensor: token_embd.weight, 2 dims, F32, offset 0
        write_string(&mut buf, "token_embd.weight");
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&4u64.to_le_bytes());
        buf.extend_from_slice(&8u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // F32
        buf.extend_from_slice(&0u64.to_le_bytes()); // offset

        let mut cursor = Cursor::new(buf);
        let gguf = GgufFile::parse(&mut cursor).unwrap();
        assert_eq!(gguf.version, 3);
        assert_eq!(gguf.architecture(), Some("qwen2"));
        assert_eq!(gguf.tensors.len(), 1);
        assert_eq!(gguf.tensors[0].name, "token_embd.weight");
        assert_eq!(gguf.tensors[0].size_bytes(), 4 * 32);
        assert_eq!(gguf.data_offset % gguf.alignment, 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 16];
        let mut cursor = Cursor::new(buf);
        assert!(GgufFile::parse(&mut cursor).is_err());
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        buf.extend_from_slice(&99u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(GgufFile::parse(&mut cursor).is_err());
    }
}
