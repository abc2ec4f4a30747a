//! Reader and writer for the `.mda` array container.
//!
//! Layout: little-endian `i32` element-type code, `i32` bytes per element,
//! `i32` dimension count (negative when dimensions are stored as `i64`),
//! the dimensions, then the elements in column-major order.
//!
//! Tables handled in-process are at most two-dimensional `[rows, records]`.
//! Values are widened to `f64` for processing and narrowed back to the
//! table's element type on write. Callers that produce values outside that
//! type's exact range switch the table to `F64` first.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ndarray::{Array1, Array2, Axis, ShapeBuilder};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Largest dimension count accepted in a header.
const MAX_DIMS: usize = 50;

/// Errors raised while reading or writing `.mda` data.
#[derive(Error, Debug)]
pub enum MdaError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed header: {0}")]
    Header(String),

    #[error("unsupported element type code {0}")]
    UnsupportedType(i32),

    #[error("unsupported rank {0} (tables must have 1 or 2 dimensions)")]
    UnsupportedRank(usize),

    #[error("truncated data: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
}

pub type Result<T> = std::result::Result<T, MdaError>;

/// Element types understood by the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    U8,
    F32,
    I16,
    I32,
    U16,
    F64,
    U32,
}

impl ElementType {
    /// Header code for this element type.
    pub fn code(self) -> i32 {
        match self {
            ElementType::U8 => -2,
            ElementType::F32 => -3,
            ElementType::I16 => -4,
            ElementType::I32 => -5,
            ElementType::U16 => -6,
            ElementType::F64 => -7,
            ElementType::U32 => -8,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            -2 => Ok(ElementType::U8),
            -3 => Ok(ElementType::F32),
            -4 => Ok(ElementType::I16),
            -5 => Ok(ElementType::I32),
            -6 => Ok(ElementType::U16),
            -7 => Ok(ElementType::F64),
            -8 => Ok(ElementType::U32),
            other => Err(MdaError::UnsupportedType(other)),
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::F32 | ElementType::I32 | ElementType::U32 => 4,
            ElementType::F64 => 8,
        }
    }

    fn get(self, buf: &mut impl Buf) -> f64 {
        match self {
            ElementType::U8 => buf.get_u8() as f64,
            ElementType::F32 => buf.get_f32_le() as f64,
            ElementType::I16 => buf.get_i16_le() as f64,
            ElementType::I32 => buf.get_i32_le() as f64,
            ElementType::U16 => buf.get_u16_le() as f64,
            ElementType::F64 => buf.get_f64_le(),
            ElementType::U32 => buf.get_u32_le() as f64,
        }
    }

    fn put(self, buf: &mut impl BufMut, value: f64) {
        match self {
            ElementType::U8 => buf.put_u8(value as u8),
            ElementType::F32 => buf.put_f32_le(value as f32),
            ElementType::I16 => buf.put_i16_le(value as i16),
            ElementType::I32 => buf.put_i32_le(value as i32),
            ElementType::U16 => buf.put_u16_le(value as u16),
            ElementType::F64 => buf.put_f64_le(value),
            ElementType::U32 => buf.put_u32_le(value as u32),
        }
    }
}

/// Parsed `.mda` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdaHeader {
    pub element_type: ElementType,
    pub dims: Vec<usize>,
    /// Header length in bytes (offset of the first element)
    pub header_len: usize,
}

impl MdaHeader {
    /// Read only the header of a file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let io_err = |source| MdaError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = std::fs::File::open(path).map_err(io_err)?;

        let mut fixed = [0u8; 12];
        file.read_exact(&mut fixed).map_err(io_err)?;
        let num_dims = (&fixed[8..12]).get_i32_le();
        let dim_width = if num_dims < 0 { 8 } else { 4 };
        let rank = num_dims.unsigned_abs() as usize;
        if rank == 0 || rank > MAX_DIMS {
            return Err(MdaError::Header(format!("invalid dimension count {}", num_dims)));
        }

        let mut rest = vec![0u8; rank * dim_width];
        file.read_exact(&mut rest).map_err(io_err)?;

        let mut buf = Vec::with_capacity(fixed.len() + rest.len());
        buf.extend_from_slice(&fixed);
        buf.extend_from_slice(&rest);
        Self::parse(&buf)
    }

    /// Parse a header from the start of a buffer.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < 12 {
            return Err(MdaError::Header(format!(
                "need at least 12 bytes, found {}",
                buf.remaining()
            )));
        }

        let element_type = ElementType::from_code(buf.get_i32_le())?;
        let bytes_per_entry = buf.get_i32_le();
        if bytes_per_entry as usize != element_type.size() {
            return Err(MdaError::Header(format!(
                "{:?} expects {} bytes per entry, header says {}",
                element_type,
                element_type.size(),
                bytes_per_entry
            )));
        }

        let num_dims = buf.get_i32_le();
        let wide = num_dims < 0;
        let rank = num_dims.unsigned_abs() as usize;
        if rank == 0 || rank > MAX_DIMS {
            return Err(MdaError::Header(format!("invalid dimension count {}", num_dims)));
        }

        let dim_width = if wide { 8 } else { 4 };
        if buf.remaining() < rank * dim_width {
            return Err(MdaError::Header("truncated dimension list".to_string()));
        }

        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            let dim = if wide { buf.get_i64_le() } else { buf.get_i32_le() as i64 };
            if dim < 0 {
                return Err(MdaError::Header(format!("negative dimension {}", dim)));
            }
            dims.push(dim as usize);
        }

        Ok(Self {
            element_type,
            dims,
            header_len: 12 + rank * dim_width,
        })
    }

    /// Total number of elements described by the header.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// First dimension (channels for a timeseries, rows for a table).
    pub fn dim0(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    /// Second dimension (samples for a timeseries, records for a table).
    pub fn dim1(&self) -> usize {
        self.dims.get(1).copied().unwrap_or(1)
    }
}

/// An in-memory table `[rows, records]` decoded from an `.mda` artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct MdaTable {
    pub element_type: ElementType,
    pub data: Array2<f64>,
    /// Whether the source was one-dimensional (written back the same way)
    pub one_dimensional: bool,
}

impl MdaTable {
    /// Create a two-dimensional table.
    pub fn new(element_type: ElementType, data: Array2<f64>) -> Self {
        Self {
            element_type,
            data,
            one_dimensional: false,
        }
    }

    /// Create a one-dimensional table (a single row).
    pub fn from_row(element_type: ElementType, values: Vec<f64>) -> Self {
        let data = Array1::from(values).insert_axis(Axis(0));
        Self {
            element_type,
            data,
            one_dimensional: true,
        }
    }

    /// Number of rows (fields per record).
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of records (columns).
    pub fn records(&self) -> usize {
        self.data.ncols()
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| MdaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(&bytes)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.encode()).map_err(|source| MdaError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = MdaHeader::parse(bytes)?;
        let (rows, records, one_dimensional) = match header.dims.as_slice() {
            [n] => (1, *n, true),
            [m, n] => (*m, *n, false),
            other => return Err(MdaError::UnsupportedRank(other.len())),
        };

        let expected = rows
            .checked_mul(records)
            .and_then(|n| n.checked_mul(header.element_type.size()))
            .ok_or_else(|| {
                MdaError::Header(format!("dimensions {}x{} overflow the addressable size", rows, records))
            })?;
        let mut body = &bytes[header.header_len..];
        if body.remaining() < expected {
            return Err(MdaError::Truncated {
                expected,
                found: body.remaining(),
            });
        }

        let mut values = Vec::with_capacity(rows * records);
        for _ in 0..rows * records {
            values.push(header.element_type.get(&mut body));
        }

        let data = Array2::from_shape_vec((rows, records).f(), values)
            .map_err(|e| MdaError::Header(e.to_string()))?;

        Ok(Self {
            element_type: header.element_type,
            data,
            one_dimensional,
        })
    }

    pub fn encode(&self) -> Bytes {
        let element_type = self.element_type;
        let rank = if self.one_dimensional && self.rows() == 1 { 1 } else { 2 };
        let mut buf = BytesMut::with_capacity(12 + rank * 4 + self.data.len() * element_type.size());

        buf.put_i32_le(element_type.code());
        buf.put_i32_le(element_type.size() as i32);
        buf.put_i32_le(rank as i32);
        if rank == 2 {
            buf.put_i32_le(self.rows() as i32);
        }
        buf.put_i32_le(self.records() as i32);

        // Transposed logical iteration yields column-major element order
        for &value in self.data.t().iter() {
            element_type.put(&mut buf, value);
        }

        buf.freeze()
    }
}
