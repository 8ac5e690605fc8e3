//! Saving and loading parameter tensors.
//!
//! # Checkpoint Format
//!
//! ```text
//! ┌────────────┬──────────────────────────────────┐
//! │ Header     │ Tensor, repeated `count` times   │
//! ├────────────┼──────────────────────────────────┤
//! │ "tgrd"[4]  │ u64: rank                        │
//! │ u32: count │ [u64; rank] shape                │
//! │            │ [f64; prod(shape)] data          │
//! └────────────┴──────────────────────────────────┘
//! ```
//!
//! All integers and floats are little-endian. Every record is checked with
//! `briny`'s [`Validate`] before it becomes a [`Tensor`]: no zero dimension,
//! an element count that matches the shape, and only finite values.
//!
//! # Example
//!
//! ```rust
//! use tapegrad::{modelio::{load_parameters, save_parameters}, tensor};
//!
//! let path = std::env::temp_dir().join("tapegrad-modelio-doc.tgrd");
//! save_parameters(&path, &[tensor!([[1.0, 2.0], [3.0, 4.0]])]).unwrap();
//! let loaded = load_parameters(&path).unwrap();
//! assert_eq!(loaded[0].shape(), &[2, 2]);
//! # std::fs::remove_file(&path).ok();
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use briny::prelude::*;

use crate::error::{GradError, Result};
use crate::tensors::Tensor;

const MAGIC: &[u8; 4] = b"tgrd";
/// Upper bound on up-front allocation while reading; larger tensors grow.
const MAX_PREALLOC: usize = 1 << 20;

struct PackedTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Validate for PackedTensor {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.shape.contains(&0) {
            return Err(ValidationError);
        }
        let expected = self
            .shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or(ValidationError)?;
        if self.data.len() != expected || !self.data.iter().all(|v| v.is_finite()) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Writes `tensors` to `path`, replacing any existing file.
///
/// # Errors
/// [`GradError::Io`] on any write failure, [`GradError::Checkpoint`] for
/// more tensors than the header can count.
pub fn save_parameters(path: impl AsRef<Path>, tensors: &[Tensor]) -> Result<()> {
    let count = u32::try_from(tensors.len()).map_err(|_| GradError::Checkpoint("too many tensors"))?;
    let mut file = BufWriter::new(File::create(path.as_ref())?);

    file.write_all(MAGIC)?;
    file.write_all(&count.to_le_bytes())?;
    for tensor in tensors {
        file.write_all(&(tensor.rank() as u64).to_le_bytes())?;
        for &dim in tensor.shape() {
            file.write_all(&(dim as u64).to_le_bytes())?;
        }
        for &value in tensor.data() {
            file.write_all(&value.to_le_bytes())?;
        }
    }
    file.flush()?;
    tracing::debug!(path = %path.as_ref().display(), tensors = tensors.len(), "parameters saved");
    Ok(())
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_usize(reader: &mut impl Read) -> Result<usize> {
    usize::try_from(read_u64(reader)?).map_err(|_| GradError::Checkpoint("dimension overflows usize"))
}

/// Reads every tensor stored at `path`.
///
/// # Errors
/// [`GradError::Io`] for unreadable or truncated files,
/// [`GradError::Checkpoint`] for a wrong magic header or a record that
/// fails validation.
pub fn load_parameters(path: impl AsRef<Path>) -> Result<Vec<Tensor>> {
    let mut file = BufReader::new(File::open(path.as_ref())?);

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(GradError::Checkpoint("invalid magic header"));
    }
    let mut count = [0u8; 4];
    file.read_exact(&mut count)?;
    let count = u32::from_le_bytes(count) as usize;

    let mut tensors = Vec::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        let rank = read_usize(&mut file)?;
        let mut shape = Vec::with_capacity(rank.min(MAX_PREALLOC));
        for _ in 0..rank {
            shape.push(read_usize(&mut file)?);
        }
        let size = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or(GradError::Checkpoint("tensor size overflows usize"))?;

        let mut data = Vec::with_capacity(size.min(MAX_PREALLOC));
        for _ in 0..size {
            data.push(f64::from_bits(read_u64(&mut file)?));
        }

        let packed = TrustedData::new(PackedTensor { shape, data })
            .map_err(|_| GradError::Checkpoint("tensor record failed validation"))?
            .into_inner();
        tensors.push(Tensor::new(packed.shape, packed.data)?);
    }
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    fn temp(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tapegrad-{}-{name}", std::process::id()))
    }

    #[test]
    fn round_trips_mixed_ranks() {
        let path = temp("mixed.tgrd");
        let tensors = vec![tensor!([[1.5, -2.0], [0.0, 4.25]]), tensor!([0.1, 0.2, 0.3])];
        save_parameters(&path, &tensors).unwrap();
        assert_eq!(load_parameters(&path).unwrap(), tensors);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_foreign_files() {
        let path = temp("foreign.tgrd");
        std::fs::write(&path, b"bpat\x01\x00\x00\x00").unwrap();
        assert!(matches!(load_parameters(&path), Err(GradError::Checkpoint(_))));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_non_finite_values() {
        let path = temp("nan.tgrd");
        save_parameters(&path, &[tensor!([1.0, f64::NAN])]).unwrap();
        assert!(matches!(load_parameters(&path), Err(GradError::Checkpoint(_))));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn truncated_file_is_an_io_error() {
        let path = temp("short.tgrd");
        save_parameters(&path, &[tensor!([1.0, 2.0])]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(matches!(load_parameters(&path), Err(GradError::Io(_))));
        std::fs::remove_file(&path).ok();
    }
}
