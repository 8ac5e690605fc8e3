//! Backend selection module.
//!
//! Chooses where forward matrix products run.
//!
//! # Supported Backends
//!
//! - `Cpu`: rayon kernels in `f64` (default, bit-reproducible).
//! - `Wgpu`: WGSL compute kernel in `f32`, only with the `wgpu` feature.
//!   Gradients are always computed on the CPU, and any GPU failure falls back
//!   to the CPU kernel.
//!
//! The backend is stored globally using an `AtomicU8`, so it can be switched
//! between batches without threading a handle through the graph.

use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Multi-threaded CPU kernels (default).
    #[default]
    Cpu = 0,
    /// GPU matmul through `wgpu`.
    Wgpu = 1,
}

impl TryFrom<u8> for Backend {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            other => Err(other),
        }
    }
}

static GLOBAL_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the active backend.
///
/// Selecting [`Backend::Wgpu`] without the `wgpu` feature is allowed; every
/// operation then keeps running on the CPU.
///
/// # Example
///
/// ```
/// use tapegrad::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(backend: Backend) {
    tracing::debug!(?backend, "backend selected");
    GLOBAL_BACKEND.store(backend as u8, Ordering::Release);
}

/// Returns the currently active backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
#[must_use]
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        assert_eq!(Backend::try_from(Backend::Wgpu as u8), Ok(Backend::Wgpu));
        assert_eq!(Backend::try_from(9), Err(9));
    }
}
