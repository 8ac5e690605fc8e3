//! Operation Dispatch Layer
//!
//! Selects the kernel for forward matrix products at runtime, based on the
//! global [`Backend`](crate::backend::Backend).
//!
//! 1. `Wgpu` (if the feature is enabled and a device is available)
//! 2. Falls back to `Cpu`
//!
//! Backward products never dispatch: they always run the `f64` CPU kernels.

use crate::backend::{Backend, get_backend};

/// `C = A × B` for row-major `A: m×k`, `B: k×n` on the active backend.
#[must_use]
pub fn matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    match get_backend() {
        Backend::Wgpu => {
            #[cfg(feature = "wgpu")]
            {
                match super::wgpu::matmul(a, b, m, k, n) {
                    Ok(out) => return out,
                    Err(err) => tracing::warn!(%err, "gpu matmul failed, using cpu"),
                }
            }
        }
        Backend::Cpu => {}
    }

    super::cpu::matmul(a, b, m, k, n)
}
