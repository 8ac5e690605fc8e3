//! Utilities to approximate equality of floating point values.
//!
//! Differences are measured relative to the larger magnitude, but never
//! relative to less than `1.0`, so values near zero are compared absolutely.

use crate::tensors::Tensor;

/// Upper bound of [`ApproxEquality::Precise`].
pub const F64_MIN_ERROR: f64 = 1e-12;

/// Upper bound of [`ApproxEquality::Partial`].
pub const F64_AVG_ERROR: f64 = 1e-6;

/// Upper bound of [`ApproxEquality::Relative`].
pub const F64_MAX_ERROR: f64 = 1e-3;

/// `|a − b| / max(|a|, |b|, 1)`.
#[must_use]
pub fn relative_error(a: f64, b: f64) -> f64 {
    (a - b).abs() / a.abs().max(b.abs()).max(1.0)
}

/// How close two values are, from best to worst.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within rounding noise.
    Precise = 0,
    /// Good enough for analytic-vs-analytic comparisons.
    Partial = 1,
    /// Good enough for finite differences.
    Relative = 2,
    /// Not equal.
    Scarce = 3,
}

impl ApproxEquality {
    #[must_use]
    pub fn grade(error: f64) -> Self {
        if error <= F64_MIN_ERROR {
            Self::Precise
        } else if error <= F64_AVG_ERROR {
            Self::Partial
        } else if error <= F64_MAX_ERROR {
            Self::Relative
        } else {
            Self::Scarce
        }
    }
}

/// Grades the distance between `self` and `rhs`.
pub trait RelativeEq<Rhs: ?Sized = Self> {
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq for f64 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.is_nan() || rhs.is_nan() {
            return ApproxEquality::Scarce;
        }
        ApproxEquality::grade(relative_error(*self, *rhs))
    }
}

/// The worst element decides; slices of different lengths are never equal.
impl RelativeEq for [f64] {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        self.iter()
            .zip(rhs)
            .map(|(a, b)| a.approx_eq(b))
            .max()
            .unwrap_or(ApproxEquality::Precise)
    }
}

impl RelativeEq for Tensor {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.shape() != rhs.shape() {
            return ApproxEquality::Scarce;
        }
        self.data().approx_eq(rhs.data())
    }
}

/// True when `a` and `b` grade [`Partial`](ApproxEquality::Partial) or better.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Partial
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn grades_scalars() {
        assert_eq!(1.0f64.approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!(1.0f64.approx_eq(&(1.0 + 1e-8)), ApproxEquality::Partial);
        assert_eq!(1000.0f64.approx_eq(&1000.5), ApproxEquality::Relative);
        assert_eq!(0.0f64.approx_eq(&0.1), ApproxEquality::Scarce);
        assert_eq!(f64::NAN.approx_eq(&f64::NAN), ApproxEquality::Scarce);
    }

    #[test]
    fn worst_element_decides() {
        let a = [1.0, 2.0, 3.0];
        let b = [1.0, 2.5, 3.0 + 1e-9];
        assert_eq!(a[..].approx_eq(&b[..]), ApproxEquality::Scarce);
        assert!(!approx_eq(&a[..], &b[..]));
    }

    #[test]
    fn tensors_compare_shape_first() {
        let a = tensor!([[1.0, 2.0]]);
        let b = tensor!([1.0, 2.0]);
        assert_eq!(a.approx_eq(&b), ApproxEquality::Scarce);
        assert!(approx_eq(&b, &tensor!([1.0, 2.0 + 1e-13])));
    }
}
