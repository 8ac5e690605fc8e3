//! Parallel CPU kernels.
//!
//! # CPU Backend
//!
//! Plain slice kernels used by every primitive's forward and backward rule.
//! Shape checking happens in [`ops`](crate::ops); these functions trust the
//! dimensions they are given.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon), one task per
//!   output row
//! - Numerically stable sigmoid and (log-)softmax
//!
//! ## Determinism
//!
//! Every output element is produced by a single sequential loop with a fixed
//! summation order. Rayon only decides which thread runs that loop, so the
//! results are bit-identical from run to run.

use rayon::prelude::*;

/// `C = A × B` for row-major `A: m×k`, `B: k×n`.
#[must_use]
pub fn matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (j, cell) in row.iter_mut().enumerate() {
            let mut sum = 0.0;
            for (l, &x) in a_row.iter().enumerate() {
                sum += x * b[l * n + j];
            }
            *cell = sum;
        }
    });
    out
}

/// `G × Bᵗ` for `G: m×n`, `B: k×n`; result is `m×k`.
#[must_use]
pub fn matmul_bt(g: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * k];
    out.par_chunks_mut(k).enumerate().for_each(|(i, row)| {
        let g_row = &g[i * n..(i + 1) * n];
        for (l, cell) in row.iter_mut().enumerate() {
            let b_row = &b[l * n..(l + 1) * n];
            *cell = g_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
        }
    });
    debug_assert_eq!(out.len(), m * k);
    out
}

/// `Aᵗ × G` for `A: m×k`, `G: m×n`; result is `k×n`.
#[must_use]
pub fn matmul_at(a: &[f64], g: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; k * n];
    out.par_chunks_mut(n).enumerate().for_each(|(l, row)| {
        for (j, cell) in row.iter_mut().enumerate() {
            let mut sum = 0.0;
            for i in 0..m {
                sum += a[i * k + l] * g[i * n + j];
            }
            *cell = sum;
        }
    });
    out
}

/// Adds `bias` to every row of `y` in place.
pub fn add_row_bias(y: &mut [f64], bias: &[f64]) {
    y.par_chunks_mut(bias.len()).for_each(|row| {
        row.iter_mut().zip(bias).for_each(|(v, b)| *v += b);
    });
}

/// Sum over rows of a row-major `rows×cols` matrix.
#[must_use]
pub fn column_sum(g: &[f64], cols: usize) -> Vec<f64> {
    let mut out = vec![0.0; cols];
    for row in g.chunks(cols) {
        out.iter_mut().zip(row).for_each(|(acc, x)| *acc += x);
    }
    out
}

/// Element-wise `f(a[i], b[i])`.
#[must_use]
pub fn zip_map(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64 + Sync) -> Vec<f64> {
    a.par_iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
}

/// Element-wise `f(a[i])`.
#[must_use]
pub fn map(a: &[f64], f: impl Fn(f64) -> f64 + Sync) -> Vec<f64> {
    a.par_iter().map(|&x| f(x)).collect()
}

/// ReLU forward, returning the output and the mask of strictly positive inputs.
#[must_use]
pub fn relu(x: &[f64]) -> (Vec<f64>, Vec<bool>) {
    let positive: Vec<bool> = x.par_iter().map(|&v| v > 0.0).collect();
    let out = x
        .par_iter()
        .zip(&positive)
        .map(|(&v, &p)| if p { v } else { 0.0 })
        .collect();
    (out, positive)
}

/// Passes `g` through where the forward input was strictly positive.
#[must_use]
pub fn relu_backward(g: &[f64], positive: &[bool]) -> Vec<f64> {
    g.par_iter()
        .zip(positive)
        .map(|(&d, &p)| if p { d } else { 0.0 })
        .collect()
}

fn stable_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Logistic sigmoid.
#[must_use]
pub fn sigmoid(x: &[f64]) -> Vec<f64> {
    map(x, stable_sigmoid)
}

/// `g · s(1 − s)` from the cached forward output `s`.
#[must_use]
pub fn sigmoid_backward(g: &[f64], s: &[f64]) -> Vec<f64> {
    zip_map(g, s, |d, y| d * y * (1.0 - y))
}

/// Row-wise log-softmax over rows of length `cols`.
///
/// Returns `(log_softmax, softmax)`; the softmax is what the backward rule
/// needs.
#[must_use]
pub fn log_softmax_rows(x: &[f64], cols: usize) -> (Vec<f64>, Vec<f64>) {
    let mut logp = vec![0.0; x.len()];
    let mut probs = vec![0.0; x.len()];
    logp.par_chunks_mut(cols)
        .zip(probs.par_chunks_mut(cols))
        .zip(x.par_chunks(cols))
        .for_each(|((lp, p), row)| {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let sum: f64 = row.iter().map(|v| (v - max).exp()).sum();
            let log_norm = max + sum.ln();
            for ((l, q), &v) in lp.iter_mut().zip(p.iter_mut()).zip(row) {
                *l = v - log_norm;
                *q = l.exp();
            }
        });
    (logp, probs)
}

/// `dx_i = g_i − softmax_i · Σ_j g_j`, row-wise.
#[must_use]
pub fn log_softmax_backward(g: &[f64], softmax: &[f64], cols: usize) -> Vec<f64> {
    let mut out = vec![0.0; g.len()];
    out.par_chunks_mut(cols)
        .zip(g.par_chunks(cols))
        .zip(softmax.par_chunks(cols))
        .for_each(|((dx, dy), s)| {
            let total: f64 = dy.iter().sum();
            for ((d, &gy), &p) in dx.iter_mut().zip(dy).zip(s) {
                *d = gy - p * total;
            }
        });
    out
}

/// Row-wise softmax over rows of length `cols`, max-shifted.
#[must_use]
pub fn softmax_rows(x: &[f64], cols: usize) -> Vec<f64> {
    let mut out = vec![0.0; x.len()];
    out.par_chunks_mut(cols)
        .zip(x.par_chunks(cols))
        .for_each(|(y, row)| {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mut sum = 0.0;
            for (o, &v) in y.iter_mut().zip(row) {
                *o = (v - max).exp();
                sum += *o;
            }
            y.iter_mut().for_each(|o| *o /= sum);
        });
    out
}

/// `dx_i = y_i (g_i − Σ_j y_j g_j)`, row-wise.
#[must_use]
pub fn softmax_backward(g: &[f64], y: &[f64], cols: usize) -> Vec<f64> {
    let mut out = vec![0.0; g.len()];
    out.par_chunks_mut(cols)
        .zip(g.par_chunks(cols))
        .zip(y.par_chunks(cols))
        .for_each(|((dx, dy), s)| {
            let dot: f64 = dy.iter().zip(s).map(|(a, b)| a * b).sum();
            for ((d, &gy), &p) in dx.iter_mut().zip(dy).zip(s) {
                *d = p * (gy - dot);
            }
        });
    out
}
