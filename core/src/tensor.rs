/// Flat f32 numerics for the proposal network.
///
/// All operations are free functions on flat f32 slices with explicit
/// dimensions. Row-major layout throughout. Backward kernels accumulate into
/// caller-provided buffers; callers pre-zero.

use serde::{Deserialize, Serialize};

/// Flat f32 tensor with shape metadata. Observation and sample values cross
/// the trace boundary in this form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; n],
            shape: shape.to_vec(),
        }
    }

    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor {
            data,
            shape: shape.to_vec(),
        }
    }

    /// Scalar convenience constructor (rank-1, length-1).
    pub fn scalar(value: f32) -> Self {
        Tensor {
            data: vec![value],
            shape: vec![1],
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Rank of the tensor (number of axes).
    pub fn dim(&self) -> usize {
        self.shape.len()
    }
}

// ── Dense (linear) layer kernels ─────────────────────────────────────
//
// Weights are [out_dim, in_dim] row-major, matching y = x @ W^T + b.
// The transposed access pattern avoids materializing W^T.

/// out[b,o] = bias[o] + Σ_i x[b,i] * w[o,i].  Overwrites `out`.
pub fn linear_f32(x: &[f32], w: &[f32], bias: &[f32], out: &mut [f32], bsz: usize, in_dim: usize, out_dim: usize) {
    debug_assert_eq!(x.len(), bsz * in_dim);
    debug_assert_eq!(w.len(), out_dim * in_dim);
    debug_assert_eq!(bias.len(), out_dim);
    debug_assert_eq!(out.len(), bsz * out_dim);

    for b in 0..bsz {
        let xrow = &x[b * in_dim..(b + 1) * in_dim];
        for o in 0..out_dim {
            let wrow = &w[o * in_dim..(o + 1) * in_dim];
            let mut sum = bias[o];
            for i in 0..in_dim {
                sum += xrow[i] * wrow[i];
            }
            out[b * out_dim + o] = sum;
        }
    }
}

/// out[b,o] += bias[o] + Σ_i x[b,i] * w[o,i].  Accumulating variant for
/// layers that sum two projections (LSTM gates).
pub fn linear_acc_f32(x: &[f32], w: &[f32], bias: &[f32], out: &mut [f32], bsz: usize, in_dim: usize, out_dim: usize) {
    debug_assert_eq!(x.len(), bsz * in_dim);
    debug_assert_eq!(w.len(), out_dim * in_dim);
    debug_assert_eq!(bias.len(), out_dim);
    debug_assert_eq!(out.len(), bsz * out_dim);

    for b in 0..bsz {
        let xrow = &x[b * in_dim..(b + 1) * in_dim];
        for o in 0..out_dim {
            let wrow = &w[o * in_dim..(o + 1) * in_dim];
            let mut sum = bias[o];
            for i in 0..in_dim {
                sum += xrow[i] * wrow[i];
            }
            out[b * out_dim + o] += sum;
        }
    }
}

/// Backward of `linear_f32`. Accumulates into d_x, d_w, d_b (pre-zeroed by
/// the caller, or carrying prior accumulation):
///   d_x[b,i] += Σ_o d_out[b,o] * w[o,i]
///   d_w[o,i] += Σ_b d_out[b,o] * x[b,i]
///   d_b[o]   += Σ_b d_out[b,o]
pub fn linear_backward_f32(
    x: &[f32],
    w: &[f32],
    d_out: &[f32],
    d_x: &mut [f32],
    d_w: &mut [f32],
    d_b: &mut [f32],
    bsz: usize,
    in_dim: usize,
    out_dim: usize,
) {
    debug_assert_eq!(x.len(), bsz * in_dim);
    debug_assert_eq!(w.len(), out_dim * in_dim);
    debug_assert_eq!(d_out.len(), bsz * out_dim);
    debug_assert_eq!(d_x.len(), bsz * in_dim);
    debug_assert_eq!(d_w.len(), out_dim * in_dim);
    debug_assert_eq!(d_b.len(), out_dim);

    for b in 0..bsz {
        let xrow = &x[b * in_dim..(b + 1) * in_dim];
        for o in 0..out_dim {
            let g = d_out[b * out_dim + o];
            if g == 0.0 {
                continue;
            }
            let wrow = &w[o * in_dim..(o + 1) * in_dim];
            for i in 0..in_dim {
                d_x[b * in_dim + i] += g * wrow[i];
                d_w[o * in_dim + i] += g * xrow[i];
            }
            d_b[o] += g;
        }
    }
}

// ── Activations ──────────────────────────────────────────────────────

/// out[i] = max(0, x[i]).
pub fn relu_f32(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    for i in 0..x.len() {
        out[i] = if x[i] > 0.0 { x[i] } else { 0.0 };
    }
}

/// Backward of ReLU given the pre-activation: d_pre[i] += d_out[i] where
/// pre[i] > 0.
pub fn relu_backward_f32(pre: &[f32], d_out: &[f32], d_pre: &mut [f32]) {
    debug_assert_eq!(pre.len(), d_out.len());
    debug_assert_eq!(pre.len(), d_pre.len());
    for i in 0..pre.len() {
        if pre[i] > 0.0 {
            d_pre[i] += d_out[i];
        }
    }
}

/// Sigmoid: 1 / (1 + exp(-x)). Clamped to avoid overflow.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 15.0 {
        return 1.0;
    }
    if x <= -15.0 {
        return 0.0;
    }
    1.0 / (1.0 + (-x).exp())
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed
/// into `out`. Numerically stable (max subtraction).
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

// ── Convolution kernels (observation encoder) ────────────────────────
//
// Valid (no-padding) 2-D convolution, stride 1, square kernel.
// Input  [bsz, c_in, h, w], weight [c_out, c_in, k, k], bias [c_out],
// output [bsz, c_out, h-k+1, w-k+1].

/// Output spatial extent of a valid conv: `n - k + 1` (0 if too small).
#[inline]
pub fn conv_out_extent(n: usize, k: usize) -> usize {
    (n + 1).saturating_sub(k)
}

pub fn conv2d_f32(
    x: &[f32],
    w: &[f32],
    bias: &[f32],
    out: &mut [f32],
    bsz: usize,
    c_in: usize,
    h: usize,
    wd: usize,
    c_out: usize,
    k: usize,
) {
    let oh = conv_out_extent(h, k);
    let ow = conv_out_extent(wd, k);
    debug_assert_eq!(x.len(), bsz * c_in * h * wd);
    debug_assert_eq!(w.len(), c_out * c_in * k * k);
    debug_assert_eq!(bias.len(), c_out);
    debug_assert_eq!(out.len(), bsz * c_out * oh * ow);

    for b in 0..bsz {
        for co in 0..c_out {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut sum = bias[co];
                    for ci in 0..c_in {
                        let xbase = ((b * c_in + ci) * h + oy) * wd + ox;
                        let wbase = (co * c_in + ci) * k * k;
                        for ky in 0..k {
                            let xrow = xbase + ky * wd;
                            let wrow = wbase + ky * k;
                            for kx in 0..k {
                                sum += x[xrow + kx] * w[wrow + kx];
                            }
                        }
                    }
                    out[((b * c_out + co) * oh + oy) * ow + ox] = sum;
                }
            }
        }
    }
}

/// Backward of `conv2d_f32`. Accumulates into d_x, d_w, d_b (pre-zeroed).
pub fn conv2d_backward_f32(
    x: &[f32],
    w: &[f32],
    d_out: &[f32],
    d_x: &mut [f32],
    d_w: &mut [f32],
    d_b: &mut [f32],
    bsz: usize,
    c_in: usize,
    h: usize,
    wd: usize,
    c_out: usize,
    k: usize,
) {
    let oh = conv_out_extent(h, k);
    let ow = conv_out_extent(wd, k);
    debug_assert_eq!(d_out.len(), bsz * c_out * oh * ow);
    debug_assert_eq!(d_x.len(), x.len());
    debug_assert_eq!(d_w.len(), w.len());
    debug_assert_eq!(d_b.len(), c_out);

    for b in 0..bsz {
        for co in 0..c_out {
            for oy in 0..oh {
                for ox in 0..ow {
                    let g = d_out[((b * c_out + co) * oh + oy) * ow + ox];
                    if g == 0.0 {
                        continue;
                    }
                    d_b[co] += g;
                    for ci in 0..c_in {
                        let xbase = ((b * c_in + ci) * h + oy) * wd + ox;
                        let wbase = (co * c_in + ci) * k * k;
                        for ky in 0..k {
                            let xrow = xbase + ky * wd;
                            let wrow = wbase + ky * k;
                            for kx in 0..k {
                                d_w[wrow + kx] += g * x[xrow + kx];
                                d_x[xrow + kx] += g * w[wrow + kx];
                            }
                        }
                    }
                }
            }
        }
    }
}

/// 2×2 max-pool, stride 2, floor semantics (a trailing odd row/column is
/// dropped). Writes the flat argmax index of each window into `argmax` for
/// the backward pass. Output [bsz, c, h/2, w/2].
pub fn maxpool2x2_f32(
    x: &[f32],
    out: &mut [f32],
    argmax: &mut [usize],
    bsz: usize,
    c: usize,
    h: usize,
    w: usize,
) {
    let oh = h / 2;
    let ow = w / 2;
    debug_assert_eq!(x.len(), bsz * c * h * w);
    debug_assert_eq!(out.len(), bsz * c * oh * ow);
    debug_assert_eq!(argmax.len(), out.len());

    for b in 0..bsz {
        for ch in 0..c {
            let plane = (b * c + ch) * h * w;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best_idx = plane + (2 * oy) * w + 2 * ox;
                    let mut best = x[best_idx];
                    for dy in 0..2 {
                        for dx in 0..2 {
                            let idx = plane + (2 * oy + dy) * w + (2 * ox + dx);
                            if x[idx] > best {
                                best = x[idx];
                                best_idx = idx;
                            }
                        }
                    }
                    let o = ((b * c + ch) * oh + oy) * ow + ox;
                    out[o] = best;
                    argmax[o] = best_idx;
                }
            }
        }
    }
}

/// Backward of `maxpool2x2_f32`: scatter each output gradient to the input
/// position recorded in `argmax`. Accumulates into d_x (pre-zeroed).
pub fn maxpool2x2_backward_f32(d_out: &[f32], argmax: &[usize], d_x: &mut [f32]) {
    debug_assert_eq!(d_out.len(), argmax.len());
    for i in 0..d_out.len() {
        d_x[argmax[i]] += d_out[i];
    }
}

// ── Deterministic RNG ────────────────────────────────────────────────
//
// xorshift64. All layer initialization flows through this so a fixed seed
// reproduces the network bit-for-bit; the state is persisted with the
// artifact so reload resumes the same stream.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}

/// Xavier-style scale for a dense layer: sqrt(2 / (fan_in + fan_out)).
#[inline]
pub fn xavier_scale(fan_in: usize, fan_out: usize) -> f32 {
    (2.0 / (fan_in + fan_out) as f32).sqrt()
}
