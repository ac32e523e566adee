/// Observation and sample embedding layers.
///
/// Both encoder families map raw tensors to fixed-width feature vectors
/// that feed the recurrent input. Every layer keeps its parameters as flat
/// row-major Vec<f32> and provides a hand-derived backward pass; forward
/// calls return a cache holding exactly the intermediates backward needs.
///
/// Rank validation happens at construction, never at forward time: an
/// example observation of unsupported rank is a `ModelError::Configuration`
/// before training starts.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::tensor::{
    conv2d_backward_f32, conv2d_f32, conv_out_extent, linear_backward_f32, linear_f32,
    maxpool2x2_backward_f32, maxpool2x2_f32, relu_backward_f32, relu_f32, xavier_scale, SimpleRng,
    Tensor,
};

/// Sample-value embedding family. Closed set selected at configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum SampleEmbeddingKind {
    Fc,
}

/// Observation embedding family. Closed set selected at configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ObserveEmbeddingKind {
    Fc,
    Cnn6,
}

// ── Sample embedding ─────────────────────────────────────────────────

/// Single dense layer + ReLU from a flattened sample value to the sample
/// embedding width. One per (address, instance) pair, created lazily by
/// the polymorph pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SampleEmbeddingFC {
    pub w: Vec<f32>,
    pub b: Vec<f32>,
    pub input_dim: usize,
    pub output_dim: usize,
}

/// Intermediates for the backward pass of one forward call.
pub struct SampleFcCache {
    x: Vec<f32>,
    pre: Vec<f32>,
    bsz: usize,
}

impl SampleEmbeddingFC {
    pub fn init(input_dim: usize, output_dim: usize, rng: &mut SimpleRng) -> Self {
        let mut w = vec![0.0f32; output_dim * input_dim];
        rng.fill_uniform(&mut w, xavier_scale(input_dim, output_dim));
        SampleEmbeddingFC {
            w,
            b: vec![0.0; output_dim],
            input_dim,
            output_dim,
        }
    }

    pub fn zeros_like(&self) -> Self {
        SampleEmbeddingFC {
            w: vec![0.0; self.w.len()],
            b: vec![0.0; self.b.len()],
            input_dim: self.input_dim,
            output_dim: self.output_dim,
        }
    }

    pub fn num_params(&self) -> usize {
        self.w.len() + self.b.len()
    }

    /// x: [bsz, input_dim] flattened sample values.
    pub fn forward(&self, x: &[f32], bsz: usize) -> (Vec<f32>, SampleFcCache) {
        let mut pre = vec![0.0f32; bsz * self.output_dim];
        linear_f32(x, &self.w, &self.b, &mut pre, bsz, self.input_dim, self.output_dim);
        let mut out = vec![0.0f32; pre.len()];
        relu_f32(&pre, &mut out);
        (out, SampleFcCache { x: x.to_vec(), pre, bsz })
    }

    /// Sample values are leaves; no input gradient is produced.
    pub fn backward(&self, cache: &SampleFcCache, d_out: &[f32], grads: &mut Self) {
        let mut d_pre = vec![0.0f32; cache.pre.len()];
        relu_backward_f32(&cache.pre, d_out, &mut d_pre);
        let mut d_x = vec![0.0f32; cache.x.len()];
        linear_backward_f32(
            &cache.x, &self.w, &d_pre, &mut d_x, &mut grads.w, &mut grads.b,
            cache.bsz, self.input_dim, self.output_dim,
        );
    }
}

// ── Observation embedding: fully-connected variant ───────────────────

/// Flatten → dense + ReLU → dense + ReLU.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObserveEmbeddingFC {
    pub w1: Vec<f32>,
    pub b1: Vec<f32>,
    pub w2: Vec<f32>,
    pub b2: Vec<f32>,
    pub input_dim: usize,
    pub output_dim: usize,
}

pub struct ObserveFcCache {
    x: Vec<f32>,
    pre1: Vec<f32>,
    a1: Vec<f32>,
    pre2: Vec<f32>,
    bsz: usize,
}

impl ObserveEmbeddingFC {
    /// `example` is one non-batch observation; it fixes the input width.
    pub fn new(example: &Tensor, output_dim: usize, rng: &mut SimpleRng) -> Result<Self, ModelError> {
        if example.dim() == 0 || example.dim() > 3 {
            return Err(ModelError::config(format!(
                "fc observe embedding expects a 1d, 2d or 3d example observation, got rank {}",
                example.dim()
            )));
        }
        let input_dim = example.numel();
        let mut w1 = vec![0.0f32; output_dim * input_dim];
        rng.fill_uniform(&mut w1, xavier_scale(input_dim, output_dim));
        let mut w2 = vec![0.0f32; output_dim * output_dim];
        rng.fill_uniform(&mut w2, xavier_scale(output_dim, output_dim));
        Ok(ObserveEmbeddingFC {
            w1,
            b1: vec![0.0; output_dim],
            w2,
            b2: vec![0.0; output_dim],
            input_dim,
            output_dim,
        })
    }

    pub fn zeros_like(&self) -> Self {
        ObserveEmbeddingFC {
            w1: vec![0.0; self.w1.len()],
            b1: vec![0.0; self.b1.len()],
            w2: vec![0.0; self.w2.len()],
            b2: vec![0.0; self.b2.len()],
            input_dim: self.input_dim,
            output_dim: self.output_dim,
        }
    }

    pub fn num_params(&self) -> usize {
        self.w1.len() + self.b1.len() + self.w2.len() + self.b2.len()
    }

    /// x: [bsz, input_dim] flattened observations.
    pub fn forward(&self, x: &[f32], bsz: usize) -> (Vec<f32>, ObserveFcCache) {
        let d = self.output_dim;
        let mut pre1 = vec![0.0f32; bsz * d];
        linear_f32(x, &self.w1, &self.b1, &mut pre1, bsz, self.input_dim, d);
        let mut a1 = vec![0.0f32; pre1.len()];
        relu_f32(&pre1, &mut a1);
        let mut pre2 = vec![0.0f32; bsz * d];
        linear_f32(&a1, &self.w2, &self.b2, &mut pre2, bsz, d, d);
        let mut out = vec![0.0f32; pre2.len()];
        relu_f32(&pre2, &mut out);
        (out, ObserveFcCache { x: x.to_vec(), pre1, a1, pre2, bsz })
    }

    /// Observations are leaves; no input gradient is produced.
    pub fn backward(&self, cache: &ObserveFcCache, d_out: &[f32], grads: &mut Self) {
        let d = self.output_dim;
        let bsz = cache.bsz;

        let mut d_pre2 = vec![0.0f32; cache.pre2.len()];
        relu_backward_f32(&cache.pre2, d_out, &mut d_pre2);
        let mut d_a1 = vec![0.0f32; cache.a1.len()];
        linear_backward_f32(&cache.a1, &self.w2, &d_pre2, &mut d_a1, &mut grads.w2, &mut grads.b2, bsz, d, d);

        let mut d_pre1 = vec![0.0f32; cache.pre1.len()];
        relu_backward_f32(&cache.pre1, &d_a1, &mut d_pre1);
        let mut d_x = vec![0.0f32; cache.x.len()];
        linear_backward_f32(
            &cache.x, &self.w1, &d_pre1, &mut d_x, &mut grads.w1, &mut grads.b1,
            bsz, self.input_dim, d,
        );
    }
}

// ── Observation embedding: convolutional variant ─────────────────────

/// One valid 3×3 convolution stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conv2d {
    pub w: Vec<f32>,
    pub b: Vec<f32>,
    pub c_in: usize,
    pub c_out: usize,
}

const CONV_KERNEL: usize = 3;

impl Conv2d {
    fn init(c_in: usize, c_out: usize, rng: &mut SimpleRng) -> Self {
        let fan_in = c_in * CONV_KERNEL * CONV_KERNEL;
        let fan_out = c_out * CONV_KERNEL * CONV_KERNEL;
        let mut w = vec![0.0f32; c_out * c_in * CONV_KERNEL * CONV_KERNEL];
        rng.fill_uniform(&mut w, xavier_scale(fan_in, fan_out));
        Conv2d {
            w,
            b: vec![0.0; c_out],
            c_in,
            c_out,
        }
    }

    fn zeros_like(&self) -> Self {
        Conv2d {
            w: vec![0.0; self.w.len()],
            b: vec![0.0; self.b.len()],
            c_in: self.c_in,
            c_out: self.c_out,
        }
    }

    fn num_params(&self) -> usize {
        self.w.len() + self.b.len()
    }
}

/// Six-stage convolutional encoder for image-like observations:
/// conv+ReLU ×2, pool, conv+ReLU ×3, pool, conv+ReLU, pool, then two dense
/// layers with ReLU. The flattened convolutional width is measured with a
/// dry forward pass on the construction example — it depends on the input
/// spatial extent and is never assumed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObserveEmbeddingCNN6 {
    pub convs: Vec<Conv2d>,
    pub w_lin1: Vec<f32>,
    pub b_lin1: Vec<f32>,
    pub w_lin2: Vec<f32>,
    pub b_lin2: Vec<f32>,
    pub input_channels: usize,
    pub input_h: usize,
    pub input_w: usize,
    pub cnn_output_dim: usize,
    pub output_dim: usize,
}

/// Per-stage intermediates of the convolutional pipeline.
struct CnnStageCache {
    x: Vec<f32>,
    pre: Vec<f32>,
    h: usize,
    w: usize,
}

struct PoolCache {
    argmax: Vec<usize>,
    in_h: usize,
    in_w: usize,
    c: usize,
}

pub struct Cnn6Cache {
    stages: Vec<CnnStageCache>,
    pools: Vec<PoolCache>,
    flat: Vec<f32>,
    pre_l1: Vec<f32>,
    a_l1: Vec<f32>,
    pre_l2: Vec<f32>,
    bsz: usize,
}

/// Stage indices after which a 2×2 max-pool runs.
const POOL_AFTER: [usize; 3] = [1, 4, 5];

impl ObserveEmbeddingCNN6 {
    /// `example` is one non-batch observation: rank 2 (h × w, a channel
    /// axis is inserted) or rank 3 (channels × h × w). Anything else is a
    /// configuration error here, before any forward pass runs.
    pub fn new(example: &Tensor, output_dim: usize, rng: &mut SimpleRng) -> Result<Self, ModelError> {
        let (c, h, w) = match example.dim() {
            2 => (1, example.shape[0], example.shape[1]),
            3 => (example.shape[0], example.shape[1], example.shape[2]),
            rank => {
                return Err(ModelError::config(format!(
                    "cnn6 observe embedding expects a 2d (h x w) or 3d (c x h x w) example observation, got rank {rank}"
                )))
            }
        };

        let channel_plan = [(c, 64), (64, 64), (64, 128), (128, 128), (128, 128), (128, 128)];
        let convs: Vec<Conv2d> = channel_plan
            .iter()
            .map(|&(ci, co)| Conv2d::init(ci, co, rng))
            .collect();

        let mut enc = ObserveEmbeddingCNN6 {
            convs,
            w_lin1: Vec::new(),
            b_lin1: Vec::new(),
            w_lin2: Vec::new(),
            b_lin2: Vec::new(),
            input_channels: c,
            input_h: h,
            input_w: w,
            cnn_output_dim: 0,
            output_dim,
        };

        // Dry pass on the single example to measure the flattened width.
        let mut example_data = vec![0.0f32; c * h * w];
        example_data.copy_from_slice(&example.data);
        let (flat, _) = enc.forward_cnn(&example_data, 1);
        enc.cnn_output_dim = flat.len();
        if enc.cnn_output_dim == 0 {
            return Err(ModelError::config(format!(
                "cnn6 observe embedding: spatial extent {h}x{w} collapses to zero after the conv/pool stack"
            )));
        }

        let mut w_lin1 = vec![0.0f32; output_dim * enc.cnn_output_dim];
        rng.fill_uniform(&mut w_lin1, xavier_scale(enc.cnn_output_dim, output_dim));
        let mut w_lin2 = vec![0.0f32; output_dim * output_dim];
        rng.fill_uniform(&mut w_lin2, xavier_scale(output_dim, output_dim));
        enc.w_lin1 = w_lin1;
        enc.b_lin1 = vec![0.0; output_dim];
        enc.w_lin2 = w_lin2;
        enc.b_lin2 = vec![0.0; output_dim];
        Ok(enc)
    }

    pub fn zeros_like(&self) -> Self {
        ObserveEmbeddingCNN6 {
            convs: self.convs.iter().map(Conv2d::zeros_like).collect(),
            w_lin1: vec![0.0; self.w_lin1.len()],
            b_lin1: vec![0.0; self.b_lin1.len()],
            w_lin2: vec![0.0; self.w_lin2.len()],
            b_lin2: vec![0.0; self.b_lin2.len()],
            input_channels: self.input_channels,
            input_h: self.input_h,
            input_w: self.input_w,
            cnn_output_dim: self.cnn_output_dim,
            output_dim: self.output_dim,
        }
    }

    pub fn num_params(&self) -> usize {
        self.convs.iter().map(Conv2d::num_params).sum::<usize>()
            + self.w_lin1.len()
            + self.b_lin1.len()
            + self.w_lin2.len()
            + self.b_lin2.len()
    }

    /// Conv/pool stack: x is [bsz, c, h, w] flat. Returns the flattened
    /// output [bsz, cnn_output_dim] and the stage caches.
    fn forward_cnn(&self, x: &[f32], bsz: usize) -> (Vec<f32>, (Vec<CnnStageCache>, Vec<PoolCache>)) {
        let mut cur = x.to_vec();
        let mut h = self.input_h;
        let mut w = self.input_w;
        let mut stages = Vec::with_capacity(self.convs.len());
        let mut pools = Vec::with_capacity(POOL_AFTER.len());

        for (si, conv) in self.convs.iter().enumerate() {
            let oh = conv_out_extent(h, CONV_KERNEL);
            let ow = conv_out_extent(w, CONV_KERNEL);
            let mut pre = vec![0.0f32; bsz * conv.c_out * oh * ow];
            conv2d_f32(&cur, &conv.w, &conv.b, &mut pre, bsz, conv.c_in, h, w, conv.c_out, CONV_KERNEL);
            let mut act = vec![0.0f32; pre.len()];
            relu_f32(&pre, &mut act);
            stages.push(CnnStageCache { x: cur, pre, h, w });
            cur = act;
            h = oh;
            w = ow;

            if POOL_AFTER.contains(&si) {
                let (ph, pw) = (h / 2, w / 2);
                let mut pooled = vec![0.0f32; bsz * conv.c_out * ph * pw];
                let mut argmax = vec![0usize; pooled.len()];
                maxpool2x2_f32(&cur, &mut pooled, &mut argmax, bsz, conv.c_out, h, w);
                pools.push(PoolCache { argmax, in_h: h, in_w: w, c: conv.c_out });
                cur = pooled;
                h = ph;
                w = pw;
            }
        }

        (cur, (stages, pools))
    }

    /// x: [bsz, c, h, w] flat (a missing channel axis has already been
    /// accounted for by construction: c == input_channels).
    pub fn forward(&self, x: &[f32], bsz: usize) -> (Vec<f32>, Cnn6Cache) {
        let (flat, (stages, pools)) = self.forward_cnn(x, bsz);
        debug_assert_eq!(flat.len(), bsz * self.cnn_output_dim);

        let d = self.output_dim;
        let mut pre_l1 = vec![0.0f32; bsz * d];
        linear_f32(&flat, &self.w_lin1, &self.b_lin1, &mut pre_l1, bsz, self.cnn_output_dim, d);
        let mut a_l1 = vec![0.0f32; pre_l1.len()];
        relu_f32(&pre_l1, &mut a_l1);
        let mut pre_l2 = vec![0.0f32; bsz * d];
        linear_f32(&a_l1, &self.w_lin2, &self.b_lin2, &mut pre_l2, bsz, d, d);
        let mut out = vec![0.0f32; pre_l2.len()];
        relu_f32(&pre_l2, &mut out);

        (out, Cnn6Cache { stages, pools, flat, pre_l1, a_l1, pre_l2, bsz })
    }

    /// Observations are leaves; no input gradient is produced.
    pub fn backward(&self, cache: &Cnn6Cache, d_out: &[f32], grads: &mut Self) {
        let d = self.output_dim;
        let bsz = cache.bsz;

        // Dense head, in reverse.
        let mut d_pre_l2 = vec![0.0f32; cache.pre_l2.len()];
        relu_backward_f32(&cache.pre_l2, d_out, &mut d_pre_l2);
        let mut d_a_l1 = vec![0.0f32; cache.a_l1.len()];
        linear_backward_f32(&cache.a_l1, &self.w_lin2, &d_pre_l2, &mut d_a_l1, &mut grads.w_lin2, &mut grads.b_lin2, bsz, d, d);

        let mut d_pre_l1 = vec![0.0f32; cache.pre_l1.len()];
        relu_backward_f32(&cache.pre_l1, &d_a_l1, &mut d_pre_l1);
        let mut d_flat = vec![0.0f32; cache.flat.len()];
        linear_backward_f32(
            &cache.flat, &self.w_lin1, &d_pre_l1, &mut d_flat, &mut grads.w_lin1, &mut grads.b_lin1,
            bsz, self.cnn_output_dim, d,
        );

        // Conv/pool stack, in reverse. `d_cur` is the gradient on the
        // post-ReLU (or post-pool) activation flowing down the stack.
        let mut d_cur = d_flat;
        let mut pool_idx = cache.pools.len();
        for (si, conv) in self.convs.iter().enumerate().rev() {
            if POOL_AFTER.contains(&si) {
                pool_idx -= 1;
                let pool = &cache.pools[pool_idx];
                let mut d_unpooled = vec![0.0f32; bsz * pool.c * pool.in_h * pool.in_w];
                maxpool2x2_backward_f32(&d_cur, &pool.argmax, &mut d_unpooled);
                d_cur = d_unpooled;
            }

            let stage = &cache.stages[si];
            let mut d_pre = vec![0.0f32; stage.pre.len()];
            relu_backward_f32(&stage.pre, &d_cur, &mut d_pre);

            let mut d_x = vec![0.0f32; stage.x.len()];
            let grad_conv = &mut grads.convs[si];
            conv2d_backward_f32(
                &stage.x, &conv.w, &d_pre, &mut d_x, &mut grad_conv.w, &mut grad_conv.b,
                bsz, conv.c_in, stage.h, stage.w, conv.c_out, CONV_KERNEL,
            );
            d_cur = d_x;
        }
    }
}

// ── Closed dispatch over observation encoder variants ────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ObserveEmbedding {
    Fc(ObserveEmbeddingFC),
    Cnn6(ObserveEmbeddingCNN6),
}

pub enum ObserveCache {
    Fc(ObserveFcCache),
    Cnn6(Cnn6Cache),
}

impl ObserveEmbedding {
    /// Construct the configured variant from one example observation.
    pub fn new(
        kind: ObserveEmbeddingKind,
        example: &Tensor,
        output_dim: usize,
        rng: &mut SimpleRng,
    ) -> Result<Self, ModelError> {
        match kind {
            ObserveEmbeddingKind::Fc => Ok(ObserveEmbedding::Fc(ObserveEmbeddingFC::new(example, output_dim, rng)?)),
            ObserveEmbeddingKind::Cnn6 => {
                Ok(ObserveEmbedding::Cnn6(ObserveEmbeddingCNN6::new(example, output_dim, rng)?))
            }
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            ObserveEmbedding::Fc(e) => e.output_dim,
            ObserveEmbedding::Cnn6(e) => e.output_dim,
        }
    }

    /// Flat per-example input width the encoder expects.
    pub fn input_numel(&self) -> usize {
        match self {
            ObserveEmbedding::Fc(e) => e.input_dim,
            ObserveEmbedding::Cnn6(e) => e.input_channels * e.input_h * e.input_w,
        }
    }

    pub fn num_params(&self) -> usize {
        match self {
            ObserveEmbedding::Fc(e) => e.num_params(),
            ObserveEmbedding::Cnn6(e) => e.num_params(),
        }
    }

    pub fn zeros_like(&self) -> Self {
        match self {
            ObserveEmbedding::Fc(e) => ObserveEmbedding::Fc(e.zeros_like()),
            ObserveEmbedding::Cnn6(e) => ObserveEmbedding::Cnn6(e.zeros_like()),
        }
    }

    /// x: [bsz, input_numel] flat batch of observations.
    pub fn forward(&self, x: &[f32], bsz: usize) -> (Vec<f32>, ObserveCache) {
        match self {
            ObserveEmbedding::Fc(e) => {
                let (out, cache) = e.forward(x, bsz);
                (out, ObserveCache::Fc(cache))
            }
            ObserveEmbedding::Cnn6(e) => {
                let (out, cache) = e.forward(x, bsz);
                (out, ObserveCache::Cnn6(cache))
            }
        }
    }

    pub fn backward(&self, cache: &ObserveCache, d_out: &[f32], grads: &mut Self) {
        match (self, cache, grads) {
            (ObserveEmbedding::Fc(e), ObserveCache::Fc(c), ObserveEmbedding::Fc(g)) => e.backward(c, d_out, g),
            (ObserveEmbedding::Cnn6(e), ObserveCache::Cnn6(c), ObserveEmbedding::Cnn6(g)) => e.backward(c, d_out, g),
            _ => unreachable!("observe embedding cache/grads variant mismatch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_embedding_shapes_and_relu() {
        let mut rng = SimpleRng::new(1);
        let layer = SampleEmbeddingFC::init(3, 5, &mut rng);
        assert_eq!(layer.num_params(), 3 * 5 + 5);
        let x = vec![1.0f32, -2.0, 0.5, 0.0, 0.0, 0.0];
        let (out, _) = layer.forward(&x, 2);
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|&v| v >= 0.0), "relu output must be non-negative");
    }

    #[test]
    fn test_sample_embedding_backward_matches_finite_diff() {
        let mut rng = SimpleRng::new(3);
        let layer = SampleEmbeddingFC::init(4, 3, &mut rng);
        let mut x = vec![0.0f32; 8];
        rng.fill_uniform(&mut x, 1.0);

        let (out, cache) = layer.forward(&x, 2);
        let d_out = vec![1.0f32; out.len()];
        let mut grads = layer.zeros_like();
        layer.backward(&cache, &d_out, &mut grads);

        let loss = |l: &SampleEmbeddingFC| l.forward(&x, 2).0.iter().sum::<f32>();
        let eps = 1e-3;
        for idx in 0..layer.w.len() {
            let mut lp = layer.clone();
            lp.w[idx] += eps;
            let mut lm = layer.clone();
            lm.w[idx] -= eps;
            let fd = (loss(&lp) - loss(&lm)) / (2.0 * eps);
            assert!(
                (fd - grads.w[idx]).abs() < 1e-2,
                "w[{idx}]: analytic={}, fd={}",
                grads.w[idx],
                fd
            );
        }
    }

    #[test]
    fn test_fc_observe_rejects_rank_4_at_construction() {
        let mut rng = SimpleRng::new(5);
        let example = Tensor::zeros(&[2, 3, 4, 5]);
        let err = ObserveEmbeddingFC::new(&example, 8, &mut rng).unwrap_err();
        assert!(matches!(err, ModelError::Configuration { .. }));
    }

    #[test]
    fn test_cnn6_rejects_rank_1_and_rank_4_at_construction() {
        let mut rng = SimpleRng::new(5);
        for shape in [vec![10usize], vec![1, 2, 32, 32]] {
            let example = Tensor::zeros(&shape);
            let err = ObserveEmbeddingCNN6::new(&example, 8, &mut rng).unwrap_err();
            assert!(matches!(err, ModelError::Configuration { .. }), "shape {shape:?}");
        }
    }

    #[test]
    fn test_cnn6_rejects_too_small_spatial_extent() {
        let mut rng = SimpleRng::new(5);
        let example = Tensor::zeros(&[16, 16]);
        let err = ObserveEmbeddingCNN6::new(&example, 8, &mut rng).unwrap_err();
        assert!(matches!(err, ModelError::Configuration { .. }));
    }

    #[test]
    fn test_cnn6_measures_flat_width_by_dry_pass() {
        let mut rng = SimpleRng::new(5);
        // 32x32 single channel: 32→30→28→14→12→10→8→4→2→1 spatially
        let example = Tensor::zeros(&[32, 32]);
        let enc = ObserveEmbeddingCNN6::new(&example, 8, &mut rng).unwrap();
        assert_eq!(enc.input_channels, 1);
        assert_eq!(enc.cnn_output_dim, 128, "128 channels x 1 x 1");
        let x = vec![0.1f32; 32 * 32];
        let (out, _) = enc.forward(&x, 1);
        assert_eq!(out.len(), 8);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_fc_observe_backward_matches_finite_diff() {
        let mut rng = SimpleRng::new(9);
        let example = Tensor::zeros(&[4]);
        let enc = ObserveEmbeddingFC::new(&example, 3, &mut rng).unwrap();
        let mut x = vec![0.0f32; 8];
        rng.fill_uniform(&mut x, 1.0);

        let (out, cache) = enc.forward(&x, 2);
        let d_out = vec![1.0f32; out.len()];
        let mut grads = enc.zeros_like();
        enc.backward(&cache, &d_out, &mut grads);

        let loss = |e: &ObserveEmbeddingFC| e.forward(&x, 2).0.iter().sum::<f32>();
        let eps = 1e-3;
        for idx in 0..enc.w1.len() {
            let mut ep = enc.clone();
            ep.w1[idx] += eps;
            let mut em = enc.clone();
            em.w1[idx] -= eps;
            let fd = (loss(&ep) - loss(&em)) / (2.0 * eps);
            assert!(
                (fd - grads.w1[idx]).abs() < 1e-2,
                "w1[{idx}]: analytic={}, fd={}",
                grads.w1[idx],
                fd
            );
        }
        for idx in 0..enc.b2.len() {
            let mut ep = enc.clone();
            ep.b2[idx] += eps;
            let mut em = enc.clone();
            em.b2[idx] -= eps;
            let fd = (loss(&ep) - loss(&em)) / (2.0 * eps);
            assert!((fd - grads.b2[idx]).abs() < 1e-2, "b2[{idx}]");
        }
    }
}
