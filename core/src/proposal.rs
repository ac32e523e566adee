/// Proposal heads: per-(address, instance) output networks mapping the
/// recurrent hidden state to distribution parameters of a declared kind.
///
/// Closed dispatch: each supported kind is a `ProposalHead` variant
/// carrying its own parameter construction, log-probability rule and
/// backward pass. A kind with no variant (the trace layer's `normal`) is
/// rejected upstream with `ModelError::UnsupportedProposal` — there is no
/// default branch.

use serde::{Deserialize, Serialize};

use crate::tensor::{linear_backward_f32, linear_f32, softmax_f32, xavier_scale, SimpleRng};
use crate::EPSILON;

/// Dense layer from hidden state to (max − min) logits, scaled by the
/// softmax boost before normalization. The resulting categorical covers
/// the integer range [min, max).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalUniformDiscrete {
    pub w: Vec<f32>,
    pub b: Vec<f32>,
    pub input_dim: usize,
    pub min: i64,
    pub max: i64,
    pub softmax_boost: f32,
}

/// Intermediates for one forward call.
pub struct UniformDiscreteCache {
    h: Vec<f32>,
    probs: Vec<f32>,
    bsz: usize,
}

impl ProposalUniformDiscrete {
    pub fn init(input_dim: usize, min: i64, max: i64, softmax_boost: f32, rng: &mut SimpleRng) -> Self {
        debug_assert!(max > min, "degenerate discrete-uniform range [{min}, {max})");
        let out_dim = (max - min) as usize;
        let mut w = vec![0.0f32; out_dim * input_dim];
        rng.fill_uniform(&mut w, xavier_scale(input_dim, out_dim));
        ProposalUniformDiscrete {
            w,
            b: vec![0.0; out_dim],
            input_dim,
            min,
            max,
            softmax_boost,
        }
    }

    pub fn zeros_like(&self) -> Self {
        ProposalUniformDiscrete {
            w: vec![0.0; self.w.len()],
            b: vec![0.0; self.b.len()],
            input_dim: self.input_dim,
            min: self.min,
            max: self.max,
            softmax_boost: self.softmax_boost,
        }
    }

    pub fn num_params(&self) -> usize {
        self.w.len() + self.b.len()
    }

    pub fn output_dim(&self) -> usize {
        (self.max - self.min) as usize
    }

    /// h: [bsz, input_dim] hidden states. Returns the per-member softmax
    /// rows [bsz, max−min].
    pub fn forward(&self, h: &[f32], bsz: usize) -> (Vec<f32>, UniformDiscreteCache) {
        let k = self.output_dim();
        let mut logits = vec![0.0f32; bsz * k];
        linear_f32(h, &self.w, &self.b, &mut logits, bsz, self.input_dim, k);
        for v in logits.iter_mut() {
            *v *= self.softmax_boost;
        }
        let mut probs = vec![0.0f32; logits.len()];
        softmax_f32(&logits, &mut probs, bsz, k);
        (
            probs.clone(),
            UniformDiscreteCache { h: h.to_vec(), probs, bsz },
        )
    }

    /// Epsilon-floored log-probability of `value` for batch member `b`,
    /// indexed at `value − member_min` (each member's own declared min).
    pub fn log_prob(probs: &[f32], k: usize, b: usize, value: i64, member_min: i64) -> f32 {
        let idx = value - member_min;
        debug_assert!(
            idx >= 0 && (idx as usize) < k,
            "sampled value {value} outside declared range (min {member_min}, {k} slots)"
        );
        (probs[b * k + idx as usize] + EPSILON).ln()
    }

    /// Backward for the negative-log-likelihood contribution of this head:
    /// loss += −scale · Σ_b log(p[b, pick_b] + ε). Accumulates parameter
    /// gradients into `grads` and the hidden-state gradient into `d_h`
    /// (both carrying prior accumulation).
    ///
    /// d/ds_j of log(p_i + ε) is r·(δ_ij − p_j) with r = p_i / (p_i + ε);
    /// the ε-correction factor keeps the analytic gradient in exact
    /// agreement with the floored forward value.
    pub fn backward_nll(
        &self,
        cache: &UniformDiscreteCache,
        picks: &[usize],
        scale: f32,
        grads: &mut Self,
        d_h: &mut [f32],
    ) {
        let k = self.output_dim();
        let bsz = cache.bsz;
        debug_assert_eq!(picks.len(), bsz);
        debug_assert_eq!(d_h.len(), bsz * self.input_dim);

        let mut d_logits = vec![0.0f32; bsz * k];
        for b in 0..bsz {
            let pick = picks[b];
            let p_pick = cache.probs[b * k + pick];
            let r = p_pick / (p_pick + EPSILON);
            for j in 0..k {
                let delta = if j == pick { 1.0 } else { 0.0 };
                // d(−scale·log(p_pick+ε))/d s_j, then chain through the boost
                d_logits[b * k + j] = scale * r * (cache.probs[b * k + j] - delta) * self.softmax_boost;
            }
        }

        linear_backward_f32(
            &cache.h, &self.w, &d_logits, d_h, &mut grads.w, &mut grads.b,
            bsz, self.input_dim, k,
        );
    }
}

// ── Closed dispatch over head variants ───────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProposalHead {
    UniformDiscrete(ProposalUniformDiscrete),
}

pub enum HeadCache {
    UniformDiscrete(UniformDiscreteCache),
}

impl ProposalHead {
    pub fn num_params(&self) -> usize {
        match self {
            ProposalHead::UniformDiscrete(h) => h.num_params(),
        }
    }

    pub fn zeros_like(&self) -> Self {
        match self {
            ProposalHead::UniformDiscrete(h) => ProposalHead::UniformDiscrete(h.zeros_like()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_rows_are_distributions() {
        let mut rng = SimpleRng::new(17);
        let head = ProposalUniformDiscrete::init(4, 0, 10, 1.0, &mut rng);
        assert_eq!(head.output_dim(), 10);
        let mut h = vec![0.0f32; 2 * 4];
        rng.fill_uniform(&mut h, 1.0);
        let (probs, _) = head.forward(&h, 2);
        for b in 0..2 {
            let s: f32 = probs[b * 10..(b + 1) * 10].iter().sum();
            assert!((s - 1.0).abs() < 1e-5, "member {b} sums to {s}");
            assert!(probs[b * 10..(b + 1) * 10].iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn test_negative_min_indexing() {
        let mut rng = SimpleRng::new(17);
        let head = ProposalUniformDiscrete::init(3, -5, 5, 1.0, &mut rng);
        let h = vec![0.1f32; 3];
        let (probs, _) = head.forward(&h, 1);
        // value −5 maps to slot 0, value 4 to slot 9
        let lp_low = ProposalUniformDiscrete::log_prob(&probs, 10, 0, -5, -5);
        let lp_high = ProposalUniformDiscrete::log_prob(&probs, 10, 0, 4, -5);
        assert!((lp_low - (probs[0] + EPSILON).ln()).abs() < 1e-7);
        assert!((lp_high - (probs[9] + EPSILON).ln()).abs() < 1e-7);
    }

    #[test]
    fn test_softmax_boost_sharpens() {
        let mut rng = SimpleRng::new(3);
        let mild = ProposalUniformDiscrete::init(4, 0, 6, 1.0, &mut rng);
        let mut sharp = mild.clone();
        sharp.softmax_boost = 10.0;
        let mut h = vec![0.0f32; 4];
        SimpleRng::new(9).fill_uniform(&mut h, 1.0);
        let (p_mild, _) = mild.forward(&h, 1);
        let (p_sharp, _) = sharp.forward(&h, 1);
        let max_mild = p_mild.iter().cloned().fold(0.0f32, f32::max);
        let max_sharp = p_sharp.iter().cloned().fold(0.0f32, f32::max);
        assert!(max_sharp > max_mild, "boost must concentrate mass: {max_sharp} vs {max_mild}");
    }

    #[test]
    fn test_backward_nll_matches_finite_diff() {
        let mut rng = SimpleRng::new(23);
        let head = ProposalUniformDiscrete::init(3, 0, 5, 2.0, &mut rng);
        let (bsz, k) = (2, 5);
        let mut h = vec![0.0f32; bsz * 3];
        rng.fill_uniform(&mut h, 1.0);
        let picks = vec![1usize, 4];
        let scale = 1.0 / bsz as f32;

        let (_, cache) = head.forward(&h, bsz);
        let mut grads = head.zeros_like();
        let mut d_h = vec![0.0f32; h.len()];
        head.backward_nll(&cache, &picks, scale, &mut grads, &mut d_h);

        let loss = |hd: &ProposalUniformDiscrete, hidden: &[f32]| {
            let (probs, _) = hd.forward(hidden, bsz);
            let mut total = 0.0f32;
            for b in 0..bsz {
                total += (probs[b * k + picks[b]] + EPSILON).ln();
            }
            -total * scale
        };
        let eps = 1e-3;
        for idx in 0..head.w.len() {
            let mut hp = head.clone();
            hp.w[idx] += eps;
            let mut hm = head.clone();
            hm.w[idx] -= eps;
            let fd = (loss(&hp, &h) - loss(&hm, &h)) / (2.0 * eps);
            assert!(
                (fd - grads.w[idx]).abs() < 1e-2,
                "w[{idx}]: analytic={}, fd={}",
                grads.w[idx],
                fd
            );
        }
        for idx in 0..h.len() {
            let mut hp = h.clone();
            hp[idx] += eps;
            let mut hm = h.clone();
            hm[idx] -= eps;
            let fd = (loss(&head, &hp) - loss(&head, &hm)) / (2.0 * eps);
            assert!((fd - d_h[idx]).abs() < 1e-2, "d_h[{idx}]: analytic={}, fd={}", d_h[idx], fd);
        }
    }
}
