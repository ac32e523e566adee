/// AdamW optimizer over the artifact's dynamically grown parameter set.
///
/// The artifact enumerates its parameter buffers in a stable order
/// (observe layer, recurrent core, then the per-site arenas in
/// registration order). Because polymorph only ever appends arena entries,
/// existing moment buffers keep their positions across growth; buffers for
/// newly attached layers are created lazily at the next step, starting at
/// zero. Bias correction uses the global step count.
///
/// Source: Loshchilov & Hutter 2019. With weight_decay = 0 this reduces to
/// plain Adam.

use serde::{Deserialize, Serialize};

/// AdamW hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Moment buffers for a single parameter buffer (one flat array of weights).
#[derive(Clone, Debug, Serialize, Deserialize)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf { m: vec![0.0; n], v: vec![0.0; n] }
    }
}

/// Core AdamW step on a single (params, grads, m, v) group.
///
/// Modifies params, m, v in place. Uses pre-computed bias correction inverses.
#[inline]
fn adamw_step_buf(
    params: &mut [f32],
    grads: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    bc1_inv: f32,
    bc2_inv: f32,
    weight_decay: f32,
) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        let g = grads[i];
        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
        let m_hat = m[i] * bc1_inv;
        let v_hat = v[i] * bc2_inv;
        params[i] -= lr * (m_hat / (v_hat.sqrt() + eps) + weight_decay * params[i]);
    }
}

/// Optimizer state: one moment-buffer pair per parameter buffer, in the
/// artifact's stable enumeration order, plus the global step counter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdamW {
    pub config: AdamWConfig,
    bufs: Vec<MomentBuf>,
    step: u64,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        AdamW {
            config,
            bufs: Vec::new(),
            step: 0,
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// One update over all (param, grad) buffer pairs. Pairs past the end
    /// of the tracked set get fresh zero moment buffers — this is how
    /// polymorph growth extends the optimizer without touching existing
    /// state.
    pub fn step(&mut self, pairs: &mut [(&mut [f32], &[f32])], lr: f32) {
        let c = self.config.clone();
        self.step += 1;
        let t = self.step as f32;
        let bc1_inv = 1.0 / (1.0 - c.beta1.powf(t));
        let bc2_inv = 1.0 / (1.0 - c.beta2.powf(t));

        for (idx, (p, g)) in pairs.iter_mut().enumerate() {
            if idx >= self.bufs.len() {
                self.bufs.push(MomentBuf::zeros(p.len()));
            }
            let buf = &mut self.bufs[idx];
            debug_assert_eq!(buf.m.len(), p.len(), "moment buffer shape drifted from parameter buffer");
            adamw_step_buf(
                p, g, &mut buf.m, &mut buf.v,
                lr, c.beta1, c.beta2, c.eps, bc1_inv, bc2_inv, c.weight_decay,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_moves_params_against_gradient() {
        let mut opt = AdamW::new(AdamWConfig::default());
        let mut p = vec![0.5f32; 4];
        let g = vec![1.0f32; 4];
        let before = p.clone();
        {
            let mut pairs = vec![(p.as_mut_slice(), g.as_slice())];
            opt.step(&mut pairs, 1e-2);
        }
        assert!(p.iter().zip(&before).all(|(a, b)| a < b), "positive grad must decrease params");
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_constant_gradient_converges_downhill() {
        let mut opt = AdamW::new(AdamWConfig::default());
        let mut p = vec![1.0f32];
        let g = vec![1.0f32];
        for _ in 0..200 {
            let mut pairs = vec![(p.as_mut_slice(), g.as_slice())];
            opt.step(&mut pairs, 1e-2);
        }
        assert!(p[0] < 0.0, "200 steps against constant gradient: {}", p[0]);
    }

    #[test]
    fn test_late_buffers_get_fresh_state() {
        let mut opt = AdamW::new(AdamWConfig::default());
        let mut a = vec![0.1f32; 2];
        let ga = vec![1.0f32; 2];
        {
            let mut pairs = vec![(a.as_mut_slice(), ga.as_slice())];
            opt.step(&mut pairs, 1e-3);
        }

        // A new buffer appears at the end (polymorph attached a layer).
        let mut b = vec![0.2f32; 3];
        let gb = vec![1.0f32; 3];
        let a_after_first = a.clone();
        {
            let mut pairs = vec![(a.as_mut_slice(), ga.as_slice()), (b.as_mut_slice(), gb.as_slice())];
            opt.step(&mut pairs, 1e-3);
        }
        assert_ne!(a, a_after_first, "existing buffer keeps updating");
        assert!(b.iter().all(|&v| v < 0.2), "new buffer updates from zero moments");
    }

    #[test]
    fn test_state_survives_serde_roundtrip() {
        let mut opt = AdamW::new(AdamWConfig::default());
        let mut p = vec![0.5f32; 2];
        let g = vec![0.3f32; 2];
        {
            let mut pairs = vec![(p.as_mut_slice(), g.as_slice())];
            opt.step(&mut pairs, 1e-2);
        }
        let json = serde_json::to_string(&opt).unwrap();
        let mut back: AdamW = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step_count(), 1);

        // Both copies take the same next step.
        let mut p2 = p.clone();
        {
            let mut pairs = vec![(p.as_mut_slice(), g.as_slice())];
            opt.step(&mut pairs, 1e-2);
        }
        {
            let mut pairs = vec![(p2.as_mut_slice(), g.as_slice())];
            back.step(&mut pairs, 1e-2);
        }
        assert_eq!(p, p2);
    }
}
