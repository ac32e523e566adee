/// Multi-layer LSTM over the per-timestep concatenated feature sequence.
///
/// Input is [t_len, bsz, input_dim] flat, hidden/cell state start at zero,
/// output is the top layer's hidden state per timestep. The forward pass
/// caches per-step gate activations; the backward pass runs truncated BPTT
/// over the cached window (the window is the whole sub-batch sequence —
/// gradients never cross sub-batch boundaries).
///
/// Gate order in the fused buffers is [i f g o]:
///   i = σ(·), f = σ(·), g = tanh(·), o = σ(·)
///   c_t = f ⊙ c_{t-1} + i ⊙ g,  h_t = o ⊙ tanh(c_t)

use serde::{Deserialize, Serialize};

use crate::tensor::{linear_acc_f32, linear_backward_f32, linear_f32, sigmoid_f32, xavier_scale, SimpleRng};

/// One recurrent layer. Weights follow the fused-gate convention:
/// w_ih [4H, input_dim], w_hh [4H, H], biases [4H].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LstmLayerParams {
    pub w_ih: Vec<f32>,
    pub w_hh: Vec<f32>,
    pub b_ih: Vec<f32>,
    pub b_hh: Vec<f32>,
    pub input_dim: usize,
    pub hidden_dim: usize,
}

impl LstmLayerParams {
    fn init(input_dim: usize, hidden_dim: usize, rng: &mut SimpleRng) -> Self {
        let mut w_ih = vec![0.0f32; 4 * hidden_dim * input_dim];
        rng.fill_uniform(&mut w_ih, xavier_scale(input_dim, hidden_dim));
        let mut w_hh = vec![0.0f32; 4 * hidden_dim * hidden_dim];
        rng.fill_uniform(&mut w_hh, xavier_scale(hidden_dim, hidden_dim));
        LstmLayerParams {
            w_ih,
            w_hh,
            b_ih: vec![0.0; 4 * hidden_dim],
            b_hh: vec![0.0; 4 * hidden_dim],
            input_dim,
            hidden_dim,
        }
    }

    fn zeros_like(&self) -> Self {
        LstmLayerParams {
            w_ih: vec![0.0; self.w_ih.len()],
            w_hh: vec![0.0; self.w_hh.len()],
            b_ih: vec![0.0; self.b_ih.len()],
            b_hh: vec![0.0; self.b_hh.len()],
            input_dim: self.input_dim,
            hidden_dim: self.hidden_dim,
        }
    }

    fn num_params(&self) -> usize {
        self.w_ih.len() + self.w_hh.len() + self.b_ih.len() + self.b_hh.len()
    }
}

/// The full recurrent core: `depth` stacked layers of width `hidden_dim`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LstmParams {
    pub layers: Vec<LstmLayerParams>,
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub depth: usize,
}

/// Per-timestep activations of one layer, kept for BPTT.
struct StepCache {
    x: Vec<f32>,
    i: Vec<f32>,
    f: Vec<f32>,
    g: Vec<f32>,
    o: Vec<f32>,
    c: Vec<f32>,
    h: Vec<f32>,
}

pub struct LstmCache {
    steps: Vec<Vec<StepCache>>, // [depth][t_len]
    t_len: usize,
    bsz: usize,
}

impl LstmParams {
    pub fn init(input_dim: usize, hidden_dim: usize, depth: usize, rng: &mut SimpleRng) -> Self {
        let layers = (0..depth)
            .map(|l| {
                let in_dim = if l == 0 { input_dim } else { hidden_dim };
                LstmLayerParams::init(in_dim, hidden_dim, rng)
            })
            .collect();
        LstmParams {
            layers,
            input_dim,
            hidden_dim,
            depth,
        }
    }

    pub fn zeros_like(&self) -> Self {
        LstmParams {
            layers: self.layers.iter().map(LstmLayerParams::zeros_like).collect(),
            input_dim: self.input_dim,
            hidden_dim: self.hidden_dim,
            depth: self.depth,
        }
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(LstmLayerParams::num_params).sum()
    }

    /// input: [t_len, bsz, input_dim] flat. Returns the top layer's hidden
    /// outputs [t_len, bsz, hidden_dim] and the BPTT cache.
    pub fn forward(&self, input: &[f32], t_len: usize, bsz: usize) -> (Vec<f32>, LstmCache) {
        debug_assert_eq!(input.len(), t_len * bsz * self.input_dim);
        let hd = self.hidden_dim;

        let mut layer_input = input.to_vec();
        let mut steps: Vec<Vec<StepCache>> = Vec::with_capacity(self.depth);

        for layer in &self.layers {
            let in_dim = layer.input_dim;
            let mut layer_out = vec![0.0f32; t_len * bsz * hd];
            let mut layer_steps = Vec::with_capacity(t_len);
            let mut h_prev = vec![0.0f32; bsz * hd];
            let mut c_prev = vec![0.0f32; bsz * hd];

            for t in 0..t_len {
                let x_t = &layer_input[t * bsz * in_dim..(t + 1) * bsz * in_dim];
                let mut gates = vec![0.0f32; bsz * 4 * hd];
                linear_f32(x_t, &layer.w_ih, &layer.b_ih, &mut gates, bsz, in_dim, 4 * hd);
                linear_acc_f32(&h_prev, &layer.w_hh, &layer.b_hh, &mut gates, bsz, hd, 4 * hd);

                let mut i_g = vec![0.0f32; bsz * hd];
                let mut f_g = vec![0.0f32; bsz * hd];
                let mut g_g = vec![0.0f32; bsz * hd];
                let mut o_g = vec![0.0f32; bsz * hd];
                let mut c = vec![0.0f32; bsz * hd];
                let mut h = vec![0.0f32; bsz * hd];

                for b in 0..bsz {
                    let gb = b * 4 * hd;
                    for j in 0..hd {
                        let iv = sigmoid_f32(gates[gb + j]);
                        let fv = sigmoid_f32(gates[gb + hd + j]);
                        let gv = gates[gb + 2 * hd + j].tanh();
                        let ov = sigmoid_f32(gates[gb + 3 * hd + j]);
                        let cv = fv * c_prev[b * hd + j] + iv * gv;
                        let hv = ov * cv.tanh();
                        i_g[b * hd + j] = iv;
                        f_g[b * hd + j] = fv;
                        g_g[b * hd + j] = gv;
                        o_g[b * hd + j] = ov;
                        c[b * hd + j] = cv;
                        h[b * hd + j] = hv;
                    }
                }

                layer_out[t * bsz * hd..(t + 1) * bsz * hd].copy_from_slice(&h);
                h_prev.copy_from_slice(&h);
                c_prev.copy_from_slice(&c);
                layer_steps.push(StepCache {
                    x: x_t.to_vec(),
                    i: i_g,
                    f: f_g,
                    g: g_g,
                    o: o_g,
                    c,
                    h,
                });
            }

            steps.push(layer_steps);
            layer_input = layer_out;
        }

        (layer_input, LstmCache { steps, t_len, bsz })
    }

    /// BPTT over the cached window. d_out: [t_len, bsz, hidden_dim] on the
    /// top layer's hidden outputs. Returns (parameter gradients, gradient
    /// on the input sequence [t_len, bsz, input_dim]).
    pub fn backward(&self, cache: &LstmCache, d_out: &[f32]) -> (LstmParams, Vec<f32>) {
        let t_len = cache.t_len;
        let bsz = cache.bsz;
        let hd = self.hidden_dim;
        debug_assert_eq!(d_out.len(), t_len * bsz * hd);

        let mut grads = self.zeros_like();
        // Gradient on the current layer's hidden outputs, per timestep.
        let mut d_ext = d_out.to_vec();

        for (l, layer) in self.layers.iter().enumerate().rev() {
            let in_dim = layer.input_dim;
            let layer_steps = &cache.steps[l];
            let layer_grads = &mut grads.layers[l];

            let mut d_x_seq = vec![0.0f32; t_len * bsz * in_dim];
            let mut dh_next = vec![0.0f32; bsz * hd];
            let mut dc_next = vec![0.0f32; bsz * hd];
            let mut d_gates = vec![0.0f32; bsz * 4 * hd];

            for t in (0..t_len).rev() {
                let st = &layer_steps[t];

                for b in 0..bsz {
                    for j in 0..hd {
                        let bj = b * hd + j;
                        let dh = d_ext[t * bsz * hd + bj] + dh_next[bj];
                        let tc = st.c[bj].tanh();
                        let iv = st.i[bj];
                        let fv = st.f[bj];
                        let gv = st.g[bj];
                        let ov = st.o[bj];
                        let c_prev = if t == 0 { 0.0 } else { layer_steps[t - 1].c[bj] };

                        let d_o = dh * tc * ov * (1.0 - ov);
                        let dc = dh * ov * (1.0 - tc * tc) + dc_next[bj];
                        let d_i = dc * gv * iv * (1.0 - iv);
                        let d_f = dc * c_prev * fv * (1.0 - fv);
                        let d_g = dc * iv * (1.0 - gv * gv);

                        let gb = b * 4 * hd;
                        d_gates[gb + j] = d_i;
                        d_gates[gb + hd + j] = d_f;
                        d_gates[gb + 2 * hd + j] = d_g;
                        d_gates[gb + 3 * hd + j] = d_o;

                        dc_next[bj] = dc * fv;
                    }
                }

                // Input projection: d_x, dW_ih, db_ih.
                linear_backward_f32(
                    &st.x,
                    &layer.w_ih,
                    &d_gates,
                    &mut d_x_seq[t * bsz * in_dim..(t + 1) * bsz * in_dim],
                    &mut layer_grads.w_ih,
                    &mut layer_grads.b_ih,
                    bsz,
                    in_dim,
                    4 * hd,
                );

                // Recurrent projection: dh_{t-1}, dW_hh, db_hh.
                let h_prev_zeros;
                let h_prev: &[f32] = if t == 0 {
                    h_prev_zeros = vec![0.0f32; bsz * hd];
                    &h_prev_zeros
                } else {
                    &layer_steps[t - 1].h
                };
                dh_next.fill(0.0);
                linear_backward_f32(
                    h_prev,
                    &layer.w_hh,
                    &d_gates,
                    &mut dh_next,
                    &mut layer_grads.w_hh,
                    &mut layer_grads.b_hh,
                    bsz,
                    hd,
                    4 * hd,
                );
            }

            d_ext = d_x_seq;
        }

        (grads, d_ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shapes() {
        let mut rng = SimpleRng::new(21);
        let lstm = LstmParams::init(6, 4, 2, &mut rng);
        let (t_len, bsz) = (3, 2);
        let mut input = vec![0.0f32; t_len * bsz * 6];
        rng.fill_uniform(&mut input, 1.0);
        let (out, _) = lstm.forward(&input, t_len, bsz);
        assert_eq!(out.len(), t_len * bsz * 4);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_zero_input_zero_bias_stays_bounded() {
        let mut rng = SimpleRng::new(21);
        let lstm = LstmParams::init(4, 3, 1, &mut rng);
        let input = vec![0.0f32; 5 * 1 * 4];
        let (out, _) = lstm.forward(&input, 5, 1);
        // tanh-bounded hidden state
        assert!(out.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_forward_deterministic() {
        let mut rng = SimpleRng::new(77);
        let lstm = LstmParams::init(5, 4, 2, &mut rng);
        let mut input = vec![0.0f32; 4 * 3 * 5];
        SimpleRng::new(5).fill_uniform(&mut input, 1.0);
        let (a, _) = lstm.forward(&input, 4, 3);
        let (b, _) = lstm.forward(&input, 4, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn test_num_params_counts_all_layers() {
        let mut rng = SimpleRng::new(1);
        let lstm = LstmParams::init(6, 4, 2, &mut rng);
        let l0 = 4 * 4 * 6 + 4 * 4 * 4 + 16 + 16;
        let l1 = 4 * 4 * 4 + 4 * 4 * 4 + 16 + 16;
        assert_eq!(lstm.num_params(), l0 + l1);
    }

    #[test]
    fn test_backward_matches_finite_diff() {
        let mut rng = SimpleRng::new(13);
        let (t_len, bsz, in_dim, hd, depth) = (3, 2, 3, 4, 2);
        let lstm = LstmParams::init(in_dim, hd, depth, &mut rng);
        let mut input = vec![0.0f32; t_len * bsz * in_dim];
        rng.fill_uniform(&mut input, 1.0);

        // Loss = sum of all hidden outputs.
        let (out, cache) = lstm.forward(&input, t_len, bsz);
        let d_out = vec![1.0f32; out.len()];
        let (grads, d_input) = lstm.backward(&cache, &d_out);

        let loss = |l: &LstmParams, x: &[f32]| l.forward(x, t_len, bsz).0.iter().sum::<f32>();
        let eps = 1e-2;
        let tol = 1e-2;

        // Spot-check a few weights in every buffer of both layers.
        for l in 0..depth {
            let n_ih = lstm.layers[l].w_ih.len();
            for idx in [0usize, n_ih / 2, n_ih - 1] {
                let mut lp = lstm.clone();
                lp.layers[l].w_ih[idx] += eps;
                let mut lm = lstm.clone();
                lm.layers[l].w_ih[idx] -= eps;
                let fd = (loss(&lp, &input) - loss(&lm, &input)) / (2.0 * eps);
                let an = grads.layers[l].w_ih[idx];
                assert!((fd - an).abs() < tol, "layer {l} w_ih[{idx}]: analytic={an}, fd={fd}");
            }
            let n_hh = lstm.layers[l].w_hh.len();
            for idx in [0usize, n_hh - 1] {
                let mut lp = lstm.clone();
                lp.layers[l].w_hh[idx] += eps;
                let mut lm = lstm.clone();
                lm.layers[l].w_hh[idx] -= eps;
                let fd = (loss(&lp, &input) - loss(&lm, &input)) / (2.0 * eps);
                let an = grads.layers[l].w_hh[idx];
                assert!((fd - an).abs() < tol, "layer {l} w_hh[{idx}]: analytic={an}, fd={fd}");
            }
            for idx in [0usize, 4 * hd - 1] {
                let mut lp = lstm.clone();
                lp.layers[l].b_ih[idx] += eps;
                let mut lm = lstm.clone();
                lm.layers[l].b_ih[idx] -= eps;
                let fd = (loss(&lp, &input) - loss(&lm, &input)) / (2.0 * eps);
                let an = grads.layers[l].b_ih[idx];
                assert!((fd - an).abs() < tol, "layer {l} b_ih[{idx}]: analytic={an}, fd={fd}");
            }
        }

        // Input gradient.
        for idx in [0usize, input.len() / 2, input.len() - 1] {
            let mut xp = input.clone();
            xp[idx] += eps;
            let mut xm = input.clone();
            xm[idx] -= eps;
            let fd = (loss(&lstm, &xp) - loss(&lstm, &xm)) / (2.0 * eps);
            let an = d_input[idx];
            assert!((fd - an).abs() < tol, "d_input[{idx}]: analytic={an}, fd={fd}");
        }
    }
}
