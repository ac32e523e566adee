/// The polymorphic model artifact.
///
/// One owned aggregate holds everything the proposal network is: the
/// observation encoder, the recurrent core, the per-(address, instance)
/// sample-embedding/proposal-head arenas, the one-hot registries, training
/// bookkeeping and optimizer state. All mutation happens through an
/// exclusive reference from a single driver loop — no globals.
///
/// Growth ("polymorph") only ever appends: registries assign slots in
/// first-seen order, the site arena is push-only, and the optimizer's
/// moment buffers extend lazily at the end. Earlier handles, indices and
/// optimizer state stay valid across growth.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adamw::AdamW;
use crate::embedding::{
    ObserveCache, ObserveEmbedding, ObserveEmbeddingKind, SampleEmbeddingFC, SampleEmbeddingKind,
    SampleFcCache,
};
use crate::error::ModelError;
use crate::lstm::{LstmCache, LstmParams};
use crate::onehot::OneHotRegistry;
use crate::proposal::{ProposalHead, ProposalUniformDiscrete, UniformDiscreteCache};
use crate::tensor::{SimpleRng, Tensor};
use crate::trace::{Proposal, Trace};

/// Construction-time hyperparameters. One-hot capacities are fixed here;
/// exceeding them later is a fatal `CapacityError`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub model_name: String,
    pub one_hot_address_dim: usize,
    pub one_hot_instance_dim: usize,
    pub one_hot_proposal_dim: usize,
    pub softmax_boost: f32,
    pub seed: u64,
}

impl ArtifactConfig {
    /// Tiny configuration for fast tests.
    pub fn test_config() -> Self {
        ArtifactConfig {
            model_name: "test".to_string(),
            one_hot_address_dim: 8,
            one_hot_instance_dim: 8,
            one_hot_proposal_dim: 4,
            softmax_boost: 1.0,
            seed: 42,
        }
    }
}

/// One grown (address, instance) site: its sample embedding and its
/// proposal head, living side by side in the arena.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Site {
    pub address: String,
    pub instance: i64,
    pub sample_layer: SampleEmbeddingFC,
    pub proposal_layer: ProposalHead,
}

/// Gradients mirroring the artifact's full parameter set. Produced by
/// `grad_loss`, consumed by the optimizer step inside `train_batch`.
pub struct ArtifactGrads {
    pub observe: ObserveEmbedding,
    pub lstm: LstmParams,
    pub sites: Vec<(SampleEmbeddingFC, ProposalHead)>,
}

/// Per-sub-batch forward intermediates. Scoped to one loss/grad call and
/// dropped at its end, which bounds transient memory across repeated
/// dynamic forward passes.
struct SubBatchPass {
    loss: f32,
    obs_cache: ObserveCache,
    smp_caches: Vec<Option<(usize, SampleFcCache)>>,
    lstm_cache: LstmCache,
    head_caches: Vec<(usize, UniformDiscreteCache, Vec<usize>)>,
    t_len: usize,
    bsz: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    // Identity and versioning.
    pub model_name: String,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub code_version: String,

    // Architecture hyperparameters.
    pub softmax_boost: f32,
    smp_emb_kind: Option<SampleEmbeddingKind>,
    smp_emb_dim: usize,
    obs_emb_kind: Option<ObserveEmbeddingKind>,
    obs_emb_dim: usize,
    lstm_dim: usize,
    lstm_depth: usize,
    lstm_input_dim: usize,

    // One-hot registries.
    one_hot_address: OneHotRegistry<String>,
    one_hot_instance: OneHotRegistry<i64>,
    one_hot_proposal: OneHotRegistry<String>,

    // Layers. The site index is rebuilt from the arena after reload.
    observe_layer: Option<ObserveEmbedding>,
    lstm: Option<LstmParams>,
    sites: Vec<Site>,
    #[serde(skip)]
    site_index: HashMap<(String, i64), usize>,

    // Training/validation bookkeeping.
    pub num_parameters: usize,
    pub train_loss_best: Option<f32>,
    pub train_loss_worst: Option<f32>,
    pub valid_loss_initial: Option<f32>,
    pub valid_loss_final: Option<f32>,
    pub valid_loss_best: Option<f32>,
    pub valid_loss_worst: Option<f32>,
    pub train_history_trace: Vec<u64>,
    pub train_history_loss: Vec<f32>,
    pub valid_history_trace: Vec<u64>,
    pub valid_history_loss: Vec<f32>,
    pub total_training_time_secs: f64,
    pub total_iterations: u64,
    pub total_traces: u64,
    pub updates: u64,

    valid_batch: Option<Vec<Vec<Trace>>>,
    optim: AdamW,
    rng: SimpleRng,
}

impl Artifact {
    pub fn new(config: ArtifactConfig) -> Self {
        let now = SystemTime::now();
        Artifact {
            model_name: config.model_name,
            created: now,
            modified: now,
            code_version: env!("CARGO_PKG_VERSION").to_string(),
            softmax_boost: config.softmax_boost,
            smp_emb_kind: None,
            smp_emb_dim: 0,
            obs_emb_kind: None,
            obs_emb_dim: 0,
            lstm_dim: 0,
            lstm_depth: 0,
            lstm_input_dim: 0,
            one_hot_address: OneHotRegistry::new(config.one_hot_address_dim),
            one_hot_instance: OneHotRegistry::new(config.one_hot_instance_dim),
            one_hot_proposal: OneHotRegistry::new(config.one_hot_proposal_dim),
            observe_layer: None,
            lstm: None,
            sites: Vec::new(),
            site_index: HashMap::new(),
            num_parameters: 0,
            train_loss_best: None,
            train_loss_worst: None,
            valid_loss_initial: None,
            valid_loss_final: None,
            valid_loss_best: None,
            valid_loss_worst: None,
            train_history_trace: Vec::new(),
            train_history_loss: Vec::new(),
            valid_history_trace: Vec::new(),
            valid_history_loss: Vec::new(),
            total_training_time_secs: 0.0,
            total_iterations: 0,
            total_traces: 0,
            updates: 0,
            valid_batch: None,
            optim: AdamW::default(),
            rng: SimpleRng::new(config.seed),
        }
    }

    // ── One-time architecture configuration ──────────────────────────

    pub fn set_sample_embedding(&mut self, kind: SampleEmbeddingKind, dim: usize) {
        self.smp_emb_kind = Some(kind);
        self.smp_emb_dim = dim;
    }

    /// Constructs the observation encoder from one example observation.
    /// Rank validation happens here, before any forward pass.
    pub fn set_observe_embedding(
        &mut self,
        example_observes: &Tensor,
        kind: ObserveEmbeddingKind,
        dim: usize,
    ) -> Result<(), ModelError> {
        let layer = ObserveEmbedding::new(kind, example_observes, dim, &mut self.rng)?;
        self.obs_emb_kind = Some(kind);
        self.obs_emb_dim = dim;
        self.observe_layer = Some(layer);
        self.num_parameters = self.count_parameters();
        Ok(())
    }

    /// Creates the recurrent core. Requires both embedding configurations,
    /// since the input width concatenates their outputs with the one-hot
    /// tags.
    pub fn set_lstm(&mut self, dim: usize, depth: usize) -> Result<(), ModelError> {
        if self.observe_layer.is_none() {
            return Err(ModelError::config("set_observe_embedding must run before set_lstm"));
        }
        if self.smp_emb_kind.is_none() {
            return Err(ModelError::config("set_sample_embedding must run before set_lstm"));
        }
        self.lstm_dim = dim;
        self.lstm_depth = depth;
        self.lstm_input_dim = self.obs_emb_dim
            + self.smp_emb_dim
            + self.one_hot_address.dim()
            + self.one_hot_instance.dim()
            + self.one_hot_proposal.dim();
        self.lstm = Some(LstmParams::init(self.lstm_input_dim, dim, depth, &mut self.rng));
        self.num_parameters = self.count_parameters();
        Ok(())
    }

    /// Stores the held-out validation batch and registers its structure.
    pub fn set_valid_batch(&mut self, batch: Vec<Vec<Trace>>) -> Result<(), ModelError> {
        self.polymorph(&batch)?;
        self.valid_batch = Some(batch);
        Ok(())
    }

    fn ensure_configured(&self) -> Result<(), ModelError> {
        if self.observe_layer.is_none() || self.smp_emb_kind.is_none() || self.lstm.is_none() {
            return Err(ModelError::config(
                "artifact not configured: set_sample_embedding, set_observe_embedding and set_lstm must run first",
            ));
        }
        Ok(())
    }

    // ── Growth ───────────────────────────────────────────────────────

    /// Registers every address/instance/proposal-kind of each sub-batch's
    /// representative trace and lazily attaches a sample-embedding /
    /// proposal-head pair per new (address, instance). Idempotent;
    /// monotonic. Returns whether any layer was attached.
    pub fn polymorph(&mut self, batch: &[Vec<Trace>]) -> Result<bool, ModelError> {
        self.ensure_configured()?;
        let mut layers_changed = false;

        for sub_batch in batch {
            let example_trace = match sub_batch.first() {
                Some(t) => t,
                None => continue,
            };
            for sample in &example_trace.samples {
                let before = self.one_hot_address.len();
                self.one_hot_address
                    .register(&sample.address)
                    .map_err(|e| ModelError::capacity("address", e))?;
                if self.one_hot_address.len() > before {
                    info!(address = %sample.address, "polymorphing, new address");
                }

                let before = self.one_hot_instance.len();
                self.one_hot_instance
                    .register(&sample.instance)
                    .map_err(|e| ModelError::capacity("instance", e))?;
                if self.one_hot_instance.len() > before {
                    info!(instance = sample.instance, "polymorphing, new instance");
                }

                let proposal_name = sample.proposal.name().to_string();
                let before = self.one_hot_proposal.len();
                self.one_hot_proposal
                    .register(&proposal_name)
                    .map_err(|e| ModelError::capacity("proposal", e))?;
                if self.one_hot_proposal.len() > before {
                    info!(proposal = %proposal_name, "polymorphing, new proposal kind");
                }

                let key = (sample.address.clone(), sample.instance);
                if !self.site_index.contains_key(&key) {
                    let sample_layer = match self.smp_emb_kind {
                        Some(SampleEmbeddingKind::Fc) => {
                            SampleEmbeddingFC::init(sample.value.numel(), self.smp_emb_dim, &mut self.rng)
                        }
                        None => return Err(ModelError::config("sample embedding kind not configured")),
                    };
                    let proposal_layer = match &sample.proposal {
                        Proposal::UniformDiscrete { min, max } => {
                            ProposalHead::UniformDiscrete(ProposalUniformDiscrete::init(
                                self.lstm_dim,
                                *min,
                                *max,
                                self.softmax_boost,
                                &mut self.rng,
                            ))
                        }
                        Proposal::Normal => {
                            return Err(ModelError::unsupported_proposal(sample.proposal.name()))
                        }
                    };
                    info!(
                        address = %sample.address,
                        instance = sample.instance,
                        "polymorphing, new layer pair attached"
                    );
                    let id = self.sites.len();
                    self.sites.push(Site {
                        address: sample.address.clone(),
                        instance: sample.instance,
                        sample_layer,
                        proposal_layer,
                    });
                    self.site_index.insert(key, id);
                    layers_changed = true;
                }
            }
        }

        if layers_changed {
            self.num_parameters = self.count_parameters();
            self.modified = SystemTime::now();
            info!(num_parameters = self.num_parameters, "polymorphing, new trainable parameter count");
        }
        Ok(layers_changed)
    }

    fn count_parameters(&self) -> usize {
        let observe = self.observe_layer.as_ref().map_or(0, ObserveEmbedding::num_params);
        let lstm = self.lstm.as_ref().map_or(0, LstmParams::num_params);
        let sites: usize = self
            .sites
            .iter()
            .map(|s| s.sample_layer.num_params() + s.proposal_layer.num_params())
            .sum();
        observe + lstm + sites
    }

    fn site_id(&self, address: &str, instance: i64) -> Result<usize, ModelError> {
        self.site_index
            .get(&(address.to_string(), instance))
            .copied()
            .ok_or_else(|| {
                ModelError::config(format!(
                    "no layer pair for site ({address}, {instance}); polymorph must cover the batch first"
                ))
            })
    }

    // ── Loss ─────────────────────────────────────────────────────────

    /// Mean negative log-likelihood per trace for one sub-batch.
    pub fn loss(&self, sub_batch: &[Trace]) -> Result<f32, ModelError> {
        // The full pass (caches included) lives only inside this call.
        let pass = self.run_sub_batch(sub_batch)?;
        Ok(pass.loss)
    }

    /// Unweighted mean of the per-sub-batch losses over the stored
    /// validation batch. Sub-batches of unequal size are averaged as if
    /// equal — the mean is over sub-batches, not traces.
    pub fn valid_loss(&self) -> Result<f32, ModelError> {
        let valid_batch = self
            .valid_batch
            .as_ref()
            .ok_or_else(|| ModelError::config("no validation batch set"))?;
        if valid_batch.is_empty() {
            return Err(ModelError::config("validation batch is empty"));
        }
        let mut total = 0.0f32;
        for sub_batch in valid_batch {
            total += self.loss(sub_batch)?;
        }
        Ok(total / valid_batch.len() as f32)
    }

    /// `valid_loss` plus bookkeeping: initial/final/best/worst and the
    /// validation history keyed by total traces seen.
    pub fn record_valid_loss(&mut self) -> Result<f32, ModelError> {
        let loss = self.valid_loss()?;
        if self.valid_loss_initial.is_none() {
            self.valid_loss_initial = Some(loss);
        }
        self.valid_loss_final = Some(loss);
        self.valid_loss_best = Some(self.valid_loss_best.map_or(loss, |b| b.min(loss)));
        self.valid_loss_worst = Some(self.valid_loss_worst.map_or(loss, |w| w.max(loss)));
        self.valid_history_trace.push(self.total_traces);
        self.valid_history_loss.push(loss);
        Ok(loss)
    }

    /// The full per-sub-batch state machine of the recurrent pass:
    /// observation embedding once, per-timestep sample embeddings from the
    /// previous timestep's values, one-hot tagging, recurrent core, then
    /// per-timestep proposal heads and the epsilon-floored log-likelihood.
    fn run_sub_batch(&self, sub_batch: &[Trace]) -> Result<SubBatchPass, ModelError> {
        self.ensure_configured()?;
        let bsz = sub_batch.len();
        if bsz == 0 {
            return Err(ModelError::config("empty sub-batch"));
        }
        let example_trace = &sub_batch[0];
        let t_len = example_trace.length();
        // Reject unsupported proposal kinds and uncovered structure before
        // any registry lookup; polymorph must precede the loss pass.
        for sample in &example_trace.samples {
            if let Proposal::Normal = sample.proposal {
                return Err(ModelError::unsupported_proposal(sample.proposal.name()));
            }
            self.site_id(&sample.address, sample.instance)?;
        }
        let observe_layer = match self.observe_layer.as_ref() {
            Some(l) => l,
            None => return Err(ModelError::config("observe embedding not configured")),
        };
        let lstm = match self.lstm.as_ref() {
            Some(l) => l,
            None => return Err(ModelError::config("lstm not configured")),
        };

        // Observation batch, embedded once per sub-batch.
        if example_trace.observes.dim() == 0 || example_trace.observes.dim() > 3 {
            return Err(ModelError::config(format!(
                "unsupported observation rank {} in loss",
                example_trace.observes.dim()
            )));
        }
        let obs_numel = observe_layer.input_numel();
        let mut obs = vec![0.0f32; bsz * obs_numel];
        for (b, trace) in sub_batch.iter().enumerate() {
            if trace.observes.numel() != obs_numel {
                return Err(ModelError::config(format!(
                    "observation numel {} does not match configured encoder input {}",
                    trace.observes.numel(),
                    obs_numel
                )));
            }
            obs[b * obs_numel..(b + 1) * obs_numel].copy_from_slice(&trace.observes.data);
        }
        let (obs_emb, obs_cache) = observe_layer.forward(&obs, bsz);

        // Per-timestep concatenated recurrent input.
        let obs_dim = self.obs_emb_dim;
        let smp_dim = self.smp_emb_dim;
        let input_dim = self.lstm_input_dim;
        let mut lstm_input = vec![0.0f32; t_len * bsz * input_dim];
        let mut smp_caches: Vec<Option<(usize, SampleFcCache)>> = Vec::with_capacity(t_len);

        for t in 0..t_len {
            let sample = &example_trace.samples[t];
            let a_hot = self.one_hot_address.one_hot(&sample.address);
            let i_hot = self.one_hot_instance.one_hot(&sample.instance);
            let p_hot = self.one_hot_proposal.one_hot(&sample.proposal.name().to_string());

            // Sample embedding from the previous timestep's actual values;
            // zero input at t = 0 (no prior choice exists).
            let smp_emb: Vec<f32>;
            if t == 0 {
                smp_emb = vec![0.0f32; bsz * smp_dim];
                smp_caches.push(None);
            } else {
                let prev = &example_trace.samples[t - 1];
                let site_id = self.site_id(&prev.address, prev.instance)?;
                let in_dim = self.sites[site_id].sample_layer.input_dim;
                let mut vals = vec![0.0f32; bsz * in_dim];
                for (b, trace) in sub_batch.iter().enumerate() {
                    let v = &trace.samples[t - 1].value;
                    debug_assert_eq!(v.numel(), in_dim, "sample value shape drifted within sub-batch");
                    vals[b * in_dim..(b + 1) * in_dim].copy_from_slice(&v.data);
                }
                let (emb, cache) = self.sites[site_id].sample_layer.forward(&vals, bsz);
                smp_emb = emb;
                smp_caches.push(Some((site_id, cache)));
            }

            for b in 0..bsz {
                let row = &mut lstm_input[(t * bsz + b) * input_dim..(t * bsz + b + 1) * input_dim];
                row[..obs_dim].copy_from_slice(&obs_emb[b * obs_dim..(b + 1) * obs_dim]);
                row[obs_dim..obs_dim + smp_dim].copy_from_slice(&smp_emb[b * smp_dim..(b + 1) * smp_dim]);
                let mut at = obs_dim + smp_dim;
                row[at..at + a_hot.len()].copy_from_slice(&a_hot);
                at += a_hot.len();
                row[at..at + i_hot.len()].copy_from_slice(&i_hot);
                at += i_hot.len();
                row[at..at + p_hot.len()].copy_from_slice(&p_hot);
            }
        }

        // Recurrent core, zero-initialized state.
        let (lstm_out, lstm_cache) = lstm.forward(&lstm_input, t_len, bsz);

        // Per-timestep proposal heads and log-likelihood of the actually
        // sampled values.
        let hd = self.lstm_dim;
        let mut logpdf = 0.0f32;
        let mut head_caches = Vec::with_capacity(t_len);
        for t in 0..t_len {
            let sample = &example_trace.samples[t];
            let site_id = self.site_id(&sample.address, sample.instance)?;
            let ProposalHead::UniformDiscrete(head) = &self.sites[site_id].proposal_layer;

            let h_t = &lstm_out[t * bsz * hd..(t + 1) * bsz * hd];
            let (probs, cache) = head.forward(h_t, bsz);
            let k = head.output_dim();
            let mut picks = Vec::with_capacity(bsz);
            for (b, trace) in sub_batch.iter().enumerate() {
                let member = &trace.samples[t];
                let member_min = match member.proposal {
                    Proposal::UniformDiscrete { min, .. } => min,
                    Proposal::Normal => {
                        return Err(ModelError::unsupported_proposal(member.proposal.name()))
                    }
                };
                let value = member.value.data[0] as i64;
                logpdf += ProposalUniformDiscrete::log_prob(&probs, k, b, value, member_min);
                picks.push((value - member_min) as usize);
            }
            head_caches.push((site_id, cache, picks));
        }

        debug!(bsz, t_len, "sub-batch pass complete");
        Ok(SubBatchPass {
            loss: -logpdf / bsz as f32,
            obs_cache,
            smp_caches,
            lstm_cache,
            head_caches,
            t_len,
            bsz,
        })
    }

    // ── Training path ────────────────────────────────────────────────

    /// Forward plus hand-derived backward through the whole pipeline.
    /// BPTT is truncated at the sub-batch boundary.
    pub fn grad_loss(&self, sub_batch: &[Trace]) -> Result<(f32, ArtifactGrads), ModelError> {
        let pass = self.run_sub_batch(sub_batch)?;
        let observe_layer = match self.observe_layer.as_ref() {
            Some(l) => l,
            None => return Err(ModelError::config("observe embedding not configured")),
        };
        let lstm = match self.lstm.as_ref() {
            Some(l) => l,
            None => return Err(ModelError::config("lstm not configured")),
        };

        let mut grads = ArtifactGrads {
            observe: observe_layer.zeros_like(),
            lstm: lstm.zeros_like(),
            sites: self
                .sites
                .iter()
                .map(|s| (s.sample_layer.zeros_like(), s.proposal_layer.zeros_like()))
                .collect(),
        };

        let bsz = pass.bsz;
        let t_len = pass.t_len;
        let hd = self.lstm_dim;
        let scale = 1.0 / bsz as f32;

        // Heads → gradient on each timestep's hidden output.
        let mut d_hidden = vec![0.0f32; t_len * bsz * hd];
        for (t, (site_id, cache, picks)) in pass.head_caches.iter().enumerate() {
            let ProposalHead::UniformDiscrete(head) = &self.sites[*site_id].proposal_layer;
            let ProposalHead::UniformDiscrete(ghead) = &mut grads.sites[*site_id].1;
            head.backward_nll(
                cache,
                picks,
                scale,
                ghead,
                &mut d_hidden[t * bsz * hd..(t + 1) * bsz * hd],
            );
        }

        // Recurrent core → gradient on the concatenated input sequence.
        let (lstm_grads, d_input) = lstm.backward(&pass.lstm_cache, &d_hidden);
        grads.lstm = lstm_grads;

        // Split the concatenation: observation segment accumulates across
        // every timestep; sample segments flow into the embedding layer
        // that produced them. One-hot segments are constants.
        let obs_dim = self.obs_emb_dim;
        let smp_dim = self.smp_emb_dim;
        let input_dim = self.lstm_input_dim;
        let mut d_obs = vec![0.0f32; bsz * obs_dim];
        for t in 0..t_len {
            for b in 0..bsz {
                let row = &d_input[(t * bsz + b) * input_dim..(t * bsz + b + 1) * input_dim];
                for i in 0..obs_dim {
                    d_obs[b * obs_dim + i] += row[i];
                }
            }
            if let Some((site_id, cache)) = &pass.smp_caches[t] {
                let mut d_smp = vec![0.0f32; bsz * smp_dim];
                for b in 0..bsz {
                    let row = &d_input[(t * bsz + b) * input_dim..(t * bsz + b + 1) * input_dim];
                    d_smp[b * smp_dim..(b + 1) * smp_dim].copy_from_slice(&row[obs_dim..obs_dim + smp_dim]);
                }
                self.sites[*site_id]
                    .sample_layer
                    .backward(cache, &d_smp, &mut grads.sites[*site_id].0);
            }
        }
        observe_layer.backward(&pass.obs_cache, &d_obs, &mut grads.observe);

        Ok((pass.loss, grads))
    }

    /// Parameter/gradient buffer pairs in the stable enumeration order the
    /// optimizer relies on: observe layer, recurrent core, then sites in
    /// registration order.
    fn param_grad_pairs<'a>(&'a mut self, grads: &'a ArtifactGrads) -> Vec<(&'a mut [f32], &'a [f32])> {
        let mut pairs: Vec<(&'a mut [f32], &'a [f32])> = Vec::new();

        match (self.observe_layer.as_mut(), &grads.observe) {
            (Some(ObserveEmbedding::Fc(p)), ObserveEmbedding::Fc(g)) => {
                pairs.push((&mut p.w1, &g.w1));
                pairs.push((&mut p.b1, &g.b1));
                pairs.push((&mut p.w2, &g.w2));
                pairs.push((&mut p.b2, &g.b2));
            }
            (Some(ObserveEmbedding::Cnn6(p)), ObserveEmbedding::Cnn6(g)) => {
                for (pc, gc) in p.convs.iter_mut().zip(g.convs.iter()) {
                    pairs.push((&mut pc.w, &gc.w));
                    pairs.push((&mut pc.b, &gc.b));
                }
                pairs.push((&mut p.w_lin1, &g.w_lin1));
                pairs.push((&mut p.b_lin1, &g.b_lin1));
                pairs.push((&mut p.w_lin2, &g.w_lin2));
                pairs.push((&mut p.b_lin2, &g.b_lin2));
            }
            _ => unreachable!("observe layer and gradients disagree on the encoder variant"),
        }

        if let Some(lstm) = self.lstm.as_mut() {
            for (pl, gl) in lstm.layers.iter_mut().zip(grads.lstm.layers.iter()) {
                pairs.push((&mut pl.w_ih, &gl.w_ih));
                pairs.push((&mut pl.w_hh, &gl.w_hh));
                pairs.push((&mut pl.b_ih, &gl.b_ih));
                pairs.push((&mut pl.b_hh, &gl.b_hh));
            }
        }

        for (site, (gs, gp)) in self.sites.iter_mut().zip(grads.sites.iter()) {
            pairs.push((&mut site.sample_layer.w, &gs.w));
            pairs.push((&mut site.sample_layer.b, &gs.b));
            let ProposalHead::UniformDiscrete(head) = &mut site.proposal_layer;
            let ProposalHead::UniformDiscrete(ghead) = gp;
            pairs.push((&mut head.w, &ghead.w));
            pairs.push((&mut head.b, &ghead.b));
        }

        pairs
    }

    /// One training iteration over a batch of sub-batches: per sub-batch,
    /// compute gradients and step the optimizer. Returns the unweighted
    /// mean sub-batch loss. The structure must already be covered by a
    /// `polymorph` call.
    pub fn train_batch(&mut self, batch: &[Vec<Trace>], lr: f32) -> Result<f32, ModelError> {
        if batch.is_empty() {
            return Err(ModelError::config("empty training batch"));
        }
        let start = Instant::now();
        let mut total = 0.0f32;
        let mut n_traces = 0u64;

        for sub_batch in batch {
            let (loss, grads) = self.grad_loss(sub_batch)?;
            let mut optim = std::mem::take(&mut self.optim);
            {
                let mut pairs = self.param_grad_pairs(&grads);
                optim.step(&mut pairs, lr);
            }
            self.optim = optim;
            total += loss;
            n_traces += sub_batch.len() as u64;
        }

        let mean = total / batch.len() as f32;
        self.total_iterations += 1;
        self.total_traces += n_traces;
        self.train_loss_best = Some(self.train_loss_best.map_or(mean, |b| b.min(mean)));
        self.train_loss_worst = Some(self.train_loss_worst.map_or(mean, |w| w.max(mean)));
        self.train_history_trace.push(self.total_traces);
        self.train_history_loss.push(mean);
        self.total_training_time_secs += start.elapsed().as_secs_f64();
        self.modified = SystemTime::now();
        debug!(loss = mean, iteration = self.total_iterations, "training iteration");
        Ok(mean)
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Human-readable structural description: every layer with its
    /// parameter count.
    pub fn structure_summary(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("artifact '{}'", self.model_name));
        match (&self.obs_emb_kind, &self.observe_layer) {
            (Some(kind), Some(layer)) => lines.push(format!(
                "  observe_embedding({kind:?}) -> {}: {} params",
                self.obs_emb_dim,
                layer.num_params()
            )),
            _ => lines.push("  observe_embedding: unset".to_string()),
        }
        match &self.lstm {
            Some(lstm) => lines.push(format!(
                "  lstm {} x {} (input {}): {} params",
                self.lstm_dim,
                self.lstm_depth,
                self.lstm_input_dim,
                lstm.num_params()
            )),
            None => lines.push("  lstm: unset".to_string()),
        }
        for site in &self.sites {
            lines.push(format!(
                "  sample_layer({}, {}): {} params",
                site.address,
                site.instance,
                site.sample_layer.num_params()
            ));
            let ProposalHead::UniformDiscrete(head) = &site.proposal_layer;
            lines.push(format!(
                "  proposal_layer({}, {}): uniform_discrete[{}, {}): {} params",
                site.address,
                site.instance,
                head.min,
                head.max,
                head.num_params()
            ));
        }
        lines.push(format!("  trainable params: {}", self.num_parameters));
        lines.join("\n")
    }

    /// Human-readable training-progress report.
    pub fn training_report(&self) -> String {
        let secs = self.total_training_time_secs;
        let iter_per_sec = if secs > 0.0 { self.total_iterations as f64 / secs } else { 0.0 };
        let traces_per_sec = if secs > 0.0 { self.total_traces as f64 / secs } else { 0.0 };
        let fmt_opt = |v: Option<f32>| v.map_or("-".to_string(), |x| format!("{x:+.6e}"));
        let epoch_secs = |t: SystemTime| {
            t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
        };
        [
            format!("model name            : {}", self.model_name),
            format!("created (unix)        : {}", epoch_secs(self.created)),
            format!("last modified (unix)  : {}", epoch_secs(self.modified)),
            format!("code version          : {}", self.code_version),
            format!("trainable params      : {}", self.num_parameters),
            format!("total training time s : {:.1}", secs),
            format!("updates to file       : {}", self.updates),
            format!("iterations            : {}", self.total_iterations),
            format!("iterations / s        : {iter_per_sec:.2}"),
            format!("total training traces : {}", self.total_traces),
            format!("traces / s            : {traces_per_sec:.2}"),
            format!("initial valid loss    : {}", fmt_opt(self.valid_loss_initial)),
            format!("final valid loss      : {}", fmt_opt(self.valid_loss_final)),
            format!("best train loss       : {}", fmt_opt(self.train_loss_best)),
            format!("worst train loss      : {}", fmt_opt(self.train_loss_worst)),
            format!("sample embedding dim  : {}", self.smp_emb_dim),
            format!("observe embedding dim : {}", self.obs_emb_dim),
            format!("lstm dim              : {}", self.lstm_dim),
            format!("lstm depth            : {}", self.lstm_depth),
            format!("softmax boost         : {}", self.softmax_boost),
            format!("addresses             : {}", self.one_hot_address.keys().join(" ")),
            format!(
                "instances             : {}",
                self.one_hot_instance
                    .keys()
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
            format!("proposals             : {}", self.one_hot_proposal.keys().join(" ")),
        ]
        .join("\n")
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Serializes the complete artifact (hyperparameters, registries,
    /// grown layers, bookkeeping, optimizer state) to a JSON file.
    pub fn save_checkpoint(&mut self, path: &Path) -> Result<(), ModelError> {
        self.updates += 1;
        self.modified = SystemTime::now();
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reloads an artifact able to resume polymorph/loss/train_batch
    /// exactly where the saved one stopped.
    pub fn load_checkpoint(path: &Path) -> Result<Artifact, ModelError> {
        let json = std::fs::read_to_string(path)?;
        let mut artifact: Artifact = serde_json::from_str(&json)?;
        artifact.one_hot_address.rebuild_index();
        artifact.one_hot_instance.rebuild_index();
        artifact.one_hot_proposal.rebuild_index();
        artifact.site_index = artifact
            .sites
            .iter()
            .enumerate()
            .map(|(id, s)| ((s.address.clone(), s.instance), id))
            .collect();
        Ok(artifact)
    }

    // ── Accessors used by the driver and tests ───────────────────────

    pub fn registered_addresses(&self) -> &[String] {
        self.one_hot_address.keys()
    }

    pub fn registered_instances(&self) -> &[i64] {
        self.one_hot_instance.keys()
    }

    pub fn registered_proposals(&self) -> &[String] {
        self.one_hot_proposal.keys()
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    pub fn lstm_dim(&self) -> usize {
        self.lstm_dim
    }
}
