/// Trace wire data model.
///
/// Traces arrive from the probabilistic-program protocol layer as plain
/// data: an ordered sequence of random-choice samples plus the observed
/// input tensor. Immutable once produced. Traces inside one sub-batch share
/// identical structure (addresses, instances, proposal kinds and value
/// shapes in matching order); the first trace of a sub-batch acts as the
/// structural representative.

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Proposal distribution declared by the trace layer at a random-choice
/// site. Closed set: adding a kind means adding a variant here plus a
/// matching head in `proposal.rs`.
///
/// `Normal` exists on the wire but has no head implementation — the model
/// rejects it with `ModelError::UnsupportedProposal` during both polymorph
/// and loss rather than inventing a likelihood for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Proposal {
    UniformDiscrete { min: i64, max: i64 },
    Normal,
}

impl Proposal {
    /// Stable textual kind tag, used as the proposal-kind registry key.
    pub fn name(&self) -> &'static str {
        match self {
            Proposal::UniformDiscrete { .. } => "uniform_discrete",
            Proposal::Normal => "normal",
        }
    }
}

/// One random-choice event in a trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Textual identity of the random-choice call site.
    pub address: String,
    /// Repetition count disambiguating repeated visits to the address
    /// within one trace.
    pub instance: i64,
    /// Distribution used when the trace was generated.
    pub proposal: Proposal,
    /// The actually sampled value.
    pub value: Tensor,
}

/// One full record of a program execution: its random choices in order,
/// plus the observed data tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub samples: Vec<Sample>,
    pub observes: Tensor,
}

impl Trace {
    /// Number of random choices (timesteps for the recurrent pass).
    pub fn length(&self) -> usize {
        self.samples.len()
    }
}
