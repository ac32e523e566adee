/// Checkpoint round-trip tests: a reloaded artifact must resume
/// polymorph/loss/train_batch exactly where the saved one stopped —
/// identical registries, layer parameters, bookkeeping and optimizer
/// state.

use std::path::PathBuf;

use infcomp_core::artifact::{Artifact, ArtifactConfig};
use infcomp_core::embedding::{ObserveEmbeddingKind, SampleEmbeddingKind};
use infcomp_core::error::ModelError;
use infcomp_core::tensor::Tensor;
use infcomp_core::trace::{Proposal, Sample, Trace};

// ── Helpers ──────────────────────────────────────────────────────────

fn make_trace(sites: &[(&str, i64, i64, i64, f32)], observes: &[f32]) -> Trace {
    Trace {
        samples: sites
            .iter()
            .map(|&(addr, inst, min, max, value)| Sample {
                address: addr.to_string(),
                instance: inst,
                proposal: Proposal::UniformDiscrete { min, max },
                value: Tensor::scalar(value),
            })
            .collect(),
        observes: Tensor::from_vec(observes.to_vec(), &[observes.len()]),
    }
}

fn trained_artifact() -> (Artifact, Vec<Vec<Trace>>) {
    let mut artifact = Artifact::new(ArtifactConfig::test_config());
    artifact.set_sample_embedding(SampleEmbeddingKind::Fc, 4);
    artifact
        .set_observe_embedding(&Tensor::zeros(&[3]), ObserveEmbeddingKind::Fc, 5)
        .unwrap();
    artifact.set_lstm(6, 2).unwrap();

    let batch = vec![vec![
        make_trace(&[("x", 0, 0, 10, 3.0), ("y", 0, 0, 5, 1.0)], &[0.5, -0.3, 0.8]),
        make_trace(&[("x", 0, 0, 10, 4.0), ("y", 0, 0, 5, 2.0)], &[0.2, 0.1, -0.4]),
    ]];
    artifact.set_valid_batch(batch.clone()).unwrap();
    for _ in 0..3 {
        artifact.train_batch(&batch, 0.01).unwrap();
    }
    artifact.record_valid_loss().unwrap();
    (artifact, batch)
}

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("infcomp_ckpt_{tag}_{}.json", std::process::id()))
}

// ── Round trips ──────────────────────────────────────────────────────

#[test]
fn test_checkpoint_roundtrip_preserves_structure_and_bookkeeping() {
    let (mut artifact, _) = trained_artifact();
    let path = temp_path("structure");
    artifact.save_checkpoint(&path).unwrap();
    let reloaded = Artifact::load_checkpoint(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(reloaded.num_parameters, artifact.num_parameters);
    assert_eq!(reloaded.site_count(), artifact.site_count());
    assert_eq!(reloaded.registered_addresses(), artifact.registered_addresses());
    assert_eq!(reloaded.registered_instances(), artifact.registered_instances());
    assert_eq!(reloaded.registered_proposals(), artifact.registered_proposals());
    assert_eq!(reloaded.total_iterations, artifact.total_iterations);
    assert_eq!(reloaded.total_traces, artifact.total_traces);
    assert_eq!(reloaded.train_history_loss, artifact.train_history_loss);
    assert_eq!(reloaded.valid_history_loss, artifact.valid_history_loss);
    assert_eq!(reloaded.updates, 1, "save increments the file-update counter");
    assert_eq!(reloaded.code_version, artifact.code_version);
}

#[test]
fn test_checkpoint_roundtrip_preserves_loss_exactly() {
    let (mut artifact, batch) = trained_artifact();
    let loss_before = artifact.loss(&batch[0]).unwrap();

    let path = temp_path("loss");
    artifact.save_checkpoint(&path).unwrap();
    let reloaded = Artifact::load_checkpoint(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let loss_after = reloaded.loss(&batch[0]).unwrap();
    assert_eq!(loss_before, loss_after, "identical parameters must give identical loss");
    assert_eq!(reloaded.valid_loss().unwrap(), artifact.valid_loss().unwrap());
}

#[test]
fn test_checkpoint_roundtrip_resumes_training_identically() {
    let (mut artifact, batch) = trained_artifact();
    let path = temp_path("resume");
    artifact.save_checkpoint(&path).unwrap();
    let mut reloaded = Artifact::load_checkpoint(&path).unwrap();
    std::fs::remove_file(&path).ok();

    // Optimizer moments survived: the next step matches bit for bit.
    let a = artifact.train_batch(&batch, 0.01).unwrap();
    let b = reloaded.train_batch(&batch, 0.01).unwrap();
    assert_eq!(a, b, "optimizer state must survive the round trip");

    let a2 = artifact.loss(&batch[0]).unwrap();
    let b2 = reloaded.loss(&batch[0]).unwrap();
    assert_eq!(a2, b2);
}

#[test]
fn test_checkpoint_roundtrip_resumes_polymorph() {
    let (mut artifact, _) = trained_artifact();
    let path = temp_path("polymorph");
    artifact.save_checkpoint(&path).unwrap();
    let mut reloaded = Artifact::load_checkpoint(&path).unwrap();
    std::fs::remove_file(&path).ok();

    // Old structure is already covered; new structure still grows.
    let old = vec![vec![make_trace(&[("x", 0, 0, 10, 3.0), ("y", 0, 0, 5, 1.0)], &[0.1, 0.2, 0.3])]];
    assert!(!reloaded.polymorph(&old).unwrap(), "known structure is a no-op after reload");

    let new = vec![vec![make_trace(&[("z", 0, 0, 3, 1.0)], &[0.1, 0.2, 0.3])]];
    assert!(reloaded.polymorph(&new).unwrap());
    assert_eq!(reloaded.site_count(), artifact.site_count() + 1);
}

#[test]
fn test_missing_checkpoint_is_io_error() {
    let err = Artifact::load_checkpoint(&temp_path("missing_never_written")).unwrap_err();
    assert!(matches!(err, ModelError::Io { .. }));
}
