use std::path::PathBuf;
use thiserror::Error;

/// Domain failures raised while building or running the GAN.
#[derive(Debug, Error)]
pub enum GanError {
    #[error("unknown GAN option `{0}`")]
    UnknownFlag(String),
    #[error("GAN options `{0}` and `{1}` cannot be combined")]
    ConflictingFlags(&'static str, &'static str),
    #[error("GAN option `{flag}` requires `{requires}`")]
    MissingDependency {
        flag: &'static str,
        requires: &'static str,
    },
    #[error("generator variant {variant} cannot {capability}")]
    UnsupportedVariant {
        variant: &'static str,
        capability: &'static str,
    },
    #[error("invalid model configuration: {0}")]
    InvalidModel(String),
    #[error("discriminator exposes {found} classification branches, configuration expects {expected}")]
    MissingClassifierBranches { expected: usize, found: usize },
    #[error("perceptual feature extractor weights unavailable at {path}: {reason}")]
    PerceptualWeights { path: PathBuf, reason: String },
    #[error("checkpoint {id} is incomplete: {missing} not found")]
    IncompleteCheckpoint { id: String, missing: PathBuf },
    #[error("no checkpoint found in {0}")]
    NoCheckpoint(PathBuf),
    #[error("invalid checkpoint id `{0}` (expected <epoch>_<iteration>)")]
    InvalidCheckpointId(String),
    #[error("loss `{name}` is not finite ({value})")]
    NonFiniteLoss { name: String, value: f64 },
    #[error("generator has no style encoder")]
    MissingStyleEncoder,
    #[error("dataset {0} contains no samples")]
    EmptyDataset(PathBuf),
    #[error("{path}:{line}: {reason}")]
    InvalidListing {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}
