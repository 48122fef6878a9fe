use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("verifying key registry unavailable: {0}")]
    RegistryUnavailable(String),
    #[error("poll ledger unavailable: {0}")]
    LedgerUnavailable(String),
    #[error("proof service failure: {0}")]
    Proof(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("nonce sequence violated: {0}")]
    NonceSequence(String),
    #[error("full mode ballot targets multiple options: {0:?}")]
    MultiOptionInFullMode(Vec<u32>),
    #[error("incomplete vote set: expected {expected} ballots, found {actual}")]
    IncompleteVoteSet { expected: usize, actual: usize },
    #[error("step {step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<OperatorError>,
    },
    #[error("run interrupted before completion")]
    Interrupted,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OperatorError {
    /// Wraps a failure with the name of the lifecycle phase it occurred in.
    pub fn in_step(step: &str, source: OperatorError) -> Self {
        OperatorError::Step {
            step: step.to_string(),
            source: Box::new(source),
        }
    }
}

pub type OperatorResult<T> = Result<T, OperatorError>;
