//! Errors raised by the MPC engine.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MpcError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MpcError {
    /// Two peers of one run were given the same seed.
    #[error("mpc seed duplicate")]
    MpcSeedDuplicate,
    /// A seed is zero or above the permitted range.
    #[error("mpc seed out of range: {0}")]
    MpcSeedOutRange(u64),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("unknown group public key")]
    UnknownGpk,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A store key was read before any step wrote it.
    #[error("result store key not found: {0}")]
    KeyNotFound(String),
    #[error("result store key already written: {0}")]
    KeyExists(String),

    #[error("step {0} already finished")]
    StepFinished(String),
    #[error("duplicate share from seed {0}")]
    DuplicateShare(u64),
    #[error("not enough shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    /// Peers disagree on the generated group public key, or one is missing.
    #[error("invalid mpc address")]
    InvalidMpcAddr,
    #[error("invalid mpc R")]
    InvalidMpcR,
    #[error("invalid mpc S")]
    InvalidMpcS,
    #[error("signature verification failed")]
    VerifyFailed,
    #[error("signed result does not match the expected sender address")]
    FailSignRetVerify,
    /// A judged dispute convicted this peer during a run that cannot tolerate it.
    #[error("peer {0} convicted of misbehavior")]
    Slashed(u16),
    #[error("point at infinity")]
    PointZero,
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("run {0} already exists")]
    RunExists(u64),
    #[error("run timed out: {0}")]
    Timeout(String),
    #[error("run aborted: {0}")]
    Quit(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("approval store error: {0}")]
    Approval(String),
}

impl From<serde_json::Error> for MpcError {
    fn from(err: serde_json::Error) -> Self {
        MpcError::InvalidEncoding(err.to_string())
    }
}

impl From<hex::FromHexError> for MpcError {
    fn from(err: hex::FromHexError) -> Self {
        MpcError::InvalidEncoding(err.to_string())
    }
}
