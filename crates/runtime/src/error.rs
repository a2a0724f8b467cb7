//! Engine errors.

use thiserror::Error;

use crate::types::{Key, Rank, Tag};

/// Result type for build-phase operations.
pub type BuildResult<T> = std::result::Result<T, BuildError>;

/// Result type for step-phase operations.
pub type StepResult<T> = std::result::Result<T, StepError>;

/// Errors raised while a network is being assembled. All are fatal.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate signal key: {0}")]
    DuplicateKey(Key),

    #[error("unknown signal key: {0}")]
    UnknownKey(Key),

    #[error("duplicate probe key: {0}")]
    DuplicateProbe(Key),

    #[error("view '{label}' out of bounds for signal {key}")]
    ViewOutOfBounds { key: Key, label: String },

    #[error("shape mismatch in {context}: {message}")]
    ShapeMismatch { context: String, message: String },

    #[error("unrecognized op kind: {0}")]
    UnknownOpKind(String),

    #[error("malformed spec string: {0}")]
    BadSpec(String),

    #[error("send from rank {src} to rank {dst} on tag {tag} has no matching receive")]
    MissingPeer { src: Rank, dst: Rank, tag: Tag },

    #[error(
        "send/recv size mismatch between rank {src} and rank {dst} on tag {tag}: \
         {send_len} vs {recv_len} elements"
    )]
    CommSizeMismatch {
        src: Rank,
        dst: Rank,
        tag: Tag,
        send_len: usize,
        recv_len: usize,
    },

    #[error("chunk has communication operators but no communicator was bound")]
    CommUnbound,

    #[error("chunk is already finalized")]
    AlreadyFinalized,

    #[error("chunk is not finalized")]
    NotFinalized,
}

/// Errors raised while stepping. All are fatal; the simulator aborts the run.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("chunk is not finalized")]
    NotFinalized,

    #[error("host callback for output {key} returned {got} values, expected {expected}")]
    CallbackShape {
        key: Key,
        expected: usize,
        got: usize,
    },

    #[error("communication failure: {0}")]
    CommFailure(String),
}
