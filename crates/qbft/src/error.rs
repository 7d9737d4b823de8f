//! Consensus error taxonomy.

use dv_storage::StorageError;
use dv_types::{MessageError, OperatorId};

/// Errors from QBFT message processing.
///
/// Invalid, unauthorized and equivocating messages are dropped and logged;
/// they never abort the instance. Storage errors surface through the
/// controller.
#[derive(Debug, thiserror::Error)]
pub enum QbftError {
    /// Bad type, wrong identifier/height, stale round, malformed payload.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// The same signer contributed a different value for the same
    /// (type, round).
    #[error("equivocation detected by operator {operator}")]
    EquivocationDetected { operator: OperatorId },

    /// A signer is not a member of this committee.
    #[error("operator {operator} is not authorized for this committee")]
    NotAuthorized { operator: OperatorId },

    /// Proposed value rejected by the value-check predicate.
    #[error("proposed value rejected: {0}")]
    InvalidValue(String),

    /// Soft sentinel: processing succeeded but no quorum formed yet.
    #[error("quorum not reached yet")]
    QuorumNotYet,

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
