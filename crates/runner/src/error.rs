//! Runner error taxonomy.

use dv_beacon::BeaconError;
use dv_types::{BlsError, OperatorId, ValidatorIndex};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no running duty")]
    NoRunningDuty,

    #[error("duty already running for slot {0}")]
    DutyAlreadyRunning(u64),

    #[error("unknown validator index {0}")]
    UnknownValidator(ValidatorIndex),

    #[error("partial signature from {operator} failed verification")]
    InvalidPartialSignature { operator: OperatorId },

    #[error("signer {operator} is not in the committee")]
    NotAuthorized { operator: OperatorId },

    /// The reconstructed signature did not verify; the listed shares were
    /// identified as bad by per-share verification.
    #[error("signature reconstruction failed, bad shares: {bad_shares:?}")]
    ReconstructionFailed { bad_shares: Vec<OperatorId> },

    #[error("decided value could not be decoded: {0}")]
    MalformedDecidedValue(String),

    #[error(transparent)]
    Beacon(#[from] BeaconError),

    #[error(transparent)]
    Bls(#[from] BlsError),

    #[error("network error: {0}")]
    Network(String),

    #[error("consensus not started")]
    ConsensusNotStarted,
}
