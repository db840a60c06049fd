use thiserror::Error;

/// Error taxonomy shared by every node role. Each variant carries enough
/// context to be logged usefully at the round boundary; `Fatal` is the only
/// kind that should ever propagate out of a round handler to terminate the
/// process.
#[derive(Debug, Error)]
pub enum PrivCountError {
    #[error("config invalid for round {round_id}: {reason}")]
    ConfigInvalid { round_id: String, reason: String },

    #[error("auth failed for peer {fingerprint}: {reason}")]
    AuthFailed { fingerprint: String, reason: String },

    #[error("delivery failed to {peer}: {reason}")]
    DeliveryFailed { peer: String, reason: String },

    #[error("threshold unmet: have {have}, need {need} ({role})")]
    ThresholdUnmet {
        role: &'static str,
        have: usize,
        need: usize,
    },

    #[error("delay required for counter {counter}: sigma decreased before delay_period elapsed")]
    DelayRequired { counter: String },

    #[error("event source down: {reason}")]
    EventSourceDown { reason: String },

    #[error("aggregation invalid for round {round_id}: {reason}")]
    AggregationInvalid { round_id: String, reason: String },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PrivCountError {
    /// `true` for the single kind that should terminate the process rather
    /// than being handled at the round boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PrivCountError::Fatal(_))
    }

    /// CLI exit-code contract (§6): 0 clean, 1 unrecoverable config/network
    /// error, 2 aggregation-validity failure. `exit_code` is only meaningful
    /// for an error that reached the top level; `AggregationInvalid` is the
    /// sole case where the round ran to completion but its math didn't
    /// validate, everything else is an unrecoverable condition.
    pub fn exit_code(&self) -> u8 {
        match self {
            PrivCountError::AggregationInvalid { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, PrivCountError>;
