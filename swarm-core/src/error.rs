use uuid::Uuid;

/// Result type alias for substrate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reason the planner could not produce a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoPlanReason {
    /// The frontier emptied without reaching the goal
    NoPath,
    /// Search exceeded the configured maximum depth
    DepthExceeded,
    /// Search exceeded the configured wall-clock budget
    Timeout,
}

impl std::fmt::Display for NoPlanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoPlanReason::NoPath => write!(f, "no_path"),
            NoPlanReason::DepthExceeded => write!(f, "depth"),
            NoPlanReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// Error types for the coordination substrate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient storage failure (busy, I/O); retried with backoff before surfacing
    #[error("Storage error: {0}")]
    Storage(String),

    /// Integrity check failed; the store is read-only until restored
    #[error("Store corrupt: {0}")]
    StoreCorrupt(String),

    /// Bad config, malformed pattern, cyclic supersedes; no state change occurred
    #[error("Validation error: {0}")]
    Validation(String),

    /// A consensus round could not be opened with the registered roster
    #[error("Insufficient nodes for consensus: have {have}, need {need}")]
    InsufficientNodes {
        /// Registered, non-quarantined nodes
        have: usize,
        /// Configured minimum roster size
        need: usize,
    },

    /// A* terminated without a plan
    #[error("No plan found: {0}")]
    NoPlan(NoPlanReason),

    /// Entity lookup failure
    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("Learning error: {0}")]
    Learning(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A long-running operation exceeded its timeout
    #[error("Operation timed out")]
    Timeout,

    /// Cooperative cancellation; not a failure
    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is recoverable (can retry with backoff)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Storage(_) | Error::Timeout => true,
            Error::StoreCorrupt(_)
            | Error::Validation(_)
            | Error::InsufficientNodes { .. }
            | Error::NoPlan(_)
            | Error::NotFound(_)
            | Error::Learning(_)
            | Error::Serialization(_)
            | Error::Cancelled => false,
            Error::Io(_) => true,
        }
    }

    /// Check if this error must halt writes until an operator restores the store
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StoreCorrupt(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Storage("busy".to_string()).is_recoverable());
        assert!(Error::Timeout.is_recoverable());
        assert!(!Error::Validation("bad".to_string()).is_recoverable());
        assert!(!Error::NoPlan(NoPlanReason::DepthExceeded).is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
    }

    #[test]
    fn test_corruption_is_fatal() {
        let err = Error::StoreCorrupt("integrity check failed".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_no_plan_reason_display() {
        assert_eq!(Error::NoPlan(NoPlanReason::DepthExceeded).to_string(), "No plan found: depth");
    }
}
