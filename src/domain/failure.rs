//! Stage results and the failure taxonomy.
//!
//! A stage either returns the next payload or a [`StageFailure`] tagged with a
//! [`FailureKind`]. Retry policies match on the kind; the cause travels to the
//! catch route and, eventually, the failure notification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque structured document passed from one stage to the next
pub type StagePayload = serde_json::Value;

/// Result of a single stage attempt
pub type StageResult = Result<StagePayload, StageFailure>;

/// Classification of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Not ready yet (e.g. a training job still running); worth polling again
    Transient,

    /// Anything else the stage reported as an error
    Permanent,

    /// The attempt exceeded its per-stage timeout
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// A failed stage attempt
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} failure: {cause}")]
pub struct StageFailure {
    /// What kind of failure this was
    pub kind: FailureKind,

    /// Human-readable diagnostic from the stage
    pub cause: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    /// The stage is still working on something; poll again later
    pub fn transient(cause: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, cause)
    }

    pub fn permanent(cause: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, cause)
    }

    pub fn timeout(cause: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display_includes_kind_and_cause() {
        let failure = StageFailure::transient("the training job is not completed");
        assert_eq!(
            failure.to_string(),
            "transient failure: the training job is not completed"
        );
    }

    #[test]
    fn test_failure_kind_yaml_names() {
        let kinds: Vec<FailureKind> =
            serde_yaml::from_str("[transient, permanent, timeout]").unwrap();
        assert_eq!(
            kinds,
            vec![
                FailureKind::Transient,
                FailureKind::Permanent,
                FailureKind::Timeout
            ]
        );
    }
}
