//! Typed error hierarchy for the auto-mode engine.
//!
//! Cancellation is part of the taxonomy but is never reported to the user as
//! a failure; authentication failures carry an actionable message; a stream
//! that ends without its phase marker is a hard parse failure, never an
//! implicit success. Admission denial and approval-not-found are control-flow
//! results, not errors, and do not appear here.

use thiserror::Error;

/// Failures from one feature's execution driver.
#[derive(Debug, Error)]
pub enum EngineError {
    /// User- or timeout-initiated cancellation. Not a user-visible failure.
    #[error("Execution cancelled")]
    Cancelled,

    /// Provider rejected the credentials. Not retried automatically.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Stream ended without the expected completion marker for this phase.
    #[error("Stream ended without completion marker in {phase} phase")]
    PhaseParse { phase: String },

    /// Wall-clock ceiling for one phase call elapsed.
    #[error("{phase} phase timed out after {secs}s")]
    PhaseTimeout { phase: String, secs: u64 },

    /// Provider reported an execution error.
    #[error("Provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Classify for the `auto_mode_error.error_type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancellation",
            Self::Authentication(_) => "authentication",
            Self::PhaseParse { .. }
            | Self::PhaseTimeout { .. }
            | Self::Provider(_)
            | Self::Other(_) => "execution",
        }
    }

    /// Whether this error should surface to the user at all.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Classify a provider-reported error message. Auth failures and aborts
    /// only show up as message text on the terminal stream event.
    pub fn from_provider_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("authentication")
            || lower.contains("unauthorized")
            || lower.contains("invalid api key")
        {
            Self::Authentication(message.to_string())
        } else if lower.contains("aborted") || lower.contains("cancelled") {
            Self::Cancelled
        } else {
            Self::Provider(message.to_string())
        }
    }
}

/// Structured result of a plan-approval resolution. Never thrown: an unknown
/// feature id is `success: false` with an error message, matching the
/// command-API contract.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ResolveOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResolveOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn not_found(feature_id: &str) -> Self {
        Self {
            success: false,
            error: Some(format!(
                "No pending approval found for feature {}",
                feature_id
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_user_visible() {
        let err = EngineError::Cancelled;
        assert_eq!(err.kind(), "cancellation");
        assert!(!err.is_user_visible());
    }

    #[test]
    fn authentication_classifies_from_message() {
        let err = EngineError::from_provider_message("Invalid API key provided");
        assert!(matches!(err, EngineError::Authentication(_)));
        assert_eq!(err.kind(), "authentication");
        assert!(err.is_user_visible());
    }

    #[test]
    fn abort_message_classifies_as_cancellation() {
        let err = EngineError::from_provider_message("Request aborted by client");
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn generic_message_classifies_as_execution() {
        let err = EngineError::from_provider_message("model overloaded");
        assert!(matches!(err, EngineError::Provider(_)));
        assert_eq!(err.kind(), "execution");
    }

    #[test]
    fn phase_parse_carries_phase_name() {
        let err = EngineError::PhaseParse {
            phase: "planning".into(),
        };
        assert!(err.to_string().contains("planning"));
        assert_eq!(err.kind(), "execution");
    }

    #[test]
    fn resolve_outcome_not_found_names_the_feature() {
        let outcome = ResolveOutcome::not_found("feat-9");
        assert!(!outcome.success);
        let msg = outcome.error.unwrap();
        assert!(msg.contains("No pending approval"));
        assert!(msg.contains("feat-9"));
    }

    #[test]
    fn engine_error_implements_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EngineError::Cancelled);
        assert_std_error(&EngineError::PhaseTimeout {
            phase: "action".into(),
            secs: 600,
        });
    }
}
