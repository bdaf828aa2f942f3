//! Errors raised while evaluating a message against the ruleset.
//!
//! Every variant here is an ordinary §7 "matcher error" / "action expansion
//! failure" / "deliverer failure" — ordinary in the sense that it
//! propagates out of the state machine as `StepResult::Error` and abandons
//! only the one message. Protocol violations live in `empath-ipc::IpcError`
//! instead, since they are a property of the transport, not the evaluator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A matcher failed while evaluating an expression item.
    #[error("matcher {matcher} failed: {reason}")]
    MatcherFailed { matcher: String, reason: String },

    /// No matcher is registered under this name.
    #[error("unknown matcher: {0}")]
    UnknownMatcher(String),

    /// No deliverer is registered under this name.
    #[error("unknown deliverer: {0}")]
    UnknownDeliverer(String),

    /// A rule's action-name glob matched no configured action (§4.3 step 2).
    #[error("no actions matching pattern: {0}")]
    NoMatchingActions(String),

    /// An action-name glob pattern itself failed to compile.
    #[error("invalid action name pattern {pattern}: {reason}")]
    InvalidGlob { pattern: String, reason: String },

    /// A deliverer reported failure.
    #[error("deliverer {deliverer} failed: {reason}")]
    DelivererFailed { deliverer: String, reason: String },

    /// Tag store could not be encoded for IPC transport.
    #[error("failed to encode tag store: {0}")]
    TagEncode(#[source] bincode::error::EncodeError),

    /// Tag store buffer from a reply could not be decoded.
    #[error("failed to decode tag store: {0}")]
    TagDecode(#[source] bincode::error::DecodeError),

    /// The ruleset configuration itself is invalid (e.g. a rule references
    /// `find_uid` on a platform without uid derivation, or a regex failed
    /// to compile at load time).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    /// Action-expansion and config errors are misconfigurations the
    /// operator should fix; they are never expected to succeed on retry.
    #[must_use]
    pub const fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Self::NoMatchingActions(_)
                | Self::InvalidGlob { .. }
                | Self::InvalidConfig(_)
                | Self::UnknownMatcher(_)
                | Self::UnknownDeliverer(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misconfiguration_errors_are_flagged() {
        assert!(CoreError::NoMatchingActions("spam*".into()).is_misconfiguration());
        assert!(CoreError::UnknownMatcher("regexp".into()).is_misconfiguration());
    }

    #[test]
    fn runtime_errors_are_not_misconfiguration() {
        let err = CoreError::DelivererFailed {
            deliverer: "mbox".into(),
            reason: "disk full".into(),
        };
        assert!(!err.is_misconfiguration());
        assert_eq!(err.to_string(), "deliverer mbox failed: disk full");
    }
}
