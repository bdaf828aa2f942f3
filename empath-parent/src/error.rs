//! Errors raised while dispatching one privileged request (§7 ambient
//! "ParentActionError"). Never crosses the IPC boundary as a Rust error —
//! [`crate::ParentHandler`] collapses every variant into a `DONE` reply's
//! error field before it reaches the child.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParentActionError {
    /// The child requested an action name not present in the shared ruleset.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The tag store or mail body attached to the request was malformed.
    #[error("malformed request payload: {0}")]
    MalformedRequest(String),

    /// A registered deliverer/matcher failed, or wasn't registered at all.
    #[error(transparent)]
    Core(#[from] empath_core::CoreError),
}
