//! Wire types exchanged between the empath child and parent.
//!
//! Every request carries a monotonic `id` assigned by the child; the
//! parent's reply echoes it back so the child can match the reply to the
//! outstanding `mctx` (or `dctx`) that is blocked on it. The tag store is
//! always carried as an opaque byte buffer produced by the tag-store
//! encoder in `empath-core` — this crate never interprets it.

use serde::{Deserialize, Serialize};

/// Current wire protocol version. Bumped whenever the shape of [`Request`]
/// or [`Reply`] changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// A request sent from the child to the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    /// Monotonic per-sender id; the reply must echo it.
    pub id: u32,
    pub body: RequestBody,
    /// The requesting context's current tag store, encoded.
    pub tags: Vec<u8>,
    /// The mail body, for an `Action` request a deliverer may need to act
    /// on (e.g. `write`/`rewrite`); empty for a `Match` request that has no
    /// use for it.
    #[serde(default)]
    pub mail: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    /// Run a deliverer (`ASUSER` or `WRBACK`) as `uid`.
    Action(ActionRequest),
    /// Run a matcher that must execute in the privileged process.
    Match(MatchRequest),
}

/// Requests the parent run action `action` of account `account` as `uid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub account: String,
    pub action: String,
    pub uid: u32,
    /// True if the deliverer is `WRBACK` and a replacement body is expected
    /// in the reply.
    pub expects_body: bool,
}

/// Requests the parent evaluate a single parent-deferred matcher item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    /// Name of the registered matcher implementation.
    pub matcher: String,
    /// Matcher-specific opaque configuration, as stored on the expression item.
    pub config: Vec<u8>,
}

/// The parent's reply to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub version: u32,
    /// Echoes the request's id.
    pub id: u32,
    pub outcome: Outcome,
    /// The (possibly parent-mutated) tag store, encoded. Empty only when
    /// `outcome` is `Error` and nothing else.
    pub tags: Vec<u8>,
    /// Present only for a `WRBACK` action whose outcome is `ActionDone`.
    pub body: Option<Vec<u8>>,
}

/// Result of handling a [`Request`] on the parent side.
///
/// `MatchTrue`/`MatchFalse` answer a [`MatchRequest`]; `ActionDone` answers
/// an [`ActionRequest`]. `Error` answers either and carries a human-readable
/// cause — it is an ordinary evaluation error, not a protocol violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    MatchTrue,
    MatchFalse,
    ActionDone,
    Error(String),
}

impl Request {
    #[must_use]
    pub fn action(id: u32, tags: Vec<u8>, action: ActionRequest) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            body: RequestBody::Action(action),
            tags,
            mail: Vec::new(),
        }
    }

    #[must_use]
    pub fn matcher(id: u32, tags: Vec<u8>, matcher: MatchRequest) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            body: RequestBody::Match(matcher),
            tags,
            mail: Vec::new(),
        }
    }

    /// Attach the mail body a deliverer on the other end may need to act on.
    #[must_use]
    pub fn with_mail(mut self, mail: Vec<u8>) -> Self {
        self.mail = mail;
        self
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

impl Reply {
    #[must_use]
    pub fn new(id: u32, outcome: Outcome, tags: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            outcome,
            tags,
            body: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }
}
