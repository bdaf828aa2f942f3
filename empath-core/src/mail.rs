//! The message object: body content, the wrapped-line index used to
//! unfold/refold header continuations around evaluation, and the tag store
//! that travels with it.

use crate::tags::TagStore;

/// The terminal disposition of a message once evaluation reaches `DONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Drop,
}

/// A fetched message under evaluation.
///
/// Matchers and deliverers see the body in *unfolded* form (wrap markers
/// replaced with spaces) so multi-line headers read as one logical line;
/// the wrapped-line index records where those markers were so the
/// transform can be undone before a deliverer writes the canonical body
/// back out (§4.1, §4.2).
#[derive(Debug, Clone)]
pub struct Mail {
    body: String,
    /// Byte offsets, into `body`, of characters that are currently a
    /// folded-space standing in for an original `\n`. Empty when the body
    /// is in its canonical (wrapped) form.
    wrapped: Vec<usize>,
    tags: TagStore,
    decision: Option<Decision>,
}

impl Mail {
    #[must_use]
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            wrapped: Vec::new(),
            tags: TagStore::new(),
            decision: None,
        }
    }

    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    #[must_use]
    pub fn tags(&self) -> &TagStore {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut TagStore {
        &mut self.tags
    }

    #[must_use]
    pub fn decision(&self) -> Option<Decision> {
        self.decision
    }

    pub fn set_decision(&mut self, decision: Decision) {
        self.decision = decision.into();
    }

    /// True while the body is in unfolded (space-joined) form.
    #[must_use]
    pub fn is_unfolded(&self) -> bool {
        !self.wrapped.is_empty() || !self.body.contains('\n')
    }

    /// Replace each genuine header-continuation fold with a space, recording
    /// where it was so [`Self::fold`] can restore it later. A newline is a
    /// fold only when the byte right after it is a space or tab (a
    /// whitespace-prefixed continuation line); an ordinary header/body
    /// separator newline is left untouched, matching `fill_wrapped`'s
    /// distinction between the two. Idempotent: calling this on an
    /// already-unfolded body is a no-op.
    pub fn unfold(&mut self) {
        if !self.wrapped.is_empty() {
            return;
        }
        let mut bytes = std::mem::take(&mut self.body).into_bytes();
        for i in 0..bytes.len() {
            if bytes[i] == b'\n' && matches!(bytes.get(i + 1), Some(b' ' | b'\t')) {
                bytes[i] = b' ';
                self.wrapped.push(i);
            }
        }
        self.body = String::from_utf8(bytes).expect("swapping ASCII '\\n'/' ' preserves UTF-8 validity");
    }

    /// Restore newlines at every offset recorded by [`Self::unfold`],
    /// leaving the wrapped-line index empty again.
    pub fn fold(&mut self) {
        if self.wrapped.is_empty() {
            return;
        }
        let mut bytes = std::mem::take(&mut self.body).into_bytes();
        for &i in &self.wrapped {
            bytes[i] = b'\n';
        }
        self.body = String::from_utf8(bytes).expect("swapping ASCII '\\n'/' ' preserves UTF-8 validity");
        self.wrapped.clear();
    }

    /// Recipients derived from the message itself, for rules/actions/
    /// accounts with `find_uid` set. Full header-to-uid resolution is a
    /// fetcher-backend concern (out of scope, §1); this crate's minimal
    /// built-in policy reads a pre-resolved `uid` tag (comma-separated)
    /// left by that external resolver.
    #[must_use]
    pub fn derived_uids(&self) -> Vec<u32> {
        self.tags
            .get("uid")
            .map(|csv| csv.split(',').filter_map(|s| s.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    /// Attach a replacement body arriving from a write-back reply: strip a
    /// leading mbox-style `From ` envelope line if present, then rebuild the
    /// wrapped-line index from scratch so subsequent matchers can continue
    /// unfolding (§4.4 finish-action, scenario 7).
    pub fn replace_body(&mut self, new_body: impl Into<String>) {
        let mut body = new_body.into();
        if let Some(rest) = body.strip_prefix("From ") {
            let after_line = rest.find('\n').map_or(rest.len(), |i| i + 1);
            body = rest[after_line..].to_string();
        }
        self.body = body;
        self.wrapped.clear();
        self.unfold();
    }
}
