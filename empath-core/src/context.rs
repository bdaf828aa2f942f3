//! Per-message evaluator state: [`MatchContext`] (the `mctx` of §3) and
//! [`DeliveryContext`] (the `dctx`), plus the small vocabulary the state
//! machine uses to talk to whatever carries messages across the privilege
//! boundary, without this crate depending on the IPC transport itself.

use std::{
    collections::VecDeque,
    sync::{atomic::{AtomicU32, Ordering}, Arc},
};

use crate::{mail::Mail, rule::Account, tags::TagStore};

/// A path from the root of a ruleset down to one rule: `path[0]` is an
/// index into the top-level rule list, `path[1]` an index into that
/// rule's `nested`, and so on. Addressing rules this way (rather than
/// storing parent pointers on `Rule` itself) keeps the rule tree plain,
/// owned, sharable data (§9 design notes).
pub type RulePath = Vec<usize>;

/// A request the evaluator needs some transport to carry to the privileged
/// side. The caller (the scheduler binary wiring this crate to
/// `empath-ipc`) is responsible for actually sending it and routing the
/// reply back via [`MatchContext::deliver_reply`]/[`DeliveryContext`].
#[derive(Debug, Clone)]
pub enum OutgoingRequest {
    Match { matcher: String, config: String },
    Action {
        account: String,
        action: String,
        uid: u32,
        expects_body: bool,
    },
}

/// A reply arriving from the privileged side, already decoded into terms
/// this crate understands (the scheduler translates an `empath-ipc::Reply`
/// into this before handing it to `step_match`/`step_deliver`).
#[derive(Debug, Clone)]
pub struct IncomingReply {
    pub id: u32,
    pub outcome: ReplyOutcome,
    pub tags: TagStore,
    /// Present only for a `WRBACK` action's successful reply.
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    MatchTrue,
    MatchFalse,
    ActionDone,
    Error(String),
}

/// A request awaiting a reply, paired with the id the evaluator is blocked
/// on so the scheduler can route the eventual reply back.
#[derive(Debug, Clone)]
pub struct Blocked {
    pub id: u32,
    pub request: OutgoingRequest,
}

/// One enqueued unit of delivery: an (action, uid) pair produced by the
/// delivery-queue builder (§4.3) for a matched rule.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub action: String,
    pub uid: u32,
    /// Index of the next action item to run within `action`'s item list;
    /// advanced as items complete.
    pub item_cursor: usize,
}

impl DeliveryContext {
    #[must_use]
    pub fn new(action: impl Into<String>, uid: u32) -> Self {
        Self {
            action: action.into(),
            uid,
            item_cursor: 0,
        }
    }
}

/// The per-message evaluator state machine drives through a single
/// message's rule tree (§3's `mctx`).
pub struct MatchContext {
    mail: Mail,
    account: Account,
    rule: Option<RulePath>,
    stack: Vec<RulePath>,
    expr_item: Option<usize>,
    result: bool,
    pub(crate) done: bool,
    pub(crate) matched: bool,
    dqueue: VecDeque<DeliveryContext>,
    msgid: Option<u32>,
    id_source: Arc<AtomicU32>,
    pending: Option<Blocked>,
}

impl MatchContext {
    #[must_use]
    pub fn new(mail: Mail, account: Account) -> Self {
        Self::with_id_source(mail, account, Arc::new(AtomicU32::new(1)))
    }

    /// Construct sharing a request-id counter with other contexts, so ids
    /// stay unique process-wide (§5 ordering guarantees) even with many
    /// `mctx`s interleaved by the scheduler.
    #[must_use]
    pub fn with_id_source(mail: Mail, account: Account, id_source: Arc<AtomicU32>) -> Self {
        Self {
            mail,
            account,
            rule: Some(vec![0]),
            stack: Vec::new(),
            expr_item: None,
            result: false,
            done: false,
            matched: false,
            dqueue: VecDeque::new(),
            msgid: None,
            id_source,
            pending: None,
        }
    }

    #[must_use]
    pub fn mail(&self) -> &Mail {
        &self.mail
    }

    pub fn mail_mut(&mut self) -> &mut Mail {
        &mut self.mail
    }

    #[must_use]
    pub fn account(&self) -> &Account {
        &self.account
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.msgid.is_some()
    }

    #[must_use]
    pub fn rule(&self) -> Option<&RulePath> {
        self.rule.as_ref()
    }

    pub(crate) fn set_rule(&mut self, rule: Option<RulePath>) {
        self.rule = rule;
    }

    pub(crate) fn stack_mut(&mut self) -> &mut Vec<RulePath> {
        &mut self.stack
    }

    #[must_use]
    pub fn expr_item(&self) -> Option<usize> {
        self.expr_item
    }

    pub(crate) fn set_expr_item(&mut self, item: Option<usize>) {
        self.expr_item = item;
    }

    #[must_use]
    pub fn result(&self) -> bool {
        self.result
    }

    pub(crate) fn set_result(&mut self, result: bool) {
        self.result = result;
    }

    pub fn dqueue_mut(&mut self) -> &mut VecDeque<DeliveryContext> {
        &mut self.dqueue
    }

    #[must_use]
    pub fn dqueue(&self) -> &VecDeque<DeliveryContext> {
        &self.dqueue
    }

    /// Allocate a fresh monotonic request id, to be used for exactly one
    /// outstanding request.
    fn next_id(&self) -> u32 {
        self.id_source.fetch_add(1, Ordering::Relaxed)
    }

    /// Issue a parent-matcher request: allocates an id, marks the context
    /// blocked on it, and stores the request for the scheduler to send.
    ///
    /// # Errors
    ///
    /// Returns an error only if the context is already blocked, which would
    /// indicate a caller bug (a matcher must not be invoked while `msgid` is
    /// already set).
    pub fn send_match_request(&mut self, matcher: &str, config: &str) -> crate::Result<()> {
        self.issue(OutgoingRequest::Match {
            matcher: matcher.to_string(),
            config: config.to_string(),
        })
    }

    /// Issue an action request for `dctx`, marking the context blocked on
    /// its reply (§4.4 start-action, `ASUSER`/`WRBACK` branch).
    ///
    /// # Errors
    ///
    /// Returns an error if the context is already blocked.
    pub fn send_action_request(
        &mut self,
        account: &str,
        action: &str,
        uid: u32,
        expects_body: bool,
    ) -> crate::Result<()> {
        self.issue(OutgoingRequest::Action {
            account: account.to_string(),
            action: action.to_string(),
            uid,
            expects_body,
        })
    }

    fn issue(&mut self, request: OutgoingRequest) -> crate::Result<()> {
        if self.msgid.is_some() {
            return Err(crate::CoreError::MatcherFailed {
                matcher: "<context>".into(),
                reason: "context issued a second request while already blocked".into(),
            });
        }
        let id = self.next_id();
        self.msgid = Some(id);
        self.pending = Some(Blocked { id, request });
        Ok(())
    }

    /// Take the outgoing request the caller must transmit, if one was just
    /// issued during this step.
    pub fn take_pending_request(&mut self) -> Option<Blocked> {
        self.pending.take()
    }

    /// Consume an incoming reply if its id matches the outstanding
    /// `msgid`; returns `None` (context stays `BLOCKED`, unchanged) on a
    /// mismatch or absent reply (§4.1 blocked path).
    pub(crate) fn take_matching_reply(&mut self, reply: Option<IncomingReply>) -> Option<IncomingReply> {
        let reply = reply?;
        if self.msgid != Some(reply.id) {
            return None;
        }
        self.msgid = None;
        self.mail.tags_mut().replace(reply.tags.clone());
        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::Mail;

    #[test]
    fn new_context_starts_at_the_first_top_level_rule() {
        let ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        assert_eq!(ctx.rule(), Some(&vec![0]));
        assert!(!ctx.is_blocked());
    }

    #[test]
    fn send_match_request_blocks_the_context() {
        let mut ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        ctx.send_match_request("parent", "cfg").unwrap();
        assert!(ctx.is_blocked());
        assert!(ctx.take_pending_request().is_some());
    }

    #[test]
    fn issuing_a_second_request_while_blocked_is_an_error() {
        let mut ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        ctx.send_match_request("parent", "cfg").unwrap();
        assert!(ctx.send_match_request("parent", "cfg2").is_err());
    }

    #[test]
    fn mismatched_reply_id_leaves_context_blocked() {
        let mut ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        ctx.send_match_request("parent", "cfg").unwrap();
        let reply = IncomingReply {
            id: 999,
            outcome: ReplyOutcome::MatchTrue,
            tags: TagStore::new(),
            body: None,
        };
        assert!(ctx.take_matching_reply(Some(reply)).is_none());
        assert!(ctx.is_blocked());
    }
}
