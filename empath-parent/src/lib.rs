//! The privileged-side request handler (§4.4 ambient "Privileged-side
//! dispatch"): turns a decoded IPC [`Request`] into a [`Reply`] by running
//! the requested deliverer or privileged matcher against the message it
//! carries, scoped to the requested uid for the duration of the call.

use std::sync::Arc;

use async_trait::async_trait;
use empath_core::{
    deliverer::{DelivererRegistry, DeliveryKind},
    mail::Mail,
    matcher::{MatchOutcome, MatcherRegistry},
    rule::Ruleset,
    tags::TagStore,
};
use empath_ipc::{
    protocol::{ActionRequest, MatchRequest, Outcome, RequestBody},
    server::{error_reply, RequestHandler},
    Reply, Request,
};
use tracing::{error, warn};

mod error;
mod privilege;

pub use error::ParentActionError;
pub use privilege::PrivilegeGuard;

/// Dispatches `ACTION`/`MATCH` requests arriving from one child connection.
///
/// Holds the same [`Ruleset`] the child evaluates against (account/action
/// tables are shared so both sides agree on what e.g. `uid` resolution
/// means) plus the registries of deliverers/matchers that are only ever
/// invoked here, never in the child.
pub struct ParentHandler {
    ruleset: Arc<Ruleset>,
    deliverers: DelivererRegistry,
    matchers: MatcherRegistry,
}

impl ParentHandler {
    #[must_use]
    pub fn new(ruleset: Arc<Ruleset>) -> Self {
        Self::with_registries(ruleset, DelivererRegistry::with_builtins(), MatcherRegistry::with_builtins())
    }

    #[must_use]
    pub fn with_registries(
        ruleset: Arc<Ruleset>,
        deliverers: DelivererRegistry,
        matchers: MatcherRegistry,
    ) -> Self {
        Self {
            ruleset,
            deliverers,
            matchers,
        }
    }

    fn handle_action(&self, request: &Request, action_req: &ActionRequest) -> Reply {
        let Some(action) = self.ruleset.actions.get(&action_req.action) else {
            return error_reply(
                request.id,
                request.tags.clone(),
                ParentActionError::UnknownAction(action_req.action.clone()).to_string(),
            );
        };

        let mut mail = match build_mail(request) {
            Ok(mail) => mail,
            Err(e) => return error_reply(request.id, request.tags.clone(), e.to_string()),
        };

        // Run every configured item in order; a write-back deliverer's
        // mutation of `mail`'s body carries over to the next item, matching
        // the child's own sequential item_cursor semantics (§4.4).
        let _guard = PrivilegeGuard::assume(action_req.uid);
        for item in &action.items {
            let deliverer = match self.deliverers.get(&item.deliverer) {
                Ok(deliverer) => deliverer,
                Err(e) => {
                    return error_reply(request.id, encode_tags(&mail), ParentActionError::from(e).to_string())
                }
            };
            if deliverer.kind() == DeliveryKind::InChild {
                warn!(
                    deliverer = item.deliverer,
                    "an in-child deliverer was dispatched to the parent; running it anyway"
                );
            }
            if let Err(e) = deliverer.deliver(&mut mail, &item.config) {
                error!(action = action_req.action, uid = action_req.uid, "deliverer failed: {e}");
                return error_reply(request.id, encode_tags(&mail), ParentActionError::from(e).to_string());
            }
        }

        let tags = encode_tags(&mail);
        let reply = Reply::new(request.id, Outcome::ActionDone, tags);
        if action_req.expects_body {
            reply.with_body(mail.body().as_bytes().to_vec())
        } else {
            reply
        }
    }

    fn handle_match(&self, request: &Request, match_req: &MatchRequest) -> Reply {
        let mail = match build_mail(request) {
            Ok(mail) => mail,
            Err(e) => return error_reply(request.id, request.tags.clone(), e.to_string()),
        };

        let matcher = match self.matchers.get(&match_req.matcher) {
            Ok(matcher) => matcher,
            Err(e) => {
                return error_reply(request.id, request.tags.clone(), ParentActionError::from(e).to_string())
            }
        };
        let config = match std::str::from_utf8(&match_req.config) {
            Ok(config) => config,
            Err(e) => {
                return error_reply(
                    request.id,
                    request.tags.clone(),
                    ParentActionError::MalformedRequest(e.to_string()).to_string(),
                )
            }
        };

        // Parent-side matchers evaluate directly; unlike the child, a
        // `MatchOutcome::Parent` here would mean a matcher deferred to
        // itself, which is a misconfiguration rather than a valid outcome.
        let mut ctx = empath_core::context::MatchContext::new(mail, empath_core::rule::Account::new("_parent"));
        let outcome = matcher.evaluate(&mut ctx, config);
        let mail = ctx.mail().clone();

        match outcome {
            Ok(MatchOutcome::True) => Reply::new(request.id, Outcome::MatchTrue, encode_tags(&mail)),
            Ok(MatchOutcome::False) => Reply::new(request.id, Outcome::MatchFalse, encode_tags(&mail)),
            Ok(MatchOutcome::Parent) => error_reply(
                request.id,
                encode_tags(&mail),
                format!("matcher {} deferred to the parent from the parent", match_req.matcher),
            ),
            Err(e) => error_reply(request.id, encode_tags(&mail), e.to_string()),
        }
    }
}

#[async_trait]
impl RequestHandler for ParentHandler {
    async fn handle(&self, request: Request) -> Reply {
        match &request.body {
            RequestBody::Action(action_req) => self.handle_action(&request, action_req),
            RequestBody::Match(match_req) => self.handle_match(&request, match_req),
        }
    }
}

fn build_mail(request: &Request) -> Result<Mail, ParentActionError> {
    let tags = TagStore::decode(&request.tags)?;
    let body = String::from_utf8(request.mail.clone())
        .map_err(|e| ParentActionError::MalformedRequest(e.to_string()))?;
    let mut mail = Mail::new(body);
    mail.tags_mut().replace(tags);
    Ok(mail)
}

fn encode_tags(mail: &Mail) -> Vec<u8> {
    mail.tags().encode().unwrap_or_default()
}
