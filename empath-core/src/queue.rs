//! The delivery-queue builder (§4.3): expands a matched rule's action-name
//! templates into concrete `dctx` entries, resolving the effective uid set
//! with the rule → action → account → default precedence chain.

use std::collections::HashSet;

use globset::Glob;

use crate::{
    context::{DeliveryContext, MatchContext},
    rule::{Account, Action, Rule, Ruleset},
    subst::substitute,
    CoreError,
};

/// Expand `rule`'s `actions` templates against `ruleset` and append one
/// [`DeliveryContext`] per (action, uid) pair onto `ctx`'s delivery queue.
/// Returns the number of contexts enqueued; `0` means the rule had no
/// `actions` at all, which is not an error (a rule may match purely to add
/// a tag or descend into nested rules).
///
/// # Errors
///
/// Returns [`CoreError::InvalidGlob`] if a template's compiled-down
/// pattern is malformed, or [`CoreError::NoMatchingActions`] if a pattern
/// matches no configured action name — both abort evaluation of the
/// message (§4.1 "enqueue deliveries").
pub fn build_delivery_queue(ctx: &mut MatchContext, rule: &Rule, ruleset: &Ruleset) -> crate::Result<usize> {
    let account = ruleset
        .accounts
        .get(&ctx.account().name)
        .cloned()
        .unwrap_or_else(|| ctx.account().clone());

    let mut enqueued = 0;
    for template in &rule.actions {
        let pattern = substitute(template, ctx.mail().tags());
        let glob = Glob::new(&pattern)
            .map_err(|e| CoreError::InvalidGlob {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?
            .compile_matcher();

        let mut matched_any = false;
        for action in ruleset.actions.values() {
            if !glob.is_match(&action.name) {
                continue;
            }
            matched_any = true;
            let uids = resolve_effective_users(rule, action, &account, ctx.mail(), ruleset.default_user);
            for uid in uids {
                ctx.dqueue_mut().push_back(DeliveryContext::new(action.name.clone(), uid));
                enqueued += 1;
            }
        }

        if !matched_any {
            return Err(CoreError::NoMatchingActions(pattern));
        }
    }

    Ok(enqueued)
}

/// Resolve the uid set for one (rule, action, account) triple: the first
/// level (in rule → action → account order) that sets `find_uid` or a
/// non-empty `users` wins outright; if none do, synthesize `{default_user}`
/// (§4.3 step 3, §8 "User resolution" law).
#[must_use]
pub fn resolve_effective_users(rule: &Rule, action: &Action, account: &Account, mail: &crate::mail::Mail, default_user: u32) -> Vec<u32> {
    for (find_uid, users) in [
        (rule.find_uid, &rule.users),
        (action.find_uid, &action.users),
        (account.find_uid, &account.users),
    ] {
        if find_uid {
            return weed_users(mail.derived_uids());
        }
        if let Some(users) = users {
            if !users.is_empty() {
                return weed_users(users.clone());
            }
        }
    }
    vec![default_user]
}

/// Drop duplicate uids from a resolved user set, keeping first-seen order.
/// User sets containing duplicates are not errors but must be deduplicated
/// before expansion (§4.3 step 3).
fn weed_users(users: Vec<u32>) -> Vec<u32> {
    let mut seen = HashSet::with_capacity(users.len());
    users.into_iter().filter(|uid| seen.insert(*uid)).collect()
}
