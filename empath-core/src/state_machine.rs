//! The per-message match/deliver state machine (§4.1, §4.2): the two
//! scheduler-facing entry points [`step_match`] and [`step_deliver`], and
//! the action-dispatch helpers they call (§4.4).
//!
//! Grounded directly on the reference implementation's `mail_match`/
//! `mail_deliver` (the live path, not the `#if 0` dead code): rule descent
//! via an explicit ancestor stack, one expression item evaluated per call,
//! and the same `BLOCKED`/`CONTINUE`/`DELIVER`/`DONE`/`MATCH`/`ERROR`
//! vocabulary (§6).

use empath_tracing::traced;

use crate::{
    context::{DeliveryContext, IncomingReply, MatchContext, ReplyOutcome},
    deliverer::{Deliverer, DelivererRegistry, DeliveryKind},
    mail::Decision,
    matcher::{MatchOutcome, MatcherRegistry},
    queue::build_delivery_queue,
    rule::{ImplicitAction, Operator, Ruleset},
    CoreError, Result,
};

/// Outcome of one [`step_match`] call (§6 return-code surfaces).
#[derive(Debug)]
pub enum MatchStep {
    Continue,
    Blocked,
    Deliver,
    Done,
    Error(CoreError),
}

/// Outcome of one [`step_deliver`] call.
#[derive(Debug)]
pub enum DeliverStep {
    Continue,
    Blocked,
    Match,
    Error(CoreError),
}

enum ActionStart {
    Done,
    Parent,
}

/// Advance `ctx` through the matching phase by one step (§4.1).
///
/// `reply` must be `Some` exactly when the caller is resuming a context
/// this function previously returned `Blocked` for, carrying the IPC reply
/// that unblocks it — and its id is checked against `ctx`'s outstanding
/// `msgid` before it is consumed.
#[traced]
pub fn step_match(
    ctx: &mut MatchContext,
    ruleset: &Ruleset,
    matchers: &MatcherRegistry,
    reply: Option<IncomingReply>,
) -> MatchStep {
    ctx.mail_mut().unfold();

    if ctx.is_blocked() {
        let Some(incoming) = ctx.take_matching_reply(reply) else {
            return MatchStep::Blocked;
        };

        let (rule_path, item_idx) = match (ctx.rule().cloned(), ctx.expr_item()) {
            (Some(rule_path), Some(item_idx)) => (rule_path, item_idx),
            _ => {
                return MatchStep::Error(CoreError::InvalidConfig(
                    "blocked context has no pending expression item".into(),
                ))
            }
        };
        let Some(rule) = ruleset.rule_at(&rule_path) else {
            return MatchStep::Error(CoreError::InvalidConfig(
                "blocked context's rule path no longer resolves".into(),
            ));
        };
        let item = &rule.expr[item_idx];

        match incoming.outcome {
            ReplyOutcome::Error(reason) => {
                return MatchStep::Error(CoreError::MatcherFailed {
                    matcher: item.matcher.clone(),
                    reason,
                })
            }
            ReplyOutcome::MatchTrue => apply_outcome(ctx, item.operator, item.inverted, true),
            ReplyOutcome::MatchFalse => apply_outcome(ctx, item.operator, item.inverted, false),
            ReplyOutcome::ActionDone => {
                return MatchStep::Error(CoreError::InvalidConfig(
                    "received an action reply while blocked on a match request".into(),
                ))
            }
        }

        advance_expr_item(ctx, ruleset, &rule_path);
        if ctx.expr_item().is_some() {
            return MatchStep::Continue;
        }
        return finish_expression(ctx, ruleset);
    }

    if ctx.done {
        return MatchStep::Done;
    }

    let Some(rule_path) = ctx.rule().cloned() else {
        return finalize_end_of_ruleset(ctx, ruleset);
    };

    if ctx.expr_item().is_none() {
        // A context starts at path `[0]` unconditionally; an empty ruleset
        // means that path never resolves, which is not an error — it's an
        // empty rule tree, i.e. immediately at the end of the ruleset.
        let Some(rule) = ruleset.rule_at(&rule_path) else {
            return finalize_end_of_ruleset(ctx, ruleset);
        };

        if !rule.accounts.is_empty()
            && !rule
                .accounts
                .iter()
                .any(|pattern| name_matches(pattern, &ctx.account().name))
        {
            ctx.set_result(false);
            return finish_expression(ctx, ruleset);
        }

        if rule.is_rule_all() {
            ctx.set_result(true);
            return finish_expression(ctx, ruleset);
        }

        ctx.set_result(false);
        ctx.set_expr_item(Some(0));
    }

    let Some(rule) = ruleset.rule_at(&rule_path) else {
        return MatchStep::Error(CoreError::InvalidConfig(
            "current rule path no longer resolves".into(),
        ));
    };
    let item_idx = ctx.expr_item().expect("just initialised above if it was absent");
    let item = &rule.expr[item_idx];

    let matcher = match matchers.get(&item.matcher) {
        Ok(matcher) => matcher,
        Err(e) => return MatchStep::Error(e),
    };

    match matcher.evaluate(ctx, &item.config) {
        Err(e) => return MatchStep::Error(e),
        Ok(MatchOutcome::Parent) => return MatchStep::Blocked,
        Ok(MatchOutcome::True) => apply_outcome(ctx, item.operator, item.inverted, true),
        Ok(MatchOutcome::False) => apply_outcome(ctx, item.operator, item.inverted, false),
    }

    advance_expr_item(ctx, ruleset, &rule_path);
    if ctx.expr_item().is_some() {
        return MatchStep::Continue;
    }
    finish_expression(ctx, ruleset)
}

/// Advance `ctx` through the delivery phase by one step (§4.2). Same
/// blocked/reply contract as [`step_match`].
#[traced]
pub fn step_deliver(
    ctx: &mut MatchContext,
    ruleset: &Ruleset,
    deliverers: &DelivererRegistry,
    reply: Option<IncomingReply>,
) -> DeliverStep {
    ctx.mail_mut().fold();

    if ctx.is_blocked() {
        let Some(incoming) = ctx.take_matching_reply(reply) else {
            return DeliverStep::Blocked;
        };
        let Some(head) = ctx.dqueue().front().cloned() else {
            return DeliverStep::Error(CoreError::InvalidConfig(
                "blocked delivery context has an empty queue".into(),
            ));
        };
        if let Err(e) = finish_action(ctx, ruleset, deliverers, &head, incoming) {
            return DeliverStep::Error(e);
        }
        ctx.dqueue_mut().pop_front();
        return DeliverStep::Continue;
    }

    if ctx.dqueue().is_empty() {
        return DeliverStep::Match;
    }

    let head = ctx
        .dqueue()
        .front()
        .cloned()
        .expect("queue non-empty, checked above");
    match start_action(ctx, ruleset, deliverers, &head) {
        Err(e) => return DeliverStep::Error(e),
        Ok(ActionStart::Parent) => return DeliverStep::Blocked,
        Ok(ActionStart::Done) => {}
    }

    ctx.dqueue_mut().pop_front();
    DeliverStep::Continue
}

/// §4.4 start-action.
///
/// An action's items are dispatched as one unit: if every item is
/// `INCHILD`, each runs in order, synchronously, right here; if any item
/// needs the privileged side (`ASUSER`/`WRBACK`), the whole item list is
/// handed to the parent in a single request, which runs all of them in
/// order under the assumed uid (including any `INCHILD` items among
/// them — see `empath-parent::handle_action`) so an item never runs twice
/// (§3 `dctx` "target action-item cursor" caveat, §6).
fn start_action(
    ctx: &mut MatchContext,
    ruleset: &Ruleset,
    deliverers: &DelivererRegistry,
    dctx: &DeliveryContext,
) -> Result<ActionStart> {
    let action = ruleset
        .actions
        .get(&dctx.action)
        .ok_or_else(|| CoreError::UnknownDeliverer(dctx.action.clone()))?;

    let pending = action.items.get(dctx.item_cursor..).unwrap_or(&[]);
    if pending.is_empty() {
        // No deliverer configured for this item: treat as a no-op success
        // (§4.4 start-action step 2).
        return Ok(ActionStart::Done);
    }

    ctx.mail_mut().tags_mut().insert("action", action.name.clone());

    let kinds = pending
        .iter()
        .map(|item| deliverers.get(&item.deliverer).map(|d| d.kind()))
        .collect::<Result<Vec<_>>>()?;

    if kinds.iter().all(|kind| *kind == DeliveryKind::InChild) {
        for item in pending {
            let deliverer = deliverers.get(&item.deliverer)?;
            deliverer.deliver(ctx.mail_mut(), &item.config)?;
        }
        return Ok(ActionStart::Done);
    }

    let account_name = ctx.account().name.clone();
    let expects_body = kinds.iter().any(|kind| *kind == DeliveryKind::WriteBack);
    ctx.send_action_request(&account_name, &dctx.action, dctx.uid, expects_body)?;
    Ok(ActionStart::Parent)
}

/// §4.4 finish-action.
fn finish_action(
    ctx: &mut MatchContext,
    ruleset: &Ruleset,
    deliverers: &DelivererRegistry,
    dctx: &DeliveryContext,
    reply: IncomingReply,
) -> Result<()> {
    // `ctx.take_matching_reply` has already replaced the tag store with the
    // reply's payload; refresh derived tags (e.g. a delivery counter) now
    // that the parent's mutations are visible.
    refresh_derived_tags(ctx.mail_mut());

    if let ReplyOutcome::Error(reason) = reply.outcome {
        return Err(CoreError::DelivererFailed {
            deliverer: dctx.action.clone(),
            reason,
        });
    }

    let action = ruleset
        .actions
        .get(&dctx.action)
        .ok_or_else(|| CoreError::UnknownDeliverer(dctx.action.clone()))?;
    let expects_body = action
        .items
        .get(dctx.item_cursor..)
        .unwrap_or(&[])
        .iter()
        .map(|item| deliverers.get(&item.deliverer))
        .collect::<Result<Vec<_>>>()?
        .iter()
        .any(|deliverer| deliverer.kind() == DeliveryKind::WriteBack);

    if !expects_body {
        return Ok(());
    }

    let body = reply.body.ok_or_else(|| {
        CoreError::InvalidConfig("write-back reply carried no replacement body".into())
    })?;
    ctx.mail_mut().replace_body(body);
    Ok(())
}

/// The "tag update hooks" external collaborator (§4.4 step 1): a minimal
/// built-in that tracks how many deliveries a message has been through, the
/// example the spec names.
fn refresh_derived_tags(mail: &mut crate::mail::Mail) {
    let count = mail
        .tags()
        .get("deliveries")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    mail.tags_mut().insert("deliveries", count.to_string());
}

/// §4.1 "skip" label onward: the rule either didn't match (advance to the
/// next rule) or did (tag, descend into nested rules or enqueue
/// deliveries, then advance).
fn finish_expression(ctx: &mut MatchContext, ruleset: &Ruleset) -> MatchStep {
    let rule_path = ctx
        .rule()
        .cloned()
        .expect("a rule is always set while finishing its expression");

    if !ctx.result() {
        advance_to_next_rule(ctx, ruleset, &rule_path);
        return MatchStep::Continue;
    }

    ctx.matched = true;
    let Some(rule) = ruleset.rule_at(&rule_path) else {
        return MatchStep::Error(CoreError::InvalidConfig(
            "matched rule path no longer resolves".into(),
        ));
    };
    if rule.stop {
        ctx.done = true;
    }

    if !rule.nested.is_empty() {
        let mut child_path = rule_path.clone();
        child_path.push(0);
        ctx.stack_mut().push(rule_path);
        ctx.set_rule(Some(child_path));
        ctx.set_expr_item(None);
        return MatchStep::Continue;
    }

    if let Some(key_template) = rule.key.clone() {
        let value_template = rule.value.clone().unwrap_or_default();
        let key = crate::subst::substitute(&key_template, ctx.mail().tags());
        let value = crate::subst::substitute(&value_template, ctx.mail().tags());
        if !key.is_empty() {
            ctx.mail_mut().tags_mut().insert(key, value);
        }
    }

    let mut pending_deliver = false;
    if !rule.actions.is_empty() {
        let rule = rule.clone();
        match build_delivery_queue(ctx, &rule, ruleset) {
            Err(e) => return MatchStep::Error(e),
            Ok(enqueued) => pending_deliver = enqueued > 0,
        }
    }

    advance_to_next_rule(ctx, ruleset, &rule_path);
    if pending_deliver {
        MatchStep::Deliver
    } else {
        MatchStep::Continue
    }
}

/// §4.1 "end of ruleset": apply the implicit-action policy and finish.
fn finalize_end_of_ruleset(ctx: &mut MatchContext, ruleset: &Ruleset) -> MatchStep {
    let decision = match ruleset.implicit_action {
        ImplicitAction::None => {
            tracing::warn!(
                account = %ctx.account().name,
                "reached end of ruleset with no implicit-action policy; keeping mail"
            );
            Decision::Keep
        }
        ImplicitAction::Keep => Decision::Keep,
        ImplicitAction::Drop => Decision::Drop,
    };
    ctx.mail_mut().set_decision(decision);
    MatchStep::Done
}

/// Advance `rule`/`stack` to the next rule to visit: the sibling of
/// `current`, or (repeatedly) the sibling of the nearest ancestor on the
/// stack whose own sibling list is exhausted (§4.1 "next rule", §9
/// "Recursive rule tree with sibling descent").
fn advance_to_next_rule(ctx: &mut MatchContext, ruleset: &Ruleset, current: &[usize]) {
    let mut next = sibling_path(current);
    while ruleset.rule_at(&next).is_none() {
        let Some(ancestor) = ctx.stack_mut().pop() else {
            ctx.set_rule(None);
            ctx.set_expr_item(None);
            return;
        };
        next = sibling_path(&ancestor);
    }
    ctx.set_rule(Some(next));
    ctx.set_expr_item(None);
}

fn sibling_path(path: &[usize]) -> Vec<usize> {
    let mut next = path.to_vec();
    if let Some(last) = next.last_mut() {
        *last += 1;
    }
    next
}

fn advance_expr_item(ctx: &mut MatchContext, ruleset: &Ruleset, rule_path: &[usize]) {
    let len = ruleset.rule_at(rule_path).map_or(0, |r| r.expr.len());
    let next = ctx.expr_item().map(|i| i + 1);
    match next {
        Some(i) if i < len => ctx.set_expr_item(Some(i)),
        _ => ctx.set_expr_item(None),
    }
}

/// Combine one expression item's outcome into `ctx.result` (§4.5): invert
/// first if the item is inverted, then fold with the running result via
/// its operator. `OP_NONE`/`OP_OR` behave identically here because the
/// running result starts at `false`.
fn apply_outcome(ctx: &mut MatchContext, operator: Operator, inverted: bool, raw_true: bool) {
    let value = if inverted { !raw_true } else { raw_true };
    let combined = match operator {
        Operator::None | Operator::Or => ctx.result() || value,
        Operator::And => ctx.result() && value,
    };
    ctx.set_result(combined);
}

fn name_matches(pattern: &str, name: &str) -> bool {
    globset::Glob::new(pattern)
        .map(|glob| glob.compile_matcher().is_match(name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::MatchContext,
        deliverer::DelivererRegistry,
        mail::Mail,
        matcher::MatcherRegistry,
        rule::{Account, Action, ActionItem, ExpressionItem, Rule, Ruleset},
    };
    use std::collections::HashMap;

    fn base_ruleset() -> Ruleset {
        Ruleset {
            rules: Vec::new(),
            actions: HashMap::new(),
            accounts: HashMap::new(),
            default_user: 1000,
            implicit_action: ImplicitAction::None,
        }
    }

    fn keep_action() -> Action {
        Action {
            name: "keep".into(),
            users: None,
            find_uid: false,
            items: vec![ActionItem {
                deliverer: "tag".into(),
                config: "action=keep".into(),
            }],
        }
    }

    /// Scenario 1: empty ruleset, `impl_act = NONE` keeps with a warning.
    #[test]
    fn keep_default_on_empty_ruleset() {
        let ruleset = base_ruleset();
        let mut ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        let matchers = MatcherRegistry::with_builtins();

        let step = step_match(&mut ctx, &ruleset, &matchers, None);
        assert!(matches!(step, MatchStep::Done));
        assert_eq!(ctx.mail().decision(), Some(Decision::Keep));
    }

    /// Scenario 2: `match all actions "keep"` with an in-child deliverer.
    #[test]
    fn simple_match_and_deliver() {
        let mut rule = Rule::new(0);
        rule.actions.push("keep".into());

        let mut ruleset = base_ruleset();
        ruleset.rules.push(rule);
        ruleset.actions.insert("keep".into(), keep_action());
        ruleset.implicit_action = ImplicitAction::Keep;

        let mut ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        let matchers = MatcherRegistry::with_builtins();
        let deliverers = DelivererRegistry::with_builtins();

        let step = step_match(&mut ctx, &ruleset, &matchers, None);
        assert!(matches!(step, MatchStep::Deliver));

        let step = step_deliver(&mut ctx, &ruleset, &deliverers, None);
        assert!(matches!(step, DeliverStep::Continue));

        let step = step_deliver(&mut ctx, &ruleset, &deliverers, None);
        assert!(matches!(step, DeliverStep::Match));

        let step = step_match(&mut ctx, &ruleset, &matchers, None);
        assert!(matches!(step, MatchStep::Done));
        assert_eq!(ctx.mail().decision(), Some(Decision::Keep));
    }

    /// Scenario 3: first rule is `stop`; rule 2 is never visited.
    #[test]
    fn stop_rule_skips_remaining_rules() {
        let mut rule1 = Rule::new(0);
        rule1.actions.push("keep".into());
        rule1.stop = true;

        let mut rule2 = Rule::new(1);
        rule2.actions.push("keep".into());

        let mut ruleset = base_ruleset();
        ruleset.rules.push(rule1);
        ruleset.rules.push(rule2);
        ruleset.actions.insert("keep".into(), keep_action());

        let mut ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        let matchers = MatcherRegistry::with_builtins();
        let deliverers = DelivererRegistry::with_builtins();

        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Deliver
        ));
        assert!(ctx.done);
        assert!(matches!(
            step_deliver(&mut ctx, &ruleset, &deliverers, None),
            DeliverStep::Continue
        ));
        assert!(matches!(
            step_deliver(&mut ctx, &ruleset, &deliverers, None),
            DeliverStep::Match
        ));

        // Rule 2 must never be visited: the very next step_match is DONE.
        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Done
        ));
    }

    /// Scenario 4: `not tag x=x or tag y=y` on a message with `y=y` only.
    #[test]
    fn and_or_with_invert() {
        let mut rule = Rule::new(0);
        rule.expr.push(ExpressionItem {
            operator: Operator::None,
            inverted: true,
            matcher: "tag".into(),
            config: "x=x".into(),
        });
        rule.expr.push(ExpressionItem {
            operator: Operator::Or,
            inverted: false,
            matcher: "tag".into(),
            config: "y=y".into(),
        });

        let mut ruleset = base_ruleset();
        ruleset.rules.push(rule);

        let mut mail = Mail::new("body");
        mail.tags_mut().insert("y", "y");
        let mut ctx = MatchContext::new(mail, Account::new("a1"));
        let matchers = MatcherRegistry::with_builtins();

        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Continue
        ));
        assert!(ctx.result());
        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Continue
        ));
        assert!(ctx.matched);
    }

    /// Scenario 5: a parent-deferred matcher blocks, then resumes on reply.
    #[test]
    fn parent_matcher_blocks_then_resumes() {
        let mut rule = Rule::new(0);
        rule.expr.push(ExpressionItem {
            operator: Operator::None,
            inverted: false,
            matcher: "parent".into(),
            config: "cfg".into(),
        });

        let mut ruleset = base_ruleset();
        ruleset.rules.push(rule);

        let mut ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        let matchers = MatcherRegistry::with_builtins();

        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Blocked
        ));
        assert!(ctx.is_blocked());
        let pending = ctx.take_pending_request().unwrap();

        let reply = IncomingReply {
            id: pending.id,
            outcome: ReplyOutcome::MatchTrue,
            tags: ctx.mail().tags().clone(),
            body: None,
        };
        let step = step_match(&mut ctx, &ruleset, &matchers, Some(reply));
        assert!(matches!(step, MatchStep::Continue));
        assert!(ctx.matched);
    }

    /// Scenario 6: nested rules; outer has no own actions, children do.
    #[test]
    fn nested_rules_descend_and_ascend_correctly() {
        let mut child1 = Rule::new(0);
        child1.expr.push(ExpressionItem {
            operator: Operator::None,
            inverted: false,
            matcher: "tag".into(),
            config: "x=present".into(),
        });
        child1.actions.push("keep".into());

        let mut child2 = Rule::new(0);
        child2.actions.push("keep".into());

        let mut outer = Rule::new(0);
        outer.nested.push(child1);
        outer.nested.push(child2);

        let mut ruleset = base_ruleset();
        ruleset.rules.push(outer);
        ruleset.actions.insert("keep".into(), keep_action());
        ruleset.implicit_action = ImplicitAction::Keep;

        let mut ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        let matchers = MatcherRegistry::with_builtins();
        let deliverers = DelivererRegistry::with_builtins();

        // Outer matches (rule-all), descends into child1.
        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Continue
        ));
        assert_eq!(ctx.rule(), Some(&vec![0, 0]));

        // child1's tag condition is false: no deliveries, advance to child2.
        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Continue
        ));
        assert_eq!(ctx.rule(), Some(&vec![0, 1]));

        // child2 is rule-all: delivers.
        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Deliver
        ));
        assert!(matches!(
            step_deliver(&mut ctx, &ruleset, &deliverers, None),
            DeliverStep::Continue
        ));
        assert!(matches!(
            step_deliver(&mut ctx, &ruleset, &deliverers, None),
            DeliverStep::Match
        ));

        // Stack popped, outer has no sibling: done.
        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Done
        ));
    }

    /// Scenario 7: a write-back action rewrites the body on reply.
    #[test]
    fn write_back_action_replaces_body_on_reply() {
        let mut rule = Rule::new(0);
        rule.actions.push("rewrite".into());

        let action = Action {
            name: "rewrite".into(),
            users: None,
            find_uid: false,
            items: vec![ActionItem {
                deliverer: "rewrite".into(),
                config: "prepend:X-Filtered: yes\n".into(),
            }],
        };

        let mut ruleset = base_ruleset();
        ruleset.rules.push(rule);
        ruleset.actions.insert("rewrite".into(), action);

        let mut ctx = MatchContext::new(Mail::new("Subject: hi\nbody"), Account::new("a1"));
        let matchers = MatcherRegistry::with_builtins();
        let deliverers = DelivererRegistry::with_builtins();

        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Deliver
        ));

        assert!(matches!(
            step_deliver(&mut ctx, &ruleset, &deliverers, None),
            DeliverStep::Blocked
        ));
        let pending = ctx.take_pending_request().unwrap();

        let reply = IncomingReply {
            id: pending.id,
            outcome: ReplyOutcome::ActionDone,
            tags: ctx.mail().tags().clone(),
            body: Some("X-Filtered: yes\nSubject: hi\nnew body".into()),
        };
        assert!(matches!(
            step_deliver(&mut ctx, &ruleset, &deliverers, Some(reply)),
            DeliverStep::Continue
        ));
        assert!(ctx.mail().body().contains("X-Filtered: yes"));
        assert!(ctx.mail().body().contains("new body"));

        assert!(matches!(
            step_deliver(&mut ctx, &ruleset, &deliverers, None),
            DeliverStep::Match
        ));
    }

    /// An action with several in-child items runs every one of them, not
    /// just the first, before the dctx is popped.
    #[test]
    fn multi_item_inchild_action_runs_every_item() {
        let mut rule = Rule::new(0);
        rule.actions.push("tag-twice".into());

        let action = Action {
            name: "tag-twice".into(),
            users: None,
            find_uid: false,
            items: vec![
                ActionItem {
                    deliverer: "tag".into(),
                    config: "first=one".into(),
                },
                ActionItem {
                    deliverer: "tag".into(),
                    config: "second=two".into(),
                },
            ],
        };

        let mut ruleset = base_ruleset();
        ruleset.rules.push(rule);
        ruleset.actions.insert("tag-twice".into(), action);

        let mut ctx = MatchContext::new(Mail::new("body"), Account::new("a1"));
        let matchers = MatcherRegistry::with_builtins();
        let deliverers = DelivererRegistry::with_builtins();

        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Deliver
        ));
        assert!(matches!(
            step_deliver(&mut ctx, &ruleset, &deliverers, None),
            DeliverStep::Continue
        ));
        assert_eq!(ctx.mail().tags().get("first"), Some("one"));
        assert_eq!(ctx.mail().tags().get("second"), Some("two"));
    }

    /// A header that isn't the first one in the message must still match
    /// once `step_match`'s unconditional unfold pre-pass runs: the
    /// header/body separator newline must survive unfolding, or the whole
    /// message collapses into a single unmatchable "line".
    #[test]
    fn header_matcher_finds_a_non_leading_header_through_step_match() {
        let mut rule = Rule::new(0);
        rule.expr.push(ExpressionItem {
            operator: Operator::None,
            inverted: false,
            matcher: "header".into(),
            config: "from".into(),
        });
        rule.actions.push("keep".into());

        let mut ruleset = base_ruleset();
        ruleset.rules.push(rule);
        ruleset.actions.insert("keep".into(), keep_action());

        let mut ctx = MatchContext::new(
            Mail::new("Subject: hi\nFrom: a@b\n\nbody text"),
            Account::new("a1"),
        );
        let matchers = MatcherRegistry::with_builtins();

        assert!(matches!(
            step_match(&mut ctx, &ruleset, &matchers, None),
            MatchStep::Deliver
        ));
        assert!(ctx.matched);
    }
}
