//! End-to-end test of the privilege-separated round trip: a real
//! `empath-parent` handler served over a real Unix socket, driven by the
//! `empath-core` state machine through `empath-ipc`'s client/server pair.
//! This is the scenario `bin/child.rs`/`bin/parent.rs` wire up for real,
//! minus process separation (§5, §6).

use std::{collections::HashMap, sync::Arc, time::Duration};

use empath_core::{
    context::{IncomingReply, MatchContext, ReplyOutcome},
    deliverer::DelivererRegistry,
    mail::{Decision, Mail},
    matcher::MatcherRegistry,
    rule::{Account, Action, ActionItem, ImplicitAction, Rule, Ruleset},
    state_machine::{step_deliver, step_match, DeliverStep, MatchStep},
    tags::TagStore,
};
use empath_ipc::{
    client::IpcClient,
    protocol::{MatchRequest, Outcome},
    IpcServer, Request,
};
use empath_parent::ParentHandler;
use tempfile::TempDir;
use tokio::sync::broadcast;

async fn start_parent(socket_path: &str, ruleset: Arc<Ruleset>) -> broadcast::Sender<empath_common::Signal> {
    let handler = Arc::new(ParentHandler::new(ruleset));
    let server = IpcServer::new(socket_path, handler);
    let (tx, rx) = broadcast::channel(1);

    let path = socket_path.to_string();
    tokio::spawn(async move {
        if let Err(e) = server.serve(rx).await {
            eprintln!("parent server error on {path}: {e}");
        }
    });

    for _ in 0..100 {
        if std::path::Path::new(socket_path).exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tx
}

fn write_back_ruleset() -> Ruleset {
    let mut actions = HashMap::new();
    actions.insert(
        "rewrite".to_string(),
        Action {
            name: "rewrite".into(),
            users: None,
            find_uid: false,
            items: vec![ActionItem {
                deliverer: "rewrite".into(),
                config: "prepend:X-Filtered: yes\n".into(),
            }],
        },
    );

    let mut rule = Rule::new(0);
    rule.actions.push("rewrite".into());

    Ruleset {
        rules: vec![rule],
        actions,
        accounts: HashMap::new(),
        default_user: 1000,
        implicit_action: ImplicitAction::Keep,
    }
}

/// Drives a single message through `step_match`/`step_deliver`, sending any
/// blocked request over `ipc` and feeding the matching reply back, until the
/// message reaches `DONE`.
async fn run_to_completion(
    ctx: &mut MatchContext,
    ruleset: &Ruleset,
    matchers: &MatcherRegistry,
    deliverers: &DelivererRegistry,
    ipc: &IpcClient,
    replies: &mut empath_ipc::client::ReplyStream,
) {
    let mut matching = true;
    loop {
        if matching {
            match step_match(ctx, ruleset, matchers, None) {
                MatchStep::Deliver => matching = false,
                MatchStep::Done => break,
                MatchStep::Continue => {}
                MatchStep::Blocked => unreachable!("no parent-deferred matchers in this ruleset"),
                MatchStep::Error(e) => panic!("match error: {e}"),
            }
            continue;
        }

        match step_deliver(ctx, ruleset, deliverers, None) {
            DeliverStep::Continue => continue,
            DeliverStep::Match => {
                matching = true;
                continue;
            }
            DeliverStep::Error(e) => panic!("deliver error: {e}"),
            DeliverStep::Blocked => {}
        }

        let pending = ctx.take_pending_request().expect("BLOCKED must have issued a request");
        let tags = ctx.mail().tags().encode().unwrap();
        let mail = ctx.mail().body().as_bytes().to_vec();
        let request = match &pending.request {
            empath_core::context::OutgoingRequest::Action {
                account,
                action,
                uid,
                expects_body,
            } => Request::action(
                pending.id,
                tags,
                empath_ipc::protocol::ActionRequest {
                    account: account.clone(),
                    action: action.clone(),
                    uid: *uid,
                    expects_body: *expects_body,
                },
            )
            .with_mail(mail),
            empath_core::context::OutgoingRequest::Match { matcher, config } => {
                Request::matcher(pending.id, tags, MatchRequest {
                    matcher: matcher.clone(),
                    config: config.clone().into_bytes(),
                })
                .with_mail(mail)
            }
        };

        ipc.send(&request).await.unwrap();
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.id, pending.id);

        let incoming = IncomingReply {
            id: reply.id,
            outcome: match reply.outcome {
                Outcome::MatchTrue => ReplyOutcome::MatchTrue,
                Outcome::MatchFalse => ReplyOutcome::MatchFalse,
                Outcome::ActionDone => ReplyOutcome::ActionDone,
                Outcome::Error(reason) => ReplyOutcome::Error(reason),
            },
            tags: TagStore::decode(&reply.tags).unwrap(),
            body: reply.body.map(|b| String::from_utf8(b).unwrap()),
        };

        match step_deliver(ctx, ruleset, deliverers, Some(incoming)) {
            DeliverStep::Continue => {}
            DeliverStep::Match => matching = true,
            DeliverStep::Error(e) => panic!("deliver error after reply: {e}"),
            DeliverStep::Blocked => panic!("still blocked right after consuming the matching reply"),
        }
    }
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn write_back_action_round_trips_through_a_real_socket() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("empath.sock");
    let socket_str = socket_path.to_str().unwrap().to_string();

    let ruleset = Arc::new(write_back_ruleset());
    let shutdown_tx = start_parent(&socket_str, Arc::clone(&ruleset)).await;

    let (ipc, mut replies) = IpcClient::connect(&socket_str).await.unwrap();
    let matchers = MatcherRegistry::with_builtins();
    let deliverers = DelivererRegistry::with_builtins();

    let mut ctx = MatchContext::new(Mail::new("Subject: hi\nbody"), Account::new("a1"));
    run_to_completion(&mut ctx, &ruleset, &matchers, &deliverers, &ipc, &mut replies).await;

    assert_eq!(ctx.mail().decision(), Some(Decision::Keep));
    assert!(ctx.mail().body().contains("X-Filtered: yes"));

    let _ = shutdown_tx.send(empath_common::Signal::Shutdown);
}
