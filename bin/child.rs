//! Unprivileged scheduler binary: drives one [`MatchContext`] per
//! pre-fetched message through match/deliver (§5 "Scheduling model"),
//! parking a context whenever it blocks on the parent and resuming it once
//! the matching reply arrives, while other contexts keep making progress.
//!
//! Fetching mail itself is out of scope (§1 Non-goals); this binary takes
//! already-fetched message bodies as file paths on the command line, one
//! `mctx` per file, and logs the terminal decision for each.

use std::{
    collections::HashMap,
    sync::{atomic::AtomicU32, Arc, LazyLock},
};

use empath_common::{internal, outgoing, Signal};
use empath_core::{
    config,
    context::{Blocked, IncomingReply, MatchContext, OutgoingRequest, ReplyOutcome},
    deliverer::DelivererRegistry,
    mail::Mail,
    matcher::MatcherRegistry,
    rule::{Account, Ruleset},
    state_machine::{step_deliver, step_match, DeliverStep, MatchStep},
};
use empath_ipc::{
    client::{IpcClient, ReplyStream},
    protocol::{ActionRequest, MatchRequest, Outcome},
    Reply, Request,
};
use tokio::sync::broadcast;

static SHUTDOWN: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    internal!("received shutdown signal, finishing in-flight messages");
    let _ = SHUTDOWN.send(Signal::Shutdown);
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Phase {
    Matching,
    Delivering,
}

struct Job {
    ctx: MatchContext,
    phase: Phase,
    finished: bool,
}

impl Job {
    fn new(ctx: MatchContext) -> Self {
        Self {
            ctx,
            phase: Phase::Matching,
            finished: false,
        }
    }
}

/// Run every ready job one step, routing blocked ones' requests to the
/// parent and returning which job (if any) newly blocked, keyed by the
/// request id it is now waiting on.
async fn step_all(
    jobs: &mut [Job],
    ruleset: &Ruleset,
    matchers: &MatcherRegistry,
    deliverers: &DelivererRegistry,
    ipc: &IpcClient,
    blocked_ids: &mut HashMap<u32, usize>,
) -> anyhow::Result<bool> {
    let mut progressed = false;

    for (idx, job) in jobs.iter_mut().enumerate() {
        if job.finished || job.ctx.is_blocked() {
            continue;
        }
        progressed = true;
        step_one(idx, job, ruleset, matchers, deliverers, ipc, blocked_ids, None).await?;
    }

    Ok(progressed)
}

#[allow(clippy::too_many_arguments)]
async fn step_one(
    idx: usize,
    job: &mut Job,
    ruleset: &Ruleset,
    matchers: &MatcherRegistry,
    deliverers: &DelivererRegistry,
    ipc: &IpcClient,
    blocked_ids: &mut HashMap<u32, usize>,
    reply: Option<IncomingReply>,
) -> anyhow::Result<()> {
    match job.phase {
        Phase::Matching => match step_match(&mut job.ctx, ruleset, matchers, reply) {
            MatchStep::Continue => {}
            MatchStep::Deliver => job.phase = Phase::Delivering,
            MatchStep::Blocked => send_pending(job, ipc, idx, blocked_ids).await?,
            MatchStep::Done => {
                if job.ctx.account().keep {
                    job.ctx.mail_mut().set_decision(empath_core::mail::Decision::Keep);
                }
                job.finished = true;
                internal!("message {} decided: {:?}", idx, job.ctx.mail().decision());
            }
            MatchStep::Error(e) => {
                job.finished = true;
                internal!("message {} aborted during match: {}", idx, e);
            }
        },
        Phase::Delivering => match step_deliver(&mut job.ctx, ruleset, deliverers, reply) {
            DeliverStep::Continue => {}
            DeliverStep::Match => job.phase = Phase::Matching,
            DeliverStep::Blocked => send_pending(job, ipc, idx, blocked_ids).await?,
            DeliverStep::Error(e) => {
                job.finished = true;
                internal!("message {} aborted during delivery: {}", idx, e);
            }
        },
    }

    Ok(())
}

async fn send_pending(
    job: &mut Job,
    ipc: &IpcClient,
    idx: usize,
    blocked_ids: &mut HashMap<u32, usize>,
) -> anyhow::Result<()> {
    let Some(pending) = job.ctx.take_pending_request() else {
        anyhow::bail!("context reported BLOCKED but issued no request");
    };
    let request = build_wire_request(&pending, job.ctx.mail())?;
    outgoing!("sending request {} for message {}", pending.id, idx);
    // A send failure is an ordinary, recoverable transport error (a timeout
    // or I/O hiccup) unless it's flagged fatal (a protocol-level violation
    // on the shared connection): the former abandons only this message
    // (§5 "Cancellation and timeouts"), the latter must tear the process
    // down since every other context shares the same connection.
    match ipc.send(&request).await {
        Ok(()) => {
            blocked_ids.insert(pending.id, idx);
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            job.finished = true;
            internal!("message {} aborted: failed to send request {}: {}", idx, pending.id, e);
            Ok(())
        }
    }
}

fn build_wire_request(blocked: &Blocked, mail: &Mail) -> anyhow::Result<Request> {
    let tags = mail.tags().encode()?;
    let mail_bytes = mail.body().as_bytes().to_vec();

    let request = match &blocked.request {
        OutgoingRequest::Match { matcher, config } => Request::matcher(
            blocked.id,
            tags,
            MatchRequest {
                matcher: matcher.clone(),
                config: config.clone().into_bytes(),
            },
        ),
        OutgoingRequest::Action {
            account,
            action,
            uid,
            expects_body,
        } => Request::action(
            blocked.id,
            tags,
            ActionRequest {
                account: account.clone(),
                action: action.clone(),
                uid: *uid,
                expects_body: *expects_body,
            },
        ),
    };

    Ok(request.with_mail(mail_bytes))
}

fn decode_incoming(reply: Reply) -> anyhow::Result<IncomingReply> {
    let tags = empath_core::tags::TagStore::decode(&reply.tags).unwrap_or_default();
    let outcome = match reply.outcome {
        Outcome::MatchTrue => ReplyOutcome::MatchTrue,
        Outcome::MatchFalse => ReplyOutcome::MatchFalse,
        Outcome::ActionDone => ReplyOutcome::ActionDone,
        Outcome::Error(reason) => ReplyOutcome::Error(reason),
    };
    let body = reply.body.map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    Ok(IncomingReply {
        id: reply.id,
        outcome,
        tags,
        body,
    })
}

async fn run(
    ruleset: Ruleset,
    matchers: MatcherRegistry,
    deliverers: DelivererRegistry,
    ipc: IpcClient,
    mut replies: ReplyStream,
    mut jobs: Vec<Job>,
) -> anyhow::Result<()> {
    let mut blocked_ids: HashMap<u32, usize> = HashMap::new();

    loop {
        if jobs.iter().all(|job| job.finished) {
            break;
        }

        let progressed = step_all(&mut jobs, &ruleset, &matchers, &deliverers, &ipc, &mut blocked_ids).await?;
        if progressed {
            continue;
        }

        if blocked_ids.is_empty() {
            // Nothing progressed and nothing is in flight: every remaining
            // job is either finished or stuck in a way this loop can't fix.
            break;
        }

        let reply = replies.recv().await?;
        let Some(idx) = blocked_ids.remove(&reply.id) else {
            internal!("dropping reply {} for an id nobody is waiting on", reply.id);
            continue;
        };
        let incoming = decode_incoming(reply)?;
        step_one(idx, &mut jobs[idx], &ruleset, &matchers, &deliverers, &ipc, &mut blocked_ids, Some(incoming)).await?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    empath_common::logging::init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| "/etc/empath/empath.toml".to_string());
    let socket_path = args
        .next()
        .unwrap_or_else(|| empath_ipc::DEFAULT_CONTROL_SOCKET.to_string());
    let mail_paths: Vec<String> = args.collect();

    let ruleset = config::load_file(&config_path)?;
    let matchers = MatcherRegistry::with_builtins();
    let deliverers = DelivererRegistry::with_builtins();

    let (ipc, replies) = IpcClient::connect(&socket_path).await?;

    let id_source = Arc::new(AtomicU32::new(1));
    let account_name = ruleset
        .accounts
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "default".to_string());

    let mut jobs = Vec::with_capacity(mail_paths.len());
    for path in &mail_paths {
        let body = std::fs::read_to_string(path)?;
        let ctx = MatchContext::with_id_source(Mail::new(body), Account::new(&account_name), Arc::clone(&id_source));
        jobs.push(Job::new(ctx));
    }

    tokio::select! {
        result = run(ruleset, matchers, deliverers, ipc, replies, jobs) => result?,
        () = wait_for_shutdown_signal() => {}
    }

    internal!("child shut down");
    Ok(())
}
