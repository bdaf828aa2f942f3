//! The unprivileged decision core: everything needed to decide what happens
//! to one message, without ever needing to act on that decision directly.
//!
//! This crate owns the rule tree, the tag store, the expression evaluator,
//! the delivery-queue builder and the per-message match/deliver state
//! machine. It knows nothing about sockets, processes or uids beyond the
//! numbers it is told to use — `empath-ipc` carries decisions to the
//! privileged side, and `empath-parent` is the one thing allowed to act on
//! them.

pub mod config;
pub mod context;
pub mod deliverer;
pub mod error;
pub mod mail;
pub mod matcher;
pub mod queue;
pub mod rule;
pub mod state_machine;
pub mod subst;
pub mod tags;

pub use context::{DeliveryContext, MatchContext};
pub use deliverer::{DeliveryKind, Deliverer};
pub use error::{CoreError, Result};
pub use mail::Mail;
pub use matcher::{MatchOutcome, Matcher};
pub use rule::{Account, Action, ExpressionItem, Rule};
pub use state_machine::{DeliverStep, MatchStep};
pub use tags::TagStore;
