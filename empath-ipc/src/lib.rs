//! Privilege-separated IPC between the empath child and parent processes.
//!
//! The unprivileged child sends `Request::Action` (run a deliverer as a uid)
//! and `Request::Match` (run a matcher that must see privileged state)
//! messages; the parent always answers with a `Reply` carrying the
//! (possibly mutated) tag buffer and an [`Outcome`].
//!
//! Wire format: a 4-byte big-endian length prefix followed by a
//! `bincode`-encoded envelope, one per request/reply.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use error::{IpcError, Result};
pub use protocol::{ActionRequest, MatchRequest, Outcome, Reply, Request, PROTOCOL_VERSION};
pub use server::{IpcServer, RequestHandler};

/// Default path for the parent's control socket.
pub const DEFAULT_CONTROL_SOCKET: &str = "/var/run/empath/control.sock";
