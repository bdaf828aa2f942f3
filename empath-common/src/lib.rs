pub mod logging;

pub use tracing;

/// Broadcast to every long-running task when the process is asked to stop.
///
/// `Shutdown` asks tasks to stop admitting new work and begin draining;
/// `Finalised` is sent once the drain deadline has passed, for tasks that
/// need to distinguish "wind down" from "stop now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
