//! Parent-side IPC server: accepts the child's connection and serves
//! [`Request`]s with [`Reply`]s.
//!
//! Unlike a typical request/response RPC server, a single connection stays
//! open for the life of the child and may have many requests in flight
//! concurrently (one per blocked `mctx`/`dctx`); each request is handled on
//! its own task so a slow deliverer cannot head-of-line block the others,
//! and replies are written back as they complete, tagged with the
//! originating request's id.

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::{broadcast, Mutex},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::IpcError,
    protocol::{Outcome, Reply, Request, PROTOCOL_VERSION},
    Result,
};

/// Reject requests above this size before allocating a read buffer.
const MAX_REQUEST_SIZE: u32 = 64_000_000;

/// Implemented by the privileged action executor (`empath-parent`) to turn
/// a decoded [`Request`] into a [`Reply`]. Never returns a Rust `Err` for
/// an ordinary evaluation failure — those are `Outcome::Error` replies;
/// an `Err` here aborts the connection as a protocol-level failure.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Reply;
}

/// Listens on a Unix socket and dispatches requests to a [`RequestHandler`].
pub struct IpcServer {
    socket_path: String,
    handler: Arc<dyn RequestHandler>,
}

impl IpcServer {
    #[must_use]
    pub fn new(socket_path: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    /// Serve until `shutdown` fires, then drain in-flight connections and
    /// remove the socket file.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is already in use by a live instance
    /// or cannot be bound.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<empath_common::Signal>) -> Result<()> {
        let socket_path = Path::new(&self.socket_path);
        if socket_path.exists() {
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(IpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("socket already in use by a running instance: {}", self.socket_path),
                )));
            }
            info!("removing stale socket file: {}", self.socket_path);
            tokio::fs::remove_file(socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            let metadata = tokio::fs::metadata(&self.socket_path).await?;
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(&self.socket_path, perms).await?;
            info!("control socket created with mode 0600: {}", self.socket_path);
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    error!("error serving child connection: {e}");
                                }
                            });
                        }
                        Err(e) => error!("error accepting child connection: {e}"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(empath_common::Signal::Shutdown | empath_common::Signal::Finalised) => {
                            info!("IPC server shutting down");
                            break;
                        }
                        Err(e) => {
                            error!("IPC server shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        if socket_path.exists() {
            debug!("removing socket file: {}", self.socket_path);
            let _ = tokio::fs::remove_file(socket_path).await;
        }

        Ok(())
    }

    async fn handle_connection(stream: UnixStream, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let (mut read, write) = tokio::io::split(stream);
        let write = Arc::new(Mutex::new(write));

        loop {
            let request = match Self::read_request(&mut read).await {
                Ok(request) => request,
                Err(IpcError::ConnectionClosed) => break,
                Err(e) => return Err(e),
            };

            if !request.is_version_compatible() {
                warn!(
                    "child sent incompatible protocol version {} (ours {})",
                    request.version, PROTOCOL_VERSION
                );
                return Err(IpcError::VersionMismatch {
                    peer: request.version,
                    ours: PROTOCOL_VERSION,
                });
            }

            let handler = Arc::clone(&handler);
            let write = Arc::clone(&write);
            tokio::spawn(async move {
                let id = request.id;
                let tags = request.tags.clone();
                // A deliverer panic or failed privilege transition must not
                // take the whole parent down with it (§4.4): catch it here
                // and report it through the ordinary protocol instead of
                // letting the task die with no reply ever written back.
                let reply = match std::panic::AssertUnwindSafe(handler.handle(request))
                    .catch_unwind()
                    .await
                {
                    Ok(reply) => reply,
                    Err(panic) => {
                        let message = panic_message(&panic);
                        error!("handler panicked on request {id}: {message}");
                        error_reply(id, tags, format!("handler panicked: {message}"))
                    }
                };
                if let Err(e) = Self::write_reply(&write, &reply).await {
                    error!("failed to write reply {}: {e}", reply.id);
                }
            });
        }

        Ok(())
    }

    async fn read_request(
        stream: &mut tokio::io::ReadHalf<UnixStream>,
    ) -> Result<Request> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IpcError::ConnectionClosed
            } else {
                IpcError::Io(e)
            }
        })?;

        let len = u32::from_be_bytes(len_buf);
        if len > MAX_REQUEST_SIZE {
            return Err(IpcError::Decode(bincode::error::DecodeError::Other(
                "request exceeds maximum size",
            )));
        }

        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await?;

        let (request, _): (Request, _) =
            bincode::serde::decode_from_slice(&buf, bincode::config::legacy())?;

        trace!(id = request.id, "received request from child");
        Ok(request)
    }

    async fn write_reply(
        write: &Arc<Mutex<tokio::io::WriteHalf<UnixStream>>>,
        reply: &Reply,
    ) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(reply, bincode::config::legacy())?;
        let len = u32::try_from(bytes.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut write = write.lock().await;
        write.write_all(&len.to_be_bytes()).await?;
        write.write_all(&bytes).await?;
        write.flush().await?;

        trace!(id = reply.id, "sent reply to child");
        Ok(())
    }
}

/// Builds an `Outcome::Error` reply, e.g. when a handler catches a
/// deliverer panic or a failed privilege transition — the parent stays up
/// and reports the failure through the ordinary protocol instead (§4.4).
#[must_use]
pub fn error_reply(id: u32, tags: Vec<u8>, message: impl Into<String>) -> Reply {
    Reply::new(id, Outcome::Error(message.into()), tags)
}

/// Best-effort extraction of a panic payload's message, for the error
/// reply's text; panics usually carry a `&str` or `String` payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
