//! Child-side stub for the privilege-separated IPC connection.
//!
//! The connection is a single duplex stream shared by every in-flight
//! `mctx`/`dctx` in the child: [`IpcClient::send`] pushes one request and
//! returns as soon as it is written (it does not wait for the matching
//! reply — replies may arrive interleaved and out of order with respect to
//! other contexts' requests); [`ReplyStream::recv`] is polled by the
//! scheduler loop, which matches each reply's `id` to the context that is
//! blocked on it and resumes it.

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::UnixStream,
    sync::Mutex,
};
use tracing::trace;

use crate::{error::IpcError, protocol::PROTOCOL_VERSION, Reply, Request, Result};

/// Reject replies above this size outright rather than allocating for them;
/// a legitimate reply never approaches this (tag buffers and write-back
/// bodies are message-sized, not unbounded).
const MAX_REPLY_SIZE: u32 = 64_000_000;

/// Sending half of the child's connection to the parent.
pub struct IpcClient {
    write: Mutex<WriteHalf<UnixStream>>,
    send_timeout: Duration,
}

/// Receiving half, owned by the scheduler loop.
pub struct ReplyStream {
    read: ReadHalf<UnixStream>,
}

/// Split a connected stream into the two halves the scheduler wires up
/// separately (send side shared across contexts, receive side polled once).
#[must_use]
pub fn split(stream: UnixStream) -> (IpcClient, ReplyStream) {
    let (read, write) = tokio::io::split(stream);
    (
        IpcClient {
            write: Mutex::new(write),
            send_timeout: Duration::from_secs(10),
        },
        ReplyStream { read },
    )
}

impl IpcClient {
    /// Connect to the parent's control socket and split into send/receive halves.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(socket_path: &str) -> Result<(Self, ReplyStream)> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(split(stream))
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Send one request. Does not wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write times out or fails.
    pub async fn send(&self, request: &Request) -> Result<()> {
        tokio::time::timeout(self.send_timeout, self.send_inner(request))
            .await
            .map_err(|_| IpcError::Timeout)?
    }

    async fn send_inner(&self, request: &Request) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(request, bincode::config::legacy())?;
        let len = u32::try_from(bytes.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut write = self.write.lock().await;
        write.write_all(&len.to_be_bytes()).await?;
        write.write_all(&bytes).await?;
        write.flush().await?;

        trace!(id = request.id, bytes = len, "sent request to parent");
        Ok(())
    }
}

impl ReplyStream {
    /// Receive the next reply from the parent, in whatever order it arrives.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::ConnectionClosed`] on a clean EOF, or a protocol
    /// violation error if the payload is malformed or the version mismatches.
    pub async fn recv(&mut self) -> Result<Reply> {
        let mut len_buf = [0u8; 4];
        self.read.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IpcError::ConnectionClosed
            } else {
                IpcError::Io(e)
            }
        })?;

        let len = u32::from_be_bytes(len_buf);
        if len > MAX_REPLY_SIZE {
            return Err(IpcError::Decode(bincode::error::DecodeError::Other(
                "reply exceeds maximum size",
            )));
        }

        let mut buf = vec![0u8; len as usize];
        self.read.read_exact(&mut buf).await?;

        let (reply, _): (Reply, _) =
            bincode::serde::decode_from_slice(&buf, bincode::config::legacy())?;

        if !reply.is_version_compatible() {
            return Err(IpcError::VersionMismatch {
                peer: reply.version,
                ours: PROTOCOL_VERSION,
            });
        }
        if reply.tags.is_empty() && !reply.is_error() {
            return Err(IpcError::MissingTagBuffer);
        }

        trace!(id = reply.id, "received reply from parent");
        Ok(reply)
    }
}
