//! The boundary between the relay and whatever carries its bytes.
//!
//! A transport hands the relay [`Channel`] handles: duplex byte streams that
//! can report how many inbound bytes are buffered without blocking. Listeners
//! report each newly established channel through an [`AcceptHandler`].
//!
//! Implementations must tolerate `read` and `write` being called on the same
//! handle concurrently from different tasks: the fan-in and fan-out loops
//! share every handle.

use std::{future::Future, io, sync::Arc};

use thiserror::Error;

/// A duplex byte stream produced by a transport.
pub trait Channel: Send + Sync + 'static {
    /// Number of inbound bytes that a `read` can return right now.
    fn pending_bytes(&self) -> usize;

    /// Reads up to `buf.len()` buffered bytes. Returns
    /// [`ChannelError::Closed`] once the peer is gone and nothing is left.
    fn read(&self, buf: &mut [u8]) -> impl Future<Output = Result<usize, ChannelError>> + Send;

    /// Writes `buf`, returning how many bytes the transport accepted.
    fn write(&self, buf: &[u8]) -> impl Future<Output = Result<usize, ChannelError>> + Send;

    /// True once the channel can never produce more data.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Receives every channel a listener establishes.
pub trait AcceptHandler<C: Channel>: Send + Sync + 'static {
    /// Returning an error rejects the channel; the listener closes it.
    fn on_accept(&self, channel: Arc<C>) -> impl Future<Output = Result<(), AcceptError>> + Send;
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel reached end of stream")]
    Closed,
    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Maps an I/O error, treating peer disconnects as a clean close.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => ChannelError::Closed,
            _ => ChannelError::Io(err),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    #[error("registry is full ({capacity} channels)")]
    RegistryFull { capacity: usize },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("circuit handshake failed: {0}")]
    Handshake(String),
    #[error("gate rejected the circuit: {status}")]
    Rejected { status: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}
