//! TCP transport gated by a WebSocket upgrade.
//!
//! A client connects and asks for the gate path with a WebSocket upgrade
//! request; the listener answers `101 Switching Protocols` only for that path
//! and `404 Not Found` for anything else. That exchange is the circuit
//! initialization; afterwards each write travels as one binary message.
//!
//! Each established channel runs a pump task that moves inbound messages into
//! an in-memory buffer, which is what lets [`Channel::pending_bytes`] answer
//! without blocking.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::{Buf, BytesMut};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async, client_async,
    tungstenite::{
        self, Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};
use tracing::{debug, info, warn};

use crate::{
    endpoint::Endpoint,
    transport::{AcceptHandler, Channel, ChannelError, TransportError},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type GateStream = WebSocketStream<TcpStream>;

pub struct GateListener {
    listener: TcpListener,
    path: String,
}

impl GateListener {
    /// Binds the gate at `path` on `addr`. Use port 0 for an ephemeral port.
    pub async fn bind(path: impl Into<String>, addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            path: path.into(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts the accept loop. Every connection that completes the handshake
    /// is handed to `handler`; dropping the returned handle does not stop
    /// the loop, aborting it does.
    pub fn spawn<H>(self, handler: H) -> JoinHandle<()>
    where
        H: AcceptHandler<GateChannel>,
    {
        tokio::spawn(self.serve(Arc::new(handler)))
    }

    async fn serve<H>(self, handler: Arc<H>)
    where
        H: AcceptHandler<GateChannel>,
    {
        let GateListener { listener, path } = self;
        let path: Arc<str> = path.into();

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    spawn_circuit_setup(stream, peer, Arc::clone(&path), Arc::clone(&handler))
                }
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            }
        }
    }
}

fn spawn_circuit_setup<H>(stream: TcpStream, peer: SocketAddr, path: Arc<str>, handler: Arc<H>)
where
    H: AcceptHandler<GateChannel>,
{
    tokio::spawn(async move {
        let channel = match timeout(HANDSHAKE_TIMEOUT, accept_circuit(stream, peer, &path)).await {
            Ok(Ok(channel)) => Arc::new(channel),
            Ok(Err(err)) => {
                warn!(%peer, error = %err, "circuit setup failed");
                return;
            }
            Err(_) => {
                warn!(%peer, "circuit setup timed out");
                return;
            }
        };

        info!(%peer, "[+] incoming client");
        if let Err(err) = handler.on_accept(channel).await {
            warn!(%peer, error = %err, "incoming client rejected");
        }
    });
}

async fn accept_circuit(
    stream: TcpStream,
    peer: SocketAddr,
    path: &str,
) -> Result<GateChannel, TransportError> {
    let check_gate = |request: &Request, response: Response| {
        let requested = request.uri().path();
        if requested == path {
            return Ok(response);
        }
        let mut rejection = ErrorResponse::new(Some(format!("no gate at '{requested}'")));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    };

    let socket = accept_hdr_async(stream, check_gate)
        .await
        .map_err(handshake_error)?;
    Ok(GateChannel::start(socket, peer))
}

/// Connects to the gate described by `url`. The returned circuit must be
/// initialized before it can carry data.
pub async fn build_channel(url: &str) -> Result<PendingCircuit, TransportError> {
    let endpoint = Endpoint::parse(url)?;
    let addr = endpoint.authority();
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| TransportError::Connect { addr, source })?;
    debug!(url, "gate connection established");
    Ok(PendingCircuit { stream, endpoint })
}

/// A connected socket that has not yet completed the gate handshake.
pub struct PendingCircuit {
    stream: TcpStream,
    endpoint: Endpoint,
}

impl PendingCircuit {
    pub async fn initialize_circuit(self) -> Result<GateChannel, TransportError> {
        let PendingCircuit { stream, endpoint } = self;
        let peer = stream.peer_addr()?;
        let request = format!("ws://{}{}", endpoint.authority(), endpoint.path());

        let (socket, response) = timeout(HANDSHAKE_TIMEOUT, client_async(request, stream))
            .await
            .map_err(|_| TransportError::Handshake("timed out waiting for the gate".to_string()))?
            .map_err(handshake_error)?;
        debug!(%peer, status = %response.status(), "circuit initialized");

        Ok(GateChannel::start(socket, peer))
    }
}

fn handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => TransportError::Rejected {
            status: response.status().to_string(),
        },
        tungstenite::Error::Io(err) => TransportError::Io(err),
        other => TransportError::Handshake(other.to_string()),
    }
}

fn channel_error(err: tungstenite::Error) -> ChannelError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ChannelError::Closed
        }
        tungstenite::Error::Io(err) => ChannelError::from_io(err),
        other => ChannelError::Io(io::Error::other(other)),
    }
}

#[derive(Default)]
struct InboundBuffer {
    data: parking_lot::Mutex<BytesMut>,
    closed: AtomicBool,
}

/// An established gate circuit.
pub struct GateChannel {
    inbound: Arc<InboundBuffer>,
    sink: Mutex<SplitSink<GateStream, Message>>,
    pump: JoinHandle<()>,
    peer: SocketAddr,
}

impl GateChannel {
    fn start(socket: GateStream, peer: SocketAddr) -> Self {
        let (sink, stream) = socket.split();
        let inbound = Arc::new(InboundBuffer::default());
        let pump = tokio::spawn(pump(stream, Arc::clone(&inbound), peer));
        Self {
            inbound,
            sink: Mutex::new(sink),
            pump,
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for GateChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(mut stream: SplitStream<GateStream>, inbound: Arc<InboundBuffer>, peer: SocketAddr) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => inbound.data.lock().extend_from_slice(&data),
            Ok(Message::Text(text)) => inbound.data.lock().extend_from_slice(text.as_bytes()),
            Ok(Message::Close(frame)) => {
                debug!(%peer, ?frame, "peer closed the circuit");
                break;
            }
            // Pings are answered by the websocket layer itself.
            Ok(_) => {}
            Err(err) => {
                debug!(%peer, error = %err, "circuit read failed");
                break;
            }
        }
    }
    inbound.closed.store(true, Ordering::Release);
}

impl Channel for GateChannel {
    fn pending_bytes(&self) -> usize {
        self.inbound.data.lock().len()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        // Check `closed` before looking at the buffer so bytes pushed right
        // before the pump exits are never mistaken for end of stream.
        let closed = self.is_closed();
        let mut data = self.inbound.data.lock();
        if data.is_empty() {
            return if closed { Err(ChannelError::Closed) } else { Ok(0) };
        }
        let n = buf.len().min(data.len());
        data.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ChannelError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(buf.to_vec()))
            .await
            .map_err(channel_error)?;
        Ok(buf.len())
    }

    fn is_closed(&self) -> bool {
        self.inbound.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{endpoint::DEFAULT_GATE, transport::AcceptError};

    struct Collect(tokio::sync::mpsc::UnboundedSender<Arc<GateChannel>>);

    impl AcceptHandler<GateChannel> for Collect {
        async fn on_accept(&self, channel: Arc<GateChannel>) -> Result<(), AcceptError> {
            let _ = self.0.send(channel);
            Ok(())
        }
    }

    async fn listen() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Arc<GateChannel>>) {
        let listener = GateListener::bind(DEFAULT_GATE, "127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        listener.spawn(Collect(tx));
        (addr, rx)
    }

    async fn wait_for_pending(channel: &GateChannel, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while channel.pending_bytes() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bytes should arrive");
    }

    #[tokio::test]
    async fn circuit_carries_bytes_both_ways() {
        let (addr, mut accepted) = listen().await;
        let url = Endpoint::new("127.0.0.1", addr.port(), DEFAULT_GATE).url();

        let client = build_channel(&url)
            .await
            .expect("build channel")
            .initialize_circuit()
            .await
            .expect("initialize circuit");
        let server = timeout(Duration::from_secs(2), accepted.recv())
            .await
            .expect("accept in time")
            .expect("accepted channel");

        assert_eq!(client.write(b"hello").await.expect("write"), 5);
        wait_for_pending(&server, 5).await;
        let mut buf = vec![0u8; server.pending_bytes()];
        assert_eq!(server.read(&mut buf).await.expect("read"), 5);
        assert_eq!(buf, b"hello");

        server.write(b"world").await.expect("write");
        wait_for_pending(&client, 5).await;
        let mut buf = [0u8; 5];
        client.read(&mut buf).await.expect("read");
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn wrong_gate_path_is_rejected() {
        let (addr, _accepted) = listen().await;
        let url = Endpoint::new("127.0.0.1", addr.port(), "/elsewhere").url();

        let result = build_channel(&url)
            .await
            .expect("build channel")
            .initialize_circuit()
            .await;

        match result {
            Err(TransportError::Rejected { status }) => {
                assert!(status.starts_with("404"), "{status}")
            }
            Err(other) => panic!("expected a rejection, got {other}"),
            Ok(_) => panic!("expected a rejection, got a channel"),
        }
    }

    #[tokio::test]
    async fn plain_http_request_never_becomes_a_channel() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (addr, mut accepted) = listen().await;
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /gate.php HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .expect("send request");

        let mut response = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
            .await
            .expect("gate should hang up")
            .expect("read response");

        assert!(!response.starts_with(b"HTTP/1.1 101"));
        assert!(accepted.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_peer_reads_as_closed() {
        let (addr, mut accepted) = listen().await;
        let url = Endpoint::new("127.0.0.1", addr.port(), DEFAULT_GATE).url();

        let client = build_channel(&url)
            .await
            .expect("build channel")
            .initialize_circuit()
            .await
            .expect("initialize circuit");
        let server = accepted.recv().await.expect("accepted channel");

        drop(client);
        timeout(Duration::from_secs(2), async {
            while !server.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("close should be observed");

        let mut buf = [0u8; 1];
        assert!(matches!(server.read(&mut buf).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn connecting_to_nothing_fails_to_build() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let url = Endpoint::new("127.0.0.1", port, DEFAULT_GATE).url();
        let result = build_channel(&url).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
