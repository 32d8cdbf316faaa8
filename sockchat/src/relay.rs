use std::{future::Future, io, sync::Arc, time::Duration};

use anyhow::Result;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    input::LineSource,
    registry::{ChannelId, Registry, Visit},
    transport::{Channel, ChannelError},
};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("short write on channel {channel}: wrote {written} of {expected} bytes")]
    ShortWrite {
        channel: ChannelId,
        expected: usize,
        written: usize,
    },
    #[error("short read on channel {channel}: read {read} of {expected} pending bytes")]
    ShortRead {
        channel: ChannelId,
        expected: usize,
        read: usize,
    },
    #[error("channel {channel} failed")]
    Channel {
        channel: ChannelId,
        #[source]
        source: ChannelError,
    },
    #[error("failed to read local input")]
    Input(#[source] io::Error),
    #[error("failed to write local output")]
    Output(#[source] io::Error),
    #[error("relay task ended abnormally")]
    Task(#[from] tokio::task::JoinError),
}

/// Bytes drained from one channel during a fan-in sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub channel: ChannelId,
    pub data: Vec<u8>,
}

/// Writes `line` to every registered channel with one write call each.
///
/// Channels that report end of stream are dropped from the registry. Returns
/// how many channels received the line.
pub async fn broadcast<C: Channel>(
    registry: &Registry<C>,
    line: &[u8],
) -> Result<usize, RelayError> {
    let outcome = registry
        .visit(|id, channel| async move {
            match channel.write(line).await {
                Ok(written) if written == line.len() => Ok(Visit::Keep),
                Ok(written) => Err(RelayError::ShortWrite {
                    channel: id,
                    expected: line.len(),
                    written,
                }),
                Err(ChannelError::Closed) => {
                    info!(channel = id, "channel closed during write");
                    Ok(Visit::Drop)
                }
                Err(source) => Err(RelayError::Channel { channel: id, source }),
            }
        })
        .await?;

    Ok(outcome.visited - outcome.dropped.len())
}

/// One fan-in sweep: reads exactly the pending bytes of every channel that
/// has some, dropping channels that have closed.
pub async fn drain<C: Channel>(registry: &Registry<C>) -> Result<Vec<Inbound>, RelayError> {
    let inbound = Mutex::new(Vec::new());
    let collected = &inbound;

    registry
        .visit(|id, channel| {
            // Sample `closed` first: a transport may buffer its last bytes and
            // close in between, and those bytes must still be read.
            let closed = channel.is_closed();
            let pending = channel.pending_bytes();
            async move {
                if pending == 0 {
                    if closed {
                        info!(channel = id, "channel closed by peer");
                        return Ok(Visit::Drop);
                    }
                    return Ok(Visit::Keep);
                }

                let mut data = vec![0u8; pending];
                match channel.read(&mut data).await {
                    Ok(read) if read == pending => {
                        collected.lock().push(Inbound { channel: id, data });
                        Ok(Visit::Keep)
                    }
                    Ok(read) => Err(RelayError::ShortRead {
                        channel: id,
                        expected: pending,
                        read,
                    }),
                    Err(ChannelError::Closed) => {
                        info!(channel = id, "channel closed during read");
                        Ok(Visit::Drop)
                    }
                    Err(source) => Err(RelayError::Channel { channel: id, source }),
                }
            }
        })
        .await?;

    Ok(inbound.into_inner())
}

/// Broadcasts every line from `source` until the source is exhausted.
pub async fn fan_out<S, C>(source: &mut S, registry: &Registry<C>) -> Result<(), RelayError>
where
    S: LineSource,
    C: Channel,
{
    loop {
        match source.poll().await.map_err(RelayError::Input)? {
            Some(line) => {
                let delivered = broadcast(registry, &line).await?;
                debug!(bytes = line.len(), delivered, "line broadcast");
            }
            None if source.is_exhausted() => return Ok(()),
            None => continue,
        }
    }
}

/// Fan-in pacing and termination.
#[derive(Debug, Clone, Copy)]
pub struct FanInSettings {
    pub poll_interval: Duration,
    /// Return once a sweep leaves the registry empty.
    pub stop_when_empty: bool,
}

impl Default for FanInSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_when_empty: false,
        }
    }
}

/// Polls every channel and copies whatever arrived to `output`, one chunk
/// per line.
pub async fn fan_in<C, W>(
    registry: &Registry<C>,
    output: &mut W,
    settings: FanInSettings,
) -> Result<(), RelayError>
where
    C: Channel,
    W: AsyncWrite + Unpin,
{
    loop {
        for chunk in drain(registry).await? {
            debug!(channel = chunk.channel, bytes = chunk.data.len(), "received");
            write_chunk(output, &chunk.data)
                .await
                .map_err(RelayError::Output)?;
        }

        if settings.stop_when_empty && registry.is_empty().await {
            return Ok(());
        }

        tokio::time::sleep(settings.poll_interval).await;
    }
}

async fn write_chunk<W>(output: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(data).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}

/// Runs the fan-out and fan-in loops over one shared registry.
pub struct Relay<C> {
    registry: Arc<Registry<C>>,
    settings: FanInSettings,
}

impl<C: Channel> Relay<C> {
    pub fn new(registry: Arc<Registry<C>>, settings: FanInSettings) -> Self {
        Self { registry, settings }
    }

    /// Drives both loops until `shutdown` resolves, the fan-in loop finishes,
    /// or either loop fails.
    ///
    /// Exhausting the local input only stops the fan-out side; inbound data
    /// keeps flowing.
    pub async fn run_until<S, W, F>(self, mut source: S, mut output: W, shutdown: F) -> Result<()>
    where
        S: LineSource,
        W: AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let Relay { registry, settings } = self;
        tokio::pin!(shutdown);

        let mut writer: JoinHandle<Result<(), RelayError>> = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { fan_out(&mut source, &registry).await })
        };
        let mut reader: JoinHandle<Result<(), RelayError>> = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { fan_in(&registry, &mut output, settings).await })
        };

        let mut writer_done = false;
        let result = loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break Ok(());
                }
                joined = &mut writer, if !writer_done => {
                    writer_done = true;
                    match flatten(joined) {
                        Ok(()) => info!("local input closed; still relaying inbound data"),
                        Err(err) => break Err(err),
                    }
                }
                joined = &mut reader => {
                    match flatten(joined) {
                        Ok(()) => {
                            info!("no channels left to relay");
                            break Ok(());
                        }
                        Err(err) => break Err(err),
                    }
                }
            }
        };

        writer.abort();
        reader.abort();

        if let Err(err) = &result {
            warn!(error = %err, "relay stopped on fatal error");
        }
        result.map_err(Into::into)
    }
}

fn flatten(
    joined: Result<Result<(), RelayError>, tokio::task::JoinError>,
) -> Result<(), RelayError> {
    joined?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        input::StdinLines,
        memory::{MemoryChannel, WriteJournal},
    };

    async fn registry_of(channels: &[Arc<MemoryChannel>]) -> Registry<MemoryChannel> {
        let registry = Registry::new();
        for channel in channels {
            registry
                .register(Arc::clone(channel))
                .await
                .expect("register");
        }
        registry
    }

    #[tokio::test]
    async fn broadcast_reaches_every_channel_once() {
        let a = Arc::new(MemoryChannel::new("a"));
        let b = Arc::new(MemoryChannel::new("b"));
        let registry = registry_of(&[a.clone(), b.clone()]).await;

        let delivered = broadcast(&registry, b"hello").await.expect("broadcast");

        assert_eq!(delivered, 2);
        assert_eq!(a.written(), vec![b"hello".to_vec()]);
        assert_eq!(b.written(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn broadcast_follows_registration_order() {
        let journal = WriteJournal::new();
        let channels: Vec<_> = ["1", "2", "3"]
            .into_iter()
            .map(|label| Arc::new(MemoryChannel::with_journal(label, journal.clone())))
            .collect();
        let registry = registry_of(&channels).await;

        broadcast(&registry, b"ping").await.expect("broadcast");

        assert_eq!(journal.labels(), vec!["1", "2", "3"]);
        assert!(journal.entries().iter().all(|(_, data)| data == b"ping"));
    }

    #[tokio::test]
    async fn short_write_is_fatal() {
        let channel = Arc::new(MemoryChannel::new("a"));
        channel.limit_writes(2);
        let registry = registry_of(&[channel]).await;

        let err = broadcast(&registry, b"hello").await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::ShortWrite {
                expected: 5,
                written: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn closed_channel_is_dropped_on_write() {
        let live = Arc::new(MemoryChannel::new("live"));
        let dead = Arc::new(MemoryChannel::new("dead"));
        dead.close();
        let registry = registry_of(&[dead.clone(), live.clone()]).await;

        let delivered = broadcast(&registry, b"hi").await.expect("broadcast");

        assert_eq!(delivered, 1);
        assert_eq!(registry.len().await, 1);
        assert_eq!(live.written(), vec![b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn io_error_on_write_is_fatal() {
        let channel = Arc::new(MemoryChannel::new("a"));
        channel.fail_with(io::ErrorKind::PermissionDenied);
        let registry = registry_of(&[channel]).await;

        let err = broadcast(&registry, b"hi").await.unwrap_err();
        assert!(matches!(err, RelayError::Channel { channel: 1, .. }));
    }

    #[tokio::test]
    async fn drain_reads_exactly_the_pending_bytes() {
        let channel = Arc::new(MemoryChannel::new("a"));
        channel.feed(b"world");
        let registry = registry_of(&[channel.clone()]).await;

        let inbound = drain(&registry).await.expect("drain");

        assert_eq!(
            inbound,
            vec![Inbound {
                channel: 1,
                data: b"world".to_vec()
            }]
        );
        assert_eq!(channel.read_sizes(), vec![5]);
        assert_eq!(channel.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn drain_skips_idle_channels() {
        let idle = Arc::new(MemoryChannel::new("idle"));
        let busy = Arc::new(MemoryChannel::new("busy"));
        busy.feed(b"x");
        let registry = registry_of(&[idle.clone(), busy]).await;

        let inbound = drain(&registry).await.expect("drain");

        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].channel, 2);
        assert!(idle.read_sizes().is_empty());
    }

    #[tokio::test]
    async fn short_read_is_fatal() {
        let channel = Arc::new(MemoryChannel::new("a"));
        channel.feed(b"world");
        channel.limit_reads(3);
        let registry = registry_of(&[channel]).await;

        let err = drain(&registry).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::ShortRead {
                expected: 5,
                read: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn drain_drops_closed_channels_after_their_last_bytes() {
        let channel = Arc::new(MemoryChannel::new("a"));
        channel.feed(b"last words");
        channel.close();
        let registry = registry_of(&[channel]).await;

        let first = drain(&registry).await.expect("first sweep");
        assert_eq!(first[0].data, b"last words".to_vec());
        assert_eq!(registry.len().await, 1);

        let second = drain(&registry).await.expect("second sweep");
        assert!(second.is_empty());
        assert!(registry.is_empty().await);
    }

    /// Delivers its final bytes and closes right after the first
    /// `pending_bytes` sample, the way a transport pump can.
    struct ClosesAfterSample {
        inner: MemoryChannel,
        fired: std::sync::atomic::AtomicBool,
    }

    impl Channel for ClosesAfterSample {
        fn pending_bytes(&self) -> usize {
            let pending = self.inner.pending_bytes();
            if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.inner.feed(b"last");
                self.inner.close();
            }
            pending
        }

        async fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
            self.inner.read(buf).await
        }

        async fn write(&self, buf: &[u8]) -> Result<usize, ChannelError> {
            self.inner.write(buf).await
        }

        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    #[tokio::test]
    async fn drain_keeps_a_channel_that_closes_mid_sweep_until_it_is_read() {
        let channel = Arc::new(ClosesAfterSample {
            inner: MemoryChannel::new("a"),
            fired: Default::default(),
        });
        let registry = Registry::new();
        registry.register(Arc::clone(&channel)).await.expect("register");

        let first = drain(&registry).await.expect("first sweep");
        assert!(first.is_empty());
        assert_eq!(registry.len().await, 1);

        let second = drain(&registry).await.expect("second sweep");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data, b"last".to_vec());

        drain(&registry).await.expect("third sweep");
        assert!(registry.is_empty().await);
        assert_eq!(channel.inner.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn fan_out_stops_when_input_is_exhausted() {
        let channel = Arc::new(MemoryChannel::new("a"));
        let registry = registry_of(&[channel.clone()]).await;
        let mut source = StdinLines::new(&b"one\n\ntwo\n"[..]);

        fan_out(&mut source, &registry).await.expect("fan out");

        assert_eq!(channel.written(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn fan_in_stops_when_the_last_channel_closes() {
        let channel = Arc::new(MemoryChannel::new("a"));
        channel.feed(b"bye");
        channel.close();
        let registry = registry_of(&[channel]).await;
        let mut output = Vec::new();

        fan_in(
            &registry,
            &mut output,
            FanInSettings {
                poll_interval: Duration::from_millis(1),
                stop_when_empty: true,
            },
        )
        .await
        .expect("fan in");

        assert_eq!(output, b"bye\n".to_vec());
    }

    #[tokio::test]
    async fn run_until_surfaces_fatal_errors() {
        let channel = Arc::new(MemoryChannel::new("a"));
        channel.limit_writes(1);
        let registry = Arc::new(registry_of(&[channel]).await);
        let relay = Relay::new(registry, FanInSettings::default());

        let result = relay
            .run_until(
                StdinLines::new(&b"hello\n"[..]),
                tokio::io::sink(),
                std::future::pending::<()>(),
            )
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::ShortWrite { .. })
        ));
    }
}
