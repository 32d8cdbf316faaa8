//! In-process channel for driving the relay without sockets.
//!
//! Bytes pushed with [`MemoryChannel::feed`] become pending inbound data and
//! every successful write is recorded. Faults can be injected to exercise the
//! relay's error policy.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;

use crate::transport::{Channel, ChannelError};

/// Shared log of writes across several channels, in the order they happened.
#[derive(Debug, Clone, Default)]
pub struct WriteJournal {
    entries: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl WriteJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels of the channels written to, oldest first.
    pub fn labels(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.entries.lock().clone()
    }

    fn record(&self, label: &str, data: &[u8]) {
        self.entries.lock().push((label.to_string(), data.to_vec()));
    }
}

#[derive(Debug, Default)]
struct Faults {
    write_limit: Option<usize>,
    read_limit: Option<usize>,
    error: Option<io::ErrorKind>,
}

#[derive(Debug)]
pub struct MemoryChannel {
    label: String,
    inbound: Mutex<BytesMut>,
    written: Mutex<Vec<Vec<u8>>>,
    read_sizes: Mutex<Vec<usize>>,
    closed: AtomicBool,
    faults: Mutex<Faults>,
    journal: Option<WriteJournal>,
}

impl MemoryChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            inbound: Mutex::new(BytesMut::new()),
            written: Mutex::new(Vec::new()),
            read_sizes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            faults: Mutex::new(Faults::default()),
            journal: None,
        }
    }

    pub fn with_journal(label: impl Into<String>, journal: WriteJournal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new(label)
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queues bytes as if the peer had sent them.
    pub fn feed(&self, data: &[u8]) {
        self.inbound.lock().extend_from_slice(data);
    }

    /// Every write accepted so far, one entry per call.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    /// Buffer sizes of every `read` call so far.
    pub fn read_sizes(&self) -> Vec<usize> {
        self.read_sizes.lock().clone()
    }

    /// Simulates the peer going away. Buffered inbound bytes stay readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Caps how many bytes each write reports as accepted.
    pub fn limit_writes(&self, max: usize) {
        self.faults.lock().write_limit = Some(max);
    }

    /// Caps how many bytes each read returns.
    pub fn limit_reads(&self, max: usize) {
        self.faults.lock().read_limit = Some(max);
    }

    /// Makes every subsequent read and write fail with `kind`.
    pub fn fail_with(&self, kind: io::ErrorKind) {
        self.faults.lock().error = Some(kind);
    }

    fn injected_error(&self) -> Option<ChannelError> {
        self.faults
            .lock()
            .error
            .map(|kind| ChannelError::Io(io::Error::new(kind, "injected failure")))
    }
}

impl Channel for MemoryChannel {
    fn pending_bytes(&self) -> usize {
        self.inbound.lock().len()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        self.read_sizes.lock().push(buf.len());
        if let Some(err) = self.injected_error() {
            return Err(err);
        }

        let limit = self.faults.lock().read_limit.unwrap_or(usize::MAX);
        let mut inbound = self.inbound.lock();
        if inbound.is_empty() && self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let n = buf.len().min(inbound.len()).min(limit);
        inbound.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ChannelError> {
        if let Some(err) = self.injected_error() {
            return Err(err);
        }
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let limit = self.faults.lock().write_limit.unwrap_or(usize::MAX);
        let accepted = &buf[..buf.len().min(limit)];
        self.written.lock().push(accepted.to_vec());
        if let Some(journal) = &self.journal {
            journal.record(&self.label, accepted);
        }
        Ok(accepted.len())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
