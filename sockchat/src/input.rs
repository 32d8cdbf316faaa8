use std::{future::Future, io, ops::RangeInclusive, time::Duration};

use rand::{Rng, SeedableRng, distributions::Alphanumeric, rngs::StdRng};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};

/// Where locally-originated lines come from.
///
/// `poll` yields `None` when no line is ready; callers retry. Once the
/// source can never produce another line, `is_exhausted` turns true and
/// `poll` keeps returning `None` immediately.
pub trait LineSource: Send + 'static {
    fn poll(&mut self) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;

    fn is_exhausted(&self) -> bool;
}

/// Newline-delimited lines from an async reader, usually stdin.
pub struct StdinLines<R> {
    reader: R,
    buffer: Vec<u8>,
    exhausted: bool,
}

impl StdinLines<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> StdinLines<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            exhausted: false,
        }
    }
}

impl<R> LineSource for StdinLines<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn poll(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.exhausted {
            return Ok(None);
        }

        self.buffer.clear();
        let read = self.reader.read_until(b'\n', &mut self.buffer).await?;
        if read == 0 {
            self.exhausted = true;
            return Ok(None);
        }

        let line = trim_line_ending(&self.buffer);
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(line.to_vec()))
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

pub const CHATTER_DELAY_SECS: RangeInclusive<u64> = 1..=10;
const CHATTER_LENGTH: RangeInclusive<usize> = 10..=50;

/// Generates random traffic instead of reading the terminal, which is handy
/// for soak-testing a link between two unattended nodes.
pub struct Chatter {
    label: String,
    delay_secs: RangeInclusive<u64>,
    rng: StdRng,
}

impl Chatter {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_rng(label, CHATTER_DELAY_SECS, StdRng::from_entropy())
    }

    pub fn with_rng(
        label: impl Into<String>,
        delay_secs: RangeInclusive<u64>,
        rng: StdRng,
    ) -> Self {
        Self {
            label: label.into(),
            delay_secs,
            rng,
        }
    }

    fn next_message(&mut self) -> String {
        let length = self.rng.gen_range(CHATTER_LENGTH);
        let noise: String = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect();
        format!("{} sends: {noise}", self.label)
    }
}

impl LineSource for Chatter {
    async fn poll(&mut self) -> io::Result<Option<Vec<u8>>> {
        let delay = self.rng.gen_range(self.delay_secs.clone());
        if delay > 0 {
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        Ok(Some(self.next_message().into_bytes()))
    }

    fn is_exhausted(&self) -> bool {
        false
    }
}
