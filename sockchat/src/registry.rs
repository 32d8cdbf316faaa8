use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::transport::{AcceptError, AcceptHandler, Channel};

pub type ChannelId = u64;

/// What a visitor wants done with the handle it was just given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Drop,
}

/// Outcome of one full traversal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Visited {
    pub visited: usize,
    pub dropped: Vec<ChannelId>,
}

struct Entry<C> {
    id: ChannelId,
    channel: Arc<C>,
}

/// Ordered set of live channels shared by the accept handler and the relay
/// loops.
///
/// One lock guards the sequence. Appends, removals and whole traversals all
/// run under it, so a traversal always sees a consistent list and a handle
/// registered mid-traversal shows up in the next one.
pub struct Registry<C> {
    entries: Mutex<Vec<Entry<C>>>,
    next_id: AtomicU64,
    capacity: Option<usize>,
}

impl<C: Channel> Registry<C> {
    pub fn new() -> Self {
        Self::with_capacity_limit(None)
    }

    /// A registry that rejects registrations beyond `capacity` when set.
    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    pub async fn register(&self, channel: Arc<C>) -> Result<ChannelId, AcceptError> {
        let mut entries = self.entries.lock().await;

        if let Some(capacity) = self.capacity {
            if entries.len() >= capacity {
                return Err(AcceptError::RegistryFull { capacity });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(Entry { id, channel });
        debug!(channel = id, total = entries.len(), "channel registered");
        Ok(id)
    }

    pub async fn remove(&self, id: ChannelId) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        before != entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Ids in insertion order.
    pub async fn ids(&self) -> Vec<ChannelId> {
        self.entries.lock().await.iter().map(|entry| entry.id).collect()
    }

    /// Calls `visitor` once per handle, in insertion order, holding the lock
    /// for the whole traversal.
    ///
    /// Handles the visitor answers [`Visit::Drop`] for are removed before the
    /// lock is released. The first error stops the traversal; removals
    /// gathered up to that point still apply.
    pub async fn visit<F, Fut, E>(&self, mut visitor: F) -> Result<Visited, E>
    where
        F: FnMut(ChannelId, Arc<C>) -> Fut,
        Fut: Future<Output = Result<Visit, E>>,
    {
        let mut entries = self.entries.lock().await;
        let mut outcome = Visited::default();
        let mut failure = None;

        for entry in entries.iter() {
            match visitor(entry.id, Arc::clone(&entry.channel)).await {
                Ok(Visit::Keep) => {}
                Ok(Visit::Drop) => outcome.dropped.push(entry.id),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
            outcome.visited += 1;
        }

        if !outcome.dropped.is_empty() {
            entries.retain(|entry| !outcome.dropped.contains(&entry.id));
            for id in &outcome.dropped {
                info!(channel = id, remaining = entries.len(), "channel removed");
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }
}

impl<C: Channel> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Channel> AcceptHandler<C> for Arc<Registry<C>> {
    async fn on_accept(&self, channel: Arc<C>) -> Result<(), AcceptError> {
        let id = self.register(channel).await?;
        info!(channel = id, "incoming client registered");
        Ok(())
    }
}
