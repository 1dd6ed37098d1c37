//! Replicated log store
//!
//! An ordered collection of committed `(slot, value)` entries. Slots are
//! agreed by consensus and may commit out of arrival order; entries are
//! immutable once present. Readers tail the log with [`LogStore::pull`],
//! which yields existing entries in ascending slot order and then blocks for
//! live commits.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

/// Errors raised by log store operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// A slot was set twice with different values. This is a consensus-safety
    /// violation and is never resolved by overwriting.
    SlotConflict {
        slot: u64,
        existing: String,
        proposed: String,
    },
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::SlotConflict { slot, existing, proposed } => write!(
                f,
                "slot {} already holds {:?}, refusing conflicting value {:?}",
                slot, existing, proposed
            ),
        }
    }
}

impl std::error::Error for LogError {}

/// Entries plus the live-subscriber registry, guarded together so that a
/// subscription can snapshot the log and register its channel atomically.
#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<u64, String>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<(u64, String)>>,
    next_subscriber: u64,
}

/// In-memory replicated log keyed by slot
///
/// Insertions and subscriptions take the exclusive lock; read-only scans take
/// the shared lock. The lock is never held while waiting on live commits.
#[derive(Debug, Default)]
pub struct LogStore {
    inner: RwLock<Inner>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the committed value for `slot`.
    ///
    /// Out-of-order insertion is expected; the entry lands in slot order
    /// regardless of arrival order. Re-delivery of the same value is an
    /// idempotent no-op. A different value for an existing slot is refused
    /// with [`LogError::SlotConflict`].
    pub fn set(&self, slot: u64, value: &str) -> Result<(), LogError> {
        let mut inner = self.inner.write().expect("log lock poisoned");
        if let Some(existing) = inner.entries.get(&slot) {
            if existing == value {
                return Ok(());
            }
            return Err(LogError::SlotConflict {
                slot,
                existing: existing.clone(),
                proposed: value.to_owned(),
            });
        }
        inner.entries.insert(slot, value.to_owned());

        // Notify live tails; drop the channel of any reader that went away.
        inner.subscribers.retain(|_, tx| tx.send((slot, value.to_owned())).is_ok());
        Ok(())
    }

    /// Begin an unbounded tail read at `slot >= from`.
    ///
    /// The snapshot of existing entries and the registration of the live
    /// channel happen under one exclusive lock, so an entry is delivered from
    /// exactly one of the two paths: commits before the subscription are in
    /// the snapshot, commits after it arrive on the channel. Dropping the
    /// returned [`Tail`] unregisters the subscriber.
    pub fn pull(self: &Arc<Self>, from: u64) -> Tail {
        let mut inner = self.inner.write().expect("log lock poisoned");
        let snapshot: VecDeque<(u64, String)> = inner
            .entries
            .range(from..)
            .map(|(slot, value)| (*slot, value.clone()))
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, tx);

        Tail {
            store: Arc::clone(self),
            id,
            from,
            snapshot,
            live: rx,
        }
    }

    /// Value committed at `slot`, if any
    pub fn get(&self, slot: u64) -> Option<String> {
        self.inner
            .read()
            .expect("log lock poisoned")
            .entries
            .get(&slot)
            .cloned()
    }

    /// All committed entries in ascending slot order
    pub fn entries(&self) -> Vec<(u64, String)> {
        self.inner
            .read()
            .expect("log lock poisoned")
            .entries
            .iter()
            .map(|(slot, value)| (*slot, value.clone()))
            .collect()
    }

    /// Number of committed entries
    pub fn len(&self) -> usize {
        self.inner.read().expect("log lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.read().expect("log lock poisoned").subscribers.len()
    }
}

/// A live tail reader's cursor over the log
///
/// Yields the snapshot portion first, then blocks on live commits. The
/// sequence is unbounded; it ends only when the reader is dropped (or, in
/// tests, when the store itself is gone).
#[derive(Debug)]
pub struct Tail {
    store: Arc<LogStore>,
    id: u64,
    from: u64,
    snapshot: VecDeque<(u64, String)>,
    live: mpsc::UnboundedReceiver<(u64, String)>,
}

impl Tail {
    /// Next committed entry, blocking until one is available.
    ///
    /// Snapshot entries come out in ascending slot order; live entries follow
    /// in commit order. Live commits below `from` are filtered out.
    pub async fn next(&mut self) -> Option<(u64, String)> {
        if let Some(entry) = self.snapshot.pop_front() {
            return Some(entry);
        }
        loop {
            match self.live.recv().await {
                Some((slot, value)) if slot >= self.from => return Some((slot, value)),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

impl Drop for Tail {
    fn drop(&mut self) {
        let mut inner = self.store.inner.write().expect("log lock poisoned");
        inner.subscribers.remove(&self.id);
    }
}
