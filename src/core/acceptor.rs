//! Acceptor role: per-node consensus state

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

/// The record an acceptor holds as its highest-accepted proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedValue {
    /// Proposal number the value was accepted under
    pub n: u64,
    /// Opaque token identifying the commit attempt that proposed the value
    pub id: String,
    /// The proposed value itself
    pub value: String,
}

/// Outcome of a `PREPARE` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareReply {
    /// Promise granted, carrying the highest previously-accepted value if any
    Promised(Option<AcceptedValue>),
    /// Proposal number was not higher than the current promise, which is
    /// reported back so a lagging proposer can catch up
    Refused { promised: u64 },
}

/// Shared reference to an acceptor, one per node
pub type SharedAcceptor = Arc<Mutex<Acceptor>>;

/// Per-node acceptor state for single-decree Paxos rounds.
///
/// Mutated only by this node's own prepare/accept handlers; callers serialize
/// access through the [`SharedAcceptor`] lock. Invariants: `promised_n` never
/// decreases, and the accepted value (when present) was accepted under a
/// number `<= promised_n`.
#[derive(Debug, Default)]
pub struct Acceptor {
    promised_n: u64,
    accepted: Option<AcceptedValue>,
    learned: HashSet<String>,
}

impl Acceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a `PREPARE n` request.
    ///
    /// Grants a promise when `n` is strictly higher than any number promised
    /// so far. The previously-accepted value is returned with the promise but
    /// retained: it must survive until overwritten by a later `accept`, so a
    /// competing proposer can discover it.
    pub fn prepare(&mut self, n: u64) -> PrepareReply {
        if n > self.promised_n {
            self.promised_n = n;
            PrepareReply::Promised(self.accepted.clone())
        } else {
            PrepareReply::Refused { promised: self.promised_n }
        }
    }

    /// Handle an `ACCEPT n id value` request.
    ///
    /// Accepts when `n` is at least the promised number, recording the value
    /// as the new highest-accepted proposal.
    pub fn accept(&mut self, n: u64, id: &str, value: &str) -> bool {
        if n >= self.promised_n {
            self.promised_n = n;
            self.accepted = Some(AcceptedValue {
                n,
                id: id.to_owned(),
                value: value.to_owned(),
            });
            true
        } else {
            false
        }
    }

    /// Record that proposal `id` has been durably applied to the log store.
    ///
    /// A proposer that later discovers this id as a previously-accepted value
    /// can skip carrying it forward instead of committing it a second time.
    pub fn mark_learned(&mut self, id: String) {
        self.learned.insert(id);
    }

    /// Whether proposal `id` is known to be applied already
    pub fn is_learned(&self, id: &str) -> bool {
        self.learned.contains(id)
    }

    /// Highest proposal number promised so far
    pub fn promised_n(&self) -> u64 {
        self.promised_n
    }

    /// Current highest-accepted proposal, if any
    pub fn accepted(&self) -> Option<&AcceptedValue> {
        self.accepted.as_ref()
    }
}
