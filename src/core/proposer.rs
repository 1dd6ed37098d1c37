//! Proposer role: drives the two-phase commit loop for client values

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use nanoid::nanoid;

use super::acceptor::{AcceptedValue, PrepareReply, SharedAcceptor};
use super::config::{round_of, ClusterConfig};
use crate::log::{LogError, LogStore};
use crate::transport::Transport;

/// Errors surfaced by a commit
#[derive(Debug)]
pub enum CommitError {
    /// Applying the agreed value to the local log failed. A slot conflict
    /// here is a consensus-safety violation and is never papered over.
    Log(LogError),
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::Log(err) => write!(f, "commit failed: {}", err),
        }
    }
}

impl std::error::Error for CommitError {}

impl From<LogError> for CommitError {
    fn from(err: LogError) -> Self {
        CommitError::Log(err)
    }
}

/// Result of one full prepare/accept cycle
enum RoundOutcome {
    /// A value reached an accept quorum and was learned; it may carry a
    /// competing proposer's id rather than ours.
    Committed(AcceptedValue),
    /// An acceptor explicitly refused the prepare, reporting its promise
    Refused { promised: u64 },
    /// The round fell short of quorum
    QuorumFailed,
}

/// Result of the prepare fan-out
enum PrepareOutcome {
    /// Quorum of promises; the message to propose in phase two
    Proposal(AcceptedValue),
    /// Explicit refusal, carrying the refusing acceptor's promise
    Refused { promised: u64 },
    /// Too few responders promised
    NoQuorum,
}

/// Drives Paxos rounds against the whole cluster for values submitted by
/// clients of this node.
///
/// The proposer's own node is an ordinary target: its acceptor is reached
/// through the transport like any peer, so quorum arithmetic covers the full
/// membership. The round counter is shared across commits and only ever
/// increases.
pub struct Proposer<T: Transport> {
    config: ClusterConfig,
    transport: Arc<T>,
    acceptor: SharedAcceptor,
    log: Arc<LogStore>,
    round: AtomicU64,
}

impl<T: Transport + 'static> Proposer<T> {
    pub fn new(
        config: ClusterConfig,
        transport: T,
        acceptor: SharedAcceptor,
        log: Arc<LogStore>,
    ) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            acceptor,
            log,
            // Round 0 composes to proposal numbers an acceptor could refuse
            // from node 0, so numbering starts at 1.
            round: AtomicU64::new(1),
        }
    }

    /// Commit `value` to the replicated log, returning the slot it landed in.
    ///
    /// Mints a fresh proposal id, then attempts rounds with increasing
    /// proposal numbers until a round's accept phase succeeds for a message
    /// carrying our own id. A round won by a competing proposer commits that
    /// proposer's value (at that round's slot) and we retry for ours at a
    /// fresh slot; quorum failures bump the round and retry with backoff.
    pub async fn commit(&self, value: &str) -> Result<u64, CommitError> {
        let id = nanoid!();
        let mut attempt = 0u32;
        loop {
            let n = self.config.proposal_number(self.round.load(Ordering::SeqCst));
            match self.run_round(n, value, &id).await? {
                RoundOutcome::Committed(message) if message.id == id => {
                    tracing::info!(slot = message.n, "value committed");
                    // The slot is consumed; later commits start past it.
                    self.bump_round_past(round_of(message.n));
                    return Ok(message.n);
                }
                RoundOutcome::Committed(message) => {
                    tracing::debug!(
                        slot = message.n,
                        winner = %message.id,
                        "slot won by a competing proposal, retrying"
                    );
                    self.bump_round_past(round_of(message.n));
                }
                RoundOutcome::Refused { promised } => {
                    // A refusal reveals the cluster's high-water mark; jump
                    // straight past it instead of grinding one round at a
                    // time.
                    tracing::debug!(n, promised, "round refused, catching up");
                    self.bump_round_past(round_of(promised));
                }
                RoundOutcome::QuorumFailed => {
                    self.round.fetch_add(1, Ordering::SeqCst);
                }
            }
            attempt += 1;
            self.backoff(attempt).await;
        }
    }

    /// One prepare/accept cycle under proposal number `n`.
    async fn run_round(&self, n: u64, value: &str, id: &str) -> Result<RoundOutcome, CommitError> {
        let message = match self.prepare_round(n, value, id).await {
            PrepareOutcome::Proposal(message) => message,
            PrepareOutcome::Refused { promised } => {
                return Ok(RoundOutcome::Refused { promised })
            }
            PrepareOutcome::NoQuorum => return Ok(RoundOutcome::QuorumFailed),
        };

        if !self.accept_round(&message).await {
            return Ok(RoundOutcome::QuorumFailed);
        }

        self.learn(&message).await?;
        Ok(RoundOutcome::Committed(message))
    }

    /// Phase one: fan out `PREPARE n` to every acceptor and fold the
    /// responses into the message to propose.
    ///
    /// Rejection is strict: one explicit refusal aborts the round even when a
    /// majority of promises has already arrived, and carries the refuser's
    /// promised number so the caller can catch up. Unreachable peers count as
    /// neither promise nor refusal. Among previously-accepted values carried
    /// by promises, the highest-numbered one not yet known learned is adopted
    /// in place of the client value (a learned one was applied already and
    /// must not be committed a second time at a fresh slot).
    async fn prepare_round(&self, n: u64, value: &str, id: &str) -> PrepareOutcome {
        let mut futures: FuturesUnordered<_> = (0..self.config.len())
            .map(|target| {
                let transport = Arc::clone(&self.transport);
                async move { (target, transport.prepare(target, n).await) }
            })
            .collect();

        let mut promises = 0;
        let mut previous = Vec::new();
        while let Some((target, result)) = futures.next().await {
            match result {
                Ok(PrepareReply::Promised(prev)) => {
                    promises += 1;
                    previous.extend(prev);
                }
                Ok(PrepareReply::Refused { promised }) => {
                    tracing::debug!(peer = target, n, promised, "prepare refused");
                    return PrepareOutcome::Refused { promised };
                }
                Err(err) => {
                    tracing::debug!(peer = target, n, error = %err, "peer unreachable during prepare");
                }
            }
        }

        if promises < self.config.quorum() {
            tracing::debug!(n, promises, quorum = self.config.quorum(), "prepare quorum failed");
            return PrepareOutcome::NoQuorum;
        }

        let acceptor = self.acceptor.lock().await;
        let adopted = previous
            .into_iter()
            .filter(|prev| !acceptor.is_learned(&prev.id))
            .max_by_key(|prev| prev.n);
        drop(acceptor);

        PrepareOutcome::Proposal(match adopted {
            Some(prev) => AcceptedValue { n, id: prev.id, value: prev.value },
            None => AcceptedValue { n, id: id.to_owned(), value: value.to_owned() },
        })
    }

    /// Phase two: fan out the accept message; success requires a quorum of
    /// acceptances and not a single explicit refusal.
    async fn accept_round(&self, message: &AcceptedValue) -> bool {
        let mut futures: FuturesUnordered<_> = (0..self.config.len())
            .map(|target| {
                let transport = Arc::clone(&self.transport);
                let message = message.clone();
                async move {
                    let result = transport
                        .accept(target, message.n, &message.id, &message.value)
                        .await;
                    (target, result)
                }
            })
            .collect();

        let mut accepts = 0;
        while let Some((target, result)) = futures.next().await {
            match result {
                Ok(true) => accepts += 1,
                Ok(false) => {
                    tracing::debug!(peer = target, n = message.n, "accept refused");
                    return false;
                }
                Err(err) => {
                    tracing::debug!(peer = target, n = message.n, error = %err, "peer unreachable during accept");
                }
            }
        }

        accepts >= self.config.quorum()
    }

    /// Learn step: apply the agreed value locally, then broadcast `SET` to
    /// the rest of the cluster without waiting for delivery.
    ///
    /// The broadcast is best effort; a peer that misses it serves a lagging
    /// log until a later commit catches it up.
    async fn learn(&self, message: &AcceptedValue) -> Result<(), CommitError> {
        self.log.set(message.n, &message.value)?;
        self.acceptor.lock().await.mark_learned(message.id.clone());

        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();
        let message = message.clone();
        tokio::spawn(async move {
            let mut futures: FuturesUnordered<_> = (0..config.len())
                .filter(|&target| target != config.node_index())
                .map(|target| {
                    let transport = Arc::clone(&transport);
                    let message = message.clone();
                    async move {
                        let result = transport
                            .learn(target, message.n, &message.id, &message.value)
                            .await;
                        (target, result)
                    }
                })
                .collect();
            while let Some((target, result)) = futures.next().await {
                if let Err(err) = result {
                    tracing::warn!(peer = target, error = %err, "learn broadcast failed");
                }
            }
        });

        Ok(())
    }

    /// Advance the round counter past `past`, keeping it monotonic under
    /// concurrent commits.
    fn bump_round_past(&self, past: u64) {
        let mut current = self.round.load(Ordering::SeqCst);
        while current <= past {
            match self.round.compare_exchange(
                current,
                past + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let factor = 1u32 << attempt.min(6);
        tokio::time::sleep(self.config.retry_backoff() * factor).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use tokio::sync::{mpsc, Mutex};

    use crate::core::acceptor::Acceptor;
    use crate::transport::inmemory::{InMemoryTransport, NodeHandle, Request};

    struct TestNode {
        acceptor: SharedAcceptor,
        log: Arc<LogStore>,
    }

    /// Spin up `count` in-memory nodes, returning their state and the sender
    /// map for transports. Nodes listed in `down` get no serving task: sends
    /// to them fail like a dead peer.
    fn cluster(count: usize, down: &[usize]) -> (Vec<TestNode>, HashMap<usize, mpsc::Sender<Request>>) {
        let mut nodes = Vec::new();
        let mut senders = HashMap::new();
        for index in 0..count {
            let acceptor: SharedAcceptor = Arc::new(Mutex::new(Acceptor::new()));
            let log = Arc::new(LogStore::new());
            let (tx, handle) = NodeHandle::channel(16);
            if !down.contains(&index) {
                handle.spawn(acceptor.clone(), log.clone());
            }
            senders.insert(index, tx);
            nodes.push(TestNode { acceptor, log });
        }
        (nodes, senders)
    }

    fn config(count: usize, index: usize) -> ClusterConfig {
        let addresses = (0..count).map(|i| format!("node-{}", i)).collect();
        ClusterConfig::new(addresses, index).with_retry_backoff(Duration::from_millis(1))
    }

    fn proposer(
        nodes: &[TestNode],
        senders: &HashMap<usize, mpsc::Sender<Request>>,
        index: usize,
    ) -> Proposer<InMemoryTransport> {
        Proposer::new(
            config(nodes.len(), index),
            InMemoryTransport::new(senders.clone(), Duration::from_millis(200)),
            nodes[index].acceptor.clone(),
            nodes[index].log.clone(),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_commit_single_node() {
        let (nodes, senders) = cluster(1, &[]);
        let proposer = proposer(&nodes, &senders, 0);

        let slot = proposer.commit("hello").await.unwrap();
        assert_eq!(nodes[0].log.get(slot).as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_commit_reaches_every_log() {
        let (nodes, senders) = cluster(3, &[]);
        let proposer = proposer(&nodes, &senders, 0);

        let slot = proposer.commit("x").await.unwrap();

        // The committing node applies synchronously; the rest learn via the
        // asynchronous broadcast.
        assert_eq!(nodes[0].log.get(slot).as_deref(), Some("x"));
        wait_until(|| {
            nodes.iter().all(|node| node.log.get(slot).as_deref() == Some("x"))
        })
        .await;
    }

    #[tokio::test]
    async fn test_commit_survives_one_dead_peer() {
        let (nodes, senders) = cluster(3, &[2]);
        let proposer = proposer(&nodes, &senders, 0);

        let slot = proposer.commit("resilient").await.unwrap();
        assert_eq!(nodes[0].log.get(slot).as_deref(), Some("resilient"));
        wait_until(|| nodes[1].log.get(slot).as_deref() == Some("resilient")).await;
        // The dead node learned nothing
        assert!(nodes[2].log.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_round_fails_without_quorum() {
        // Only this node is alive in a cluster of three
        let (nodes, senders) = cluster(3, &[1, 2]);
        let proposer = proposer(&nodes, &senders, 0);

        let n = proposer.config.proposal_number(1);
        let outcome = proposer.prepare_round(n, "v", "id").await;
        assert!(matches!(outcome, PrepareOutcome::NoQuorum));
    }

    #[tokio::test]
    async fn test_prepare_round_aborts_on_refusal_despite_majority() {
        let (nodes, senders) = cluster(3, &[]);
        // Node 2 has already promised a much higher number
        nodes[2].acceptor.lock().await.prepare(1 << 20);

        let proposer = proposer(&nodes, &senders, 0);
        let n = proposer.config.proposal_number(1);

        // Nodes 0 and 1 would promise (a majority), but the explicit refusal
        // from node 2 aborts the round and reports the promise.
        let outcome = proposer.prepare_round(n, "v", "id").await;
        assert!(matches!(outcome, PrepareOutcome::Refused { promised } if promised == 1 << 20));
    }

    #[tokio::test]
    async fn test_commit_catches_up_after_competing_high_round() {
        let (nodes, senders) = cluster(3, &[]);
        // Every acceptor has promised a proposal from a far-ahead round, as
        // if the rest of the cluster had been committing without us.
        let high = config(3, 1).proposal_number(200);
        for node in &nodes {
            node.acceptor.lock().await.prepare(high);
        }

        let proposer = proposer(&nodes, &senders, 0);

        // One refused round reveals the high-water mark; the commit must land
        // promptly instead of grinding through 200 rounds of backoff.
        let slot = tokio::time::timeout(Duration::from_secs(1), proposer.commit("fresh"))
            .await
            .expect("commit did not catch up with the cluster round")
            .unwrap();
        assert!(round_of(slot) > 200);
        assert_eq!(nodes[0].log.get(slot).as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_commit_adopts_unlearned_previous_value() {
        let (nodes, senders) = cluster(3, &[]);
        // A competing proposer got "theirs" accepted by a majority but never
        // finished the learn step.
        nodes[1].acceptor.lock().await.accept(7, "other", "theirs");
        nodes[2].acceptor.lock().await.accept(7, "other", "theirs");

        let proposer = proposer(&nodes, &senders, 0);
        let slot = proposer.commit("mine").await.unwrap();

        // Our value landed at its own slot...
        assert_eq!(nodes[0].log.get(slot).as_deref(), Some("mine"));
        // ...and the orphaned value was carried forward and committed first.
        let values: Vec<String> = nodes[0].log.entries().into_iter().map(|(_, v)| v).collect();
        assert!(values.contains(&"theirs".to_string()));
        let theirs_slot = nodes[0]
            .log
            .entries()
            .into_iter()
            .find(|(_, v)| v == "theirs")
            .map(|(slot, _)| slot)
            .unwrap();
        assert!(theirs_slot < slot);
    }

    #[tokio::test]
    async fn test_learned_previous_value_is_not_recommitted() {
        let (nodes, senders) = cluster(3, &[]);
        // "done" was fully committed earlier: accepted everywhere and learned.
        for node in &nodes {
            let mut acceptor = node.acceptor.lock().await;
            acceptor.prepare(7);
            acceptor.accept(7, "done-id", "done");
            node.log.set(7, "done").unwrap();
        }
        nodes[0].acceptor.lock().await.mark_learned("done-id".into());

        let proposer = proposer(&nodes, &senders, 0);
        let slot = proposer.commit("fresh").await.unwrap();

        assert_eq!(nodes[0].log.get(slot).as_deref(), Some("fresh"));
        // "done" still lives at its original slot only
        let occurrences = nodes[0]
            .log
            .entries()
            .into_iter()
            .filter(|(_, v)| v == "done")
            .count();
        assert_eq!(occurrences, 1);
    }

    #[tokio::test]
    async fn test_concurrent_commits_never_disagree_per_slot() {
        let (nodes, senders) = cluster(3, &[]);
        let proposer_a = proposer(&nodes, &senders, 0);
        let proposer_b = proposer(&nodes, &senders, 1);

        let (slot_a, slot_b) = tokio::join!(proposer_a.commit("x"), proposer_b.commit("y"));
        let (slot_a, slot_b) = (slot_a.unwrap(), slot_b.unwrap());
        assert_ne!(slot_a, slot_b);

        wait_until(|| {
            nodes.iter().all(|node| {
                node.log.get(slot_a).as_deref() == Some("x")
                    && node.log.get(slot_b).as_deref() == Some("y")
            })
        })
        .await;

        // Safety: wherever two nodes both hold a slot, they hold one value.
        for slot in nodes[0].log.entries().into_iter().map(|(slot, _)| slot) {
            let mut values: Vec<_> = nodes
                .iter()
                .filter_map(|node| node.log.get(slot))
                .collect();
            values.dedup();
            assert_eq!(values.len(), 1, "slot {} holds conflicting values", slot);
        }
    }
}
