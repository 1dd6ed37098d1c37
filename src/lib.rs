//! Paxos-replicated append-only log
//!
//! A fixed set of peer nodes agree, via single-decree Paxos rounds, on the value
//! assigned to each slot of a shared log. Clients append values with `PUSH` and
//! tail the log with `PULL`, which streams committed values live as they arrive.

pub mod client;
pub mod core;
pub mod log;
pub mod protocol;
pub mod server;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
