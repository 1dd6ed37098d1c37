//! Consensus core: acceptor and proposer roles plus cluster configuration

pub mod acceptor;
pub mod config;
pub mod proposer;

pub use acceptor::{AcceptedValue, Acceptor, PrepareReply, SharedAcceptor};
pub use config::{round_of, ClusterConfig};
pub use proposer::{CommitError, Proposer};
