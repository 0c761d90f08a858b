//! # Local Reference Environment
//!
//! A self-contained backend, transport, and cluster harness. Together they
//! run a full validator set inside one process, which is what the devnet
//! binary, the integration tests, and the benchmarks build on.

pub mod backend;
pub mod cluster;
pub mod transport;

pub use backend::{BackendError, BlockProposal, FinalizedBlock, LocalBackend};
pub use cluster::{LocalCluster, LocalNode};
pub use transport::{spawn_ingest, DeliveryFilter, Inbox, LocalNetwork, LocalTransport};
