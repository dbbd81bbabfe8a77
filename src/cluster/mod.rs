//! Local cluster (feature-gated).
//!
//! An in-process ledger implementing [`ClusterRpc`](crate::rpc::ClusterRpc):
//! - System, nonce, stake and vote accounts with atomic instruction processing.
//! - Durable nonce checks and rotation, recent blockhash expiry, per-signature fees.
//! - A status cache (moka by default) that turns resubmissions into `AlreadyProcessed`.
//! - JSON snapshots so the CLI can carry the ledger between invocations.

pub mod bank;
pub mod snapshot;
pub mod status;
pub mod types;

pub use bank::LocalCluster;
pub use status::{MokaStatusCache, StatusCache};
pub use types::ClusterConfig;
