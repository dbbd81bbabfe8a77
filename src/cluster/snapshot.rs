use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::bank::{BankState, LocalCluster};
use crate::cluster::status::{MokaStatusCache, StatusCache};
use crate::cluster::types::ClusterConfig;
use crate::error::Result;
use crate::rpc::TransactionStatus;
use crate::types::Signature;

#[derive(Serialize, Deserialize)]
struct LedgerSnapshot {
    state: BankState,
    statuses: Vec<(Signature, TransactionStatus)>,
}

impl LocalCluster<MokaStatusCache> {
    /// Opens the ledger stored at `path`, or starts a fresh one if the file is absent.
    pub fn open(path: &Path, config: ClusterConfig) -> Result<Self> {
        if !path.exists() {
            debug!("No ledger at {}, starting from genesis", path.display());
            return Self::new(config);
        }
        let raw = fs::read_to_string(path)?;
        let snapshot: LedgerSnapshot = serde_json::from_str(&raw)?;
        let statuses = MokaStatusCache::new(config.status_cache_capacity);
        for (signature, status) in snapshot.statuses {
            statuses.insert(signature, status);
        }
        debug!(
            "Loaded ledger at slot {} with {} accounts",
            snapshot.state.slot,
            snapshot.state.accounts.len()
        );
        Self::from_parts(config, snapshot.state, statuses)
    }
}

impl<S: StatusCache> LocalCluster<S> {
    /// Writes the ledger to `path` as JSON, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let (state, statuses) = self.snapshot_parts();
        let encoded = serde_json::to_string_pretty(&LedgerSnapshot { state, statuses })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
