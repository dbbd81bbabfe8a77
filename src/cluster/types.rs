use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Ledger parameters of the local cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub lamports_per_signature: u64,
    /// How many recent blockhashes stay valid for non-durable transactions.
    pub max_recent_blockhashes: usize,
    pub status_cache_capacity: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            lamports_per_signature: 5_000,
            max_recent_blockhashes: 150,
            status_cache_capacity: 100_000,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.lamports_per_signature == 0 {
            return Err(Error::InvalidConfig(
                "lamports_per_signature must be >= 1".into(),
            ));
        }
        if self.max_recent_blockhashes == 0 {
            return Err(Error::InvalidConfig(
                "max_recent_blockhashes must be >= 1".into(),
            ));
        }
        if self.status_cache_capacity == 0 {
            return Err(Error::InvalidConfig(
                "status_cache_capacity must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
