use moka::sync::Cache;

use crate::rpc::TransactionStatus;
use crate::types::Signature;

/// Record of processed transactions, keyed by identifying signature.
pub trait StatusCache: Send + Sync {
    fn get(&self, signature: &Signature) -> Option<TransactionStatus>;

    fn insert(&self, signature: Signature, status: TransactionStatus);

    fn entries(&self) -> Vec<(Signature, TransactionStatus)>;
}

/// In-memory status cache backed by `moka::sync::Cache`.
#[derive(Debug, Clone)]
pub struct MokaStatusCache {
    inner: Cache<Signature, TransactionStatus>,
}

impl MokaStatusCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(max_capacity).build(),
        }
    }
}

impl StatusCache for MokaStatusCache {
    fn get(&self, signature: &Signature) -> Option<TransactionStatus> {
        self.inner.get(signature)
    }

    fn insert(&self, signature: Signature, status: TransactionStatus) {
        self.inner.insert(signature, status);
    }

    fn entries(&self) -> Vec<(Signature, TransactionStatus)> {
        let mut out: Vec<_> = self.inner.iter().map(|(k, v)| (*k, v)).collect();
        out.sort_by_key(|(_, status)| status.slot);
        out
    }
}
