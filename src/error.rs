use crate::types::{Hash, Pubkey, Signature};

/// Error returned when a textual key, hash, signature or manifest fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("expected {expected} bytes, got {found}")]
    Length { expected: usize, found: usize },
    #[error("expected <pubkey>=<signature>, got `{0}`")]
    SignerPair(String),
    #[error("manifest line {line}: {reason}")]
    Manifest { line: usize, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account {0} not found")]
    AccountNotFound(Pubkey),
    #[error("account {0} already exists")]
    AccountExists(Pubkey),
    #[error("account {account} has insufficient funds: {available} lamports available, {required} required")]
    InsufficientFunds {
        account: Pubkey,
        required: u64,
        available: u64,
    },
    #[error("missing {role} signer {pubkey}")]
    MissingAuthority { role: &'static str, pubkey: Pubkey },
    #[error("incomplete signatures, missing: {}", format_keys(.missing))]
    IncompleteSignatures { missing: Vec<Pubkey> },
    #[error("nonce mismatch: transaction bound to {supplied}, nonce account holds {current}")]
    NonceMismatch { supplied: Hash, current: Hash },
    #[error("transaction {0} already processed")]
    AlreadyProcessed(Signature),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("account {account} is not a {expected} account")]
    InvalidAccount {
        account: Pubkey,
        expected: &'static str,
    },
    #[error("{role} of {account} is {expected}, transaction names {provided}")]
    AuthorityMismatch {
        account: Pubkey,
        role: &'static str,
        expected: Pubkey,
        provided: Pubkey,
    },
    #[error("signature for {0} does not verify")]
    InvalidSignature(Pubkey),
    #[error("{0} is not a signer of this transaction")]
    UnexpectedSigner(Pubkey),
    #[error("blockhash {0} not found or expired")]
    BlockhashExpired(Hash),
    #[error("workflow is at {found}, expected {expected}")]
    InvalidStage {
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("keystore error: {0}")]
    Keystore(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the failed step may be retried without restarting the workflow.
    ///
    /// Only network failures qualify, and a retried submit must still check the
    /// transaction status by signature first.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkError(_))
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Malformed(err.to_string())
    }
}

fn format_keys(keys: &[Pubkey]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_transient() {
        assert!(Error::NetworkError("timeout".into()).is_transient());
        assert!(!Error::AlreadyProcessed(Signature::default()).is_transient());
        assert!(!Error::NonceMismatch {
            supplied: Hash::default(),
            current: Hash::new([1; 32]),
        }
        .is_transient());
    }

    #[test]
    fn incomplete_signatures_lists_missing_keys() {
        let a = Pubkey::new([1; 32]);
        let b = Pubkey::new([2; 32]);
        let msg = Error::IncompleteSignatures {
            missing: vec![a, b],
        }
        .to_string();
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
    }
}
