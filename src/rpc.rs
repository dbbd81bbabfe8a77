use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{Message, Transaction};
use crate::types::{Hash, Pubkey, Signature};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceState {
    pub authority: Pubkey,
    pub nonce_value: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StakeStatus {
    Initialized,
    Delegated { vote_account: Pubkey },
    Deactivated { vote_account: Pubkey },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeState {
    pub stake_authority: Pubkey,
    pub withdraw_authority: Pubkey,
    #[serde(flatten)]
    pub status: StakeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountData {
    System,
    Nonce(NonceState),
    Stake(StakeState),
    Vote { node: Pubkey },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub lamports: u64,
    pub data: AccountData,
}

impl AccountState {
    pub fn system(lamports: u64) -> Self {
        Self {
            lamports,
            data: AccountData::System,
        }
    }
}

/// Status of a processed transaction, looked up by its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub slot: u64,
}

/// The cluster RPC surface the workflow consumes.
///
/// Implementations report transport failures as [`Error::NetworkError`]; every other
/// error means the request reached the cluster and was answered.
pub trait ClusterRpc: Send + Sync {
    /// Fails with [`Error::AccountNotFound`] if nothing lives at `pubkey`.
    fn get_account(&self, pubkey: &Pubkey) -> Result<AccountState>;

    /// Balance in lamports; zero for a missing account.
    fn get_balance(&self, pubkey: &Pubkey) -> Result<u64>;

    fn get_latest_blockhash(&self) -> Result<Hash>;

    fn get_fee_for_message(&self, message: &Message) -> Result<u64>;

    fn get_signature_status(&self, signature: &Signature) -> Result<Option<TransactionStatus>>;

    fn send_transaction(&self, transaction: &Transaction) -> Result<Signature>;
}

/// Fetches a stake account, checking that it really holds stake state.
pub fn get_stake_account<C: ClusterRpc + ?Sized>(
    rpc: &C,
    address: &Pubkey,
) -> Result<(u64, StakeState)> {
    let account = rpc.get_account(address)?;
    match account.data {
        AccountData::Stake(state) => Ok((account.lamports, state)),
        _ => Err(Error::InvalidAccount {
            account: *address,
            expected: "stake",
        }),
    }
}

/// Fetches a nonce account, checking that it really holds nonce state.
pub fn get_nonce_account<C: ClusterRpc + ?Sized>(
    rpc: &C,
    address: &Pubkey,
) -> Result<(u64, NonceState)> {
    let account = rpc.get_account(address)?;
    match account.data {
        AccountData::Nonce(state) => Ok((account.lamports, state)),
        _ => Err(Error::InvalidAccount {
            account: *address,
            expected: "nonce",
        }),
    }
}
