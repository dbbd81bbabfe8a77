//! Durable nonce provider: creates nonce accounts and reads their current value.
use tracing::{debug, info};

use crate::core::{create_with_seed, NONCE_OWNER};
use crate::error::{Error, Result};
use crate::intent::{Instruction, Intent};
use crate::keys::Signer;
use crate::message::{Message, Transaction};
use crate::rpc::{get_nonce_account, ClusterRpc, NonceState};
use crate::types::{lamports_to_sol, Hash, Pubkey};

/// Seed used by [`NonceProvider::create_nonce_account`].
pub const DEFAULT_NONCE_SEED: &str = "nonce";

/// Address of the nonce account `funding` creates with `seed`.
pub fn nonce_address(funding: &Pubkey, seed: &str) -> Result<Pubkey> {
    create_with_seed(funding, seed, NONCE_OWNER)
}

pub struct NonceProvider<'a, C: ClusterRpc + ?Sized> {
    rpc: &'a C,
}

impl<'a, C: ClusterRpc + ?Sized> NonceProvider<'a, C> {
    pub fn new(rpc: &'a C) -> Self {
        Self { rpc }
    }

    pub fn create_nonce_account<S: Signer + ?Sized>(
        &self,
        funding_key: &S,
        nonce_authority: &Pubkey,
        amount: u64,
    ) -> Result<Pubkey> {
        self.create_nonce_account_with_seed(funding_key, nonce_authority, amount, DEFAULT_NONCE_SEED)
    }

    /// Creates and funds a nonce account at the address derived from the funding key and `seed`.
    ///
    /// Fails with [`Error::AccountExists`] if that address is taken and with
    /// [`Error::InsufficientFunds`] if the funding key cannot cover `amount` plus the fee.
    pub fn create_nonce_account_with_seed<S: Signer + ?Sized>(
        &self,
        funding_key: &S,
        nonce_authority: &Pubkey,
        amount: u64,
        seed: &str,
    ) -> Result<Pubkey> {
        if amount == 0 {
            return Err(Error::InvalidConfig(
                "nonce account amount must be >= 1 lamport".into(),
            ));
        }
        let funding = funding_key.pubkey();
        let address = nonce_address(&funding, seed)?;
        match self.rpc.get_account(&address) {
            Ok(_) => return Err(Error::AccountExists(address)),
            Err(Error::AccountNotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let intent = Intent::new(vec![Instruction::CreateNonceAccountWithSeed {
            from: funding,
            base: funding,
            seed: seed.to_owned(),
            lamports: amount,
            nonce_authority: *nonce_authority,
        }])?;
        let blockhash = self.rpc.get_latest_blockhash()?;
        let message = Message::new_with_blockhash(intent, funding, blockhash);

        let fee = self.rpc.get_fee_for_message(&message)?;
        let balance = self.rpc.get_balance(&funding)?;
        let required = amount.saturating_add(fee);
        debug!(
            "Funding balance {} SOL, required {} SOL",
            lamports_to_sol(balance),
            lamports_to_sol(required)
        );
        if balance < required {
            return Err(Error::InsufficientFunds {
                account: funding,
                required,
                available: balance,
            });
        }

        let mut transaction = Transaction::new_unsigned(message);
        transaction.try_sign(&[funding_key])?;
        let signature = self.rpc.send_transaction(&transaction)?;
        info!(
            "Created nonce account {} with {} SOL, authority {} ({})",
            address,
            lamports_to_sol(amount),
            nonce_authority,
            signature
        );
        Ok(address)
    }

    /// Latest on-chain nonce value. Changes every time a transaction consumes it.
    pub fn get_current_nonce(&self, nonce_account: &Pubkey) -> Result<Hash> {
        Ok(self.get_nonce_account(nonce_account)?.1.nonce_value)
    }

    /// Balance and nonce state of `nonce_account`.
    pub fn get_nonce_account(&self, nonce_account: &Pubkey) -> Result<(u64, NonceState)> {
        get_nonce_account(self.rpc, nonce_account)
    }
}

#[cfg(all(test, feature = "local-cluster"))]
mod tests {
    use super::*;
    use crate::cluster::{ClusterConfig, LocalCluster};
    use crate::keys::Keypair;

    fn setup(lamports: u64) -> (LocalCluster, Keypair) {
        let cluster = LocalCluster::new(ClusterConfig::default()).unwrap();
        let funder = Keypair::new();
        if lamports > 0 {
            cluster.airdrop(&funder.pubkey(), lamports).unwrap();
        }
        (cluster, funder)
    }

    #[test]
    fn creates_account_with_authority() {
        let (cluster, funder) = setup(10_000_000);
        let authority = Pubkey::new([8; 32]);
        let provider = NonceProvider::new(&cluster);
        let address = provider
            .create_nonce_account(&funder, &authority, 1_000_000)
            .unwrap();
        assert_eq!(address, nonce_address(&funder.pubkey(), DEFAULT_NONCE_SEED).unwrap());
        let (lamports, state) = provider.get_nonce_account(&address).unwrap();
        assert_eq!(lamports, 1_000_000);
        assert_eq!(state.authority, authority);
        assert_eq!(provider.get_current_nonce(&address).unwrap(), state.nonce_value);
    }

    #[test]
    fn second_creation_with_same_seed_collides() {
        let (cluster, funder) = setup(10_000_000);
        let provider = NonceProvider::new(&cluster);
        provider
            .create_nonce_account(&funder, &funder.pubkey(), 1_000_000)
            .unwrap();
        assert!(matches!(
            provider.create_nonce_account(&funder, &funder.pubkey(), 1_000_000),
            Err(Error::AccountExists(_))
        ));
        provider
            .create_nonce_account_with_seed(&funder, &funder.pubkey(), 1_000_000, "nonce-2")
            .unwrap();
    }

    #[test]
    fn amount_plus_fee_must_be_covered() {
        let (cluster, funder) = setup(1_000_000);
        let provider = NonceProvider::new(&cluster);
        match provider.create_nonce_account(&funder, &funder.pubkey(), 1_000_000) {
            Err(Error::InsufficientFunds {
                required,
                available,
                ..
            }) => {
                assert_eq!(available, 1_000_000);
                assert_eq!(required, 1_000_000 + 5_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_nonce_account_is_not_found() {
        let (cluster, _) = setup(0);
        let provider = NonceProvider::new(&cluster);
        assert!(matches!(
            provider.get_current_nonce(&Pubkey::new([1; 32])),
            Err(Error::AccountNotFound(_))
        ));
    }

    #[test]
    fn system_account_is_not_a_nonce_account() {
        let (cluster, funder) = setup(1_000);
        let provider = NonceProvider::new(&cluster);
        assert!(matches!(
            provider.get_current_nonce(&funder.pubkey()),
            Err(Error::InvalidAccount { .. })
        ));
    }
}
