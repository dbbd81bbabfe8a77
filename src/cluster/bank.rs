use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::status::{MokaStatusCache, StatusCache};
use crate::cluster::types::ClusterConfig;
use crate::core::{initial_nonce_value, next_blockhash, next_nonce_value};
use crate::error::{Error, Result};
use crate::intent::{Instruction, StakeAuthorize};
use crate::message::{Lifetime, Message, Transaction};
use crate::rpc::{
    AccountData, AccountState, ClusterRpc, NonceState, StakeState, StakeStatus, TransactionStatus,
};
use crate::types::{lamports_to_sol, Hash, Pubkey, Signature};

type Accounts = BTreeMap<Pubkey, AccountState>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BankState {
    pub(crate) slot: u64,
    pub(crate) accounts: Accounts,
    pub(crate) recent_blockhashes: VecDeque<Hash>,
}

impl BankState {
    fn genesis() -> Self {
        let genesis = next_blockhash(&Hash::default(), 0);
        Self {
            slot: 0,
            accounts: Accounts::new(),
            recent_blockhashes: VecDeque::from([genesis]),
        }
    }

    fn latest_blockhash(&self) -> Hash {
        self.recent_blockhashes.back().copied().unwrap_or_default()
    }
}

/// In-process cluster that settles transactions against an in-memory ledger.
///
/// Every transaction is checked and applied under one write lock, so two
/// transactions racing on the same nonce are strictly ordered: the first one
/// advances the nonce and the second sees a mismatch.
pub struct LocalCluster<S: StatusCache = MokaStatusCache> {
    config: ClusterConfig,
    state: RwLock<BankState>,
    statuses: S,
}

impl LocalCluster<MokaStatusCache> {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let statuses = MokaStatusCache::new(config.status_cache_capacity);
        Ok(Self::with_status_cache(config, statuses))
    }
}

impl<S: StatusCache> LocalCluster<S> {
    pub fn with_status_cache(config: ClusterConfig, statuses: S) -> Self {
        Self {
            config,
            state: RwLock::new(BankState::genesis()),
            statuses,
        }
    }

    pub(crate) fn from_parts(
        config: ClusterConfig,
        state: BankState,
        statuses: S,
    ) -> Result<Self> {
        config.validate()?;
        if state.recent_blockhashes.is_empty() {
            return Err(Error::Malformed("ledger has no recent blockhashes".into()));
        }
        Ok(Self {
            config,
            state: RwLock::new(state),
            statuses,
        })
    }

    pub(crate) fn snapshot_parts(&self) -> (BankState, Vec<(Signature, TransactionStatus)>) {
        let state = self.state.read().expect("bank lock poisoned").clone();
        (state, self.statuses.entries())
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn slot(&self) -> u64 {
        self.state.read().expect("bank lock poisoned").slot
    }

    /// Credits `lamports` to `pubkey`, creating a system account if needed.
    pub fn airdrop(&self, pubkey: &Pubkey, lamports: u64) -> Result<()> {
        let mut state = self.state.write().expect("bank lock poisoned");
        credit(&mut state.accounts, pubkey, lamports)?;
        info!(
            "Airdropped {} SOL to {}",
            lamports_to_sol(lamports),
            pubkey
        );
        Ok(())
    }

    /// Registers a vote account run by `node` so stake can be delegated to it.
    pub fn add_vote_account(&self, vote_account: &Pubkey, node: &Pubkey) -> Result<()> {
        let mut state = self.state.write().expect("bank lock poisoned");
        if state.accounts.contains_key(vote_account) {
            return Err(Error::AccountExists(*vote_account));
        }
        state.accounts.insert(
            *vote_account,
            AccountState {
                lamports: 0,
                data: AccountData::Vote { node: *node },
            },
        );
        Ok(())
    }

    /// Produces a new block with a fresh blockhash.
    pub fn advance_slot(&self) -> Hash {
        let mut state = self.state.write().expect("bank lock poisoned");
        self.advance_slot_locked(&mut state)
    }

    fn advance_slot_locked(&self, state: &mut BankState) -> Hash {
        state.slot += 1;
        let hash = next_blockhash(&state.latest_blockhash(), state.slot);
        state.recent_blockhashes.push_back(hash);
        while state.recent_blockhashes.len() > self.config.max_recent_blockhashes {
            state.recent_blockhashes.pop_front();
        }
        hash
    }

    fn fee_for(&self, message: &Message) -> u64 {
        self.config
            .lamports_per_signature
            .saturating_mul(message.required_signers().len() as u64)
    }

    fn process(&self, transaction: &Transaction) -> Result<Signature> {
        transaction.verify()?;
        let message = transaction.message();
        let signature = transaction
            .signature()
            .ok_or_else(|| Error::IncompleteSignatures {
                missing: vec![message.fee_payer()],
            })?;

        let mut state = self.state.write().expect("bank lock poisoned");

        if self.statuses.get(&signature).is_some() {
            return Err(Error::AlreadyProcessed(signature));
        }

        let nonce_account = match message.lifetime() {
            Lifetime::RecentBlockhash { blockhash } => {
                if !state.recent_blockhashes.contains(blockhash) {
                    return Err(Error::BlockhashExpired(*blockhash));
                }
                None
            }
            Lifetime::DurableNonce {
                nonce_account,
                nonce_authority,
                nonce_value,
            } => {
                let nonce = nonce_state(&state.accounts, nonce_account)?;
                if nonce.authority != *nonce_authority {
                    return Err(Error::AuthorityMismatch {
                        account: *nonce_account,
                        role: "nonce authority",
                        expected: nonce.authority,
                        provided: *nonce_authority,
                    });
                }
                if nonce.nonce_value != *nonce_value {
                    return Err(Error::NonceMismatch {
                        supplied: *nonce_value,
                        current: nonce.nonce_value,
                    });
                }
                Some(*nonce_account)
            }
        };

        let fee = self.fee_for(message);
        let payer_balance = state
            .accounts
            .get(&message.fee_payer())
            .map(|a| a.lamports)
            .unwrap_or(0);
        if payer_balance < fee {
            return Err(Error::InsufficientFunds {
                account: message.fee_payer(),
                required: fee,
                available: payer_balance,
            });
        }

        // All effects land on a working copy that is committed only if every
        // instruction succeeds.
        let mut working = state.accounts.clone();
        debit(&mut working, &message.fee_payer(), fee)?;
        let blockhash = state.latest_blockhash();
        for instruction in message.intent().instructions() {
            if let Err(err) = apply(&mut working, instruction, &blockhash) {
                warn!("Transaction {} rejected: {}", signature, err);
                return Err(err);
            }
        }

        if let Some(address) = nonce_account {
            if let Some(AccountState {
                data: AccountData::Nonce(nonce),
                ..
            }) = working.get_mut(&address)
            {
                nonce.nonce_value = next_nonce_value(&nonce.nonce_value, &signature);
                debug!("Nonce {} advanced to {}", address, nonce.nonce_value);
            }
        }

        state.accounts = working;
        let slot = state.slot;
        self.statuses.insert(signature, TransactionStatus { slot });
        self.advance_slot_locked(&mut state);
        info!("Transaction {} confirmed in slot {}", signature, slot);
        Ok(signature)
    }
}

impl<S: StatusCache> ClusterRpc for LocalCluster<S> {
    fn get_account(&self, pubkey: &Pubkey) -> Result<AccountState> {
        self.state
            .read()
            .expect("bank lock poisoned")
            .accounts
            .get(pubkey)
            .cloned()
            .ok_or(Error::AccountNotFound(*pubkey))
    }

    fn get_balance(&self, pubkey: &Pubkey) -> Result<u64> {
        Ok(self
            .state
            .read()
            .expect("bank lock poisoned")
            .accounts
            .get(pubkey)
            .map(|a| a.lamports)
            .unwrap_or(0))
    }

    fn get_latest_blockhash(&self) -> Result<Hash> {
        Ok(self
            .state
            .read()
            .expect("bank lock poisoned")
            .latest_blockhash())
    }

    fn get_fee_for_message(&self, message: &Message) -> Result<u64> {
        Ok(self.fee_for(message))
    }

    fn get_signature_status(&self, signature: &Signature) -> Result<Option<TransactionStatus>> {
        Ok(self.statuses.get(signature))
    }

    fn send_transaction(&self, transaction: &Transaction) -> Result<Signature> {
        self.process(transaction)
    }
}

fn nonce_state<'a>(accounts: &'a Accounts, address: &Pubkey) -> Result<&'a NonceState> {
    match accounts.get(address) {
        None => Err(Error::AccountNotFound(*address)),
        Some(AccountState {
            data: AccountData::Nonce(nonce),
            ..
        }) => Ok(nonce),
        Some(_) => Err(Error::InvalidAccount {
            account: *address,
            expected: "nonce",
        }),
    }
}

fn credit(accounts: &mut Accounts, address: &Pubkey, lamports: u64) -> Result<()> {
    let account = accounts
        .entry(*address)
        .or_insert_with(|| AccountState::system(0));
    account.lamports = account
        .lamports
        .checked_add(lamports)
        .ok_or_else(|| Error::Malformed(format!("balance overflow for {address}")))?;
    Ok(())
}

fn debit(accounts: &mut Accounts, address: &Pubkey, lamports: u64) -> Result<()> {
    let account = accounts
        .get_mut(address)
        .ok_or(Error::AccountNotFound(*address))?;
    if account.lamports < lamports {
        return Err(Error::InsufficientFunds {
            account: *address,
            required: lamports,
            available: account.lamports,
        });
    }
    account.lamports -= lamports;
    Ok(())
}

fn create(accounts: &mut Accounts, address: Pubkey, account: AccountState) -> Result<()> {
    if accounts.contains_key(&address) {
        return Err(Error::AccountExists(address));
    }
    accounts.insert(address, account);
    Ok(())
}

fn stake_mut<'a>(accounts: &'a mut Accounts, address: &Pubkey) -> Result<&'a mut StakeState> {
    match accounts.get_mut(address) {
        None => Err(Error::AccountNotFound(*address)),
        Some(AccountState {
            data: AccountData::Stake(stake),
            ..
        }) => Ok(stake),
        Some(_) => Err(Error::InvalidAccount {
            account: *address,
            expected: "stake",
        }),
    }
}

fn nonce_mut<'a>(accounts: &'a mut Accounts, address: &Pubkey) -> Result<&'a mut NonceState> {
    match accounts.get_mut(address) {
        None => Err(Error::AccountNotFound(*address)),
        Some(AccountState {
            data: AccountData::Nonce(nonce),
            ..
        }) => Ok(nonce),
        Some(_) => Err(Error::InvalidAccount {
            account: *address,
            expected: "nonce",
        }),
    }
}

fn check_authority(
    account: &Pubkey,
    role: &'static str,
    expected: Pubkey,
    provided: Pubkey,
) -> Result<()> {
    if expected != provided {
        return Err(Error::AuthorityMismatch {
            account: *account,
            role,
            expected,
            provided,
        });
    }
    Ok(())
}

fn require_system(accounts: &Accounts, address: &Pubkey) -> Result<()> {
    match accounts.get(address) {
        None => Err(Error::AccountNotFound(*address)),
        Some(AccountState {
            data: AccountData::System,
            ..
        }) => Ok(()),
        Some(_) => Err(Error::InvalidAccount {
            account: *address,
            expected: "system",
        }),
    }
}

fn apply(accounts: &mut Accounts, instruction: &Instruction, blockhash: &Hash) -> Result<()> {
    let created = instruction.created_account()?;
    match instruction {
        Instruction::Transfer { from, to, lamports } => {
            require_system(accounts, from)?;
            debit(accounts, from, *lamports)?;
            credit(accounts, to, *lamports)
        }
        Instruction::CreateStakeAccountWithSeed {
            from,
            lamports,
            stake_authority,
            withdraw_authority,
            ..
        } => {
            let address = created.ok_or_else(|| Error::Malformed("no stake address".into()))?;
            require_system(accounts, from)?;
            debit(accounts, from, *lamports)?;
            create(
                accounts,
                address,
                AccountState {
                    lamports: *lamports,
                    data: AccountData::Stake(StakeState {
                        stake_authority: *stake_authority,
                        withdraw_authority: *withdraw_authority,
                        status: StakeStatus::Initialized,
                    }),
                },
            )
        }
        Instruction::SplitStakeWithSeed {
            source,
            stake_authority,
            lamports,
            ..
        } => {
            let address = created.ok_or_else(|| Error::Malformed("no stake address".into()))?;
            let stake = stake_mut(accounts, source)?;
            check_authority(source, "stake authority", stake.stake_authority, *stake_authority)?;
            let split = stake.clone();
            debit(accounts, source, *lamports)?;
            create(
                accounts,
                address,
                AccountState {
                    lamports: *lamports,
                    data: AccountData::Stake(split),
                },
            )
        }
        Instruction::CreateNonceAccountWithSeed {
            from,
            lamports,
            nonce_authority,
            ..
        } => {
            let address = created.ok_or_else(|| Error::Malformed("no nonce address".into()))?;
            if *lamports == 0 {
                return Err(Error::InvalidConfig("nonce account needs lamports".into()));
            }
            require_system(accounts, from)?;
            debit(accounts, from, *lamports)?;
            create(
                accounts,
                address,
                AccountState {
                    lamports: *lamports,
                    data: AccountData::Nonce(NonceState {
                        authority: *nonce_authority,
                        nonce_value: initial_nonce_value(&address, blockhash),
                    }),
                },
            )
        }
        Instruction::DelegateStake {
            stake_account,
            vote_account,
            stake_authority,
        } => {
            match accounts.get(vote_account) {
                None => return Err(Error::AccountNotFound(*vote_account)),
                Some(AccountState {
                    data: AccountData::Vote { .. },
                    ..
                }) => {}
                Some(_) => {
                    return Err(Error::InvalidAccount {
                        account: *vote_account,
                        expected: "vote",
                    })
                }
            }
            let stake = stake_mut(accounts, stake_account)?;
            check_authority(stake_account, "stake authority", stake.stake_authority, *stake_authority)?;
            stake.status = StakeStatus::Delegated {
                vote_account: *vote_account,
            };
            Ok(())
        }
        Instruction::DeactivateStake {
            stake_account,
            stake_authority,
        } => {
            let stake = stake_mut(accounts, stake_account)?;
            check_authority(stake_account, "stake authority", stake.stake_authority, *stake_authority)?;
            match stake.status {
                StakeStatus::Delegated { vote_account } => {
                    stake.status = StakeStatus::Deactivated { vote_account };
                    Ok(())
                }
                _ => Err(Error::InvalidAccount {
                    account: *stake_account,
                    expected: "delegated stake",
                }),
            }
        }
        Instruction::AuthorizeStake {
            stake_account,
            authority,
            new_authority,
            role,
        } => {
            let stake = stake_mut(accounts, stake_account)?;
            match role {
                // The withdraw authority may also reassign the stake authority.
                StakeAuthorize::Staker => {
                    if *authority != stake.withdraw_authority {
                        check_authority(stake_account, role.role(), stake.stake_authority, *authority)?;
                    }
                    stake.stake_authority = *new_authority;
                }
                StakeAuthorize::Withdrawer => {
                    check_authority(stake_account, role.role(), stake.withdraw_authority, *authority)?;
                    stake.withdraw_authority = *new_authority;
                }
            }
            Ok(())
        }
        Instruction::WithdrawNonce {
            nonce_account,
            nonce_authority,
            to,
            lamports,
        } => {
            let nonce = nonce_mut(accounts, nonce_account)?;
            check_authority(nonce_account, "nonce authority", nonce.authority, *nonce_authority)?;
            debit(accounts, nonce_account, *lamports)?;
            let closed = accounts
                .get(nonce_account)
                .map(|a| a.lamports == 0)
                .unwrap_or(false);
            if closed {
                accounts.remove(nonce_account);
            }
            credit(accounts, to, *lamports)
        }
        Instruction::AuthorizeNonce {
            nonce_account,
            nonce_authority,
            new_authority,
        } => {
            let nonce = nonce_mut(accounts, nonce_account)?;
            check_authority(nonce_account, "nonce authority", nonce.authority, *nonce_authority)?;
            nonce.authority = *new_authority;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Intent;
    use crate::keys::{Keypair, Signer};

    fn cluster() -> LocalCluster {
        LocalCluster::new(ClusterConfig::default()).unwrap()
    }

    fn send(cluster: &LocalCluster, intent: Intent, signers: &[&Keypair]) -> Result<Signature> {
        let payer = signers[0].pubkey();
        let message = Message::new_with_blockhash(intent, payer, cluster.get_latest_blockhash()?);
        let mut tx = Transaction::new_unsigned(message);
        tx.try_sign(signers)?;
        cluster.send_transaction(&tx)
    }

    #[test]
    fn fee_saturates_for_huge_rates() {
        let cluster = LocalCluster::new(ClusterConfig {
            lamports_per_signature: u64::MAX,
            ..ClusterConfig::default()
        })
        .unwrap();
        let message = Message::new_with_blockhash(
            Intent::pay(Pubkey::new([7; 32]), Pubkey::new([9; 32]), 1),
            Pubkey::new([8; 32]),
            cluster.get_latest_blockhash().unwrap(),
        );
        assert_eq!(cluster.get_fee_for_message(&message).unwrap(), u64::MAX);
    }

    #[test]
    fn transfer_moves_lamports_and_charges_fee() {
        let cluster = cluster();
        let alice = Keypair::new();
        let bob = Pubkey::new([7; 32]);
        cluster.airdrop(&alice.pubkey(), 1_000_000).unwrap();

        send(&cluster, Intent::pay(alice.pubkey(), bob, 400_000), &[&alice]).unwrap();
        assert_eq!(cluster.get_balance(&bob).unwrap(), 400_000);
        assert_eq!(cluster.get_balance(&alice.pubkey()).unwrap(), 600_000 - 5_000);
    }

    #[test]
    fn failed_instruction_leaves_ledger_untouched() {
        let cluster = cluster();
        let alice = Keypair::new();
        cluster.airdrop(&alice.pubkey(), 100_000).unwrap();
        let intent = Intent::new(vec![
            Instruction::Transfer {
                from: alice.pubkey(),
                to: Pubkey::new([1; 32]),
                lamports: 10_000,
            },
            Instruction::Transfer {
                from: alice.pubkey(),
                to: Pubkey::new([2; 32]),
                lamports: 1_000_000,
            },
        ])
        .unwrap();
        let err = send(&cluster, intent, &[&alice]).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(cluster.get_balance(&alice.pubkey()).unwrap(), 100_000);
        assert!(matches!(
            cluster.get_account(&Pubkey::new([1; 32])),
            Err(Error::AccountNotFound(_))
        ));
    }

    #[test]
    fn stale_blockhash_is_rejected() {
        let config = ClusterConfig {
            max_recent_blockhashes: 2,
            ..Default::default()
        };
        let cluster = LocalCluster::new(config).unwrap();
        let alice = Keypair::new();
        cluster.airdrop(&alice.pubkey(), 100_000).unwrap();
        let old = cluster.get_latest_blockhash().unwrap();
        cluster.advance_slot();
        cluster.advance_slot();

        let message = Message::new_with_blockhash(
            Intent::pay(alice.pubkey(), Pubkey::new([1; 32]), 1),
            alice.pubkey(),
            old,
        );
        let mut tx = Transaction::new_unsigned(message);
        tx.try_sign(&[&alice]).unwrap();
        assert!(matches!(
            cluster.send_transaction(&tx),
            Err(Error::BlockhashExpired(_))
        ));
    }

    #[test]
    fn unfunded_fee_payer_is_rejected() {
        let cluster = cluster();
        let alice = Keypair::new();
        let err = send(&cluster, Intent::pay(alice.pubkey(), Pubkey::new([1; 32]), 0), &[&alice])
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { available: 0, .. }));
    }

    #[test]
    fn withdraw_authority_may_reassign_staker() {
        let cluster = cluster();
        let funder = Keypair::new();
        let staker = Keypair::new();
        let withdrawer = Keypair::new();
        cluster.airdrop(&funder.pubkey(), 10_000_000).unwrap();
        let intent = Intent::create_stake_account_with_seed(
            funder.pubkey(),
            funder.pubkey(),
            "stake-0",
            1_000_000,
            staker.pubkey(),
            withdrawer.pubkey(),
        )
        .unwrap();
        let stake = intent.instructions()[0].created_account().unwrap().unwrap();
        send(&cluster, intent, &[&funder]).unwrap();

        let new_staker = Pubkey::new([5; 32]);
        send(
            &cluster,
            Intent::authorize_stake(stake, withdrawer.pubkey(), new_staker, StakeAuthorize::Staker),
            &[&funder, &withdrawer],
        )
        .unwrap();
        let (_, state) = crate::rpc::get_stake_account(&cluster, &stake).unwrap();
        assert_eq!(state.stake_authority, new_staker);
        assert_eq!(state.withdraw_authority, withdrawer.pubkey());
    }

    #[test]
    fn staker_cannot_reassign_withdrawer() {
        let cluster = cluster();
        let funder = Keypair::new();
        let staker = Keypair::new();
        cluster.airdrop(&funder.pubkey(), 10_000_000).unwrap();
        let intent = Intent::create_stake_account_with_seed(
            funder.pubkey(),
            funder.pubkey(),
            "stake-1",
            1_000_000,
            staker.pubkey(),
            funder.pubkey(),
        )
        .unwrap();
        let stake = intent.instructions()[0].created_account().unwrap().unwrap();
        send(&cluster, intent, &[&funder]).unwrap();

        let err = send(
            &cluster,
            Intent::authorize_stake(
                stake,
                staker.pubkey(),
                staker.pubkey(),
                StakeAuthorize::Withdrawer,
            ),
            &[&funder, &staker],
        )
        .unwrap_err();
        assert!(matches!(err, Error::AuthorityMismatch { .. }));
    }

    #[test]
    fn split_copies_authorities() {
        let cluster = cluster();
        let funder = Keypair::new();
        cluster.airdrop(&funder.pubkey(), 10_000_000).unwrap();
        let intent = Intent::create_stake_account_with_seed(
            funder.pubkey(),
            funder.pubkey(),
            "source",
            5_000_000,
            funder.pubkey(),
            funder.pubkey(),
        )
        .unwrap();
        let source = intent.instructions()[0].created_account().unwrap().unwrap();
        send(&cluster, intent, &[&funder]).unwrap();

        let split = Intent::split_stake_with_seed(source, funder.pubkey(), funder.pubkey(), "baseline", 2_000_000)
            .unwrap();
        let target = split.instructions()[0].created_account().unwrap().unwrap();
        send(&cluster, split, &[&funder]).unwrap();

        assert_eq!(cluster.get_balance(&source).unwrap(), 3_000_000);
        let (lamports, state) = crate::rpc::get_stake_account(&cluster, &target).unwrap();
        assert_eq!(lamports, 2_000_000);
        assert_eq!(state.stake_authority, funder.pubkey());
    }

    #[test]
    fn delegating_to_unknown_vote_account_fails() {
        let cluster = cluster();
        let funder = Keypair::new();
        cluster.airdrop(&funder.pubkey(), 10_000_000).unwrap();
        let intent = Intent::create_stake_account_with_seed(
            funder.pubkey(),
            funder.pubkey(),
            "s",
            1_000_000,
            funder.pubkey(),
            funder.pubkey(),
        )
        .unwrap();
        let stake = intent.instructions()[0].created_account().unwrap().unwrap();
        send(&cluster, intent, &[&funder]).unwrap();

        let err = send(
            &cluster,
            Intent::delegate_stake(stake, Pubkey::new([42; 32]), funder.pubkey()),
            &[&funder],
        )
        .unwrap_err();
        assert!(matches!(err, Error::AccountNotFound(_)));
    }

    #[test]
    fn duplicate_vote_account_is_rejected() {
        let cluster = cluster();
        let vote = Pubkey::new([1; 32]);
        cluster.add_vote_account(&vote, &Pubkey::new([2; 32])).unwrap();
        assert!(matches!(
            cluster.add_vote_account(&vote, &Pubkey::new([2; 32])),
            Err(Error::AccountExists(_))
        ));
    }
}
