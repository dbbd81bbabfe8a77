//! Transaction intents: the unsigned semantic payload of an authorization.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{create_with_seed, NONCE_OWNER, STAKE_OWNER};
use crate::error::{Error, Result};
use crate::types::Pubkey;

/// Which stake account role an authorize instruction reassigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeAuthorize {
    Staker,
    Withdrawer,
}

impl StakeAuthorize {
    pub fn role(&self) -> &'static str {
        match self {
            StakeAuthorize::Staker => "stake authority",
            StakeAuthorize::Withdrawer => "withdraw authority",
        }
    }
}

impl fmt::Display for StakeAuthorize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StakeAuthorize::Staker => f.write_str("staker"),
            StakeAuthorize::Withdrawer => f.write_str("withdrawer"),
        }
    }
}

impl FromStr for StakeAuthorize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "staker" => Ok(StakeAuthorize::Staker),
            "withdrawer" => Ok(StakeAuthorize::Withdrawer),
            other => Err(Error::Malformed(format!(
                "unknown stake role `{other}`, expected staker or withdrawer"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    /// Moves lamports between two system accounts.
    Transfer {
        from: Pubkey,
        to: Pubkey,
        lamports: u64,
    },
    DelegateStake {
        stake_account: Pubkey,
        vote_account: Pubkey,
        stake_authority: Pubkey,
    },
    DeactivateStake {
        stake_account: Pubkey,
        stake_authority: Pubkey,
    },
    /// Reassigns one role of a stake account. The other role is never touched.
    AuthorizeStake {
        stake_account: Pubkey,
        authority: Pubkey,
        new_authority: Pubkey,
        role: StakeAuthorize,
    },
    CreateStakeAccountWithSeed {
        from: Pubkey,
        base: Pubkey,
        seed: String,
        lamports: u64,
        stake_authority: Pubkey,
        withdraw_authority: Pubkey,
    },
    /// Splits `lamports` off `source` into a new stake account derived from `base`.
    SplitStakeWithSeed {
        source: Pubkey,
        stake_authority: Pubkey,
        base: Pubkey,
        seed: String,
        lamports: u64,
    },
    CreateNonceAccountWithSeed {
        from: Pubkey,
        base: Pubkey,
        seed: String,
        lamports: u64,
        nonce_authority: Pubkey,
    },
    /// Withdraws from a nonce account; withdrawing the whole balance closes it.
    WithdrawNonce {
        nonce_account: Pubkey,
        nonce_authority: Pubkey,
        to: Pubkey,
        lamports: u64,
    },
    AuthorizeNonce {
        nonce_account: Pubkey,
        nonce_authority: Pubkey,
        new_authority: Pubkey,
    },
}

impl Instruction {
    /// Keys that must sign for this instruction, with the role each one plays.
    pub fn signers(&self) -> Vec<(Pubkey, &'static str)> {
        match self {
            Instruction::Transfer { from, .. } => vec![(*from, "sender")],
            Instruction::DelegateStake {
                stake_authority, ..
            }
            | Instruction::DeactivateStake {
                stake_authority, ..
            } => vec![(*stake_authority, "stake authority")],
            Instruction::AuthorizeStake {
                authority, role, ..
            } => vec![(*authority, role.role())],
            Instruction::CreateStakeAccountWithSeed { from, base, .. }
            | Instruction::CreateNonceAccountWithSeed { from, base, .. } => {
                vec![(*from, "funding account"), (*base, "base account")]
            }
            Instruction::SplitStakeWithSeed {
                stake_authority,
                base,
                ..
            } => vec![(*stake_authority, "stake authority"), (*base, "base account")],
            Instruction::WithdrawNonce {
                nonce_authority, ..
            }
            | Instruction::AuthorizeNonce {
                nonce_authority, ..
            } => vec![(*nonce_authority, "nonce authority")],
        }
    }

    /// Address of the account this instruction creates, if any.
    pub fn created_account(&self) -> Result<Option<Pubkey>> {
        match self {
            Instruction::CreateStakeAccountWithSeed { base, seed, .. }
            | Instruction::SplitStakeWithSeed { base, seed, .. } => {
                create_with_seed(base, seed, STAKE_OWNER).map(Some)
            }
            Instruction::CreateNonceAccountWithSeed { base, seed, .. } => {
                create_with_seed(base, seed, NONCE_OWNER).map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// An immutable list of instructions that together form one authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    instructions: Vec<Instruction>,
}

impl Intent {
    pub fn new(instructions: Vec<Instruction>) -> Result<Self> {
        if instructions.is_empty() {
            return Err(Error::InvalidConfig(
                "intent needs at least one instruction".into(),
            ));
        }
        for ix in &instructions {
            ix.created_account()?;
        }
        Ok(Self { instructions })
    }

    fn single(instruction: Instruction) -> Self {
        Self {
            instructions: vec![instruction],
        }
    }

    pub fn pay(from: Pubkey, to: Pubkey, lamports: u64) -> Self {
        Self::single(Instruction::Transfer { from, to, lamports })
    }

    pub fn delegate_stake(stake_account: Pubkey, vote_account: Pubkey, stake_authority: Pubkey) -> Self {
        Self::single(Instruction::DelegateStake {
            stake_account,
            vote_account,
            stake_authority,
        })
    }

    pub fn deactivate_stake(stake_account: Pubkey, stake_authority: Pubkey) -> Self {
        Self::single(Instruction::DeactivateStake {
            stake_account,
            stake_authority,
        })
    }

    pub fn authorize_stake(
        stake_account: Pubkey,
        authority: Pubkey,
        new_authority: Pubkey,
        role: StakeAuthorize,
    ) -> Self {
        Self::single(Instruction::AuthorizeStake {
            stake_account,
            authority,
            new_authority,
            role,
        })
    }

    pub fn create_stake_account_with_seed(
        from: Pubkey,
        base: Pubkey,
        seed: &str,
        lamports: u64,
        stake_authority: Pubkey,
        withdraw_authority: Pubkey,
    ) -> Result<Self> {
        Self::new(vec![Instruction::CreateStakeAccountWithSeed {
            from,
            base,
            seed: seed.to_owned(),
            lamports,
            stake_authority,
            withdraw_authority,
        }])
    }

    pub fn split_stake_with_seed(
        source: Pubkey,
        stake_authority: Pubkey,
        base: Pubkey,
        seed: &str,
        lamports: u64,
    ) -> Result<Self> {
        Self::new(vec![Instruction::SplitStakeWithSeed {
            source,
            stake_authority,
            base,
            seed: seed.to_owned(),
            lamports,
        }])
    }

    pub fn withdraw_nonce(nonce_account: Pubkey, nonce_authority: Pubkey, to: Pubkey, lamports: u64) -> Self {
        Self::single(Instruction::WithdrawNonce {
            nonce_account,
            nonce_authority,
            to,
            lamports,
        })
    }

    pub fn authorize_nonce(nonce_account: Pubkey, nonce_authority: Pubkey, new_authority: Pubkey) -> Self {
        Self::single(Instruction::AuthorizeNonce {
            nonce_account,
            nonce_authority,
            new_authority,
        })
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Authority signers required by the instructions, first-seen order, no duplicates.
    pub fn required_signers(&self) -> Vec<(Pubkey, &'static str)> {
        let mut out: Vec<(Pubkey, &'static str)> = Vec::new();
        for (key, role) in self.instructions.iter().flat_map(|ix| ix.signers()) {
            if !out.iter().any(|(k, _)| *k == key) {
                out.push((key, role));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> Pubkey {
        Pubkey::new([b; 32])
    }

    #[test]
    fn authorize_requires_the_named_authority() {
        let intent = Intent::authorize_stake(key(1), key(2), key(3), StakeAuthorize::Withdrawer);
        assert_eq!(
            intent.required_signers(),
            vec![(key(2), "withdraw authority")]
        );
    }

    #[test]
    fn required_signers_are_deduplicated() {
        let intent = Intent::new(vec![
            Instruction::DelegateStake {
                stake_account: key(1),
                vote_account: key(2),
                stake_authority: key(9),
            },
            Instruction::DeactivateStake {
                stake_account: key(4),
                stake_authority: key(9),
            },
            Instruction::Transfer {
                from: key(5),
                to: key(6),
                lamports: 1,
            },
        ])
        .unwrap();
        let keys: Vec<_> = intent.required_signers().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![key(9), key(5)]);
    }

    #[test]
    fn empty_intent_is_rejected() {
        assert!(matches!(Intent::new(vec![]), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn oversized_seed_is_rejected_up_front() {
        let seed = "s".repeat(40);
        assert!(Intent::create_stake_account_with_seed(key(1), key(1), &seed, 10, key(1), key(1)).is_err());
    }

    #[test]
    fn stake_role_parses() {
        assert_eq!("staker".parse::<StakeAuthorize>().unwrap(), StakeAuthorize::Staker);
        assert!("voter".parse::<StakeAuthorize>().is_err());
    }
}
