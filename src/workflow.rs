//! Offline stake/payment authorization as an explicit state machine.
//!
//! ```text
//! INTENT_BUILT -> NONCE_BOUND -> OFFLINE_SIGNED -> SUBMITTED -> CONFIRMED
//!                                                           \-> REJECTED(reason)
//! ```
//!
//! Each stage method checks the current stage and fails with
//! [`Error::InvalidStage`] when called out of order. A rejected authorization can be
//! [`restart`](Authorization::restart)ed from the stage its rejection reason allows.
use std::fmt;

use derive_builder::Builder;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::intent::Intent;
use crate::keys::Signer;
use crate::manifest::DetachedSignatureSet;
use crate::message::{Message, Transaction};
use crate::nonce::NonceProvider;
use crate::offline::build_and_sign;
use crate::rpc::ClusterRpc;
use crate::submit::{assemble, OnlineSubmitter};
use crate::types::{Hash, Pubkey, Signature};

/// Accounts every stage of one authorization works with.
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
#[builder(pattern = "owned")]
pub struct WorkflowConfig {
    pub fee_payer: Pubkey,
    pub nonce_account: Pubkey,
    pub nonce_authority: Pubkey,
}

impl WorkflowConfigBuilder {
    fn validate(&self) -> Result<()> {
        if self.fee_payer.is_none() {
            return Err(Error::InvalidConfig("fee_payer must be provided".into()));
        }
        if self.nonce_account.is_none() {
            return Err(Error::InvalidConfig("nonce_account must be provided".into()));
        }
        if self.nonce_authority.is_none() {
            return Err(Error::InvalidConfig(
                "nonce_authority must be provided".into(),
            ));
        }
        Ok(())
    }

    pub fn build_validated(self) -> Result<WorkflowConfig> {
        self.validate()?;
        self.build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

/// Why a submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    StaleNonce,
    MissingSignature,
    InsufficientFunds,
    Invalid,
}

impl Rejection {
    /// Maps a submit failure to a rejection. `None` for transient failures, which
    /// leave the outcome unknown.
    pub fn from_error(err: &Error) -> Option<Self> {
        match err {
            Error::NetworkError(_) => None,
            Error::NonceMismatch { .. } => Some(Rejection::StaleNonce),
            Error::IncompleteSignatures { .. }
            | Error::MissingAuthority { .. }
            | Error::InvalidSignature(_)
            | Error::UnexpectedSigner(_) => Some(Rejection::MissingSignature),
            Error::InsufficientFunds { .. } => Some(Rejection::InsufficientFunds),
            _ => Some(Rejection::Invalid),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Rejection::StaleNonce => "stale_nonce",
            Rejection::MissingSignature => "missing_sig",
            Rejection::InsufficientFunds => "insufficient_funds",
            Rejection::Invalid => "invalid",
        }
    }

    /// Stage [`Authorization::restart`] lands on, `None` when the rejection is final.
    pub fn restart_stage(&self) -> Option<&'static str> {
        match self {
            Rejection::StaleNonce => Some(Stage::INTENT_BUILT),
            Rejection::MissingSignature => Some(Stage::NONCE_BOUND),
            Rejection::InsufficientFunds => Some(Stage::OFFLINE_SIGNED),
            Rejection::Invalid => None,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    IntentBuilt,
    NonceBound,
    OfflineSigned,
    Submitted,
    Confirmed(Signature),
    Rejected(Rejection),
}

impl Stage {
    pub const INTENT_BUILT: &'static str = "INTENT_BUILT";
    pub const NONCE_BOUND: &'static str = "NONCE_BOUND";
    pub const OFFLINE_SIGNED: &'static str = "OFFLINE_SIGNED";
    pub const SUBMITTED: &'static str = "SUBMITTED";
    pub const CONFIRMED: &'static str = "CONFIRMED";
    pub const REJECTED: &'static str = "REJECTED";

    pub fn name(&self) -> &'static str {
        match self {
            Stage::IntentBuilt => Self::INTENT_BUILT,
            Stage::NonceBound => Self::NONCE_BOUND,
            Stage::OfflineSigned => Self::OFFLINE_SIGNED,
            Stage::Submitted => Self::SUBMITTED,
            Stage::Confirmed(_) => Self::CONFIRMED,
            Stage::Rejected(_) => Self::REJECTED,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Confirmed(_) | Stage::Rejected(_))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Rejected(reason) => write!(f, "REJECTED({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Authorization {
    config: WorkflowConfig,
    intent: Intent,
    stage: Stage,
    nonce_value: Option<Hash>,
    signatures: Option<DetachedSignatureSet>,
    transaction: Option<Transaction>,
}

impl Authorization {
    pub fn new(intent: Intent, config: WorkflowConfig) -> Self {
        Self {
            config,
            intent,
            stage: Stage::IntentBuilt,
            nonce_value: None,
            signatures: None,
            transaction: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn nonce_value(&self) -> Option<Hash> {
        self.nonce_value
    }

    pub fn signatures(&self) -> Option<&DetachedSignatureSet> {
        self.signatures.as_ref()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    fn expect_stage(&self, expected: &'static str) -> Result<()> {
        if self.stage.name() != expected {
            return Err(Error::InvalidStage {
                expected,
                found: self.stage.name(),
            });
        }
        Ok(())
    }

    /// Fetches the current nonce of the configured nonce account.
    pub fn bind_nonce<C: ClusterRpc + ?Sized>(
        &mut self,
        provider: &NonceProvider<'_, C>,
    ) -> Result<Hash> {
        self.expect_stage(Stage::INTENT_BUILT)?;
        let nonce_value = provider.get_current_nonce(&self.config.nonce_account)?;
        self.bind_nonce_value(nonce_value)?;
        Ok(nonce_value)
    }

    /// Binds a nonce value carried to an offline machine by hand.
    pub fn bind_nonce_value(&mut self, nonce_value: Hash) -> Result<()> {
        self.expect_stage(Stage::INTENT_BUILT)?;
        debug!("Bound nonce {}", nonce_value);
        self.nonce_value = Some(nonce_value);
        self.stage = Stage::NonceBound;
        Ok(())
    }

    /// Signs offline with `signer_keys`, merging with any signatures collected earlier.
    pub fn sign_offline<S: Signer + ?Sized>(
        &mut self,
        signer_keys: &[&S],
    ) -> Result<&DetachedSignatureSet> {
        self.expect_stage(Stage::NONCE_BOUND)?;
        let nonce_value = self.bound_nonce()?;
        let set = build_and_sign(
            &self.intent,
            nonce_value,
            &self.config.nonce_account,
            &self.config.nonce_authority,
            &self.config.fee_payer,
            signer_keys,
        )?;
        self.collect(set)
    }

    /// Attaches a manifest produced elsewhere, e.g. parsed from `--signer` pairs.
    ///
    /// May be called repeatedly to gather signatures from several offline machines.
    /// Every signature is checked against the bound message first; a bad one is
    /// refused and the stage does not change.
    pub fn attach_signatures(
        &mut self,
        signatures: DetachedSignatureSet,
    ) -> Result<&DetachedSignatureSet> {
        if !matches!(self.stage, Stage::NonceBound | Stage::OfflineSigned) {
            return Err(Error::InvalidStage {
                expected: Stage::NONCE_BOUND,
                found: self.stage.name(),
            });
        }
        let nonce_value = self.bound_nonce()?;
        if signatures.blockhash != nonce_value {
            return Err(Error::Malformed(format!(
                "signatures are bound to {}, workflow to nonce {}",
                signatures.blockhash, nonce_value
            )));
        }
        let mut scratch = Transaction::new_unsigned(Message::new_with_nonce(
            self.intent.clone(),
            self.config.fee_payer,
            self.config.nonce_account,
            self.config.nonce_authority,
            nonce_value,
        ));
        for (pubkey, signature) in &signatures.signers {
            scratch.add_signature(*pubkey, *signature)?;
        }
        self.collect(signatures)
    }

    fn collect(&mut self, set: DetachedSignatureSet) -> Result<&DetachedSignatureSet> {
        let blockhash = set.blockhash;
        let collected = self
            .signatures
            .get_or_insert_with(|| DetachedSignatureSet::new(blockhash));
        collected.merge(set)?;
        self.stage = Stage::OfflineSigned;
        Ok(collected)
    }

    fn bound_nonce(&self) -> Result<Hash> {
        self.nonce_value.ok_or(Error::InvalidStage {
            expected: Stage::NONCE_BOUND,
            found: self.stage.name(),
        })
    }

    /// Re-assembles the transaction with the fee payer and sends it.
    ///
    /// On a transient failure the workflow stays in `SUBMITTED`; call
    /// [`reconcile`](Self::reconcile) before anything else. If the transaction turns
    /// out to have been processed already, the workflow is `CONFIRMED` and the
    /// `AlreadyProcessed` error is still returned.
    pub fn submit<C: ClusterRpc + ?Sized, S: Signer + ?Sized>(
        &mut self,
        rpc: &C,
        fee_payer: &S,
    ) -> Result<Signature> {
        self.expect_stage(Stage::OFFLINE_SIGNED)?;
        if fee_payer.pubkey() != self.config.fee_payer {
            return Err(Error::MissingAuthority {
                role: "fee payer",
                pubkey: self.config.fee_payer,
            });
        }
        let nonce_value = self.bound_nonce()?;
        let signatures = self
            .signatures
            .clone()
            .unwrap_or_else(|| DetachedSignatureSet::new(nonce_value));
        let transaction = match assemble(
            &self.intent,
            nonce_value,
            &self.config.nonce_account,
            &self.config.nonce_authority,
            &signatures,
            fee_payer,
        ) {
            Ok(transaction) => transaction,
            Err(err) => return Err(self.reject(err)),
        };
        self.stage = Stage::Submitted;
        let outcome = OnlineSubmitter::new(rpc).send(&transaction);
        self.transaction = Some(transaction);
        self.settle(outcome)
    }

    /// Resolves a `SUBMITTED` workflow whose send outcome is unknown.
    pub fn reconcile<C: ClusterRpc + ?Sized>(&mut self, rpc: &C) -> Result<Signature> {
        self.expect_stage(Stage::SUBMITTED)?;
        let transaction = self.transaction.as_ref().ok_or(Error::InvalidStage {
            expected: Stage::SUBMITTED,
            found: Stage::OFFLINE_SIGNED,
        })?;
        let outcome = OnlineSubmitter::new(rpc).confirm_or_resubmit(transaction);
        self.settle(outcome)
    }

    fn settle(&mut self, outcome: Result<Signature>) -> Result<Signature> {
        match outcome {
            Ok(signature) => {
                info!("Authorization confirmed: {}", signature);
                self.stage = Stage::Confirmed(signature);
                Ok(signature)
            }
            Err(Error::AlreadyProcessed(signature)) => {
                info!("Authorization {} was already processed", signature);
                self.stage = Stage::Confirmed(signature);
                Err(Error::AlreadyProcessed(signature))
            }
            Err(err) if err.is_transient() => {
                warn!("Outcome unknown, reconcile before retrying: {}", err);
                Err(err)
            }
            Err(err) => Err(self.reject(err)),
        }
    }

    fn reject(&mut self, err: Error) -> Error {
        // a signature that failed verification is dropped so a corrected one can be attached
        if let Error::InvalidSignature(pubkey) | Error::UnexpectedSigner(pubkey) = &err {
            if let Some(set) = self.signatures.as_mut() {
                set.signers.remove(pubkey);
            }
        }
        if let Some(reason) = Rejection::from_error(&err) {
            warn!("Authorization rejected ({}): {}", reason, err);
            self.stage = Stage::Rejected(reason);
        }
        err
    }

    /// Rewinds a rejected workflow.
    ///
    /// - `stale_nonce`: back to `INTENT_BUILT`; bind a fresh nonce and sign again.
    /// - `missing_sig`: back to `NONCE_BOUND` with the valid signatures collected so
    ///   far; attach the missing or corrected ones.
    /// - `insufficient_funds`: back to `OFFLINE_SIGNED`; fund the fee payer and submit.
    /// - `invalid`: the intent itself must change, so this fails.
    pub fn restart(&mut self) -> Result<Stage> {
        let Stage::Rejected(reason) = self.stage else {
            return Err(Error::InvalidStage {
                expected: Stage::REJECTED,
                found: self.stage.name(),
            });
        };
        if reason == Rejection::Invalid {
            return Err(Error::InvalidStage {
                expected: "REJECTED(recoverable)",
                found: "REJECTED(invalid)",
            });
        }
        self.transaction = None;
        self.stage = match reason {
            Rejection::StaleNonce => {
                self.nonce_value = None;
                self.signatures = None;
                Stage::IntentBuilt
            }
            Rejection::MissingSignature => Stage::NonceBound,
            _ => Stage::OfflineSigned,
        };
        debug!("Restarted authorization at {}", self.stage);
        Ok(self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;

    fn config() -> WorkflowConfig {
        WorkflowConfigBuilder::default()
            .fee_payer(Pubkey::new([1; 32]))
            .nonce_account(Pubkey::new([2; 32]))
            .nonce_authority(Pubkey::new([3; 32]))
            .build_validated()
            .unwrap()
    }

    #[test]
    fn builder_requires_every_account() {
        let err = WorkflowConfigBuilder::default()
            .fee_payer(Pubkey::new([1; 32]))
            .nonce_account(Pubkey::new([2; 32]))
            .build_validated()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("nonce_authority")));
    }

    #[test]
    fn stages_must_run_in_order() {
        let intent = Intent::pay(Pubkey::new([4; 32]), Pubkey::new([5; 32]), 1);
        let mut auth = Authorization::new(intent, config());
        let err = auth.sign_offline::<Keypair>(&[]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStage {
                expected: "NONCE_BOUND",
                found: "INTENT_BUILT"
            }
        ));

        auth.bind_nonce_value(Hash::new([9; 32])).unwrap();
        assert!(auth.bind_nonce_value(Hash::new([9; 32])).is_err());
        assert_eq!(auth.stage(), Stage::NonceBound);
        assert!(matches!(auth.restart(), Err(Error::InvalidStage { .. })));
    }

    #[test]
    fn manifest_for_another_nonce_is_refused() {
        let intent = Intent::pay(Pubkey::new([4; 32]), Pubkey::new([5; 32]), 1);
        let mut auth = Authorization::new(intent, config());
        auth.bind_nonce_value(Hash::new([9; 32])).unwrap();
        let err = auth
            .attach_signatures(DetachedSignatureSet::new(Hash::new([8; 32])))
            .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
        assert_eq!(auth.stage(), Stage::NonceBound);
    }

    #[test]
    fn bad_signature_at_submit_can_be_replaced() {
        let sender = Pubkey::new([4; 32]);
        let intent = Intent::pay(sender, Pubkey::new([5; 32]), 1);
        let mut auth = Authorization::new(intent, config());
        auth.bind_nonce_value(Hash::new([9; 32])).unwrap();
        let mut set = DetachedSignatureSet::new(Hash::new([9; 32]));
        set.signers.insert(sender, Signature::new([1; 64]));
        auth.signatures = Some(set);
        auth.stage = Stage::OfflineSigned;

        let err = auth.reject(Error::InvalidSignature(sender));
        assert!(matches!(err, Error::InvalidSignature(k) if k == sender));
        assert_eq!(auth.stage(), Stage::Rejected(Rejection::MissingSignature));
        assert!(auth.signatures().unwrap().signers.is_empty());
        assert_eq!(auth.restart().unwrap(), Stage::NonceBound);
    }

    #[test]
    fn unverified_signature_is_not_attached() {
        let sender = Pubkey::new([4; 32]);
        let intent = Intent::pay(sender, Pubkey::new([5; 32]), 1);
        let mut auth = Authorization::new(intent, config());
        auth.bind_nonce_value(Hash::new([9; 32])).unwrap();
        let mut set = DetachedSignatureSet::new(Hash::new([9; 32]));
        set.signers.insert(sender, Signature::new([1; 64]));

        let err = auth.attach_signatures(set).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(k) if k == sender));
        assert_eq!(auth.stage(), Stage::NonceBound);
        assert!(auth.signatures().is_none());
    }

    #[test]
    fn rejection_classification() {
        assert_eq!(
            Rejection::from_error(&Error::NonceMismatch {
                supplied: Hash::default(),
                current: Hash::new([1; 32]),
            }),
            Some(Rejection::StaleNonce)
        );
        assert_eq!(
            Rejection::from_error(&Error::IncompleteSignatures { missing: vec![] }),
            Some(Rejection::MissingSignature)
        );
        assert_eq!(
            Rejection::from_error(&Error::NetworkError("timeout".into())),
            None
        );
        assert_eq!(
            Rejection::from_error(&Error::InvalidSignature(Pubkey::new([7; 32]))),
            Some(Rejection::MissingSignature)
        );
        assert_eq!(Rejection::StaleNonce.restart_stage(), Some("INTENT_BUILT"));
        assert_eq!(Rejection::MissingSignature.restart_stage(), Some("NONCE_BOUND"));
        assert_eq!(Rejection::InsufficientFunds.restart_stage(), Some("OFFLINE_SIGNED"));
        assert_eq!(Rejection::Invalid.restart_stage(), None);
        assert_eq!(
            Stage::Rejected(Rejection::MissingSignature).to_string(),
            "REJECTED(missing_sig)"
        );
    }
}
