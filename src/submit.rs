//! Online submitter: re-assembles a detached signature set with the fee payer and
//! broadcasts the transaction.
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::intent::Intent;
use crate::keys::Signer;
use crate::manifest::DetachedSignatureSet;
use crate::message::{Lifetime, Message, Transaction};
use crate::rpc::{get_nonce_account, ClusterRpc};
use crate::types::{lamports_to_sol, Hash, Pubkey, Signature};

pub struct OnlineSubmitter<'a, C: ClusterRpc + ?Sized> {
    rpc: &'a C,
}

impl<'a, C: ClusterRpc + ?Sized> OnlineSubmitter<'a, C> {
    pub fn new(rpc: &'a C) -> Self {
        Self { rpc }
    }

    /// Rebuilds the transaction the offline signer signed, attaches its signatures
    /// and the fee payer's, and sends it.
    ///
    /// Offline checks run first (signatures verify, none missing), then the cluster
    /// checks: not already processed, nonce still current, fee covered.
    pub fn submit<S: Signer + ?Sized>(
        &self,
        intent: &Intent,
        nonce_value: Hash,
        nonce_account: &Pubkey,
        nonce_authority: &Pubkey,
        signatures: &DetachedSignatureSet,
        fee_payer: &S,
    ) -> Result<Signature> {
        let transaction = assemble(
            intent,
            nonce_value,
            nonce_account,
            nonce_authority,
            signatures,
            fee_payer,
        )?;
        self.send(&transaction)
    }

    /// Checks a fully signed transaction against current cluster state, then sends it.
    pub fn send(&self, transaction: &Transaction) -> Result<Signature> {
        let signature = self.preflight(transaction)?;
        debug!("Sending transaction {}", signature);
        let sent = self.rpc.send_transaction(transaction)?;
        info!("Transaction {} confirmed", sent);
        Ok(sent)
    }

    /// Validates `transaction` against the cluster without sending it.
    pub fn preflight(&self, transaction: &Transaction) -> Result<Signature> {
        transaction.verify()?;
        let message = transaction.message();
        let signature = transaction
            .signature()
            .ok_or_else(|| Error::IncompleteSignatures {
                missing: vec![message.fee_payer()],
            })?;

        if self.rpc.get_signature_status(&signature)?.is_some() {
            return Err(Error::AlreadyProcessed(signature));
        }
        self.check_nonce(message)?;

        let fee = self.rpc.get_fee_for_message(message)?;
        let balance = self.rpc.get_balance(&message.fee_payer())?;
        debug!(
            "Fee payer balance {} SOL, fee {} SOL",
            lamports_to_sol(balance),
            lamports_to_sol(fee)
        );
        if balance < fee {
            return Err(Error::InsufficientFunds {
                account: message.fee_payer(),
                required: fee,
                available: balance,
            });
        }
        Ok(signature)
    }

    /// Recovers from a send whose outcome is unknown.
    ///
    /// Looks the transaction up by signature first; if it landed, its signature is
    /// returned without resending. Otherwise the nonce is re-validated before the one
    /// resend, so a transaction whose nonce moved on fails `NonceMismatch` instead of
    /// being sent blind.
    pub fn confirm_or_resubmit(&self, transaction: &Transaction) -> Result<Signature> {
        let signature = transaction
            .signature()
            .ok_or_else(|| Error::IncompleteSignatures {
                missing: vec![transaction.message().fee_payer()],
            })?;
        if let Some(status) = self.rpc.get_signature_status(&signature)? {
            info!(
                "Transaction {} already landed in slot {}",
                signature, status.slot
            );
            return Ok(signature);
        }
        warn!("Transaction {} not found, resubmitting", signature);
        self.send(transaction)
    }

    fn check_nonce(&self, message: &Message) -> Result<()> {
        let Lifetime::DurableNonce {
            nonce_account,
            nonce_authority,
            nonce_value,
        } = message.lifetime()
        else {
            return Ok(());
        };
        let (_, state) = get_nonce_account(self.rpc, nonce_account)?;
        if state.authority != *nonce_authority {
            return Err(Error::AuthorityMismatch {
                account: *nonce_account,
                role: "nonce authority",
                expected: state.authority,
                provided: *nonce_authority,
            });
        }
        if state.nonce_value != *nonce_value {
            warn!(
                "Nonce {} moved on: signed against {}, current {}",
                nonce_account, nonce_value, state.nonce_value
            );
            return Err(Error::NonceMismatch {
                supplied: *nonce_value,
                current: state.nonce_value,
            });
        }
        Ok(())
    }
}

/// Rebuilds the signed message and attaches the detached and fee payer signatures.
///
/// Runs without network access; fails with [`Error::IncompleteSignatures`] if any
/// required signer is still missing afterwards.
pub fn assemble<S: Signer + ?Sized>(
    intent: &Intent,
    nonce_value: Hash,
    nonce_account: &Pubkey,
    nonce_authority: &Pubkey,
    signatures: &DetachedSignatureSet,
    fee_payer: &S,
) -> Result<Transaction> {
    if signatures.blockhash != nonce_value {
        return Err(Error::Malformed(format!(
            "signatures are bound to {}, not nonce {}",
            signatures.blockhash, nonce_value
        )));
    }
    let message = Message::new_with_nonce(
        intent.clone(),
        fee_payer.pubkey(),
        *nonce_account,
        *nonce_authority,
        nonce_value,
    );
    let mut transaction = Transaction::new_unsigned(message);
    for pair in signatures.pairs() {
        transaction.add_signature(pair.pubkey, pair.signature)?;
    }
    if transaction.signature().is_none() {
        transaction.try_sign(&[fee_payer])?;
    }
    let missing = transaction.missing_signers();
    if !missing.is_empty() {
        return Err(Error::IncompleteSignatures { missing });
    }
    Ok(transaction)
}
