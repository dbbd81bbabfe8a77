//! Offline signer.
//!
//! Nothing here takes an RPC handle: everything needed to sign (intent, nonce value,
//! nonce account, authorities and keys) is passed in, so this half of the workflow can
//! run on an air-gapped machine.
use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::intent::Intent;
use crate::keys::Signer;
use crate::manifest::DetachedSignatureSet;
use crate::message::Message;
use crate::types::{Hash, Pubkey};

/// Builds the durable-nonce message for `intent` and signs it with `signer_keys`.
///
/// The nonce authority and every authority the intent names must be among
/// `signer_keys`, otherwise this fails with [`Error::MissingAuthority`]. The fee payer
/// may be left out; it is then listed as absent and signs at submission time. Keys
/// that are not signers of the message fail with [`Error::UnexpectedSigner`].
///
/// Output is deterministic for identical inputs.
pub fn build_and_sign<S: Signer + ?Sized>(
    intent: &Intent,
    nonce_value: Hash,
    nonce_account: &Pubkey,
    nonce_authority: &Pubkey,
    fee_payer: &Pubkey,
    signer_keys: &[&S],
) -> Result<DetachedSignatureSet> {
    let message = Message::new_with_nonce(
        intent.clone(),
        *fee_payer,
        *nonce_account,
        *nonce_authority,
        nonce_value,
    );
    let keys = index_keys(&message, signer_keys)?;

    let authorities = std::iter::once((*nonce_authority, "nonce authority"))
        .chain(intent.required_signers());
    for (pubkey, role) in authorities {
        if !keys.contains_key(&pubkey) {
            return Err(Error::MissingAuthority { role, pubkey });
        }
    }

    let set = sign_message(&message, nonce_value, keys)?;
    info!(
        "Signed offline with {} key(s) against nonce {} ({} absent)",
        set.len(),
        nonce_value,
        set.absent.len()
    );
    Ok(set)
}

/// Like [`build_and_sign`], but signs with whatever subset of authorities is at hand.
///
/// Every required signer without a key is listed as absent, so the sets from several
/// machines can be [merged](DetachedSignatureSet::merge) before submission.
pub fn partial_sign<S: Signer + ?Sized>(
    intent: &Intent,
    nonce_value: Hash,
    nonce_account: &Pubkey,
    nonce_authority: &Pubkey,
    fee_payer: &Pubkey,
    signer_keys: &[&S],
) -> Result<DetachedSignatureSet> {
    let message = Message::new_with_nonce(
        intent.clone(),
        *fee_payer,
        *nonce_account,
        *nonce_authority,
        nonce_value,
    );
    let keys = index_keys(&message, signer_keys)?;
    let set = sign_message(&message, nonce_value, keys)?;
    debug!(
        "Partially signed with {} key(s), {} absent",
        set.len(),
        set.absent.len()
    );
    Ok(set)
}

fn index_keys<'k, S: Signer + ?Sized>(
    message: &Message,
    signer_keys: &[&'k S],
) -> Result<BTreeMap<Pubkey, &'k S>> {
    let mut keys = BTreeMap::new();
    for signer in signer_keys {
        let pubkey = signer.pubkey();
        if !message.is_signer(&pubkey) {
            return Err(Error::UnexpectedSigner(pubkey));
        }
        keys.insert(pubkey, *signer);
    }
    Ok(keys)
}

fn sign_message<S: Signer + ?Sized>(
    message: &Message,
    nonce_value: Hash,
    keys: BTreeMap<Pubkey, &S>,
) -> Result<DetachedSignatureSet> {
    let bytes = message.serialize()?;
    let mut set = DetachedSignatureSet::new(nonce_value);
    for (pubkey, signer) in keys {
        let signature = signer.try_sign_message(&bytes)?;
        debug!("Signed as {}", pubkey);
        set.signers.insert(pubkey, signature);
    }
    for (pubkey, _) in message.required_signers() {
        if !set.signers.contains_key(&pubkey) {
            set.absent.insert(pubkey);
        }
    }
    Ok(set)
}
