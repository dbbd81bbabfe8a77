use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::intent::Intent;
use crate::keys::Signer;
use crate::types::{Hash, Pubkey, Signature};

/// What keeps a transaction valid: a recent blockhash, or a durable nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Lifetime {
    RecentBlockhash {
        blockhash: Hash,
    },
    DurableNonce {
        nonce_account: Pubkey,
        nonce_authority: Pubkey,
        nonce_value: Hash,
    },
}

impl Lifetime {
    /// The value the signatures commit to.
    pub fn blockhash(&self) -> Hash {
        match self {
            Lifetime::RecentBlockhash { blockhash } => *blockhash,
            Lifetime::DurableNonce { nonce_value, .. } => *nonce_value,
        }
    }
}

/// An intent bound to a fee payer and a lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    fee_payer: Pubkey,
    lifetime: Lifetime,
    intent: Intent,
}

impl Message {
    pub fn new_with_nonce(
        intent: Intent,
        fee_payer: Pubkey,
        nonce_account: Pubkey,
        nonce_authority: Pubkey,
        nonce_value: Hash,
    ) -> Self {
        Self {
            fee_payer,
            lifetime: Lifetime::DurableNonce {
                nonce_account,
                nonce_authority,
                nonce_value,
            },
            intent,
        }
    }

    pub fn new_with_blockhash(intent: Intent, fee_payer: Pubkey, blockhash: Hash) -> Self {
        Self {
            fee_payer,
            lifetime: Lifetime::RecentBlockhash { blockhash },
            intent,
        }
    }

    pub fn fee_payer(&self) -> Pubkey {
        self.fee_payer
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn blockhash(&self) -> Hash {
        self.lifetime.blockhash()
    }

    /// Fee payer, then nonce authority, then instruction authorities; each key once.
    pub fn required_signers(&self) -> Vec<(Pubkey, &'static str)> {
        let mut out = vec![(self.fee_payer, "fee payer")];
        if let Lifetime::DurableNonce {
            nonce_authority, ..
        } = &self.lifetime
        {
            out.push((*nonce_authority, "nonce authority"));
        }
        for signer in self.intent.required_signers() {
            out.push(signer);
        }
        let mut seen = Vec::with_capacity(out.len());
        out.retain(|(key, _)| {
            if seen.contains(key) {
                false
            } else {
                seen.push(*key);
                true
            }
        });
        out
    }

    pub fn is_signer(&self, key: &Pubkey) -> bool {
        self.required_signers().iter().any(|(k, _)| k == key)
    }

    /// Canonical bytes covered by every signature.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A message with the signatures collected so far, keyed by signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    message: Message,
    signatures: BTreeMap<Pubkey, Signature>,
}

impl Transaction {
    pub fn new_unsigned(message: Message) -> Self {
        Self {
            message,
            signatures: BTreeMap::new(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn signatures(&self) -> &BTreeMap<Pubkey, Signature> {
        &self.signatures
    }

    /// The fee payer's signature, which identifies the transaction.
    pub fn signature(&self) -> Option<Signature> {
        self.signatures.get(&self.message.fee_payer).copied()
    }

    /// Signs with every given signer; each must be a required signer.
    pub fn try_sign<S: Signer + ?Sized>(&mut self, signers: &[&S]) -> Result<()> {
        let bytes = self.message.serialize()?;
        for signer in signers {
            let pubkey = signer.pubkey();
            if !self.message.is_signer(&pubkey) {
                return Err(Error::UnexpectedSigner(pubkey));
            }
            let signature = signer.try_sign_message(&bytes)?;
            self.signatures.insert(pubkey, signature);
        }
        Ok(())
    }

    /// Inserts a signature produced elsewhere after checking it against the message.
    pub fn add_signature(&mut self, pubkey: Pubkey, signature: Signature) -> Result<()> {
        if !self.message.is_signer(&pubkey) {
            return Err(Error::UnexpectedSigner(pubkey));
        }
        let bytes = self.message.serialize()?;
        if !pubkey.verify(&bytes, &signature) {
            return Err(Error::InvalidSignature(pubkey));
        }
        self.signatures.insert(pubkey, signature);
        Ok(())
    }

    pub fn missing_signers(&self) -> Vec<Pubkey> {
        self.message
            .required_signers()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| !self.signatures.contains_key(key))
            .collect()
    }

    /// Checks that the signature set is exactly the required set and every entry verifies.
    pub fn verify(&self) -> Result<()> {
        let bytes = self.message.serialize()?;
        for (pubkey, signature) in &self.signatures {
            if !self.message.is_signer(pubkey) {
                return Err(Error::UnexpectedSigner(*pubkey));
            }
            if !pubkey.verify(&bytes, signature) {
                return Err(Error::InvalidSignature(*pubkey));
            }
        }
        let missing = self.missing_signers();
        if !missing.is_empty() {
            return Err(Error::IncompleteSignatures { missing });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;

    fn fixture() -> (Keypair, Keypair, Keypair, Message) {
        let payer = Keypair::from_seed([1; 32]);
        let nonce_auth = Keypair::from_seed([2; 32]);
        let staker = Keypair::from_seed([3; 32]);
        let intent = Intent::delegate_stake(
            Pubkey::new([10; 32]),
            Pubkey::new([11; 32]),
            staker.pubkey(),
        );
        let message = Message::new_with_nonce(
            intent,
            payer.pubkey(),
            Pubkey::new([12; 32]),
            nonce_auth.pubkey(),
            Hash::new([13; 32]),
        );
        (payer, nonce_auth, staker, message)
    }

    #[test]
    fn required_signers_order() {
        let (payer, nonce_auth, staker, message) = fixture();
        let keys: Vec<_> = message.required_signers().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![payer.pubkey(), nonce_auth.pubkey(), staker.pubkey()]);
    }

    #[test]
    fn shared_fee_payer_and_nonce_authority_sign_once() {
        let payer = Keypair::from_seed([1; 32]);
        let message = Message::new_with_nonce(
            Intent::pay(payer.pubkey(), Pubkey::new([5; 32]), 10),
            payer.pubkey(),
            Pubkey::new([12; 32]),
            payer.pubkey(),
            Hash::default(),
        );
        assert_eq!(message.required_signers().len(), 1);
    }

    #[test]
    fn fully_signed_transaction_verifies() {
        let (payer, nonce_auth, staker, message) = fixture();
        let mut tx = Transaction::new_unsigned(message);
        tx.try_sign(&[&payer, &nonce_auth, &staker]).unwrap();
        tx.verify().unwrap();
        assert_eq!(tx.signature(), tx.signatures().get(&payer.pubkey()).copied());
    }

    #[test]
    fn missing_signer_is_reported() {
        let (payer, nonce_auth, staker, message) = fixture();
        let mut tx = Transaction::new_unsigned(message);
        tx.try_sign(&[&payer, &nonce_auth]).unwrap();
        match tx.verify() {
            Err(Error::IncompleteSignatures { missing }) => {
                assert_eq!(missing, vec![staker.pubkey()])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stranger_cannot_sign() {
        let (_, _, _, message) = fixture();
        let stranger = Keypair::from_seed([99; 32]);
        let mut tx = Transaction::new_unsigned(message);
        assert!(matches!(
            tx.try_sign(&[&stranger]),
            Err(Error::UnexpectedSigner(_))
        ));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let (payer, _, staker, message) = fixture();
        let mut tx = Transaction::new_unsigned(message);
        let forged = payer.try_sign_message(b"something else").unwrap();
        assert!(matches!(
            tx.add_signature(staker.pubkey(), forged),
            Err(Error::InvalidSignature(_))
        ));
    }
}
