//! Key management boundary.
//!
//! Workflow stages only ever see [`Signer`]: something that can name its public key and
//! sign bytes. Raw secret material stays inside [`Keypair`] or behind a [`KeyService`].
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Pubkey, Signature};

pub trait Signer {
    fn pubkey(&self) -> Pubkey;
    fn try_sign_message(&self, message: &[u8]) -> Result<Signature>;
}

/// Ed25519 keypair. `Debug` shows only the public key.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn new() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }
}

impl Default for Keypair {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("pubkey", &self.pubkey())
            .finish_non_exhaustive()
    }
}

impl Signer for Keypair {
    fn pubkey(&self) -> Pubkey {
        Pubkey::new(self.signing.verifying_key().to_bytes())
    }

    fn try_sign_message(&self, message: &[u8]) -> Result<Signature> {
        Ok(self.signing.sign(message).into())
    }
}

impl<T: Signer + ?Sized> Signer for &T {
    fn pubkey(&self) -> Pubkey {
        (**self).pubkey()
    }

    fn try_sign_message(&self, message: &[u8]) -> Result<Signature> {
        (**self).try_sign_message(message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKeypair {
    public_key: String,
    secret_key: String,
}

pub fn write_keypair_file(path: &Path, keypair: &Keypair) -> Result<()> {
    let stored = StoredKeypair {
        public_key: keypair.pubkey().to_string(),
        secret_key: hex::encode(keypair.signing.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| Error::Keystore(format!("failed to encode keypair: {err}")))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encoded)?;
    Ok(())
}

pub fn read_keypair_file(path: &Path) -> Result<Keypair> {
    let raw = fs::read_to_string(path)
        .map_err(|err| Error::Keystore(format!("{}: {err}", path.display())))?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| Error::Keystore(format!("failed to decode keypair: {err}")))?;
    let secret: [u8; 32] = hex::decode(&stored.secret_key)
        .map_err(|err| Error::Keystore(format!("invalid secret key encoding: {err}")))?
        .try_into()
        .map_err(|_| Error::Keystore("secret key must be 32 bytes".into()))?;
    let keypair = Keypair::from_seed(secret);
    let public: Pubkey = stored
        .public_key
        .parse()
        .map_err(|err| Error::Keystore(format!("invalid public key: {err}")))?;
    if keypair.pubkey() != public {
        return Err(Error::Keystore(
            "public key does not match secret key".into(),
        ));
    }
    Ok(keypair)
}

/// Opaque reference to a key held by a [`KeyService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(u64);

pub trait KeyService: Send + Sync {
    fn generate_keypair(&self) -> Result<(Pubkey, KeyHandle)>;
    fn pubkey(&self, handle: KeyHandle) -> Result<Pubkey>;
    fn sign(&self, handle: KeyHandle, message: &[u8]) -> Result<Signature>;
}

/// Process-local key service. Keys never leave the service once imported.
#[derive(Debug, Default)]
pub struct InMemoryKeyService {
    next: AtomicU64,
    keys: RwLock<HashMap<u64, Keypair>>,
}

impl InMemoryKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn import(&self, keypair: Keypair) -> (Pubkey, KeyHandle) {
        let pubkey = keypair.pubkey();
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.keys
            .write()
            .expect("key store lock poisoned")
            .insert(id, keypair);
        (pubkey, KeyHandle(id))
    }

    /// Adapts a handle into a [`Signer`] for workflow stages.
    pub fn signer(&self, handle: KeyHandle) -> Result<ServiceSigner<'_, Self>> {
        ServiceSigner::new(self, handle)
    }
}

impl KeyService for InMemoryKeyService {
    fn generate_keypair(&self) -> Result<(Pubkey, KeyHandle)> {
        Ok(self.import(Keypair::new()))
    }

    fn pubkey(&self, handle: KeyHandle) -> Result<Pubkey> {
        self.keys
            .read()
            .expect("key store lock poisoned")
            .get(&handle.0)
            .map(Signer::pubkey)
            .ok_or_else(|| Error::Keystore(format!("unknown key handle {}", handle.0)))
    }

    fn sign(&self, handle: KeyHandle, message: &[u8]) -> Result<Signature> {
        let keys = self.keys.read().expect("key store lock poisoned");
        let keypair = keys
            .get(&handle.0)
            .ok_or_else(|| Error::Keystore(format!("unknown key handle {}", handle.0)))?;
        keypair.try_sign_message(message)
    }
}

/// A [`Signer`] backed by a key service handle.
#[derive(Debug)]
pub struct ServiceSigner<'a, K: KeyService + ?Sized> {
    service: &'a K,
    handle: KeyHandle,
    pubkey: Pubkey,
}

impl<'a, K: KeyService + ?Sized> ServiceSigner<'a, K> {
    pub fn new(service: &'a K, handle: KeyHandle) -> Result<Self> {
        let pubkey = service.pubkey(handle)?;
        Ok(Self {
            service,
            handle,
            pubkey,
        })
    }
}

impl<K: KeyService + ?Sized> Signer for ServiceSigner<'_, K> {
    fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    fn try_sign_message(&self, message: &[u8]) -> Result<Signature> {
        self.service.sign(self.handle, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_signatures_verify() {
        let kp = Keypair::from_seed([4; 32]);
        let sig = kp.try_sign_message(b"hello").unwrap();
        assert!(kp.pubkey().verify(b"hello", &sig));
        assert!(!kp.pubkey().verify(b"other", &sig));
    }

    #[test]
    fn signing_is_deterministic() {
        let kp = Keypair::from_seed([4; 32]);
        assert_eq!(
            kp.try_sign_message(b"m").unwrap(),
            kp.try_sign_message(b"m").unwrap()
        );
    }

    #[test]
    fn debug_hides_secret() {
        let kp = Keypair::from_seed([4; 32]);
        let shown = format!("{kp:?}");
        assert!(shown.contains(&kp.pubkey().to_string()));
        assert!(!shown.contains(&hex::encode([4u8; 32])));
    }

    #[test]
    fn keypair_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("id.toml");
        let kp = Keypair::new();
        write_keypair_file(&path, &kp).unwrap();
        let loaded = read_keypair_file(&path).unwrap();
        assert_eq!(loaded.pubkey(), kp.pubkey());
    }

    #[test]
    fn tampered_keypair_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.toml");
        write_keypair_file(&path, &Keypair::from_seed([1; 32])).unwrap();
        let other = Keypair::from_seed([2; 32]).pubkey().to_string();
        let raw = fs::read_to_string(&path).unwrap();
        let stored: StoredKeypair = toml::from_str(&raw).unwrap();
        fs::write(&path, raw.replace(&stored.public_key, &other)).unwrap();
        assert!(matches!(read_keypair_file(&path), Err(Error::Keystore(_))));
    }

    #[test]
    fn key_service_signs_through_handles() {
        let service = InMemoryKeyService::new();
        let (pubkey, handle) = service.generate_keypair().unwrap();
        let signer = service.signer(handle).unwrap();
        assert_eq!(signer.pubkey(), pubkey);
        let sig = signer.try_sign_message(b"payload").unwrap();
        assert!(pubkey.verify(b"payload", &sig));
    }

    #[test]
    fn unknown_handle_is_an_error() {
        let service = InMemoryKeyService::new();
        assert!(matches!(
            service.sign(KeyHandle(42), b"x"),
            Err(Error::Keystore(_))
        ));
    }
}
