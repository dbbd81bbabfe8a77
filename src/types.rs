use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Converts SOL to lamports, rounding toward zero.
///
/// `None` for negative, non-finite or out-of-range amounts.
pub fn sol_to_lamports(sol: f64) -> Option<u64> {
    if !sol.is_finite() || sol < 0.0 {
        return None;
    }
    let lamports = sol * LAMPORTS_PER_SOL as f64;
    if lamports >= u64::MAX as f64 {
        return None;
    }
    Some(lamports as u64)
}

/// Converts lamports to SOL for display.
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], ParseError> {
    let bytes = hex::decode(s.trim()).map_err(|e| ParseError::Hex(e.to_string()))?;
    let found = bytes.len();
    bytes.try_into().map_err(|_| ParseError::Length {
        expected: N,
        found,
    })
}

// Fixed-size byte newtypes shown and parsed as lowercase hex.
macro_rules! hex_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn to_bytes(&self) -> [u8; $len] {
                self.0
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; $len])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_fixed::<$len>(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_bytes!(
    /// Ed25519 public key identifying an account or a signer.
    Pubkey,
    32
);

hex_bytes!(
    /// 32-byte digest. Used for recent blockhashes and durable nonce values.
    Hash,
    32
);

hex_bytes!(
    /// Ed25519 signature over a message's canonical bytes.
    Signature,
    64
);

impl From<ed25519_dalek::Signature> for Signature {
    fn from(sig: ed25519_dalek::Signature) -> Self {
        Self(sig.to_bytes())
    }
}

impl From<&Signature> for ed25519_dalek::Signature {
    fn from(sig: &Signature) -> Self {
        ed25519_dalek::Signature::from_bytes(&sig.0)
    }
}

impl Pubkey {
    /// Verifies `signature` over `message` under this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        use ed25519_dalek::Verifier;
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        key.verify(message, &signature.into()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubkey_hex_round_trip() {
        let key = Pubkey::new([0xab; 32]);
        let text = key.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<Pubkey>().unwrap(), key);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = "abcd".parse::<Hash>().unwrap_err();
        assert_eq!(
            err,
            ParseError::Length {
                expected: 32,
                found: 2
            }
        );
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(
            "zz".parse::<Signature>(),
            Err(ParseError::Hex(_))
        ));
    }

    #[test]
    fn serde_uses_hex_strings() {
        let hash = Hash::new([7; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn lamport_conversions() {
        assert_eq!(sol_to_lamports(1.5), Some(1_500_000_000));
        assert_eq!(sol_to_lamports(0.0), Some(0));
        assert_eq!(sol_to_lamports(-5.0), None);
        assert_eq!(sol_to_lamports(f64::NAN), None);
        assert_eq!(sol_to_lamports(f64::INFINITY), None);
        assert_eq!(sol_to_lamports(1e12), None);
        assert_eq!(lamports_to_sol(2_500_000_000), 2.5);
    }
}
