//! Detached signature sets and their text form.
//!
//! The set is the only artifact that crosses the air gap. Text layout:
//!
//! ```text
//! Blockhash: <hex>
//! Signers (Pubkey=Signature):
//!   <pubkey>=<signature>
//! Absent Signers (Pubkey):
//!   <pubkey>
//! ```
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ParseError, Result};
use crate::types::{Hash, Pubkey, Signature};

const BLOCKHASH_PREFIX: &str = "Blockhash:";
const SIGNERS_HEADER: &str = "Signers (Pubkey=Signature):";
const ABSENT_HEADER: &str = "Absent Signers (Pubkey):";

/// One `<pubkey>=<signature>` pair, as passed to `--signer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignerPair {
    pub pubkey: Pubkey,
    pub signature: Signature,
}

impl FromStr for SignerPair {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (pubkey, signature) = s
            .trim()
            .split_once('=')
            .ok_or_else(|| ParseError::SignerPair(s.to_owned()))?;
        Ok(Self {
            pubkey: pubkey.parse()?,
            signature: signature.parse()?,
        })
    }
}

impl fmt::Display for SignerPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.pubkey, self.signature)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedSignatureSet {
    pub blockhash: Hash,
    pub signers: BTreeMap<Pubkey, Signature>,
    #[serde(default)]
    pub absent: BTreeSet<Pubkey>,
}

impl DetachedSignatureSet {
    pub fn new(blockhash: Hash) -> Self {
        Self {
            blockhash,
            ..Default::default()
        }
    }

    /// Builds a set from `--signer` pairs collected on the submit side.
    pub fn from_pairs(blockhash: Hash, pairs: impl IntoIterator<Item = SignerPair>) -> Self {
        let mut set = Self::new(blockhash);
        for pair in pairs {
            set.signers.insert(pair.pubkey, pair.signature);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = SignerPair> + '_ {
        self.signers.iter().map(|(pubkey, signature)| SignerPair {
            pubkey: *pubkey,
            signature: *signature,
        })
    }

    /// Folds another offline machine's signatures into this set.
    ///
    /// Both sets must be bound to the same blockhash, and a key may not carry two
    /// different signatures.
    pub fn merge(&mut self, other: DetachedSignatureSet) -> Result<()> {
        if other.blockhash != self.blockhash {
            return Err(Error::Malformed(format!(
                "cannot merge signatures for blockhash {} into set for {}",
                other.blockhash, self.blockhash
            )));
        }
        // nothing is inserted unless the whole set is compatible
        if let Some(pubkey) = other
            .signers
            .iter()
            .find(|(pubkey, signature)| {
                self.signers
                    .get(*pubkey)
                    .is_some_and(|existing| existing != *signature)
            })
            .map(|(pubkey, _)| *pubkey)
        {
            return Err(Error::Malformed(format!(
                "conflicting signatures for {pubkey}"
            )));
        }
        self.signers.extend(other.signers);
        self.absent.extend(other.absent);
        let signed: Vec<Pubkey> = self.signers.keys().copied().collect();
        for key in signed {
            self.absent.remove(&key);
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl fmt::Display for DetachedSignatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{BLOCKHASH_PREFIX} {}", self.blockhash)?;
        if !self.signers.is_empty() {
            writeln!(f, "{SIGNERS_HEADER}")?;
            for pair in self.pairs() {
                writeln!(f, "  {pair}")?;
            }
        }
        if !self.absent.is_empty() {
            writeln!(f, "{ABSENT_HEADER}")?;
            for key in &self.absent {
                writeln!(f, "  {key}")?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Section {
    Preamble,
    Signers,
    Absent,
}

impl FromStr for DetachedSignatureSet {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut blockhash = None;
        let mut set = DetachedSignatureSet::default();
        let mut section = Section::Preamble;

        for (idx, raw) in s.lines().enumerate() {
            let line = raw.trim();
            let fail = |reason: String| ParseError::Manifest {
                line: idx + 1,
                reason,
            };
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix(BLOCKHASH_PREFIX) {
                if blockhash.is_some() {
                    return Err(fail("duplicate blockhash".into()));
                }
                blockhash = Some(
                    rest.trim()
                        .parse::<Hash>()
                        .map_err(|e| fail(e.to_string()))?,
                );
                continue;
            }
            if line == SIGNERS_HEADER {
                section = Section::Signers;
                continue;
            }
            if line == ABSENT_HEADER {
                section = Section::Absent;
                continue;
            }
            match section {
                Section::Preamble => return Err(fail(format!("unexpected line `{line}`"))),
                Section::Signers => {
                    let pair = line
                        .parse::<SignerPair>()
                        .map_err(|e| fail(e.to_string()))?;
                    if set.signers.insert(pair.pubkey, pair.signature).is_some() {
                        return Err(fail(format!("duplicate signer {}", pair.pubkey)));
                    }
                }
                Section::Absent => {
                    let key = line
                        .parse::<Pubkey>()
                        .map_err(|e| fail(e.to_string()))?;
                    set.absent.insert(key);
                }
            }
        }

        set.blockhash = blockhash.ok_or(ParseError::Manifest {
            line: 0,
            reason: "missing blockhash".into(),
        })?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DetachedSignatureSet {
        let mut set = DetachedSignatureSet::new(Hash::new([1; 32]));
        set.signers
            .insert(Pubkey::new([2; 32]), Signature::new([3; 64]));
        set.signers
            .insert(Pubkey::new([4; 32]), Signature::new([5; 64]));
        set.absent.insert(Pubkey::new([6; 32]));
        set
    }

    #[test]
    fn text_form_parses_back() {
        let set = sample();
        let text = set.to_string();
        assert!(text.starts_with("Blockhash: "));
        assert_eq!(text.parse::<DetachedSignatureSet>().unwrap(), set);
    }

    #[test]
    fn parser_tolerates_surrounding_whitespace() {
        let set = sample();
        let text = format!("\n\n{}\n   \n", set.to_string().replace("  ", "\t"));
        assert_eq!(text.parse::<DetachedSignatureSet>().unwrap(), set);
    }

    #[test]
    fn missing_blockhash_is_an_error() {
        let text = format!("{SIGNERS_HEADER}\n  {}={}\n", Pubkey::default(), Signature::default());
        assert!(matches!(
            text.parse::<DetachedSignatureSet>(),
            Err(ParseError::Manifest { line: 0, .. })
        ));
    }

    #[test]
    fn garbage_signer_line_reports_its_line() {
        let text = format!("{BLOCKHASH_PREFIX} {}\n{SIGNERS_HEADER}\n  nope\n", Hash::default());
        match text.parse::<DetachedSignatureSet>() {
            Err(ParseError::Manifest { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn signer_pair_parses() {
        let pair: SignerPair = format!("{}={}", Pubkey::new([8; 32]), Signature::new([9; 64]))
            .parse()
            .unwrap();
        assert_eq!(pair.pubkey, Pubkey::new([8; 32]));
        assert!("abc".parse::<SignerPair>().is_err());
    }

    #[test]
    fn merge_combines_and_clears_absent() {
        let mut first = DetachedSignatureSet::new(Hash::new([1; 32]));
        first.signers.insert(Pubkey::new([2; 32]), Signature::new([3; 64]));
        first.absent.insert(Pubkey::new([4; 32]));
        let mut second = DetachedSignatureSet::new(Hash::new([1; 32]));
        second.signers.insert(Pubkey::new([4; 32]), Signature::new([5; 64]));
        second.absent.insert(Pubkey::new([2; 32]));

        first.merge(second).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.absent.is_empty());
    }

    #[test]
    fn merge_rejects_other_blockhash_and_conflicts() {
        let mut first = sample();
        assert!(first.merge(DetachedSignatureSet::new(Hash::new([9; 32]))).is_err());

        let mut conflicting = DetachedSignatureSet::new(first.blockhash);
        conflicting
            .signers
            .insert(Pubkey::new([2; 32]), Signature::new([7; 64]));
        assert!(matches!(first.merge(conflicting), Err(Error::Malformed(_))));
    }

    #[test]
    fn failed_merge_leaves_set_untouched() {
        let mut first = DetachedSignatureSet::new(Hash::new([1; 32]));
        first.signers.insert(Pubkey::new([5; 32]), Signature::new([5; 64]));
        first.absent.insert(Pubkey::new([6; 32]));
        let before = first.clone();

        let mut second = DetachedSignatureSet::new(Hash::new([1; 32]));
        second.signers.insert(Pubkey::new([2; 32]), Signature::new([2; 64]));
        second.signers.insert(Pubkey::new([5; 32]), Signature::new([6; 64]));
        second.absent.insert(Pubkey::new([7; 32]));

        assert!(matches!(first.merge(second), Err(Error::Malformed(_))));
        assert_eq!(first, before);
    }

    #[test]
    fn json_form_round_trips() {
        let set = sample();
        assert_eq!(DetachedSignatureSet::from_json(&set.to_json().unwrap()).unwrap(), set);
    }
}
