//! Operator CLI configuration file.
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_LAMPORTS_PER_SIGNATURE: u64 = 5_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    /// Key used when a command does not name one explicitly.
    #[serde(default)]
    pub keypair_path: Option<PathBuf>,
    #[serde(default = "default_lamports_per_signature")]
    pub lamports_per_signature: u64,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./ledger.json")
}

fn default_lamports_per_signature() -> u64 {
    DEFAULT_LAMPORTS_PER_SIGNATURE
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            keypair_path: None,
            lamports_per_signature: default_lamports_per_signature(),
        }
    }
}

impl CliConfig {
    /// `~/.config/durable-auth/config.toml`, if `HOME` is set.
    pub fn default_path() -> Option<PathBuf> {
        env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("durable-auth")
                .join("config.toml")
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|err| Error::InvalidConfig(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `explicit` if given, else the default path when that file exists, else
    /// the built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| Error::InvalidConfig(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lamports_per_signature == 0 {
            return Err(Error::InvalidConfig(
                "lamports_per_signature must be > 0".into(),
            ));
        }
        if self.ledger_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("ledger_path must not be empty".into()));
        }
        Ok(())
    }
}
