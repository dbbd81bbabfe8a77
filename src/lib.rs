//! Offline authorization of stake and payment transactions with durable nonces.
//!
//! The workflow has three steps:
//! 1. [`nonce::NonceProvider`] creates a nonce account and reads its current value.
//! 2. [`offline::build_and_sign`] signs an [`intent::Intent`] bound to that nonce,
//!    with no network access, producing a [`manifest::DetachedSignatureSet`].
//! 3. [`submit::OnlineSubmitter`] adds the fee payer's signature and broadcasts.
//!
//! [`workflow::Authorization`] drives the three steps as a state machine, and
//! [`batch::submit_batch`] sends many independent transactions in parallel.
//!
//! The `local-cluster` feature (on by default) provides an in-process
//! [`ClusterRpc`](rpc::ClusterRpc) implementation with a JSON ledger file.

pub mod batch;
#[cfg(feature = "local-cluster")]
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod intent;
pub mod keys;
pub mod manifest;
pub mod message;
pub mod nonce;
pub mod offline;
pub mod rpc;
pub mod submit;
pub mod types;
pub mod workflow;

pub use batch::{submit_batch, BatchConfig, BatchConfigBuilder, BatchItem, BatchOutcome};
pub use error::{Error, ParseError, Result};
pub use intent::{Instruction, Intent, StakeAuthorize};
pub use keys::{Keypair, KeyService, Signer};
pub use manifest::{DetachedSignatureSet, SignerPair};
pub use message::{Message, Transaction};
pub use nonce::NonceProvider;
pub use offline::build_and_sign;
pub use rpc::ClusterRpc;
pub use submit::OnlineSubmitter;
pub use types::{Hash, Pubkey, Signature};
pub use workflow::{Authorization, Rejection, Stage, WorkflowConfig, WorkflowConfigBuilder};
