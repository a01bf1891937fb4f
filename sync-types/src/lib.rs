//! # sync-types
//!
//! Wire format and persisted state types for walletsync.
//!
//! This crate provides the foundational types used across all walletsync crates:
//! - [`WalletHash`], [`PublicKey`], [`Signature`] - Identity and integrity types
//! - [`Request`], [`Response`], [`Inbound`] - JSON-RPC frames
//! - [`FetchWalletResult`] and friends - RemoteStore method payloads
//! - [`LocalReplicaState`], [`ReplicaPatch`] - The persisted local replica
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod remote;
mod replica;
mod wire;

pub mod serde_b64;

pub use error::TypesError;
pub use ids::{PublicKey, Signature, WalletHash, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use remote::{
    methods, ChangePasswordParams, CreateWalletParams, CreateWalletResult, DeleteWalletParams,
    FetchStatus, FetchWalletParams, FetchWalletResult, RequestCodeParams, RequestCodeResult,
    SaveWalletParams, SaveWalletResult,
};
pub use replica::{LocalReplicaState, ReplicaPatch};
pub use wire::{
    Inbound, Notice, Request, Response, SubscribeParams, UnsubscribeParams, NOTICE_METHOD,
};
