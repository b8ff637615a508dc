// # Citizen Wallet Session SDK
//!
//! Session keys for [Citizen Wallet](https://citizenwallet.xyz) communities, usable from Rust.
//!
//! A session is an ephemeral signing key created for a short-lived interaction, such as a
//! checkout screen. The SDK keeps that key in a [`KeyValueStore`](crate::storage::KeyValueStore),
//! derives its counterfactual smart account from the community account factory, watches its
//! balance block by block and works out who funded it, so the funds can later be refunded to
//! that owner.
//!
//! For **getting up and running quickly**:
//! 1. Load the community configuration with [`CommunityConfig::from_json`](crate::config::CommunityConfig::from_json);
//! 2. Build a [`SessionManager`] with a store, an [`RpcChainProvider`](crate::chain::RpcChainProvider) and the
//!    endpoints returned by [`CommunityConfig::session_endpoints`](crate::config::CommunityConfig::session_endpoints);
//! 3. Call [`SessionManager::on_load`], then [`SessionManager::listen_to_balance`] and read
//!    [`SessionManager::balance_updates`].
//!
//! The default [`FileStore`](crate::storage::FileStore) lives in the standard config folder:
//! - `~/.config/citizenwallet/` on **Linux**
//! - `~/Library/Application Support/citizenwallet/` on **macOS**
//! - `%APPDATA%\citizenwallet\` on **Windows**
//!
//! # Transaction Abstractions
//!
//! - Use [`SessionManager::withdraw`] and [`SessionManager::refund`] to move native currency out of the session.
//! - Both return a [`PendingTransfer`](crate::transaction::PendingTransfer) to await for confirmation.
//! - Advanced users can sign requests with [`sign_transaction`](crate::transaction::sign_transaction)
//!   and submit them through any [`ChainProvider`](crate::chain::ChainProvider).

/// Re-export commonly used types from `alloy`.
pub use alloy::primitives::{Address, U256, keccak256};
pub use alloy::signers::Signature;
pub use alloy::signers::local::PrivateKeySigner;
pub use url::Url;

pub use error::{Result, SessionError};
pub use session::SessionManager;

/// Module for the session manager.
/// Ties the signing key, provider, account factory, block listening and owner reconciliation together.
pub mod session;

/// Module for key-value persistence of session data.
pub mod storage;

/// Module for the chain RPC surface consumed by sessions.
pub mod chain;

/// Module for JSON-RPC retries on transient provider failures.
pub mod resilient_provider;

/// Module for the account factory client.
pub mod factory;

/// Module for `newHeads` subscriptions with a ping/pong heartbeat.
pub mod subscription;

/// Module for inferring the session owner from on-chain transfers.
pub mod reconcile;

/// Module for signing and tracking session transfers.
pub mod transaction;

/// Module for the session signing key.
pub mod identity;

/// Module for session errors.
pub mod error;

/// Module for session, transaction and community configuration.
pub mod config;

/// Module with utility functions.
/// Includes conversions between wei and human-readable amounts.
pub mod utils;
