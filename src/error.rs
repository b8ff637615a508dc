use alloy::primitives::{B256, U256};
use displaydoc::Display;
use thiserror::Error;

/// Errors returned by [`SessionManager`](crate::session::SessionManager) operations.
/// Every failing operation rejects with one of these, it never resolves with a fallback value.
#[derive(Debug, Display, Error)]
pub enum SessionError {
    /// No chain provider is bound to the session
    ProviderNotConnected,
    /// No account factory was configured for the session
    FactoryNotConfigured,
    /// No owner has been recorded for the session
    OwnerNotSet,
    /// Balance {balance} does not cover the transfer fees {fees}
    InsufficientFunds {
        /// Balance of the session address at the time of the check.
        balance: U256,
        /// Total fees the transfer would cost.
        fees: U256,
    },
    /// Remote call failed: {0}
    RemoteCallFailure(String),
    /// Block subscription failed: {0}
    SubscriptionFailed(String),
    /// Transaction {0} was not confirmed in time
    ConfirmationTimeout(B256),
    /// Session storage failed: {0}
    Storage(String),
}

impl SessionError {
    /// Wraps an error coming from a provider or contract call.
    pub(crate) fn remote(e: impl std::fmt::Display) -> Self {
        Self::RemoteCallFailure(e.to_string())
    }

    /// Wraps an error coming from the key-value store.
    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result type used across the session API.
pub type Result<T> = std::result::Result<T, SessionError>;
