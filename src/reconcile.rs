//! Owner reconciliation.
//!
//! Infers which external address funded a session by watching the session balance
//! block by block. The first block in which the balance rises from below the
//! funding threshold to at or above it is scanned for a plain value transfer to the
//! session address; the sender of the first such transfer in block order becomes the
//! owner. A transfer relayed by a contract that forwards plain value is attributed to
//! that contract.

use alloy::primitives::{Address, U256};

use crate::chain::{ChainProvider, ObservedTransaction};

/// Session balance observed at a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceObservation {
    /// Block that triggered the observation, `None` outside of block listening.
    pub block_number: Option<u64>,
    /// Balance of the session address.
    pub balance: U256,
    /// Owner known after processing the block.
    pub owner: Option<Address>,
}

/// Returns true if `amount` is below `threshold`.
/// A zero amount or a zero (not yet known) threshold always counts as below.
pub fn is_below_threshold(amount: U256, threshold: U256) -> bool {
    if amount.is_zero() || threshold.is_zero() {
        return true;
    }
    amount < threshold
}

/// Returns the sender of the first plain value transfer to `session` in block order.
pub fn find_funding_sender(
    transactions: &[ObservedTransaction],
    session: Address,
) -> Option<Address> {
    transactions
        .iter()
        .find(|tx| tx.to == Some(session) && tx.is_plain_transfer())
        .map(|tx| tx.from)
}

/// Per-session reconciliation state.
#[derive(Debug, Default, Clone)]
pub struct OwnerReconciler {
    previous_balance: U256,
}

impl OwnerReconciler {
    /// Starts in the unfunded state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance recorded at the end of the previous tick.
    pub fn previous_balance(&self) -> U256 {
        self.previous_balance
    }

    /// Returns to the unfunded state.
    pub fn reset(&mut self) {
        self.previous_balance = U256::ZERO;
    }

    /// Returns true if `balance` crosses `threshold` upwards compared to the previous tick.
    pub fn is_rising_edge(&self, balance: U256, threshold: U256) -> bool {
        is_below_threshold(self.previous_balance, threshold)
            && !is_below_threshold(balance, threshold)
    }

    /// Processes the balance observed at `block_number`.
    ///
    /// Scans the block only when no owner is known yet and the balance crossed the
    /// threshold. Returns the owner found in this block, if any. The previous balance
    /// is updated even when fetching the block fails.
    pub async fn on_block(
        &mut self,
        provider: &dyn ChainProvider,
        session: Address,
        owner_known: bool,
        threshold: U256,
        block_number: u64,
        balance: U256,
    ) -> anyhow::Result<Option<Address>> {
        let scan = !owner_known && self.is_rising_edge(balance, threshold);
        self.previous_balance = balance;

        if !scan {
            return Ok(None);
        }

        log::debug!(
            "Balance of {session} crossed {threshold} at block {block_number}, looking for the funder"
        );

        let Some(transactions) = provider.get_block_transactions(block_number).await? else {
            log::debug!("Block {block_number} not found, owner stays unknown");
            return Ok(None);
        };

        let owner = find_funding_sender(&transactions, session);
        match owner {
            Some(owner) => log::info!("Session {session} funded by {owner} in block {block_number}"),
            None => log::debug!("No plain transfer to {session} in block {block_number}"),
        }
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, Bytes, address};

    const SESSION: Address = address!("0x0000000000000000000000000000000000000005");

    fn tx(from: Address, to: Option<Address>, input: &'static [u8]) -> ObservedTransaction {
        ObservedTransaction {
            hash: B256::ZERO,
            from,
            to,
            value: U256::from(1),
            input: Bytes::from_static(input),
        }
    }

    #[test]
    fn test_zero_threshold_counts_as_below() {
        assert!(is_below_threshold(U256::from(100), U256::ZERO));
        assert!(is_below_threshold(U256::ZERO, U256::from(3)));
        assert!(is_below_threshold(U256::from(2), U256::from(3)));
        assert!(!is_below_threshold(U256::from(3), U256::from(3)));
        assert!(!is_below_threshold(U256::from(5), U256::from(3)));
    }

    #[test]
    fn test_rising_edge_only_on_crossing() {
        let mut reconciler = OwnerReconciler::new();
        let threshold = U256::from(3);
        assert!(!reconciler.is_rising_edge(U256::ZERO, threshold));
        assert!(reconciler.is_rising_edge(U256::from(5), threshold));

        reconciler.previous_balance = U256::from(5);
        assert!(!reconciler.is_rising_edge(U256::from(6), threshold));
        // Unknown threshold never triggers.
        reconciler.reset();
        assert!(!reconciler.is_rising_edge(U256::from(5), U256::ZERO));
    }

    #[test]
    fn test_first_plain_transfer_wins() {
        let first = address!("0x00000000000000000000000000000000000000a1");
        let second = address!("0x00000000000000000000000000000000000000a2");
        let other = address!("0x00000000000000000000000000000000000000b0");
        let transactions = vec![
            tx(other, Some(other), b""),
            tx(other, Some(SESSION), b"\x01\x02"),
            tx(first, Some(SESSION), b""),
            tx(second, Some(SESSION), b""),
        ];

        assert_eq!(find_funding_sender(&transactions, SESSION), Some(first));
    }

    #[test]
    fn test_no_match_without_plain_transfer() {
        let other = address!("0x00000000000000000000000000000000000000b0");
        let transactions = vec![tx(other, Some(SESSION), b"\xde\xad"), tx(other, None, b"")];
        assert_eq!(find_funding_sender(&transactions, SESSION), None);
    }
}
