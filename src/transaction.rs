use alloy::consensus::{SignableTransaction, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::hex;
use alloy::network::TransactionBuilder;
use alloy::primitives::{B256, U256};
use alloy::rpc::types::eth::TransactionRequest;
use anyhow::anyhow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chain::{ChainProvider, TransferReceipt};
use crate::error::{Result, SessionError};
use crate::identity::SessionSigner;

/// Signs a fully populated transaction request with the session key.
/// Returns the EIP-2718 encoding ready for `eth_sendRawTransaction`.
pub fn sign_transaction(
    signer: &SessionSigner,
    request: TransactionRequest,
) -> anyhow::Result<Vec<u8>> {
    let tx = request
        .build_unsigned()
        .map_err(|e| anyhow!("Failed to build transaction: {e}"))?;
    let signature = signer.sign(&tx.encoded_for_signing())?;
    let envelope = TxEnvelope::from(tx.into_signed(signature));
    let encoded = envelope.encoded_2718();

    log::trace!(
        "Encoded transaction (hash: 0x{:x}): 0x{}",
        envelope.tx_hash(),
        hex::encode(&encoded)
    );
    Ok(encoded)
}

/// Fills nonce and chain id, signs and submits a transfer from the session signer.
pub(crate) async fn send_transfer(
    provider: Arc<dyn ChainProvider>,
    signer: &SessionSigner,
    request: TransactionRequest,
    poll_interval: Duration,
    receipt_timeout: Duration,
) -> Result<PendingTransfer> {
    let from = signer.address();
    let chain_id = provider
        .get_chain_id()
        .await
        .map_err(SessionError::remote)?;
    let nonce = provider
        .get_transaction_count(from)
        .await
        .map_err(SessionError::remote)?;

    let request = request
        .with_from(from)
        .with_chain_id(chain_id)
        .with_nonce(nonce);

    let encoded = sign_transaction(signer, request).map_err(SessionError::remote)?;
    let tx_hash = provider
        .send_raw_transaction(&encoded)
        .await
        .map_err(SessionError::remote)?;

    log::debug!("Transfer sent from {from} with hash: {tx_hash} (nonce {nonce})");

    Ok(PendingTransfer {
        tx_hash,
        provider,
        poll_interval,
        receipt_timeout,
    })
}

/// A submitted transfer. Await [`PendingTransfer::wait`] for confirmation.
pub struct PendingTransfer {
    tx_hash: B256,
    provider: Arc<dyn ChainProvider>,
    poll_interval: Duration,
    receipt_timeout: Duration,
}

impl PendingTransfer {
    /// Hash of the submitted transaction.
    pub fn tx_hash(&self) -> B256 {
        self.tx_hash
    }

    /// Waits until the transaction is mined.
    /// Fails with [`SessionError::ConfirmationTimeout`] if no receipt shows up in time,
    /// and with [`SessionError::RemoteCallFailure`] if the transaction reverted.
    pub async fn wait(self) -> Result<TransferReceipt> {
        let start_time = Instant::now();
        let tx_hash = self.tx_hash;

        loop {
            match self.provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    log::info!(
                        "Transaction {tx_hash} was included in block {:?}",
                        receipt.block_number
                    );
                    if !receipt.status {
                        return Err(SessionError::RemoteCallFailure(format!(
                            "Transaction {tx_hash} failed despite being mined."
                        )));
                    }
                    return Ok(receipt);
                }
                Ok(None) => {
                    log::trace!("Getting receipt returned None for transaction: {tx_hash}");
                }
                Err(e) if e.to_string().contains("transaction indexing is in progress") => {
                    log::debug!(
                        "Ignoring `indexing is in progress` error for transaction: {tx_hash}"
                    );
                }
                Err(e) => return Err(SessionError::remote(e)),
            }

            if start_time.elapsed() >= self.receipt_timeout {
                return Err(SessionError::ConfirmationTimeout(tx_hash));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl std::fmt::Debug for PendingTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTransfer")
            .field("tx_hash", &self.tx_hash)
            .finish()
    }
}

/// Result of [`SessionManager::refund`](crate::session::SessionManager::refund).
#[derive(Debug)]
pub struct Refund {
    /// Total fees reserved for the refund transfer.
    pub fees: U256,
    /// Amount sent back to the owner.
    pub amount: U256,
    /// The submitted refund transfer.
    pub transaction: PendingTransfer,
}
