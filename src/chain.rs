use alloy::consensus::Transaction;
use alloy::network::TransactionResponse;
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::eth::TransactionRequest;
use anyhow::anyhow;
use async_trait::async_trait;
use url::Url;

use crate::resilient_provider::{ResilientProvider, ResilientProviderConfig};

/// A transaction as observed in a block, reduced to what the session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedTransaction {
    /// Transaction hash.
    pub hash: B256,
    /// Sender.
    pub from: Address,
    /// Recipient, `None` for contract creation.
    pub to: Option<Address>,
    /// Transferred native value.
    pub value: U256,
    /// Call data. Empty for plain value transfers.
    pub input: Bytes,
}

impl ObservedTransaction {
    /// Returns true if the transaction carries no call data.
    pub fn is_plain_transfer(&self) -> bool {
        self.input.is_empty()
    }
}

/// Fee information used to price session transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeData {
    /// Base fee of the next block (in wei).
    pub next_block_base_fee: u128,
    /// Suggested EIP-1559 fee cap (in wei).
    pub max_fee_per_gas: u128,
    /// Suggested EIP-1559 priority fee (in wei).
    pub max_priority_fee_per_gas: u128,
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    /// False if the transaction reverted.
    pub status: bool,
}

/// The chain RPC surface consumed by a session.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Chain ID used when signing transactions.
    async fn get_chain_id(&self) -> anyhow::Result<u64>;

    /// Native balance of `address` at the latest block.
    async fn get_balance(&self, address: Address) -> anyhow::Result<U256>;

    /// Latest block number.
    async fn get_block_number(&self) -> anyhow::Result<u64>;

    /// Transactions of block `number` in block order, `None` if the node doesn't know the block.
    async fn get_block_transactions(
        &self,
        number: u64,
    ) -> anyhow::Result<Option<Vec<ObservedTransaction>>>;

    /// Current fee information.
    async fn get_fee_data(&self) -> anyhow::Result<FeeData>;

    /// Next nonce of `address`, including pending transactions.
    async fn get_transaction_count(&self, address: Address) -> anyhow::Result<u64>;

    /// Executes a read-only contract call and returns the raw output.
    async fn call(&self, tx: TransactionRequest) -> anyhow::Result<Bytes>;

    /// Code deployed at `address`, empty for accounts without code.
    async fn get_code(&self, address: Address) -> anyhow::Result<Bytes>;

    /// Submits a signed, EIP-2718 encoded transaction and returns its hash.
    async fn send_raw_transaction(&self, encoded: &[u8]) -> anyhow::Result<B256>;

    /// Receipt of a transaction, `None` while it is not mined.
    async fn get_transaction_receipt(&self, hash: B256) -> anyhow::Result<Option<TransferReceipt>>;

    /// Releases the underlying connection. Calls made afterwards may fail.
    async fn disconnect(&self) -> anyhow::Result<()>;
}

/// [`ChainProvider`] talking JSON-RPC over HTTP to a node.
#[derive(Clone)]
pub struct RpcChainProvider {
    provider: ResilientProvider,
    rpc_url: Url,
}

impl RpcChainProvider {
    /// Connects to the node at `rpc_url` with default retry settings.
    pub fn connect_http(rpc_url: Url) -> Self {
        Self::connect_http_with_config(rpc_url, ResilientProviderConfig::default())
    }

    /// Connects to the node at `rpc_url` with custom retry settings.
    pub fn connect_http_with_config(rpc_url: Url, config: ResilientProviderConfig) -> Self {
        log::debug!("Connecting to RPC provider: {rpc_url}");

        let provider = ProviderBuilder::new()
            .connect_http(rpc_url.clone())
            .erased();

        Self {
            provider: ResilientProvider::new(provider, config),
            rpc_url,
        }
    }

    /// The node URL.
    pub fn rpc_url(&self) -> &Url {
        &self.rpc_url
    }
}

#[async_trait]
impl ChainProvider for RpcChainProvider {
    async fn get_chain_id(&self) -> anyhow::Result<u64> {
        self.provider.get_chain_id().await
    }

    async fn get_balance(&self, address: Address) -> anyhow::Result<U256> {
        self.provider.get_balance(address).await
    }

    async fn get_block_number(&self) -> anyhow::Result<u64> {
        self.provider.get_block_number().await
    }

    async fn get_block_transactions(
        &self,
        number: u64,
    ) -> anyhow::Result<Option<Vec<ObservedTransaction>>> {
        let Some(block) = self.provider.get_full_block(number).await? else {
            return Ok(None);
        };

        let transactions = block
            .transactions
            .into_transactions()
            .map(|tx| ObservedTransaction {
                hash: TransactionResponse::tx_hash(&tx),
                from: TransactionResponse::from(&tx),
                to: Transaction::to(&tx),
                value: Transaction::value(&tx),
                input: Transaction::input(&tx).clone(),
            })
            .collect();
        Ok(Some(transactions))
    }

    async fn get_fee_data(&self) -> anyhow::Result<FeeData> {
        let history = self.provider.get_fee_history().await?;
        let next_block_base_fee = history
            .next_block_base_fee()
            .ok_or_else(|| anyhow!("Fee history returned no base fee"))?;
        let (max_fee_per_gas, max_priority_fee_per_gas) =
            self.provider.estimate_eip1559_fees().await?;

        Ok(FeeData {
            next_block_base_fee,
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn get_transaction_count(&self, address: Address) -> anyhow::Result<u64> {
        self.provider.get_transaction_count(address).await
    }

    async fn call(&self, tx: TransactionRequest) -> anyhow::Result<Bytes> {
        self.provider.call(tx).await
    }

    async fn get_code(&self, address: Address) -> anyhow::Result<Bytes> {
        self.provider.get_code_at(address).await
    }

    async fn send_raw_transaction(&self, encoded: &[u8]) -> anyhow::Result<B256> {
        self.provider.send_raw_transaction(encoded).await
    }

    async fn get_transaction_receipt(&self, hash: B256) -> anyhow::Result<Option<TransferReceipt>> {
        let receipt = self.provider.get_transaction_receipt(hash).await?;
        Ok(receipt.map(|receipt| TransferReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            status: receipt.status(),
        }))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        // HTTP transports hold no socket between calls; the handle is released when dropped.
        log::debug!("Releasing RPC provider: {}", self.rpc_url);
        Ok(())
    }
}
