use std::future::Future;
use std::time::{Duration, Instant};

use alloy::eips::BlockNumberOrTag;
use alloy::network::Ethereum;
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::eth::{Block, TransactionReceipt, TransactionRequest};
use alloy::rpc::types::FeeHistory;
use anyhow::{Result, anyhow};

/// Configuration for the resilient provider retry behavior.
#[derive(Clone, Debug)]
pub struct ResilientProviderConfig {
    /// Maximum number of retry attempts for "error sending request" errors.
    pub max_retries: u32,
    /// Delay between retry attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Timeout in seconds for "no backend is currently healthy" errors.
    pub backend_health_timeout_secs: u64,
}

impl Default for ResilientProviderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
            backend_health_timeout_secs: 30,
        }
    }
}

/// Runs `operation`, retrying errors caused by RPC load balancers switching backends.
/// Any other error is returned immediately.
pub async fn retry_transient<T, F, Fut, E>(
    config: &ResilientProviderConfig,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let start_time = Instant::now();

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            // This error can be result of load balancer switching.
            // It should be enough to retry a few times for the call to work.
            Err(e) if e.to_string().contains("error sending request") => {
                attempts += 1;
                if attempts > config.max_retries {
                    return Err(anyhow!(
                        "{operation_name} failed after {} attempts with 'error sending request': {e}",
                        config.max_retries,
                    ));
                }
                log::debug!(
                    "{operation_name} failed with 'error sending request' (attempt {attempts}/{}). Retrying...",
                    config.max_retries
                );
                continue;
            }
            // Load balancer will be switching backends until it will find a healthy one.
            Err(e)
                if e.to_string()
                    .contains("no backend is currently healthy to serve traffic") =>
            {
                let elapsed = start_time.elapsed();
                let timeout_duration = Duration::from_secs(config.backend_health_timeout_secs);

                if elapsed >= timeout_duration {
                    return Err(anyhow!(
                        "{operation_name} failed after {} seconds with 'no backend is currently healthy to serve traffic': {e}",
                        config.backend_health_timeout_secs,
                    ));
                }

                log::debug!(
                    "{operation_name} failed with 'no backend is currently healthy to serve traffic' (elapsed: {:.1}s/{:.1}s). Retrying...",
                    elapsed.as_secs_f64(),
                    timeout_duration.as_secs_f64()
                );
                tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
                continue;
            }
            Err(e) => return Err(anyhow!("{operation_name} failed: {e}")),
        }
    }
}

/// A wrapper around DynProvider that handles "error sending request" errors by retrying.
/// This provides resilience against temporary network issues and RPC load balancing switches.
#[derive(Clone)]
pub struct ResilientProvider {
    provider: DynProvider<Ethereum>,
    config: ResilientProviderConfig,
}

impl ResilientProvider {
    /// Creates a new ResilientProvider with the given provider and configuration.
    pub fn new(provider: DynProvider<Ethereum>, config: ResilientProviderConfig) -> Self {
        Self { provider, config }
    }

    async fn retry<T, F, Fut, E>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        retry_transient(&self.config, operation_name, operation).await
    }

    /// Gets the chain ID with retry logic.
    pub async fn get_chain_id(&self) -> Result<u64> {
        self.retry("get_chain_id", || self.provider.get_chain_id())
            .await
    }

    /// Gets the balance for an address with retry logic.
    pub async fn get_balance(&self, address: Address) -> Result<U256> {
        self.retry("get_balance", || async {
            self.provider.get_balance(address).await
        })
        .await
    }

    /// Gets the latest block number with retry logic.
    pub async fn get_block_number(&self) -> Result<u64> {
        self.retry("get_block_number", || self.provider.get_block_number())
            .await
    }

    /// Gets a block by number, including full transaction objects, with retry logic.
    pub async fn get_full_block(&self, number: u64) -> Result<Option<Block>> {
        self.retry("get_block_by_number", || async {
            self.provider
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .full()
                .await
        })
        .await
    }

    /// Gets the fee history of the latest block with retry logic.
    pub async fn get_fee_history(&self) -> Result<FeeHistory> {
        self.retry("get_fee_history", || async {
            self.provider
                .get_fee_history(1, BlockNumberOrTag::Latest, &[])
                .await
        })
        .await
    }

    /// Estimates EIP-1559 fees with retry logic.
    pub async fn estimate_eip1559_fees(&self) -> Result<(u128, u128)> {
        self.retry("estimate_eip1559_fees", || async {
            self.provider
                .estimate_eip1559_fees()
                .await
                .map(|fees| (fees.max_fee_per_gas, fees.max_priority_fee_per_gas))
        })
        .await
    }

    /// Gets the transaction count (nonce) for an address with retry logic.
    pub async fn get_transaction_count(&self, address: Address) -> Result<u64> {
        self.retry("get_transaction_count", || async {
            self.provider.get_transaction_count(address).await
        })
        .await
    }

    /// Executes a read-only call with retry logic.
    pub async fn call(&self, tx: TransactionRequest) -> Result<Bytes> {
        self.retry("call", || async { self.provider.call(tx.clone()).await })
            .await
    }

    /// Gets the code deployed at an address with retry logic.
    pub async fn get_code_at(&self, address: Address) -> Result<Bytes> {
        self.retry("get_code_at", || async {
            self.provider.get_code_at(address).await
        })
        .await
    }

    /// Sends a raw transaction with retry logic. Returns the transaction hash.
    pub async fn send_raw_transaction(&self, data: &[u8]) -> Result<B256> {
        self.retry("send_raw_transaction", || async {
            self.provider
                .send_raw_transaction(data)
                .await
                .map(|pending| *pending.tx_hash())
        })
        .await
    }

    /// Gets a transaction receipt with retry logic.
    pub async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>> {
        self.retry("get_transaction_receipt", || {
            self.provider.get_transaction_receipt(hash)
        })
        .await
    }
}
