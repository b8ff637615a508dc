use alloy::consensus::TxEnvelope;
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, B256, Bytes, U256, keccak256};
use alloy::rpc::types::eth::TransactionRequest;
use async_trait::async_trait;
use citizen_wallet_sdk::chain::{ChainProvider, FeeData, ObservedTransaction, TransferReceipt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Chain id reported by a fresh [`StubChainProvider`].
pub const STUB_CHAIN_ID: u64 = 1337;

/// Methods of [`ChainProvider`], used to count calls and script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubMethod {
    GetChainId,
    GetBalance,
    GetBlockNumber,
    GetBlockTransactions,
    GetFeeData,
    GetTransactionCount,
    Call,
    GetCode,
    SendRawTransaction,
    GetTransactionReceipt,
    Disconnect,
}

#[derive(Default)]
struct StubState {
    balances: HashMap<Address, U256>,
    blocks: HashMap<u64, Vec<ObservedTransaction>>,
    block_number: u64,
    fee_data: FeeData,
    call_outputs: HashMap<Address, Bytes>,
    code: HashMap<Address, Bytes>,
    nonces: HashMap<Address, u64>,
    sent: Vec<Bytes>,
    receipts: HashMap<B256, TransferReceipt>,
    mine_sent: bool,
    calls: HashMap<StubMethod, usize>,
    failures: HashMap<StubMethod, VecDeque<String>>,
    delays: HashMap<StubMethod, Duration>,
}

/// [`ChainProvider`] answering from scripted state.
///
/// Balances, blocks, fee data and call outputs are set up front. Every method call is
/// counted and can be made to fail once with [`StubChainProvider::fail_once`]. Sent
/// transactions are recorded and, unless disabled, get a successful receipt right away.
pub struct StubChainProvider {
    chain_id: u64,
    state: Mutex<StubState>,
}

impl Default for StubChainProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StubChainProvider {
    pub fn new() -> Self {
        Self {
            chain_id: STUB_CHAIN_ID,
            state: Mutex::new(StubState {
                mine_sent: true,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    /// Adds block `number` with `transactions` in block order.
    pub fn add_block(&self, number: u64, transactions: Vec<ObservedTransaction>) {
        let mut state = self.state();
        state.block_number = state.block_number.max(number);
        state.blocks.insert(number, transactions);
    }

    pub fn set_fee_data(&self, fee_data: FeeData) {
        self.state().fee_data = fee_data;
    }

    /// Output returned by `eth_call` for calls to `to`.
    pub fn set_call_output(&self, to: Address, output: impl Into<Bytes>) {
        self.state().call_outputs.insert(to, output.into());
    }

    pub fn set_code(&self, address: Address, code: impl Into<Bytes>) {
        self.state().code.insert(address, code.into());
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state().nonces.insert(address, nonce);
    }

    /// Whether sent transactions get a successful receipt immediately.
    pub fn set_mine_sent(&self, mine: bool) {
        self.state().mine_sent = mine;
    }

    pub fn set_receipt(&self, receipt: TransferReceipt) {
        self.state()
            .receipts
            .insert(receipt.transaction_hash, receipt);
    }

    /// Makes the next call to `method` fail with `message`. Calls queue up.
    pub fn fail_once(&self, method: StubMethod, message: impl Into<String>) {
        self.state()
            .failures
            .entry(method)
            .or_default()
            .push_back(message.into());
    }

    /// Makes every call to `method` take at least `delay`.
    pub fn set_delay(&self, method: StubMethod, delay: Duration) {
        self.state().delays.insert(method, delay);
    }

    /// Number of calls made to `method` so far.
    pub fn call_count(&self, method: StubMethod) -> usize {
        self.state().calls.get(&method).copied().unwrap_or(0)
    }

    /// Raw transactions submitted so far, in order.
    pub fn sent_raw_transactions(&self) -> Vec<Bytes> {
        self.state().sent.clone()
    }

    /// Submitted transactions, decoded.
    pub fn sent_transactions(&self) -> anyhow::Result<Vec<TxEnvelope>> {
        self.sent_raw_transactions()
            .iter()
            .map(|raw| {
                TxEnvelope::decode_2718(&mut raw.as_ref())
                    .map_err(|e| anyhow::anyhow!("Failed to decode sent transaction: {e}"))
            })
            .collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.call_count(StubMethod::Disconnect) > 0
    }

    /// Counts the call, applies the scripted delay and pops a scripted failure.
    async fn enter(&self, method: StubMethod) -> anyhow::Result<()> {
        let (delay, failure) = {
            let mut state = self.state();
            *state.calls.entry(method).or_default() += 1;
            let failure = state
                .failures
                .get_mut(&method)
                .and_then(VecDeque::pop_front);
            (state.delays.get(&method).copied(), failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(message) => {
                log::debug!("Stub provider failing {method:?}: {message}");
                Err(anyhow::anyhow!(message))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainProvider for StubChainProvider {
    async fn get_chain_id(&self) -> anyhow::Result<u64> {
        self.enter(StubMethod::GetChainId).await?;
        Ok(self.chain_id)
    }

    async fn get_balance(&self, address: Address) -> anyhow::Result<U256> {
        self.enter(StubMethod::GetBalance).await?;
        Ok(self
            .state()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn get_block_number(&self) -> anyhow::Result<u64> {
        self.enter(StubMethod::GetBlockNumber).await?;
        Ok(self.state().block_number)
    }

    async fn get_block_transactions(
        &self,
        number: u64,
    ) -> anyhow::Result<Option<Vec<ObservedTransaction>>> {
        self.enter(StubMethod::GetBlockTransactions).await?;
        Ok(self.state().blocks.get(&number).cloned())
    }

    async fn get_fee_data(&self) -> anyhow::Result<FeeData> {
        self.enter(StubMethod::GetFeeData).await?;
        Ok(self.state().fee_data)
    }

    async fn get_transaction_count(&self, address: Address) -> anyhow::Result<u64> {
        self.enter(StubMethod::GetTransactionCount).await?;
        Ok(self.state().nonces.get(&address).copied().unwrap_or(0))
    }

    async fn call(&self, tx: TransactionRequest) -> anyhow::Result<Bytes> {
        self.enter(StubMethod::Call).await?;
        let to = tx
            .to
            .and_then(|kind| kind.to().copied())
            .ok_or_else(|| anyhow::anyhow!("Call without recipient"))?;
        self.state()
            .call_outputs
            .get(&to)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("execution reverted: no output scripted for {to}"))
    }

    async fn get_code(&self, address: Address) -> anyhow::Result<Bytes> {
        self.enter(StubMethod::GetCode).await?;
        Ok(self.state().code.get(&address).cloned().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, encoded: &[u8]) -> anyhow::Result<B256> {
        self.enter(StubMethod::SendRawTransaction).await?;
        let hash = keccak256(encoded);
        let mut state = self.state();
        state.sent.push(Bytes::copy_from_slice(encoded));
        if state.mine_sent {
            let block_number = Some(state.block_number + 1);
            state.receipts.insert(
                hash,
                TransferReceipt {
                    transaction_hash: hash,
                    block_number,
                    status: true,
                },
            );
        }
        Ok(hash)
    }

    async fn get_transaction_receipt(&self, hash: B256) -> anyhow::Result<Option<TransferReceipt>> {
        self.enter(StubMethod::GetTransactionReceipt).await?;
        Ok(self.state().receipts.get(&hash).copied())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.enter(StubMethod::Disconnect).await
    }
}
