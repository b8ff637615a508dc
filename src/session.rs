use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::eth::TransactionRequest;
use alloy::signers::Signature;
use alloy::signers::local::PrivateKeySigner;
use bon::bon;
use tokio::sync::{Mutex, watch};
use url::Url;

use crate::chain::ChainProvider;
use crate::config::{HeartbeatConfig, TransactionConfig};
use crate::error::{Result, SessionError};
use crate::factory::{AccountFactory, DEFAULT_SALT};
use crate::identity::SessionSigner;
use crate::reconcile::{BalanceObservation, OwnerReconciler};
use crate::storage::{KeyValueStore, SESSION_KEY, SESSION_OWNER};
use crate::subscription::BlockSubscription;
use crate::transaction::{PendingTransfer, Refund, send_transfer};

/// Mutable session state. Never held across an await point.
struct SessionState {
    signer: SessionSigner,
    provider: Option<Arc<dyn ChainProvider>>,
    ws_url: Option<Url>,
    factory: Option<AccountFactory>,
    account_address: Option<Address>,
    owner: Option<Address>,
    amount_to_pay: U256,
}

struct SessionInner {
    store: Arc<dyn KeyValueStore>,
    state: RwLock<SessionState>,
    reconciler: Mutex<OwnerReconciler>,
    subscription: Mutex<Option<BlockSubscription>>,
    balance_tx: watch::Sender<Option<BalanceObservation>>,
    heartbeat: HeartbeatConfig,
    tx_config: TransactionConfig,
}

/// Owns the ephemeral signing key of a session together with its provider,
/// derived account address and owner.
///
/// Clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

#[bon]
impl SessionManager {
    /// Creates a session.
    ///
    /// With a `signer` the given key is adopted and persisted. Without one the key
    /// persisted in `store` is reused, or a new random key is generated and persisted.
    /// A persisted owner is loaded in both cases.
    #[builder]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        provider: Option<Arc<dyn ChainProvider>>,
        ws_url: Option<Url>,
        factory_address: Option<Address>,
        signer: Option<PrivateKeySigner>,
        #[builder(default)] heartbeat: HeartbeatConfig,
        #[builder(default)] transaction_config: TransactionConfig,
    ) -> Result<Self> {
        let signer = match signer {
            Some(signer) => {
                let signer = SessionSigner::from(signer);
                store
                    .set_item(SESSION_KEY, &signer.persisted_key())
                    .map_err(SessionError::storage)?;
                signer
            }
            None => load_or_generate_signer(store.as_ref())?,
        };
        let owner = load_owner(store.as_ref())?;
        let factory = factory_address.map(|address| AccountFactory::new(address, signer.address()));

        log::debug!(
            "Session initialized for {} (owner: {owner:?}, factory: {factory_address:?})",
            signer.address()
        );

        let (balance_tx, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(SessionInner {
                store,
                state: RwLock::new(SessionState {
                    signer,
                    provider,
                    ws_url,
                    factory,
                    account_address: None,
                    owner,
                    amount_to_pay: U256::ZERO,
                }),
                reconciler: Mutex::new(OwnerReconciler::new()),
                subscription: Mutex::new(None),
                balance_tx,
                heartbeat,
                tx_config: transaction_config,
            }),
        })
    }
}

impl SessionManager {
    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn provider(&self) -> Result<Arc<dyn ChainProvider>> {
        self.read_state()
            .provider
            .clone()
            .ok_or(SessionError::ProviderNotConnected)
    }

    /// Rebinds the session to a new provider without rotating the key.
    ///
    /// Stops block listening, releases the previous provider, rebuilds the factory
    /// client when `factory_address` is given and reloads the persisted owner.
    pub async fn update_provider(
        &self,
        provider: Arc<dyn ChainProvider>,
        ws_url: Option<Url>,
        factory_address: Option<Address>,
    ) -> Result<()> {
        self.stop_listening_for_blocks().await;

        let owner = load_owner(self.inner.store.as_ref())?;
        let previous = {
            let mut state = self.write_state();
            let previous = state.provider.replace(provider);
            state.ws_url = ws_url;
            if let Some(address) = factory_address {
                state.factory = Some(AccountFactory::new(address, state.signer.address()));
                state.account_address = None;
            }
            if owner.is_some() {
                state.owner = owner;
            }
            previous
        };

        if let Some(previous) = previous {
            release_provider(previous).await;
        }

        self.inner.reconciler.lock().await.reset();
        self.inner.balance_tx.send_replace(None);
        log::info!("Session {} rebound to a new provider", self.get_address());
        Ok(())
    }

    /// Address of the session signing key.
    pub fn get_address(&self) -> Address {
        self.read_state().signer.address()
    }

    /// Counterfactual account address derived by the factory for the session key.
    ///
    /// The address is cached; `force_update` asks the factory again.
    pub async fn get_account_address(&self, force_update: bool) -> Result<Address> {
        let (factory, provider) = {
            let state = self.read_state();
            let factory = state.factory.ok_or(SessionError::FactoryNotConfigured)?;
            if let Some(account) = state.account_address {
                if !force_update {
                    return Ok(account);
                }
            }
            let provider = state
                .provider
                .clone()
                .ok_or(SessionError::ProviderNotConnected)?;
            (factory, provider)
        };

        let account = factory
            .get_address(provider.as_ref(), DEFAULT_SALT)
            .await
            .map_err(SessionError::remote)?;

        let mut state = self.write_state();
        // Skip caching if the key or factory changed while the call was in flight.
        if state.factory == Some(factory) {
            state.account_address = Some(account);
        }
        Ok(account)
    }

    /// Returns true if contract code is deployed at the session account address.
    pub async fn is_account_deployed(&self) -> Result<bool> {
        let account = self.get_account_address(false).await?;
        let code = self
            .provider()?
            .get_code(account)
            .await
            .map_err(SessionError::remote)?;
        Ok(!code.is_empty())
    }

    /// Native balance of the session address.
    pub async fn get_balance(&self) -> Result<U256> {
        let provider = self.provider()?;
        provider
            .get_balance(self.get_address())
            .await
            .map_err(SessionError::remote)
    }

    /// Signs `message` as an EIP-191 personal message with the session key.
    pub async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        let signer = self.read_state().signer.clone();
        signer.sign_message(message).map_err(SessionError::remote)
    }

    /// Records and persists the session owner.
    pub fn set_owner(&self, owner: Address) -> Result<()> {
        self.inner
            .store
            .set_item(SESSION_OWNER, &owner.to_checksum(None))
            .map_err(SessionError::storage)?;
        self.write_state().owner = Some(owner);
        Ok(())
    }

    /// Session owner, from memory or else from the store.
    pub fn get_owner(&self) -> Option<Address> {
        if let Some(owner) = self.read_state().owner {
            return Some(owner);
        }
        match load_owner(self.inner.store.as_ref()) {
            Ok(owner) => {
                if owner.is_some() {
                    self.write_state().owner = owner;
                }
                owner
            }
            Err(e) => {
                log::warn!("Failed to read session owner: {e}");
                None
            }
        }
    }

    /// Sends `amount` of native currency from the session address to `to`.
    pub async fn withdraw(&self, to: Address, amount: U256) -> Result<PendingTransfer> {
        let provider = self.provider()?;
        let fees = provider.get_fee_data().await.map_err(SessionError::remote)?;

        let request = TransactionRequest::default()
            .with_to(to)
            .with_value(amount)
            .with_gas_limit(self.inner.tx_config.transfer_gas_limit)
            .with_max_fee_per_gas(fees.max_fee_per_gas)
            .with_max_priority_fee_per_gas(fees.max_priority_fee_per_gas);

        log::info!("Withdrawing {amount} wei from {} to {to}", self.get_address());
        self.send(provider, request).await
    }

    /// Sends the whole balance minus transfer fees back to the owner.
    ///
    /// The fee cap is the next block base fee plus the configured priority fee and
    /// the fees are that cap times the transfer gas limit. Nothing is sent if the
    /// balance does not cover the fees.
    pub async fn refund(&self) -> Result<Refund> {
        let owner = self.get_owner().ok_or(SessionError::OwnerNotSet)?;
        let provider = self.provider()?;
        let tx_config = &self.inner.tx_config;

        let fee_data = provider.get_fee_data().await.map_err(SessionError::remote)?;
        let fee_cap = fee_data
            .next_block_base_fee
            .checked_add(tx_config.priority_fee_per_gas)
            .ok_or_else(|| {
                SessionError::RemoteCallFailure(format!(
                    "Gas price overflows: base fee {}",
                    fee_data.next_block_base_fee
                ))
            })?;
        let fees = U256::from(fee_cap) * U256::from(tx_config.transfer_gas_limit);

        let balance = self.get_balance().await?;
        if balance <= fees {
            return Err(SessionError::InsufficientFunds { balance, fees });
        }
        let amount = balance - fees;

        let request = TransactionRequest::default()
            .with_to(owner)
            .with_value(amount)
            .with_gas_limit(tx_config.transfer_gas_limit)
            .with_gas_price(fee_cap);

        log::info!("Refunding {amount} wei to {owner} (fees: {fees} wei)");
        let transaction = self.send(provider, request).await?;
        Ok(Refund {
            fees,
            amount,
            transaction,
        })
    }

    async fn send(
        &self,
        provider: Arc<dyn ChainProvider>,
        request: TransactionRequest,
    ) -> Result<PendingTransfer> {
        let signer = self.read_state().signer.clone();
        send_transfer(
            provider,
            &signer,
            request,
            self.inner.tx_config.poll_interval,
            self.inner.tx_config.receipt_timeout,
        )
        .await
    }

    /// Replaces the session key with a new random one and forgets the owner.
    ///
    /// The previous key is removed from the store and cannot be recovered.
    pub async fn reset(&self) -> Result<()> {
        // Held until the owner is cleared: a running tick finishes first.
        let mut reconciler = self.inner.reconciler.lock().await;
        let store = self.inner.store.as_ref();
        store
            .remove_item(SESSION_OWNER)
            .map_err(SessionError::storage)?;
        store.remove_item(SESSION_KEY).map_err(SessionError::storage)?;

        let signer = SessionSigner::generate();
        store
            .set_item(SESSION_KEY, &signer.persisted_key())
            .map_err(SessionError::storage)?;

        {
            let mut state = self.write_state();
            log::info!(
                "Resetting session {}, new address {}",
                state.signer.address(),
                signer.address()
            );
            state.factory = state
                .factory
                .map(|factory| AccountFactory::new(factory.address(), signer.address()));
            state.signer = signer;
            state.account_address = None;
            state.owner = None;
        }

        reconciler.reset();
        drop(reconciler);
        self.inner.balance_tx.send_replace(None);
        Ok(())
    }

    /// Address and balance of the session, as shown when a checkout screen loads.
    pub async fn on_load(&self) -> Result<BalanceObservation> {
        let balance = self.get_balance().await?;
        let observation = BalanceObservation {
            block_number: None,
            balance,
            owner: self.get_owner(),
        };
        self.inner.balance_tx.send_replace(Some(observation));
        Ok(observation)
    }

    /// Sets the funding threshold used to detect the owner. Zero means unknown.
    pub fn set_amount_to_pay(&self, amount: U256) {
        self.write_state().amount_to_pay = amount;
    }

    /// Current funding threshold.
    pub fn amount_to_pay(&self) -> U256 {
        self.read_state().amount_to_pay
    }

    /// Evaluates `evaluate` and stores the result as the funding threshold.
    /// `None` is stored as zero; on failure the threshold is left untouched.
    pub async fn update_amount_to_pay<F, Fut>(&self, evaluate: F) -> Result<U256>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<U256>>>,
    {
        let amount = evaluate()
            .await
            .map_err(SessionError::remote)?
            .unwrap_or(U256::ZERO);
        self.set_amount_to_pay(amount);
        Ok(amount)
    }

    /// Refreshes the balance for `block_number` and runs owner reconciliation.
    ///
    /// Ticks are serialized: a tick started while another one runs waits for it.
    pub async fn handle_block(&self, block_number: u64) -> Result<BalanceObservation> {
        let mut reconciler = self.inner.reconciler.lock().await;

        let provider = self.provider()?;
        let balance = self.get_balance().await?;
        let (session, threshold) = {
            let state = self.read_state();
            (state.signer.address(), state.amount_to_pay)
        };
        let owner_known = self.get_owner().is_some();

        let found = reconciler
            .on_block(
                provider.as_ref(),
                session,
                owner_known,
                threshold,
                block_number,
                balance,
            )
            .await
            .map_err(SessionError::remote)?;
        if let Some(owner) = found {
            self.set_owner(owner)?;
        }
        drop(reconciler);

        let observation = BalanceObservation {
            block_number: Some(block_number),
            balance,
            owner: self.get_owner(),
        };
        self.inner.balance_tx.send_replace(Some(observation));
        Ok(observation)
    }

    /// Receiver of the latest balance observation.
    pub fn balance_updates(&self) -> watch::Receiver<Option<BalanceObservation>> {
        self.inner.balance_tx.subscribe()
    }

    /// Subscribes to new blocks, replacing any previous subscription.
    pub async fn listen_for_block<F, Fut>(&self, on_block: F) -> Result<()>
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.inner.subscription.lock().await;
        if let Some(previous) = subscription.take() {
            previous.close().await;
        }

        let ws_url = self
            .read_state()
            .ws_url
            .clone()
            .ok_or_else(|| SessionError::SubscriptionFailed("no websocket url configured".into()))?;

        let listener = BlockSubscription::connect(&ws_url, self.inner.heartbeat, on_block)
            .await
            .map_err(|e| SessionError::SubscriptionFailed(e.to_string()))?;
        *subscription = Some(listener);
        Ok(())
    }

    /// Subscribes to new blocks and runs [`SessionManager::handle_block`] for each of them.
    /// Failed ticks are logged and do not end the subscription.
    pub async fn listen_to_balance(&self) -> Result<()> {
        // Weak, so dropping the last session handle also ends the subscription.
        let inner = Arc::downgrade(&self.inner);
        self.listen_for_block(move |block_number| {
            let session = inner.upgrade().map(|inner| SessionManager { inner });
            async move {
                let Some(session) = session else {
                    return;
                };
                if let Err(e) = session.handle_block(block_number).await {
                    log::warn!("Failed to process block {block_number}: {e}");
                }
            }
        })
        .await
    }

    /// Stops block listening. Does nothing when not listening.
    pub async fn stop_listening_for_blocks(&self) {
        let previous = self.inner.subscription.lock().await.take();
        if let Some(previous) = previous {
            previous.close().await;
            log::debug!("Stopped listening for blocks on {}", self.get_address());
        }
    }

    /// Returns true while a block subscription is open.
    pub async fn is_listening(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .await
            .as_ref()
            .is_some_and(|subscription| !subscription.is_closed())
    }
}

/// Disconnects a provider that is no longer used. Failures are logged and dropped.
pub async fn release_provider(provider: Arc<dyn ChainProvider>) {
    if let Err(e) = provider.disconnect().await {
        log::debug!("Ignoring provider release failure: {e}");
    }
}

fn load_or_generate_signer(store: &dyn KeyValueStore) -> Result<SessionSigner> {
    if let Some(key) = store.get_item(SESSION_KEY).map_err(SessionError::storage)? {
        match SessionSigner::from_persisted(&key) {
            Ok(signer) => return Ok(signer),
            Err(e) => log::warn!("Replacing unreadable persisted session key: {e}"),
        }
    }

    let signer = SessionSigner::generate();
    store
        .set_item(SESSION_KEY, &signer.persisted_key())
        .map_err(SessionError::storage)?;
    log::info!("Generated new session key for {}", signer.address());
    Ok(signer)
}

fn load_owner(store: &dyn KeyValueStore) -> Result<Option<Address>> {
    let Some(owner) = store.get_item(SESSION_OWNER).map_err(SessionError::storage)? else {
        return Ok(None);
    };
    match owner.trim().parse::<Address>() {
        Ok(owner) => Ok(Some(owner)),
        Err(e) => {
            log::warn!("Ignoring malformed persisted session owner {owner:?}: {e}");
            Ok(None)
        }
    }
}
