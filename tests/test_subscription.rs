use alloy::primitives::{Address, B256, Bytes, U256, address};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

use citizen_wallet_sdk::chain::ObservedTransaction;
use citizen_wallet_sdk::config::HeartbeatConfig;
use citizen_wallet_sdk::storage::MemoryStore;
use citizen_wallet_sdk::{SessionError, SessionManager};
use citizen_wallet_test_utils::{MockWsNode, StubChainProvider, init_logger, wait_for};

const FUNDER: Address = address!("0x00000000000000000000000000000000000000f1");
const WAIT: Duration = Duration::from_secs(5);

fn fast_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(150),
    }
}

fn session(node: &MockWsNode, provider: Arc<StubChainProvider>) -> Result<SessionManager> {
    Ok(SessionManager::builder()
        .store(Arc::new(MemoryStore::new()))
        .provider(provider)
        .ws_url(node.url().clone())
        .heartbeat(fast_heartbeat())
        .build()?)
}

async fn listen_collecting(manager: &SessionManager) -> Result<mpsc::UnboundedReceiver<u64>> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager
        .listen_for_block(move |number| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(number);
            }
        })
        .await?;
    Ok(rx)
}

#[tokio::test]
async fn test_blocks_are_delivered_in_order() -> Result<()> {
    init_logger(false);
    let node = MockWsNode::start().await?;
    let manager = session(&node, Arc::new(StubChainProvider::new()))?;

    let mut blocks = listen_collecting(&manager).await?;
    wait_for(WAIT, || node.subscriptions() == 1).await?;
    assert!(manager.is_listening().await);

    for number in [7, 8, 9] {
        node.push_block(number);
    }
    for expected in [7, 8, 9] {
        assert_eq!(timeout(WAIT, blocks.recv()).await?, Some(expected));
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_pong_closes_socket_and_stops_pings() -> Result<()> {
    init_logger(false);
    let node = MockWsNode::start().await?;
    node.set_pong(false);
    let manager = session(&node, Arc::new(StubChainProvider::new()))?;

    let _blocks = listen_collecting(&manager).await?;
    wait_for(WAIT, || node.disconnections() == 1).await?;
    assert!(!manager.is_listening().await);

    let pings = node.pings();
    assert!(pings >= 1);
    tokio::time::sleep(fast_heartbeat().interval * 4).await;
    assert_eq!(node.pings(), pings);
    assert_eq!(node.connections(), 1);
    Ok(())
}

#[tokio::test]
async fn test_pong_keeps_socket_alive() -> Result<()> {
    init_logger(false);
    let node = MockWsNode::start().await?;
    let manager = session(&node, Arc::new(StubChainProvider::new()))?;

    let _blocks = listen_collecting(&manager).await?;
    wait_for(WAIT, || node.pings() >= 4).await?;
    assert_eq!(node.disconnections(), 0);
    assert!(manager.is_listening().await);

    manager.stop_listening_for_blocks().await;
    wait_for(WAIT, || node.disconnections() == 1).await?;
    assert_eq!(node.unsubscriptions(), 1);
    assert!(!manager.is_listening().await);

    // Stopping twice is a no-op.
    manager.stop_listening_for_blocks().await;
    Ok(())
}

#[tokio::test]
async fn test_listening_again_replaces_subscription() -> Result<()> {
    init_logger(false);
    let node = MockWsNode::start().await?;
    let manager = session(&node, Arc::new(StubChainProvider::new()))?;

    let mut first = listen_collecting(&manager).await?;
    wait_for(WAIT, || node.subscriptions() == 1).await?;
    let mut second = listen_collecting(&manager).await?;
    wait_for(WAIT, || node.subscriptions() == 2 && node.disconnections() == 1).await?;

    node.push_block(11);
    assert_eq!(timeout(WAIT, second.recv()).await?, Some(11));
    // The replaced callback was dropped with its subscription.
    assert_eq!(timeout(WAIT, first.recv()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_listen_failures() -> Result<()> {
    init_logger(false);
    let manager = SessionManager::builder()
        .store(Arc::new(MemoryStore::new()))
        .build()?;
    let result = manager.listen_for_block(|_| async {}).await;
    assert!(matches!(result, Err(SessionError::SubscriptionFailed(_))));

    let unreachable = SessionManager::builder()
        .store(Arc::new(MemoryStore::new()))
        .ws_url(Url::parse("ws://127.0.0.1:1")?)
        .build()?;
    let result = unreachable.listen_for_block(|_| async {}).await;
    assert!(matches!(result, Err(SessionError::SubscriptionFailed(_))));
    assert!(!unreachable.is_listening().await);
    Ok(())
}

#[tokio::test]
async fn test_rejected_subscription_fails() -> Result<()> {
    init_logger(false);
    let node = MockWsNode::start().await?;
    node.set_reject_subscribe(true);
    let manager = session(&node, Arc::new(StubChainProvider::new()))?;

    let result = manager.listen_for_block(|_| async {}).await;
    assert!(matches!(result, Err(SessionError::SubscriptionFailed(_))));
    assert!(!manager.is_listening().await);
    wait_for(WAIT, || node.disconnections() == 1).await?;
    assert_eq!(node.pings(), 0);

    // Once the node accepts again, listening works.
    node.set_reject_subscribe(false);
    let mut blocks = listen_collecting(&manager).await?;
    assert!(manager.is_listening().await);
    node.push_block(3);
    assert_eq!(timeout(WAIT, blocks.recv()).await?, Some(3));
    Ok(())
}

#[tokio::test]
async fn test_update_provider_stops_listening() -> Result<()> {
    init_logger(false);
    let node = MockWsNode::start().await?;
    let old_provider = Arc::new(StubChainProvider::new());
    let manager = session(&node, old_provider.clone())?;

    let _blocks = listen_collecting(&manager).await?;
    wait_for(WAIT, || node.subscriptions() == 1).await?;

    manager
        .update_provider(
            Arc::new(StubChainProvider::new()),
            Some(node.url().clone()),
            None,
        )
        .await?;
    wait_for(WAIT, || node.disconnections() == 1).await?;
    assert!(!manager.is_listening().await);
    assert!(old_provider.is_disconnected());
    Ok(())
}

#[tokio::test]
async fn test_balance_listening_reconciles_owner() -> Result<()> {
    init_logger(false);
    let node = MockWsNode::start().await?;
    let provider = Arc::new(StubChainProvider::new());
    let manager = session(&node, provider.clone())?;
    let address = manager.get_address();
    manager.set_amount_to_pay(U256::from(3));

    provider.add_block(
        2,
        vec![ObservedTransaction {
            hash: B256::ZERO,
            from: FUNDER,
            to: Some(address),
            value: U256::from(5),
            input: Bytes::new(),
        }],
    );

    let mut updates = manager.balance_updates();
    manager.listen_to_balance().await?;
    wait_for(WAIT, || node.subscriptions() == 1).await?;

    node.push_block(1);
    timeout(
        WAIT,
        updates.wait_for(|update| update.is_some_and(|o| o.block_number == Some(1))),
    )
    .await??;

    provider.set_balance(address, U256::from(5));
    node.push_block(2);
    let observation = *timeout(
        WAIT,
        updates.wait_for(|update| update.is_some_and(|o| o.block_number == Some(2))),
    )
    .await??;
    let observation = observation.expect("observation published");

    assert_eq!(observation.balance, U256::from(5));
    assert_eq!(observation.owner, Some(FUNDER));
    assert_eq!(manager.get_owner(), Some(FUNDER));

    manager.stop_listening_for_blocks().await;
    Ok(())
}
