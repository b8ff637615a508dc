use alloy::consensus::Transaction;
use alloy::primitives::{Address, U256, address};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use citizen_wallet_sdk::chain::{FeeData, TransferReceipt};
use citizen_wallet_sdk::config::{GWEI, TransactionConfig};
use citizen_wallet_sdk::storage::MemoryStore;
use citizen_wallet_sdk::{SessionError, SessionManager};
use citizen_wallet_test_utils::stub_provider::STUB_CHAIN_ID;
use citizen_wallet_test_utils::{StubChainProvider, StubMethod, init_logger};

const OWNER: Address = address!("0x00000000000000000000000000000000000000aa");
const RECIPIENT: Address = address!("0x00000000000000000000000000000000000000bb");

const BASE_FEE: u128 = GWEI;
// Next base fee plus the default 2 gwei tip, for 21000 gas.
const REFUND_FEES: u128 = 3 * GWEI * 21_000;

fn fee_data() -> FeeData {
    FeeData {
        next_block_base_fee: BASE_FEE,
        max_fee_per_gas: 4 * GWEI,
        max_priority_fee_per_gas: GWEI,
    }
}

fn funded_session(balance: U256) -> Result<(SessionManager, Arc<StubChainProvider>)> {
    let provider = Arc::new(StubChainProvider::new());
    provider.set_fee_data(fee_data());
    let manager = SessionManager::builder()
        .store(Arc::new(MemoryStore::new()))
        .provider(provider.clone())
        .transaction_config(TransactionConfig {
            receipt_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        })
        .build()?;
    provider.set_balance(manager.get_address(), balance);
    Ok((manager, provider))
}

#[tokio::test]
async fn test_refund_sends_balance_minus_fees_to_owner() -> Result<()> {
    init_logger(false);
    let balance = U256::from(1_000_000 * GWEI);
    let (manager, provider) = funded_session(balance)?;
    manager.set_owner(OWNER)?;
    provider.set_nonce(manager.get_address(), 3);

    let refund = manager.refund().await?;
    assert_eq!(refund.fees, U256::from(REFUND_FEES));
    assert_eq!(refund.amount, balance - U256::from(REFUND_FEES));

    let sent = provider.sent_transactions()?;
    assert_eq!(sent.len(), 1);
    let tx = &sent[0];
    assert_eq!(tx.to(), Some(OWNER));
    assert_eq!(tx.value(), refund.amount);
    assert_eq!(tx.gas_limit(), 21_000);
    assert_eq!(tx.gas_price(), Some(3 * GWEI));
    assert_eq!(tx.nonce(), 3);
    assert_eq!(tx.chain_id(), Some(STUB_CHAIN_ID));
    assert_eq!(*tx.tx_hash(), refund.transaction.tx_hash());

    let receipt = refund.transaction.wait().await?;
    assert!(receipt.status);
    Ok(())
}

#[tokio::test]
async fn test_refund_without_owner_fails() -> Result<()> {
    init_logger(false);
    let (manager, provider) = funded_session(U256::from(1_000_000 * GWEI))?;

    assert!(matches!(
        manager.refund().await,
        Err(SessionError::OwnerNotSet)
    ));
    assert_eq!(provider.call_count(StubMethod::GetFeeData), 0);
    Ok(())
}

#[tokio::test]
async fn test_refund_insufficient_funds_sends_nothing() -> Result<()> {
    init_logger(false);
    for balance in [0, REFUND_FEES - 1, REFUND_FEES] {
        let (manager, provider) = funded_session(U256::from(balance))?;
        manager.set_owner(OWNER)?;

        match manager.refund().await {
            Err(SessionError::InsufficientFunds { balance: b, fees }) => {
                assert_eq!(b, U256::from(balance));
                assert_eq!(fees, U256::from(REFUND_FEES));
            }
            other => panic!("expected InsufficientFunds, got {other:?}"),
        }
        assert_eq!(provider.call_count(StubMethod::SendRawTransaction), 0);
        assert!(provider.sent_raw_transactions().is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_refund_with_absurd_base_fee_fails_cleanly() -> Result<()> {
    init_logger(false);
    let (manager, provider) = funded_session(U256::MAX)?;
    manager.set_owner(OWNER)?;
    provider.set_fee_data(FeeData {
        next_block_base_fee: u128::MAX,
        ..fee_data()
    });

    let result = manager.refund().await;
    assert!(matches!(result, Err(SessionError::RemoteCallFailure(_))));
    assert_eq!(provider.call_count(StubMethod::GetBalance), 0);
    assert!(provider.sent_raw_transactions().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_refund_rejected_by_node() -> Result<()> {
    init_logger(false);
    let (manager, provider) = funded_session(U256::from(1_000_000 * GWEI))?;
    manager.set_owner(OWNER)?;
    provider.fail_once(StubMethod::SendRawTransaction, "nonce too low");

    assert!(matches!(
        manager.refund().await,
        Err(SessionError::RemoteCallFailure(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_withdraw_uses_fee_estimate() -> Result<()> {
    init_logger(false);
    let (manager, provider) = funded_session(U256::from(1_000_000 * GWEI))?;
    let amount = U256::from(5 * GWEI);

    let pending = manager.withdraw(RECIPIENT, amount).await?;

    let sent = provider.sent_transactions()?;
    assert_eq!(sent.len(), 1);
    let tx = &sent[0];
    assert_eq!(tx.to(), Some(RECIPIENT));
    assert_eq!(tx.value(), amount);
    assert_eq!(tx.gas_limit(), 21_000);
    assert_eq!(tx.max_fee_per_gas(), 4 * GWEI);
    assert_eq!(tx.max_priority_fee_per_gas(), Some(GWEI));
    assert_eq!(*tx.tx_hash(), pending.tx_hash());

    pending.wait().await?;
    Ok(())
}

#[tokio::test]
async fn test_pending_transfer_times_out() -> Result<()> {
    init_logger(false);
    let (manager, provider) = funded_session(U256::from(1_000_000 * GWEI))?;
    provider.set_mine_sent(false);

    let pending = manager.withdraw(RECIPIENT, U256::from(1)).await?;
    let hash = pending.tx_hash();
    match pending.wait().await {
        Err(SessionError::ConfirmationTimeout(timed_out)) => assert_eq!(timed_out, hash),
        other => panic!("expected ConfirmationTimeout, got {other:?}"),
    }
    assert!(provider.call_count(StubMethod::GetTransactionReceipt) > 1);
    Ok(())
}

#[tokio::test]
async fn test_pending_transfer_reports_revert() -> Result<()> {
    init_logger(false);
    let (manager, provider) = funded_session(U256::from(1_000_000 * GWEI))?;
    provider.set_mine_sent(false);

    let pending = manager.withdraw(RECIPIENT, U256::from(1)).await?;
    provider.fail_once(
        StubMethod::GetTransactionReceipt,
        "transaction indexing is in progress",
    );
    provider.set_receipt(TransferReceipt {
        transaction_hash: pending.tx_hash(),
        block_number: Some(9),
        status: false,
    });

    assert!(matches!(
        pending.wait().await,
        Err(SessionError::RemoteCallFailure(_))
    ));
    assert_eq!(provider.call_count(StubMethod::GetTransactionReceipt), 2);
    Ok(())
}
