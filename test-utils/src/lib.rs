//! Citizen Wallet session testing utilities.
//!
//! Provides a scripted chain provider and a local WebSocket node, so sessions can be
//! exercised without a running chain.

use alloy::primitives::{Address, address};
use std::time::Duration;

pub use stub_provider::{StubChainProvider, StubMethod};
pub use ws_node::MockWsNode;

pub mod stub_provider;
pub mod ws_node;

/// Factory contract address used by test sessions.
pub const TEST_FACTORY: Address = address!("0x00000000000000000000000000000000000000fa");

/// Initializes logging for tests. Safe to call from every test.
pub fn init_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .is_test(true)
        .try_init();
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_for(
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("Condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
