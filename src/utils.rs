use alloy::primitives::U256;
use bigdecimal::{BigDecimal, ToPrimitive};
use std::str::FromStr;

const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;

/// Converts an amount of native currency to wei.
/// Fractions of a wei are truncated. Fails for negative amounts or values above `u128::MAX` wei.
pub fn eth_to_wei(eth: BigDecimal) -> anyhow::Result<U256> {
    let wei = (eth * BigDecimal::from(WEI_PER_ETH))
        .with_scale(0)
        .to_u128()
        .ok_or_else(|| anyhow::anyhow!("Amount is negative or too large"))?;
    Ok(U256::from(wei))
}

/// Converts a wei amount to native currency, for display and logs.
pub fn wei_to_eth(wei: U256) -> BigDecimal {
    // The decimal string of a U256 is always a valid integer literal.
    let wei = BigDecimal::from_str(&wei.to_string()).unwrap_or_default();
    wei / BigDecimal::from(WEI_PER_ETH)
}
