use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Interval between two heartbeat pings on the block subscription socket.
pub const KEEP_ALIVE_CHECK_INTERVAL: Duration = Duration::from_millis(15_000);
/// How long to wait for a `"pong"` before the socket is considered dead.
pub const EXPECTED_PONG_BACK: Duration = Duration::from_millis(7_500);

/// One gwei in wei.
pub const GWEI: u128 = 1_000_000_000;

/// Heartbeat settings for the block subscription socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub interval: Duration,
    /// Time allowed for the `"pong"` reply before the socket is closed.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: KEEP_ALIVE_CHECK_INTERVAL,
            pong_timeout: EXPECTED_PONG_BACK,
        }
    }
}

/// Configuration for transactions sent by the session.
/// Holds gas and fee settings plus the confirmation polling policy.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Gas limit of a plain value transfer.
    pub transfer_gas_limit: u64,
    /// Priority fee added on top of the next block base fee (in wei).
    pub priority_fee_per_gas: u128,
    /// How long to wait for a receipt before giving up.
    pub receipt_timeout: Duration,
    /// Delay between two receipt lookups.
    pub poll_interval: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            transfer_gas_limit: 21_000,
            priority_fee_per_gas: 2 * GWEI,
            receipt_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Community configuration document, as served by the community config API.
/// Only the sections the session layer needs are typed, other sections are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityConfig {
    /// Community identity.
    pub community: CommunityInfo,
    /// Chain node endpoints.
    pub node: NodeConfig,
    /// Account abstraction contracts.
    pub erc4337: Erc4337Config,
    /// Config schema version.
    #[serde(default)]
    pub version: u32,
}

/// Community identity section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityInfo {
    pub name: String,
    pub alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub logo: String,
    #[serde(rename = "customDomain", default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
}

/// Chain node endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(
        rename = "chainId",
        alias = "chain_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub chain_id: Option<u64>,
    /// JSON-RPC endpoint.
    pub url: Url,
    /// WebSocket endpoint used for block subscriptions.
    pub ws_url: Url,
}

/// Account abstraction section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Erc4337Config {
    pub rpc_url: Url,
    pub entrypoint_address: Address,
    pub account_factory_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_rpc_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_extra_percentage: Option<u32>,
}

/// Endpoints a session is constructed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoints {
    pub rpc_url: Url,
    pub ws_url: Url,
    pub account_factory_address: Address,
}

impl CommunityConfig {
    /// Parses a single community configuration.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("Failed to parse community config: {e}"))
    }

    /// Parses the list of community configurations returned by the config API.
    pub fn list_from_json(json: &str) -> anyhow::Result<Vec<Self>> {
        serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("Failed to parse community config list: {e}"))
    }

    /// Endpoints needed to construct a session for this community.
    pub fn session_endpoints(&self) -> SessionEndpoints {
        SessionEndpoints {
            rpc_url: self.node.url.clone(),
            ws_url: self.node.ws_url.clone(),
            account_factory_address: self.erc4337.account_factory_address,
        }
    }
}
