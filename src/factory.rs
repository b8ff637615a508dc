use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::eth::TransactionRequest;
use alloy_sol_types::{SolCall, SolValue, sol};
use anyhow::anyhow;

use crate::chain::ChainProvider;

sol! {
    interface IAccountFactory {
        function getAddress(address owner, uint256 salt) external view returns (address);
    }
}

/// Salt used for session accounts.
pub const DEFAULT_SALT: U256 = U256::ZERO;

/// Read-only client of an account factory contract, bound to one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountFactory {
    address: Address,
    owner: Address,
}

impl AccountFactory {
    /// Binds the factory at `address` to `owner`.
    pub fn new(address: Address, owner: Address) -> Self {
        Self { address, owner }
    }

    /// Factory contract address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Owner the counterfactual accounts are derived for.
    pub fn owner(&self) -> Address {
        self.owner
    }

    /// Encodes the `getAddress(owner, salt)` call.
    pub fn get_address_request(&self, salt: U256) -> TransactionRequest {
        let call = IAccountFactory::getAddressCall {
            owner: self.owner,
            salt,
        };
        TransactionRequest::default()
            .with_to(self.address)
            .with_input(call.abi_encode())
    }

    /// Computes the counterfactual account address for the bound owner and `salt`.
    pub async fn get_address(
        &self,
        provider: &dyn ChainProvider,
        salt: U256,
    ) -> anyhow::Result<Address> {
        let output = provider.call(self.get_address_request(salt)).await?;
        let account = Address::abi_decode(&output).map_err(|e| {
            anyhow!(
                "Failed to decode getAddress output from factory {}: {e}",
                self.address
            )
        })?;

        log::debug!(
            "Factory {} derived account {account} for owner {} (salt {salt})",
            self.address,
            self.owner
        );
        Ok(account)
    }
}
