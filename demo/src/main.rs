use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use citizen_wallet_sdk::chain::RpcChainProvider;
use citizen_wallet_sdk::config::CommunityConfig;
use citizen_wallet_sdk::storage::FileStore;
use citizen_wallet_sdk::utils::{eth_to_wei, wei_to_eth};
use citizen_wallet_sdk::{Address, SessionManager};

/// Checkout session on a Citizen Wallet community
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Community configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Session store file, defaults to the user config directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Command to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the session, account and owner addresses with the balance
    Show,
    /// Wait for the session to be funded and report who funded it
    Watch {
        /// Amount expected to be paid
        #[arg(long)]
        amount: BigDecimal,
    },
    /// Record the session owner
    SetOwner { owner: Address },
    /// Send funds from the session
    Withdraw {
        #[arg(long)]
        to: Address,
        #[arg(long)]
        amount: BigDecimal,
    },
    /// Return the session balance to its owner
    Refund,
    /// Drop the session key and owner
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let content = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Failed to read {}", args.config.display()))?;
    let endpoints = CommunityConfig::from_json(&content)?.session_endpoints();

    let store = match args.store {
        Some(path) => FileStore::open(path),
        None => FileStore::open_default()?,
    };
    let session = SessionManager::builder()
        .store(Arc::new(store))
        .provider(Arc::new(RpcChainProvider::connect_http(endpoints.rpc_url)))
        .ws_url(endpoints.ws_url)
        .factory_address(endpoints.account_factory_address)
        .build()?;

    match args.command {
        Command::Show => show(&session).await?,
        Command::Watch { amount } => watch(&session, amount).await?,
        Command::SetOwner { owner } => {
            session.set_owner(owner)?;
            log::info!("Owner set to {owner}");
        }
        Command::Withdraw { to, amount } => {
            let pending = session.withdraw(to, eth_to_wei(amount)?).await?;
            log::info!("Withdrawal sent: {}", pending.tx_hash());
            let receipt = pending.wait().await?;
            log::info!("Withdrawal mined in block {:?}", receipt.block_number);
        }
        Command::Refund => {
            let refund = session.refund().await?;
            log::info!(
                "Refunding {} (fees {}) in {}",
                wei_to_eth(refund.amount),
                wei_to_eth(refund.fees),
                refund.transaction.tx_hash()
            );
            refund.transaction.wait().await?;
            log::info!("Refund confirmed");
        }
        Command::Reset => {
            session.reset().await?;
            log::info!("New session address: {}", session.get_address());
        }
    }

    Ok(())
}

async fn show(session: &SessionManager) -> Result<()> {
    let loaded = session.on_load().await?;
    log::info!("Session address: {}", session.get_address());
    log::info!("Account address: {}", session.get_account_address(false).await?);
    log::info!("Account deployed: {}", session.is_account_deployed().await?);
    log::info!("Owner: {:?}", loaded.owner);
    log::info!("Balance: {}", wei_to_eth(loaded.balance));
    Ok(())
}

async fn watch(session: &SessionManager, amount: BigDecimal) -> Result<()> {
    session.set_amount_to_pay(eth_to_wei(amount)?);
    let loaded = session.on_load().await?;
    log::info!(
        "Pay to {} (current balance {})",
        session.get_address(),
        wei_to_eth(loaded.balance)
    );

    let mut updates = session.balance_updates();
    session.listen_to_balance().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(observation) = *updates.borrow_and_update() else {
                    continue;
                };
                log::info!(
                    "Block {:?}: balance {}",
                    observation.block_number,
                    wei_to_eth(observation.balance)
                );
                if let Some(owner) = observation.owner {
                    log::info!("Session funded by {owner}");
                    break;
                }
            }
        }
    }

    session.stop_listening_for_blocks().await;
    Ok(())
}
