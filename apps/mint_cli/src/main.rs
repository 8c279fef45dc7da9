use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use client_core::{DappClient, DappHandle, JsonRpcWalletProvider};
use futures::StreamExt;
use shared::{
    domain::{ConnectionStatus, Generation, MintStatus},
    error::ErrorDetail,
    protocol::{DappEvent, MintSnapshot},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wallet_integration::{MissingWalletProvider, WalletProvider};

mod config;

#[derive(Parser, Debug)]
#[command(name = "mint_cli", about = "Connect a wallet and mint from the configured contract")]
struct Args {
    /// Config file; `mint.toml` in the working directory when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the wallet connectors and their availability.
    Connectors,
    /// Connect, mint once, and wait for the outcome.
    Mint {
        #[arg(long, default_value = "local")]
        connector: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = config::load_settings(args.config.as_deref())?;
    let connectors = settings.rpc_connectors()?;
    let provider: Arc<dyn WalletProvider> = if connectors.is_empty() {
        warn!("mint_cli: no connectors configured");
        Arc::new(MissingWalletProvider::new())
    } else {
        Arc::new(JsonRpcWalletProvider::new(connectors, settings.rpc_timings()))
    };
    let handle = DappClient::spawn(provider, settings.mint_contract()?, settings.runtime());

    match args.command {
        Command::Connectors => {
            for connector in handle.list_connectors() {
                let availability = if connector.available {
                    "available"
                } else {
                    "unavailable"
                };
                println!("{}\t{}\t{availability}", connector.id, connector.display_name);
            }
            Ok(())
        }
        Command::Mint { connector } => run_mint(&handle, &connector).await,
    }
}

async fn run_mint(handle: &DappHandle, connector: &str) -> Result<()> {
    let mut events = BroadcastStream::new(handle.subscribe_events());

    handle.connect(connector).await.map_err(user_error)?;
    loop {
        let DappEvent::ConnectionChanged(snapshot) = next_event(&mut events).await? else {
            continue;
        };
        match snapshot.status {
            ConnectionStatus::Connected => {
                if let Some(account) = &snapshot.account {
                    println!("connected: {account}");
                }
                break;
            }
            ConnectionStatus::Error => {
                let detail = snapshot
                    .error
                    .ok_or_else(|| anyhow!("connection failed without detail"))?;
                return Err(user_error(detail));
            }
            status => println!("connection: {status:?}"),
        }
    }

    let generation = handle.mint().await.map_err(user_error)?;
    info!("mint_cli: mint started generation={generation}");
    let outcome = wait_for_mint(&mut events, generation).await;
    handle.disconnect().await.map_err(user_error)?;
    let outcome = outcome?;

    match outcome.status {
        MintStatus::Confirmed => {
            let tx = outcome
                .transaction_handle
                .map(|tx| tx.to_string())
                .unwrap_or_default();
            match outcome.block_number {
                Some(block) => println!("minted: tx={tx} block={block}"),
                None => println!("minted: tx={tx}"),
            }
            Ok(())
        }
        _ => match outcome.error {
            Some(detail) => Err(user_error(detail)),
            None => bail!("mint ended in {:?}", outcome.status),
        },
    }
}

async fn wait_for_mint(
    events: &mut BroadcastStream<DappEvent>,
    generation: Generation,
) -> Result<MintSnapshot> {
    loop {
        match next_event(events).await? {
            DappEvent::MintChanged(snapshot) if snapshot.generation == generation => {
                if snapshot.session_desynced {
                    warn!("mint_cli: wallet session changed while the mint is in flight");
                }
                println!("mint: {:?}", snapshot.status);
                if snapshot.status.is_terminal() {
                    return Ok(snapshot);
                }
            }
            DappEvent::ConnectionChanged(snapshot) => {
                println!("connection: {:?}", snapshot.status);
            }
            _ => {}
        }
    }
}

async fn next_event(events: &mut BroadcastStream<DappEvent>) -> Result<DappEvent> {
    loop {
        match events.next().await {
            Some(Ok(event)) => return Ok(event),
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                warn!("mint_cli: skipped {skipped} dapp events");
            }
            None => bail!("dapp runtime stopped"),
        }
    }
}

fn user_error(detail: ErrorDetail) -> anyhow::Error {
    let message = detail.user_message();
    anyhow::Error::new(detail).context(message)
}
