//! Wallet provider backed by an Ethereum JSON-RPC node with node-managed accounts.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use shared::domain::{AccountAddress, ConnectorDescriptor, ConnectorId, TransactionHandle};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};
use url::Url;
use wallet_integration::{
    ContractCall, ProviderError, ProviderEvent, SignedSubmission, SignerHandle,
    TransactionReceipt, WalletProvider,
};

/// EIP-1193 "user rejected request".
const USER_REJECTED_CODE: i64 = 4001;
/// Geth/anvil code for execution reverted.
const EXECUTION_REVERTED_CODE: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConnectorConfig {
    pub id: ConnectorId,
    pub display_name: String,
    pub rpc_url: Url,
    /// Account to use; the node's first account when unset.
    pub account: Option<AccountAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcTimings {
    pub receipt_poll_interval: Duration,
    pub receipt_timeout: Duration,
    /// Interval of the account watcher; no watcher when unset.
    pub account_poll_interval: Option<Duration>,
}

impl Default for RpcTimings {
    fn default() -> Self {
        Self {
            receipt_poll_interval: Duration::from_millis(1_000),
            receipt_timeout: Duration::from_secs(120),
            account_poll_interval: None,
        }
    }
}

#[derive(Debug, Error)]
enum RpcCallError {
    #[error("transport failure calling {method}: {message}")]
    Transport { method: String, message: String },
    #[error("{method} returned error {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("malformed {method} response: {message}")]
    Decode { method: String, message: String },
}

impl RpcCallError {
    fn is_revert(&self) -> bool {
        match self {
            RpcCallError::Rpc { code, message, .. } => {
                *code == EXECUTION_REVERTED_CODE
                    || message.to_ascii_lowercase().contains("revert")
            }
            _ => false,
        }
    }

    fn is_user_rejection(&self) -> bool {
        matches!(self, RpcCallError::Rpc { code, .. } if *code == USER_REJECTED_CODE)
    }

    fn is_transport(&self) -> bool {
        matches!(self, RpcCallError::Transport { .. })
    }
}

/// Maps a failed signing or broadcast call onto the mint failure kinds.
impl From<RpcCallError> for ProviderError {
    fn from(err: RpcCallError) -> Self {
        if err.is_revert() {
            ProviderError::Reverted(err.to_string())
        } else if err.is_user_rejection() {
            ProviderError::Rejected(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

fn same_account(left: &AccountAddress, right: &AccountAddress) -> bool {
    left.as_str().eq_ignore_ascii_case(right.as_str())
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignTransactionResponse {
    Raw(String),
    Envelope { raw: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptResponse {
    transaction_hash: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    block_number: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransactionCallRequest<'a> {
    from: &'a str,
    to: &'a str,
    data: &'a str,
}

/// JSON-RPC endpoint of one connector. Tracks the last observed reachability.
struct RpcEndpoint {
    http: Client,
    url: Url,
    reachable: AtomicBool,
    next_id: AtomicU64,
}

impl RpcEndpoint {
    fn new(http: Client, url: Url) -> Self {
        Self {
            http,
            url,
            reachable: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        }
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcCallError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .and_then(|res| res.error_for_status());
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.reachable.store(false, Ordering::Relaxed);
                return Err(RpcCallError::Transport {
                    method: method.to_string(),
                    message: err.to_string(),
                });
            }
        };
        self.reachable.store(true, Ordering::Relaxed);

        let body: RpcResponse = response.json().await.map_err(|err| RpcCallError::Decode {
            method: method.to_string(),
            message: err.to_string(),
        })?;

        if let Some(error) = body.error {
            return Err(RpcCallError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(body.result.unwrap_or(Value::Null)).map_err(|err| {
            RpcCallError::Decode {
                method: method.to_string(),
                message: err.to_string(),
            }
        })
    }

    async fn accounts(&self) -> Result<Vec<AccountAddress>, RpcCallError> {
        self.call("eth_accounts", json!([])).await
    }
}

pub struct JsonRpcWalletProvider {
    connectors: Vec<(RpcConnectorConfig, Arc<RpcEndpoint>)>,
    timings: RpcTimings,
    events: broadcast::Sender<ProviderEvent>,
    account_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl JsonRpcWalletProvider {
    pub fn new(connectors: Vec<RpcConnectorConfig>, timings: RpcTimings) -> Self {
        let http = Client::new();
        let connectors = connectors
            .into_iter()
            .map(|config| {
                let endpoint = Arc::new(RpcEndpoint::new(http.clone(), config.rpc_url.clone()));
                (config, endpoint)
            })
            .collect();
        let (events, _) = broadcast::channel(64);
        Self {
            connectors,
            timings,
            events,
            account_watcher: Mutex::new(None),
        }
    }

    fn connector(
        &self,
        connector_id: &ConnectorId,
    ) -> Option<&(RpcConnectorConfig, Arc<RpcEndpoint>)> {
        self.connectors
            .iter()
            .find(|(config, _)| &config.id == connector_id)
    }

    /// Polls `eth_accounts` for the connector while `signer` is still held by
    /// someone. The watcher follows the re-bound signer after an account switch
    /// and stops once the last session or mint holding it lets go.
    async fn restart_account_watcher(
        &self,
        connector_id: ConnectorId,
        endpoint: Arc<RpcEndpoint>,
        signer: &Arc<JsonRpcSigner>,
    ) {
        let mut guard = self.account_watcher.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }

        let Some(interval) = self.timings.account_poll_interval else {
            return;
        };

        let events = self.events.clone();
        let timings = self.timings.clone();
        let mut watched: Weak<JsonRpcSigner> = Arc::downgrade(signer);
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(current) = watched.upgrade().map(|signer| signer.account.clone()) else {
                    debug!("rpc wallet: signer released; account watcher for {connector_id} stops");
                    return;
                };
                match endpoint.accounts().await {
                    Ok(accounts) => {
                        let Some(first) = accounts.first().cloned() else {
                            let _ = events.send(ProviderEvent::Disconnected {
                                connector_id: connector_id.clone(),
                                reason: "wallet no longer exposes any account".to_string(),
                            });
                            return;
                        };
                        if accounts.iter().any(|account| same_account(account, &current)) {
                            continue;
                        }
                        info!("rpc wallet: account switched connector={connector_id} account={first}");
                        let rebound = Arc::new(JsonRpcSigner {
                            endpoint: Arc::clone(&endpoint),
                            account: first,
                            timings: timings.clone(),
                        });
                        watched = Arc::downgrade(&rebound);
                        let signer: Arc<dyn SignerHandle> = rebound;
                        let _ = events.send(ProviderEvent::AccountChanged {
                            connector_id: connector_id.clone(),
                            signer,
                        });
                    }
                    Err(err) if err.is_transport() => {
                        let _ = events.send(ProviderEvent::Disconnected {
                            connector_id: connector_id.clone(),
                            reason: err.to_string(),
                        });
                        return;
                    }
                    Err(err) => debug!("rpc wallet: account poll failed: {err}"),
                }
            }
        }));
    }
}

impl Drop for JsonRpcWalletProvider {
    fn drop(&mut self) {
        if let Some(watcher) = self.account_watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

#[async_trait]
impl WalletProvider for JsonRpcWalletProvider {
    fn list_identities(&self) -> Vec<ConnectorDescriptor> {
        self.connectors
            .iter()
            .map(|(config, endpoint)| ConnectorDescriptor {
                id: config.id.clone(),
                display_name: config.display_name.clone(),
                available: endpoint.is_reachable(),
            })
            .collect()
    }

    async fn request_connection(
        &self,
        connector_id: &ConnectorId,
    ) -> Result<Arc<dyn SignerHandle>, ProviderError> {
        let (config, endpoint) = self.connector(connector_id).ok_or_else(|| {
            ProviderError::Rejected(format!("connector {connector_id} is not configured"))
        })?;

        let accounts = endpoint.accounts().await.map_err(|err| match err {
            RpcCallError::Transport { .. } => ProviderError::Network(err.to_string()),
            _ => ProviderError::Rejected(err.to_string()),
        })?;

        let account = match &config.account {
            Some(pinned) => accounts
                .iter()
                .find(|account| same_account(account, pinned))
                .cloned()
                .ok_or_else(|| {
                    ProviderError::Rejected(format!(
                        "account {pinned} is not managed by {}",
                        config.rpc_url
                    ))
                })?,
            None => accounts.first().cloned().ok_or_else(|| {
                ProviderError::Rejected(format!("{} exposes no accounts", config.rpc_url))
            })?,
        };

        info!("rpc wallet: connection granted connector={connector_id} account={account}");
        let granted = Arc::new(JsonRpcSigner {
            endpoint: Arc::clone(endpoint),
            account,
            timings: self.timings.clone(),
        });
        self.restart_account_watcher(connector_id.clone(), Arc::clone(endpoint), &granted)
            .await;

        let signer: Arc<dyn SignerHandle> = granted;
        Ok(signer)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

pub struct JsonRpcSigner {
    endpoint: Arc<RpcEndpoint>,
    account: AccountAddress,
    timings: RpcTimings,
}

#[async_trait]
impl SignerHandle for JsonRpcSigner {
    fn account(&self) -> &AccountAddress {
        &self.account
    }

    async fn sign_transaction(
        &self,
        call: &ContractCall,
    ) -> Result<SignedSubmission, ProviderError> {
        let request = TransactionCallRequest {
            from: self.account.as_str(),
            to: call.to.as_str(),
            data: &call.data,
        };
        let response: SignTransactionResponse = self
            .endpoint
            .call("eth_signTransaction", json!([request]))
            .await?;

        let raw = match response {
            SignTransactionResponse::Raw(raw) | SignTransactionResponse::Envelope { raw } => raw,
        };
        Ok(SignedSubmission { raw })
    }

    async fn submit_transaction(
        &self,
        signed: SignedSubmission,
    ) -> Result<TransactionHandle, ProviderError> {
        let hash: String = self
            .endpoint
            .call("eth_sendRawTransaction", json!([signed.raw]))
            .await?;
        Ok(TransactionHandle::new(hash))
    }

    async fn await_receipt(
        &self,
        transaction: &TransactionHandle,
    ) -> Result<TransactionReceipt, ProviderError> {
        let deadline = Instant::now() + self.timings.receipt_timeout;
        loop {
            let receipt: Option<ReceiptResponse> = match self
                .endpoint
                .call("eth_getTransactionReceipt", json!([transaction.as_str()]))
                .await
            {
                Ok(receipt) => receipt,
                Err(err) if err.is_transport() => {
                    warn!("rpc wallet: receipt poll for tx={transaction} failed, retrying: {err}");
                    None
                }
                Err(err) => return Err(ProviderError::Network(err.to_string())),
            };

            if let Some(receipt) = receipt {
                let block_number = receipt.block_number.as_deref().and_then(parse_quantity);
                if receipt.status.as_deref().and_then(parse_quantity) == Some(0) {
                    return Err(ProviderError::Reverted(format!(
                        "transaction {} reverted in block {}",
                        receipt.transaction_hash,
                        block_number.map_or_else(|| "?".to_string(), |n| n.to_string())
                    )));
                }
                return Ok(TransactionReceipt {
                    transaction_handle: TransactionHandle::new(receipt.transaction_hash),
                    block_number,
                });
            }

            if Instant::now() + self.timings.receipt_poll_interval > deadline {
                warn!("rpc wallet: no receipt for tx={transaction} before deadline");
                return Err(ProviderError::Network(format!(
                    "no receipt for {transaction} within {:?}",
                    self.timings.receipt_timeout
                )));
            }
            tokio::time::sleep(self.timings.receipt_poll_interval).await;
        }
    }
}

fn parse_quantity(raw: &str) -> Option<u64> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
#[path = "tests/rpc_wallet_tests.rs"]
mod tests;
