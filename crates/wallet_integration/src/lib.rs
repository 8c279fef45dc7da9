use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{
        AccountAddress, ConnectorDescriptor, ConnectorId, ContractAddress, TransactionHandle,
    },
    error::{ErrorCode, ErrorDetail},
};
use thiserror::Error;
use tokio::sync::broadcast;

/// 4-byte selector of the parameterless `mint()` entry point.
pub const MINT_SELECTOR: &str = "0x1249c58b";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request rejected by wallet: {0}")]
    Rejected(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("contract execution reverted: {0}")]
    Reverted(String),
    #[error("wallet did not answer within {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProviderError::Rejected(_) => ErrorCode::ProviderRejected,
            ProviderError::Network(_) | ProviderError::Timeout(_) => ErrorCode::NetworkError,
            ProviderError::Reverted(_) => ErrorCode::ContractReverted,
        }
    }
}

impl From<ProviderError> for ErrorDetail {
    fn from(value: ProviderError) -> Self {
        ErrorDetail::new(value.code(), value.to_string())
    }
}

/// A transaction call addressed to the mint contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub to: ContractAddress,
    /// Hex encoded call data, `0x` prefixed.
    pub data: String,
}

/// Fixed deployment address and interface description of the mint contract.
///
/// Both come from deployment configuration and are passed through untouched.
#[derive(Debug, Clone)]
pub struct MintContract {
    address: ContractAddress,
    interface: Arc<serde_json::Value>,
    mint_calldata: String,
}

impl MintContract {
    pub fn new(address: ContractAddress, interface: serde_json::Value) -> Self {
        Self {
            address,
            interface: Arc::new(interface),
            mint_calldata: MINT_SELECTOR.to_string(),
        }
    }

    pub fn with_mint_calldata(mut self, calldata: impl Into<String>) -> Self {
        self.mint_calldata = calldata.into();
        self
    }

    pub fn address(&self) -> &ContractAddress {
        &self.address
    }

    pub fn interface(&self) -> &serde_json::Value {
        &self.interface
    }

    pub fn mint_call(&self) -> ContractCall {
        ContractCall {
            to: self.address.clone(),
            data: self.mint_calldata.clone(),
        }
    }
}

/// Signed transaction bytes ready for broadcast, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedSubmission {
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_handle: TransactionHandle,
    pub block_number: Option<u64>,
}

/// Capability obtained from a connected wallet.
#[async_trait]
pub trait SignerHandle: Send + Sync {
    fn account(&self) -> &AccountAddress;
    async fn sign_transaction(&self, call: &ContractCall) -> Result<SignedSubmission, ProviderError>;
    async fn submit_transaction(
        &self,
        signed: SignedSubmission,
    ) -> Result<TransactionHandle, ProviderError>;
    async fn await_receipt(
        &self,
        transaction: &TransactionHandle,
    ) -> Result<TransactionReceipt, ProviderError>;
}

/// Notifications pushed by a provider outside of any request.
#[derive(Clone)]
pub enum ProviderEvent {
    Disconnected {
        connector_id: ConnectorId,
        reason: String,
    },
    AccountChanged {
        connector_id: ConnectorId,
        signer: Arc<dyn SignerHandle>,
    },
}

impl ProviderEvent {
    pub fn connector_id(&self) -> &ConnectorId {
        match self {
            ProviderEvent::Disconnected { connector_id, .. }
            | ProviderEvent::AccountChanged { connector_id, .. } => connector_id,
        }
    }
}

impl fmt::Debug for ProviderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderEvent::Disconnected {
                connector_id,
                reason,
            } => f
                .debug_struct("Disconnected")
                .field("connector_id", connector_id)
                .field("reason", reason)
                .finish(),
            ProviderEvent::AccountChanged {
                connector_id,
                signer,
            } => f
                .debug_struct("AccountChanged")
                .field("connector_id", connector_id)
                .field("account", signer.account())
                .finish(),
        }
    }
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn list_identities(&self) -> Vec<ConnectorDescriptor>;
    async fn request_connection(
        &self,
        connector_id: &ConnectorId,
    ) -> Result<Arc<dyn SignerHandle>, ProviderError>;
    fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent>;
}

/// Provider used when no wallet backend is configured.
pub struct MissingWalletProvider {
    events: broadcast::Sender<ProviderEvent>,
}

impl MissingWalletProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for MissingWalletProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletProvider for MissingWalletProvider {
    fn list_identities(&self) -> Vec<ConnectorDescriptor> {
        Vec::new()
    }

    async fn request_connection(
        &self,
        connector_id: &ConnectorId,
    ) -> Result<Arc<dyn SignerHandle>, ProviderError> {
        Err(ProviderError::Rejected(format!(
            "wallet provider is unavailable for connector {connector_id}"
        )))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}
