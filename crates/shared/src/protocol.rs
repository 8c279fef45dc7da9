use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        AccountAddress, ConnectionStatus, ConnectorDescriptor, ConnectorId, Generation,
        MintStatus, TransactionHandle,
    },
    error::ErrorDetail,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_connector_id: Option<ConnectorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountAddress>,
    pub signer_present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub generation: Generation,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintSnapshot {
    pub status: MintStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_handle: Option<TransactionHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub generation: Generation,
    /// Set when the wallet session changed while this request was in flight.
    pub session_desynced: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DappSnapshot {
    pub connectors: Vec<ConnectorDescriptor>,
    pub connection: ConnectionSnapshot,
    pub mint: MintSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DappAction {
    Connect,
    Disconnect,
    Mint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DappEvent {
    ConnectionChanged(ConnectionSnapshot),
    MintChanged(MintSnapshot),
    ActionRejected {
        action: DappAction,
        error: ErrorDetail,
    },
}
