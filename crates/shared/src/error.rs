use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A re-entrant call was refused while the previous one is still running.
    Busy,
    NotConnected,
    UnknownConnector,
    /// The user declined the connection or the signature in the wallet.
    ProviderRejected,
    NetworkError,
    ContractReverted,
    RuntimeStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Busy, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotConnected, message)
    }

    /// Whether the UI should prompt the user to connect a wallet before retrying.
    pub fn requires_connection(&self) -> bool {
        self.code == ErrorCode::NotConnected
    }

    pub fn user_message(&self) -> String {
        match self.code {
            ErrorCode::Busy => "An operation is already in progress; wait for it to finish.".to_string(),
            ErrorCode::NotConnected => "Connect a wallet before minting.".to_string(),
            ErrorCode::UnknownConnector => format!("Unknown wallet connector: {}", self.message),
            ErrorCode::ProviderRejected => format!("Request declined in wallet: {}", self.message),
            ErrorCode::NetworkError => {
                format!("Network unreachable; check the node and retry ({})", self.message)
            }
            ErrorCode::ContractReverted => format!("Mint reverted on-chain: {}", self.message),
            ErrorCode::RuntimeStopped => {
                "Wallet runtime stopped; restart the application.".to_string()
            }
        }
    }
}
