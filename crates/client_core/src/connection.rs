//! Wallet connection state machine.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::{AccountAddress, ConnectionStatus, ConnectorDescriptor, ConnectorId, Generation},
    error::{ErrorCode, ErrorDetail},
    protocol::ConnectionSnapshot,
};
use tracing::{debug, info, warn};
use wallet_integration::{ProviderError, ProviderEvent, SignerHandle};

pub struct ConnectionSession {
    status: ConnectionStatus,
    active_connector_id: Option<ConnectorId>,
    signer: Option<Arc<dyn SignerHandle>>,
    error: Option<ErrorDetail>,
    generation: Generation,
    updated_at: DateTime<Utc>,
}

impl ConnectionSession {
    fn disconnected(generation: Generation) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            active_connector_id: None,
            signer: None,
            error: None,
            generation,
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn active_connector_id(&self) -> Option<&ConnectorId> {
        self.active_connector_id.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        self.error.as_ref()
    }

    pub fn account(&self) -> Option<&AccountAddress> {
        self.signer.as_ref().map(|signer| signer.account())
    }

    /// The signer, only while the session is connected.
    pub fn connected_signer(&self) -> Option<Arc<dyn SignerHandle>> {
        if self.status != ConnectionStatus::Connected {
            return None;
        }
        self.signer.clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            status: self.status,
            active_connector_id: self.active_connector_id.clone(),
            account: self.account().cloned(),
            signer_present: self.signer.is_some(),
            error: self.error.clone(),
            generation: self.generation,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("status", &self.status)
            .field("active_connector_id", &self.active_connector_id)
            .field("account", &self.account())
            .field("error", &self.error)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Issued when a connection attempt starts; the result must be reported with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTicket {
    pub generation: Generation,
    pub connector_id: ConnectorId,
}

/// Owns the single wallet session and is its only writer.
#[derive(Debug)]
pub struct ConnectionController {
    session: ConnectionSession,
}

impl Default for ConnectionController {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionController {
    pub fn new() -> Self {
        Self {
            session: ConnectionSession::disconnected(Generation::INITIAL),
        }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.session.snapshot()
    }

    pub fn begin_connect(
        &mut self,
        connector_id: &ConnectorId,
        listed: &[ConnectorDescriptor],
    ) -> Result<ConnectTicket, ErrorDetail> {
        match self.session.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
            ConnectionStatus::Connecting => {
                return Err(ErrorDetail::busy(format!(
                    "connection attempt already in progress for {}",
                    display_connector(self.session.active_connector_id.as_ref())
                )));
            }
            ConnectionStatus::Connected => {
                return Err(ErrorDetail::busy(format!(
                    "already connected via {}; disconnect first",
                    display_connector(self.session.active_connector_id.as_ref())
                )));
            }
        }

        if !listed.iter().any(|descriptor| &descriptor.id == connector_id) {
            return Err(ErrorDetail::new(
                ErrorCode::UnknownConnector,
                connector_id.to_string(),
            ));
        }

        let generation = self.session.generation.next();
        self.session = ConnectionSession {
            status: ConnectionStatus::Connecting,
            active_connector_id: Some(connector_id.clone()),
            signer: None,
            error: None,
            generation,
            updated_at: Utc::now(),
        };
        info!("wallet: connecting connector={connector_id} generation={generation}");

        Ok(ConnectTicket {
            generation,
            connector_id: connector_id.clone(),
        })
    }

    /// Applies the outcome of a connection attempt. Returns `false` when the
    /// outcome belongs to a superseded attempt and was discarded.
    pub fn resolve_connect(
        &mut self,
        generation: Generation,
        result: Result<Arc<dyn SignerHandle>, ProviderError>,
    ) -> bool {
        if generation != self.session.generation
            || self.session.status != ConnectionStatus::Connecting
        {
            debug!(
                "wallet: discarding stale connect result generation={generation} current={}",
                self.session.generation
            );
            return false;
        }

        self.session.updated_at = Utc::now();
        match result {
            Ok(signer) => {
                info!(
                    "wallet: connected connector={} account={} generation={generation}",
                    display_connector(self.session.active_connector_id.as_ref()),
                    signer.account()
                );
                self.session.status = ConnectionStatus::Connected;
                self.session.signer = Some(signer);
            }
            Err(err) => {
                warn!(
                    "wallet: connection failed connector={} generation={generation}: {err}",
                    display_connector(self.session.active_connector_id.as_ref())
                );
                self.session.status = ConnectionStatus::Error;
                self.session.error = Some(err.into());
            }
        }
        true
    }

    /// Resets the session. Returns `false` when it was already disconnected.
    pub fn disconnect(&mut self) -> bool {
        if self.session.status == ConnectionStatus::Disconnected {
            return false;
        }

        let generation = self.session.generation.next();
        info!(
            "wallet: disconnected connector={} generation={generation}",
            display_connector(self.session.active_connector_id.as_ref())
        );
        self.session = ConnectionSession::disconnected(generation);
        true
    }

    /// Applies a provider notification. Returns whether the session changed.
    pub fn handle_provider_event(&mut self, event: ProviderEvent) -> bool {
        if self.session.active_connector_id.as_ref() != Some(event.connector_id()) {
            debug!(
                "wallet: ignoring provider event for inactive connector={}",
                event.connector_id()
            );
            return false;
        }

        match event {
            ProviderEvent::Disconnected { reason, .. } => {
                if self.session.status == ConnectionStatus::Disconnected {
                    return false;
                }
                warn!("wallet: provider ended the session: {reason}");
                self.disconnect()
            }
            ProviderEvent::AccountChanged { signer, .. } => {
                if self.session.status != ConnectionStatus::Connected {
                    return false;
                }
                if self.account() == Some(signer.account()) {
                    return false;
                }
                let generation = self.session.generation.next();
                info!(
                    "wallet: account changed to {} generation={generation}",
                    signer.account()
                );
                self.session.signer = Some(signer);
                self.session.generation = generation;
                self.session.updated_at = Utc::now();
                true
            }
        }
    }

    fn account(&self) -> Option<&AccountAddress> {
        self.session.account()
    }
}

fn display_connector(connector_id: Option<&ConnectorId>) -> &str {
    connector_id.map(ConnectorId::as_str).unwrap_or("<none>")
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
