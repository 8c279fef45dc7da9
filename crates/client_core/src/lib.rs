use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use shared::{
    domain::{ConnectorDescriptor, ConnectorId, Generation, TransactionHandle},
    error::{ErrorCode, ErrorDetail},
    protocol::{DappAction, DappEvent, DappSnapshot},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use wallet_integration::{
    MintContract, ProviderError, ProviderEvent, SignedSubmission, SignerHandle,
    TransactionReceipt, WalletProvider,
};

pub mod connection;
pub mod mint;
pub mod rpc_wallet;

pub use connection::{ConnectTicket, ConnectionController, ConnectionSession};
pub use mint::{MintController, MintStep, MintTicket};
pub use rpc_wallet::{JsonRpcSigner, JsonRpcWalletProvider, RpcConnectorConfig, RpcTimings};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub connect_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
        }
    }
}

enum RuntimeEvent {
    Connect {
        connector_id: ConnectorId,
        reply: oneshot::Sender<Result<(), ErrorDetail>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Mint {
        reply: oneshot::Sender<Result<Generation, ErrorDetail>>,
    },
    Snapshot {
        reply: oneshot::Sender<DappSnapshot>,
    },
    ConnectResolved {
        generation: Generation,
        result: Result<Arc<dyn SignerHandle>, ProviderError>,
    },
    Provider(ProviderEvent),
    MintSigned {
        generation: Generation,
        result: Result<SignedSubmission, ProviderError>,
    },
    MintSubmitted {
        generation: Generation,
        result: Result<TransactionHandle, ProviderError>,
    },
    MintSettled {
        generation: Generation,
        result: Result<TransactionReceipt, ProviderError>,
    },
}

impl RuntimeEvent {
    fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::Connect { .. } => "connect",
            RuntimeEvent::Disconnect { .. } => "disconnect",
            RuntimeEvent::Mint { .. } => "mint",
            RuntimeEvent::Snapshot { .. } => "snapshot",
            RuntimeEvent::ConnectResolved { .. } => "connect_resolved",
            RuntimeEvent::Provider(_) => "provider",
            RuntimeEvent::MintSigned { .. } => "mint_signed",
            RuntimeEvent::MintSubmitted { .. } => "mint_submitted",
            RuntimeEvent::MintSettled { .. } => "mint_settled",
        }
    }
}

/// Event loop owning both controllers.
///
/// Every state transition happens inside [`DappClient::apply`], one queued
/// event at a time. Suspending provider calls run in spawned tasks that post
/// their result back into the queue tagged with the generation that started
/// them.
pub struct DappClient {
    provider: Arc<dyn WalletProvider>,
    contract: MintContract,
    settings: RuntimeSettings,
    connection: ConnectionController,
    mint: MintController,
    queue: mpsc::WeakUnboundedSender<RuntimeEvent>,
    events: broadcast::Sender<DappEvent>,
}

impl DappClient {
    /// Starts the event loop on the current tokio runtime.
    pub fn spawn(
        provider: Arc<dyn WalletProvider>,
        contract: MintContract,
        settings: RuntimeSettings,
    ) -> DappHandle {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let forwarder = spawn_provider_forwarder(provider.as_ref(), queue_tx.downgrade());
        let client = Self {
            provider: Arc::clone(&provider),
            contract,
            settings,
            connection: ConnectionController::new(),
            mint: MintController::new(),
            queue: queue_tx.downgrade(),
            events: events.clone(),
        };
        tokio::spawn(client.run(queue_rx, forwarder));

        DappHandle {
            queue: queue_tx,
            events,
            provider,
        }
    }

    async fn run(
        mut self,
        mut queue: mpsc::UnboundedReceiver<RuntimeEvent>,
        forwarder: JoinHandle<()>,
    ) {
        info!("dapp: runtime started contract={}", self.contract.address());
        while let Some(event) = queue.recv().await {
            debug!(event = event.name(), "applying runtime event");
            self.apply(event);
        }
        forwarder.abort();
        info!("dapp: runtime stopped");
    }

    fn apply(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Connect {
                connector_id,
                reply,
            } => {
                let result = self.start_connect(&connector_id);
                self.reply_action(DappAction::Connect, reply, result);
            }
            RuntimeEvent::Disconnect { reply } => {
                if self.connection.disconnect() {
                    self.connection_changed();
                }
                let _ = reply.send(());
            }
            RuntimeEvent::Mint { reply } => {
                let result = self.start_mint();
                self.reply_action(DappAction::Mint, reply, result);
            }
            RuntimeEvent::Snapshot { reply } => {
                let _ = reply.send(DappSnapshot {
                    connectors: self.provider.list_identities(),
                    connection: self.connection.snapshot(),
                    mint: self.mint.snapshot(),
                });
            }
            RuntimeEvent::ConnectResolved { generation, result } => {
                if self.connection.resolve_connect(generation, result) {
                    self.connection_changed();
                }
            }
            RuntimeEvent::Provider(event) => {
                if self.connection.handle_provider_event(event) {
                    self.connection_changed();
                }
            }
            RuntimeEvent::MintSigned { generation, result } => {
                let step = self
                    .mint
                    .signed(generation, result, self.connection.session());
                if let Some(signed) = self.mint_step(step) {
                    self.spawn_submit(generation, signed);
                }
            }
            RuntimeEvent::MintSubmitted { generation, result } => {
                let step = self.mint.submitted(generation, result);
                if let Some(handle) = self.mint_step(step) {
                    self.spawn_receipt(generation, handle);
                }
            }
            RuntimeEvent::MintSettled { generation, result } => {
                let step = self.mint.settled(generation, result);
                self.mint_step(step);
            }
        }
    }

    fn start_connect(&mut self, connector_id: &ConnectorId) -> Result<(), ErrorDetail> {
        let listed = self.provider.list_identities();
        let ConnectTicket {
            generation,
            connector_id,
        } = self.connection.begin_connect(connector_id, &listed)?;
        self.connection_changed();

        let provider = Arc::clone(&self.provider);
        let timeout = self.settings.connect_timeout;
        self.spawn_step(async move {
            let result =
                match tokio::time::timeout(timeout, provider.request_connection(&connector_id))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(timeout)),
                };
            RuntimeEvent::ConnectResolved { generation, result }
        });
        Ok(())
    }

    fn start_mint(&mut self) -> Result<Generation, ErrorDetail> {
        let MintTicket { generation, signer } = self.mint.begin(self.connection.session())?;
        self.mint_changed();

        let call = self.contract.mint_call();
        self.spawn_step(async move {
            let result = signer.sign_transaction(&call).await;
            RuntimeEvent::MintSigned { generation, result }
        });
        Ok(generation)
    }

    fn spawn_submit(&self, generation: Generation, signed: SignedSubmission) {
        let Some(signer) = self.mint.signer() else {
            return;
        };
        self.spawn_step(async move {
            let result = signer.submit_transaction(signed).await;
            RuntimeEvent::MintSubmitted { generation, result }
        });
    }

    fn spawn_receipt(&self, generation: Generation, handle: TransactionHandle) {
        let Some(signer) = self.mint.signer() else {
            return;
        };
        self.spawn_step(async move {
            let result = signer.await_receipt(&handle).await;
            RuntimeEvent::MintSettled { generation, result }
        });
    }

    fn spawn_step<F>(&self, step: F)
    where
        F: std::future::Future<Output = RuntimeEvent> + Send + 'static,
    {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let event = step.await;
            match queue.upgrade() {
                Some(queue) => {
                    let _ = queue.send(event);
                }
                None => debug!(event = event.name(), "runtime gone; dropping step result"),
            }
        });
    }

    fn mint_step<T>(&mut self, step: MintStep<T>) -> Option<T> {
        match step {
            MintStep::Continue(value) => {
                self.mint_changed();
                Some(value)
            }
            MintStep::Settled => {
                self.mint_changed();
                None
            }
            MintStep::Stale => None,
        }
    }

    fn reply_action<T>(
        &self,
        action: DappAction,
        reply: oneshot::Sender<Result<T, ErrorDetail>>,
        result: Result<T, ErrorDetail>,
    ) {
        if let Err(error) = &result {
            warn!("dapp: {action:?} rejected: {error}");
            let _ = self.events.send(DappEvent::ActionRejected {
                action,
                error: error.clone(),
            });
        }
        let _ = reply.send(result);
    }

    fn connection_changed(&mut self) {
        let _ = self
            .events
            .send(DappEvent::ConnectionChanged(self.connection.snapshot()));
        if self.mint.observe_session(self.connection.session()) {
            self.mint_changed();
        }
    }

    fn mint_changed(&self) {
        let _ = self.events.send(DappEvent::MintChanged(self.mint.snapshot()));
    }
}

fn spawn_provider_forwarder(
    provider: &dyn WalletProvider,
    queue: mpsc::WeakUnboundedSender<RuntimeEvent>,
) -> JoinHandle<()> {
    let mut provider_events = provider.subscribe_events();
    tokio::spawn(async move {
        loop {
            let event = match provider_events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("dapp: dropped {skipped} provider events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            let Some(queue) = queue.upgrade() else {
                return;
            };
            if queue.send(RuntimeEvent::Provider(event)).is_err() {
                return;
            }
        }
    })
}

/// Cloneable UI-facing surface of a running [`DappClient`].
#[derive(Clone)]
pub struct DappHandle {
    queue: mpsc::UnboundedSender<RuntimeEvent>,
    events: broadcast::Sender<DappEvent>,
    provider: Arc<dyn WalletProvider>,
}

impl DappHandle {
    pub fn list_connectors(&self) -> Vec<ConnectorDescriptor> {
        self.provider.list_identities()
    }

    /// Starts a connection attempt. `Ok` means the session is now
    /// `Connecting`; the outcome arrives as a [`DappEvent::ConnectionChanged`].
    pub async fn connect(&self, connector_id: impl Into<ConnectorId>) -> Result<(), ErrorDetail> {
        let (reply, rx) = oneshot::channel();
        self.send(RuntimeEvent::Connect {
            connector_id: connector_id.into(),
            reply,
        })?;
        rx.await.map_err(|_| runtime_stopped())?
    }

    pub async fn disconnect(&self) -> Result<(), ErrorDetail> {
        let (reply, rx) = oneshot::channel();
        self.send(RuntimeEvent::Disconnect { reply })?;
        rx.await.map_err(|_| runtime_stopped())
    }

    /// Starts a mint and returns the generation of the new request.
    pub async fn mint(&self) -> Result<Generation, ErrorDetail> {
        let (reply, rx) = oneshot::channel();
        self.send(RuntimeEvent::Mint { reply })?;
        rx.await.map_err(|_| runtime_stopped())?
    }

    pub async fn snapshot(&self) -> Result<DappSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(RuntimeEvent::Snapshot { reply })?;
        rx.await.map_err(|_| anyhow!("dapp runtime stopped before answering"))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DappEvent> {
        self.events.subscribe()
    }

    fn send(&self, event: RuntimeEvent) -> Result<(), ErrorDetail> {
        self.queue.send(event).map_err(|_| runtime_stopped())
    }
}

fn runtime_stopped() -> ErrorDetail {
    ErrorDetail::new(ErrorCode::RuntimeStopped, "dapp runtime is not running")
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
