use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{AccountAddress, ConnectorDescriptor, ConnectorId, TransactionHandle},
    protocol::DappEvent,
};
use tokio::sync::{broadcast, Notify};
use wallet_integration::{
    ContractCall, ProviderError, ProviderEvent, SignedSubmission, SignerHandle,
    TransactionReceipt, WalletProvider,
};

pub(crate) const TEST_TX_HASH: &str =
    "0x8f2a1e9d1b7c4d3e5f60718293a4b5c6d7e8f90112233445566778899aabbcc";

pub(crate) struct MockSigner {
    account: AccountAddress,
    sign_error: Option<ProviderError>,
    submit_error: Option<ProviderError>,
    receipt_error: Option<ProviderError>,
    sign_gate: Option<Arc<Notify>>,
    receipt_gate: Option<Arc<Notify>>,
    pub(crate) sign_calls: AtomicUsize,
    pub(crate) submit_calls: AtomicUsize,
    pub(crate) receipt_calls: AtomicUsize,
}

impl MockSigner {
    pub(crate) fn new(account: &str) -> Self {
        Self {
            account: AccountAddress::new(account),
            sign_error: None,
            submit_error: None,
            receipt_error: None,
            sign_gate: None,
            receipt_gate: None,
            sign_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            receipt_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn rejecting_signature(mut self, reason: &str) -> Self {
        self.sign_error = Some(ProviderError::Rejected(reason.to_string()));
        self
    }

    pub(crate) fn failing_submission(mut self, err: ProviderError) -> Self {
        self.submit_error = Some(err);
        self
    }

    pub(crate) fn reverting(mut self, reason: &str) -> Self {
        self.receipt_error = Some(ProviderError::Reverted(reason.to_string()));
        self
    }

    pub(crate) fn with_sign_gate(mut self, gate: Arc<Notify>) -> Self {
        self.sign_gate = Some(gate);
        self
    }

    pub(crate) fn with_receipt_gate(mut self, gate: Arc<Notify>) -> Self {
        self.receipt_gate = Some(gate);
        self
    }

    pub(crate) fn sign_count(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn submit_count(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignerHandle for MockSigner {
    fn account(&self) -> &AccountAddress {
        &self.account
    }

    async fn sign_transaction(&self, call: &ContractCall) -> Result<SignedSubmission, ProviderError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.sign_gate {
            gate.notified().await;
        }
        if let Some(err) = &self.sign_error {
            return Err(err.clone());
        }
        Ok(SignedSubmission {
            raw: format!("0xf86b{}", call.data.trim_start_matches("0x")),
        })
    }

    async fn submit_transaction(
        &self,
        _signed: SignedSubmission,
    ) -> Result<TransactionHandle, ProviderError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.submit_error {
            return Err(err.clone());
        }
        Ok(TransactionHandle::new(TEST_TX_HASH))
    }

    async fn await_receipt(
        &self,
        transaction: &TransactionHandle,
    ) -> Result<TransactionReceipt, ProviderError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.receipt_gate {
            gate.notified().await;
        }
        if let Some(err) = &self.receipt_error {
            return Err(err.clone());
        }
        Ok(TransactionReceipt {
            transaction_handle: transaction.clone(),
            block_number: Some(42),
        })
    }
}

pub(crate) struct MockWallet {
    connectors: Vec<ConnectorDescriptor>,
    signer: Arc<MockSigner>,
    connect_error: Option<ProviderError>,
    connect_gate: Option<Arc<Notify>>,
    connect_delay: Option<Duration>,
    pub(crate) connect_calls: AtomicUsize,
    pub(crate) events: broadcast::Sender<ProviderEvent>,
}

impl MockWallet {
    pub(crate) fn new(signer: Arc<MockSigner>) -> Self {
        Self {
            connectors: vec![injected_descriptor()],
            signer,
            connect_error: None,
            connect_gate: None,
            connect_delay: None,
            connect_calls: AtomicUsize::new(0),
            events: broadcast::channel(16).0,
        }
    }

    pub(crate) fn rejecting_connection(mut self, reason: &str) -> Self {
        self.connect_error = Some(ProviderError::Rejected(reason.to_string()));
        self
    }

    pub(crate) fn with_connect_gate(mut self, gate: Arc<Notify>) -> Self {
        self.connect_gate = Some(gate);
        self
    }

    pub(crate) fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }
}

#[async_trait]
impl WalletProvider for MockWallet {
    fn list_identities(&self) -> Vec<ConnectorDescriptor> {
        self.connectors.clone()
    }

    async fn request_connection(
        &self,
        _connector_id: &ConnectorId,
    ) -> Result<Arc<dyn SignerHandle>, ProviderError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.connect_gate {
            gate.notified().await;
        }
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }
        let signer: Arc<dyn SignerHandle> = self.signer.clone();
        Ok(signer)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

pub(crate) fn injected_descriptor() -> ConnectorDescriptor {
    ConnectorDescriptor {
        id: ConnectorId::new("injected"),
        display_name: "Browser Wallet".to_string(),
        available: true,
    }
}

pub(crate) async fn next_event(rx: &mut broadcast::Receiver<DappEvent>) -> DappEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event before timeout")
        .expect("event channel open")
}
