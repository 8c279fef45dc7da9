//! Mint transaction state machine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConnectionStatus, Generation, MintStatus, TransactionHandle},
    error::ErrorDetail,
    protocol::MintSnapshot,
};
use tracing::{debug, info, warn};
use wallet_integration::{ProviderError, SignedSubmission, SignerHandle, TransactionReceipt};

use crate::connection::ConnectionSession;

#[derive(Debug, Clone)]
struct MintRequest {
    status: MintStatus,
    transaction_handle: Option<TransactionHandle>,
    block_number: Option<u64>,
    error: Option<ErrorDetail>,
    generation: Generation,
    session_generation: Option<Generation>,
    session_desynced: bool,
    updated_at: DateTime<Utc>,
}

impl MintRequest {
    fn idle() -> Self {
        Self {
            status: MintStatus::Idle,
            transaction_handle: None,
            block_number: None,
            error: None,
            generation: Generation::INITIAL,
            session_generation: None,
            session_desynced: false,
            updated_at: Utc::now(),
        }
    }
}

/// Issued for an accepted mint; carries the signer captured at acceptance.
pub struct MintTicket {
    pub generation: Generation,
    pub signer: Arc<dyn SignerHandle>,
}

/// Outcome of applying an asynchronous step result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MintStep<T> {
    /// Applied; the request moves on to the next step with this value.
    Continue(T),
    /// Applied; the request reached a terminal status.
    Settled,
    /// Result of a superseded request or an out-of-order step; discarded.
    Stale,
}

pub struct MintController {
    request: MintRequest,
    /// Signer captured when the current request was accepted.
    signer: Option<Arc<dyn SignerHandle>>,
}

impl Default for MintController {
    fn default() -> Self {
        Self::new()
    }
}

impl MintController {
    pub fn new() -> Self {
        Self {
            request: MintRequest::idle(),
            signer: None,
        }
    }

    pub fn status(&self) -> MintStatus {
        self.request.status
    }

    pub fn generation(&self) -> Generation {
        self.request.generation
    }

    /// Signer of the in-flight request. Submission and receipt polling keep
    /// using it even after the wallet session ends.
    pub fn signer(&self) -> Option<Arc<dyn SignerHandle>> {
        if !self.request.status.is_in_flight() {
            return None;
        }
        self.signer.clone()
    }

    pub fn snapshot(&self) -> MintSnapshot {
        MintSnapshot {
            status: self.request.status,
            transaction_handle: self.request.transaction_handle.clone(),
            block_number: self.request.block_number,
            error: self.request.error.clone(),
            generation: self.request.generation,
            session_desynced: self.request.session_desynced,
            updated_at: self.request.updated_at,
        }
    }

    /// Starts a fresh request. Rejections leave the current request untouched.
    pub fn begin(&mut self, session: &ConnectionSession) -> Result<MintTicket, ErrorDetail> {
        if self.request.status.is_in_flight() {
            return Err(ErrorDetail::busy(format!(
                "mint generation {} is still {:?}",
                self.request.generation, self.request.status
            )));
        }

        let Some(signer) = session.connected_signer() else {
            return Err(ErrorDetail::not_connected(format!(
                "wallet session is {:?}",
                session.status()
            )));
        };

        let generation = self.request.generation.next();
        self.request = MintRequest {
            status: MintStatus::AwaitingSigner,
            generation,
            session_generation: Some(session.generation()),
            ..MintRequest::idle()
        };
        self.signer = Some(Arc::clone(&signer));
        info!(
            "mint: awaiting signer account={} generation={generation}",
            signer.account()
        );

        Ok(MintTicket { generation, signer })
    }

    /// Applies the signer's answer. The session is re-checked before the
    /// signed transaction may be submitted.
    pub fn signed(
        &mut self,
        generation: Generation,
        result: Result<SignedSubmission, ProviderError>,
        session: &ConnectionSession,
    ) -> MintStep<SignedSubmission> {
        if !self.is_current(generation, MintStatus::AwaitingSigner) {
            return MintStep::Stale;
        }

        let signed = match result {
            Ok(signed) => signed,
            Err(err) => {
                self.fail(err.into());
                return MintStep::Settled;
            }
        };

        if session.connected_signer().is_none() {
            self.fail(ErrorDetail::not_connected(
                "wallet session ended before the signed mint was submitted",
            ));
            return MintStep::Settled;
        }

        self.transition(MintStatus::Submitting);
        MintStep::Continue(signed)
    }

    pub fn submitted(
        &mut self,
        generation: Generation,
        result: Result<TransactionHandle, ProviderError>,
    ) -> MintStep<TransactionHandle> {
        if !self.is_current(generation, MintStatus::Submitting) {
            return MintStep::Stale;
        }

        match result {
            Ok(handle) => {
                info!("mint: submitted tx={handle} generation={generation}");
                self.request.transaction_handle = Some(handle.clone());
                self.transition(MintStatus::Pending);
                MintStep::Continue(handle)
            }
            Err(err) => {
                self.fail(err.into());
                MintStep::Settled
            }
        }
    }

    pub fn settled(
        &mut self,
        generation: Generation,
        result: Result<TransactionReceipt, ProviderError>,
    ) -> MintStep<()> {
        if !self.is_current(generation, MintStatus::Pending) {
            return MintStep::Stale;
        }

        match result {
            Ok(receipt) => {
                info!(
                    "mint: confirmed tx={} block={:?} generation={generation}",
                    receipt.transaction_handle, receipt.block_number
                );
                self.request.block_number = receipt.block_number;
                self.transition(MintStatus::Confirmed);
            }
            Err(err) => self.fail(err.into()),
        }
        MintStep::Settled
    }

    /// Flags the in-flight request when the session it started under is gone
    /// or re-bound. Returns whether the flag was raised by this call.
    pub fn observe_session(&mut self, session: &ConnectionSession) -> bool {
        if !self.request.status.is_in_flight() || self.request.session_desynced {
            return false;
        }

        let same_session = self.request.session_generation == Some(session.generation())
            && session.status() == ConnectionStatus::Connected;
        if same_session {
            return false;
        }

        warn!(
            "mint: wallet session changed while generation={} is {:?}",
            self.request.generation, self.request.status
        );
        self.request.session_desynced = true;
        self.request.updated_at = Utc::now();
        true
    }

    fn is_current(&self, generation: Generation, expected: MintStatus) -> bool {
        if generation == self.request.generation && self.request.status == expected {
            return true;
        }
        debug!(
            "mint: discarding stale result generation={generation} current={} status={:?}",
            self.request.generation, self.request.status
        );
        false
    }

    fn transition(&mut self, status: MintStatus) {
        if status.is_terminal() {
            self.signer = None;
        }
        self.request.status = status;
        self.request.updated_at = Utc::now();
    }

    fn fail(&mut self, error: ErrorDetail) {
        warn!(
            "mint: failed generation={} during {:?}: {error}",
            self.request.generation, self.request.status
        );
        self.request.error = Some(error);
        self.transition(MintStatus::Failed);
    }
}

#[cfg(test)]
#[path = "tests/mint_tests.rs"]
mod tests;
