use super::*;
use crate::test_support::{injected_descriptor, MockSigner};

fn signer(account: &str) -> Arc<dyn SignerHandle> {
    Arc::new(MockSigner::new(account))
}

fn injected() -> ConnectorId {
    ConnectorId::new("injected")
}

fn connected_controller() -> ConnectionController {
    let mut controller = ConnectionController::new();
    let ticket = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect("connect accepted");
    assert!(controller.resolve_connect(ticket.generation, Ok(signer("0xaaa"))));
    controller
}

#[test]
fn starts_disconnected_without_signer() {
    let controller = ConnectionController::new();
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(!snapshot.signer_present);
    assert!(snapshot.active_connector_id.is_none());
    assert!(controller.session().connected_signer().is_none());
}

#[test]
fn connect_passes_through_connecting_before_connected() {
    let mut controller = ConnectionController::new();
    let ticket = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect("connect accepted");

    assert_eq!(controller.session().status(), ConnectionStatus::Connecting);
    assert_eq!(ticket.connector_id, injected());
    assert!(controller.session().connected_signer().is_none());

    assert!(controller.resolve_connect(ticket.generation, Ok(signer("0xaaa"))));
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert!(snapshot.signer_present);
    assert_eq!(snapshot.account.as_ref().map(AccountAddress::as_str), Some("0xaaa"));
}

#[test]
fn second_connect_while_connecting_is_busy_and_not_queued() {
    let mut controller = ConnectionController::new();
    let ticket = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect("connect accepted");

    let err = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect_err("re-entrant connect must fail");
    assert_eq!(err.code, ErrorCode::Busy);
    assert_eq!(controller.session().generation(), ticket.generation);
    assert_eq!(controller.session().status(), ConnectionStatus::Connecting);
}

#[test]
fn connect_while_connected_is_rejected() {
    let mut controller = connected_controller();
    let err = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect_err("must disconnect first");
    assert_eq!(err.code, ErrorCode::Busy);
    assert_eq!(controller.session().status(), ConnectionStatus::Connected);
}

#[test]
fn unlisted_connector_is_rejected_without_state_change() {
    let mut controller = ConnectionController::new();
    let err = controller
        .begin_connect(&ConnectorId::new("ledger"), &[injected_descriptor()])
        .expect_err("unknown connector");
    assert_eq!(err.code, ErrorCode::UnknownConnector);
    assert_eq!(controller.session().status(), ConnectionStatus::Disconnected);
    assert_eq!(controller.session().generation(), Generation::INITIAL);
}

#[test]
fn provider_rejection_moves_to_error_and_allows_retry() {
    let mut controller = ConnectionController::new();
    let ticket = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect("connect accepted");
    assert!(controller.resolve_connect(
        ticket.generation,
        Err(ProviderError::Rejected("user closed the prompt".into()))
    ));

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Error);
    assert_eq!(
        snapshot.error.as_ref().map(|err| err.code),
        Some(ErrorCode::ProviderRejected)
    );
    assert!(!snapshot.signer_present);

    let retry = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect("retry from error");
    assert!(retry.generation > ticket.generation);
    assert_eq!(controller.session().status(), ConnectionStatus::Connecting);
    assert!(controller.session().error().is_none());
}

#[test]
fn disconnect_is_idempotent() {
    let mut controller = ConnectionController::new();
    assert!(!controller.disconnect());
    assert_eq!(controller.session().generation(), Generation::INITIAL);

    let mut controller = connected_controller();
    assert!(controller.disconnect());
    assert!(!controller.disconnect());
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(!snapshot.signer_present);
    assert!(snapshot.active_connector_id.is_none());
}

#[test]
fn disconnect_from_error_clears_detail() {
    let mut controller = ConnectionController::new();
    let ticket = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect("connect accepted");
    controller.resolve_connect(ticket.generation, Err(ProviderError::Network("down".into())));

    assert!(controller.disconnect());
    assert!(controller.session().error().is_none());
    assert_eq!(controller.session().status(), ConnectionStatus::Disconnected);
}

#[test]
fn late_connect_result_after_disconnect_is_discarded() {
    let mut controller = ConnectionController::new();
    let ticket = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect("connect accepted");
    assert!(controller.disconnect());

    assert!(!controller.resolve_connect(ticket.generation, Ok(signer("0xaaa"))));
    assert_eq!(controller.session().status(), ConnectionStatus::Disconnected);
    assert!(controller.session().connected_signer().is_none());
}

#[test]
fn late_result_of_superseded_attempt_does_not_override_retry() {
    let mut controller = ConnectionController::new();
    let first = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect("first attempt");
    controller.disconnect();
    let second = controller
        .begin_connect(&injected(), &[injected_descriptor()])
        .expect("second attempt");

    assert!(!controller.resolve_connect(
        first.generation,
        Err(ProviderError::Rejected("old prompt".into()))
    ));
    assert_eq!(controller.session().status(), ConnectionStatus::Connecting);

    assert!(controller.resolve_connect(second.generation, Ok(signer("0xbbb"))));
    assert_eq!(controller.session().status(), ConnectionStatus::Connected);
}

#[test]
fn provider_disconnect_resets_the_active_session_only() {
    let mut controller = connected_controller();

    assert!(!controller.handle_provider_event(ProviderEvent::Disconnected {
        connector_id: ConnectorId::new("walletconnect"),
        reason: "other bridge closed".into(),
    }));
    assert_eq!(controller.session().status(), ConnectionStatus::Connected);

    assert!(controller.handle_provider_event(ProviderEvent::Disconnected {
        connector_id: injected(),
        reason: "extension locked".into(),
    }));
    assert_eq!(controller.session().status(), ConnectionStatus::Disconnected);
    assert!(controller.session().connected_signer().is_none());
}

#[test]
fn account_change_rebinds_signer_and_bumps_generation() {
    let mut controller = connected_controller();
    let before = controller.session().generation();

    assert!(!controller.handle_provider_event(ProviderEvent::AccountChanged {
        connector_id: injected(),
        signer: signer("0xaaa"),
    }));

    assert!(controller.handle_provider_event(ProviderEvent::AccountChanged {
        connector_id: injected(),
        signer: signer("0xccc"),
    }));
    assert_eq!(controller.session().status(), ConnectionStatus::Connected);
    assert!(controller.session().generation() > before);
    assert_eq!(
        controller.session().account().map(AccountAddress::as_str),
        Some("0xccc")
    );
}

#[test]
fn status_stays_within_the_defined_machine_for_mixed_sequences() {
    let mut controller = ConnectionController::new();
    let mut previous = controller.session().status();
    for step in 0..24u32 {
        match step % 4 {
            0 | 2 => {
                let _ = controller.begin_connect(&injected(), &[injected_descriptor()]);
            }
            1 => {
                let generation = controller.session().generation();
                let result = if step % 8 == 1 {
                    Ok(signer("0xaaa"))
                } else {
                    Err(ProviderError::Rejected("no".into()))
                };
                controller.resolve_connect(generation, result);
            }
            _ => {
                controller.disconnect();
            }
        }

        let current = controller.session().status();
        if previous == ConnectionStatus::Disconnected {
            assert_ne!(current, ConnectionStatus::Connected, "skipped Connecting");
        }
        if current == ConnectionStatus::Connected {
            assert!(controller.session().connected_signer().is_some());
        }
        previous = current;
    }
}
