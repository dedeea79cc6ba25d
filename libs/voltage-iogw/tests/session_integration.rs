//! Command Session Integration Tests
//!
//! Drives `SessionManager` against the in-memory publisher with a paused
//! clock:
//! - Authentication gating, including commands sent mid-handshake
//! - Single in-flight handshake
//! - Out-of-order response correlation
//! - Partial failure of the reset-all sequence
//! - Cancellation and timeout cleanup

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use voltage_iogw::command::{encode_ack, encode_query_reply};
use voltage_iogw::{
    AuthState, Command, CommandBuilder, CommandError, CommandType, CorrelationKey,
    MemoryPublisher, OutputState, QueryParam, SessionConfig, SessionManager, TopicTemplate, Value,
};

const DEVICE: &str = "GW-0001";

fn setup() -> (Arc<MemoryPublisher>, SessionManager<MemoryPublisher>) {
    let publisher = Arc::new(MemoryPublisher::new());
    let config = SessionConfig {
        response_timeout: Duration::from_secs(5),
        auth_timeout: Duration::from_secs(8),
        sweep_interval: Duration::from_secs(1),
    };
    let manager = SessionManager::new(
        Arc::clone(&publisher),
        TopicTemplate::parse("gw/{device_id}/down").unwrap(),
        config,
    )
    .with_default_password("123456");
    (publisher, manager)
}

async fn authenticate(publisher: &MemoryPublisher, manager: &SessionManager<MemoryPublisher>) {
    let ack = encode_ack(&CorrelationKey::AUTH, None, true);
    let (ok, _) = tokio::join!(manager.authenticate(DEVICE), async {
        publisher.wait_for(1).await;
        manager.on_frame(DEVICE, &ack)
    });
    assert!(ok.unwrap());
}

fn counter_ack(counter: u8, accepted: bool) -> Vec<u8> {
    let key = Command::ResetCounter { counter }.correlation_key();
    encode_ack(&key, None, accepted)
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_command_before_auth_never_published() {
    let (publisher, manager) = setup();

    let err = manager
        .set_output(DEVICE, 1, OutputState::Close, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::NotAuthenticated(_)));
    assert!(matches!(
        manager.query(DEVICE, QueryParam::Signal).await,
        Err(CommandError::NotAuthenticated(_))
    ));
    assert_eq!(publisher.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_command_during_handshake_refused() {
    let (publisher, manager) = setup();
    let key = Command::SetOutput {
        output: 1,
        state: OutputState::Close,
        pulse: None,
    }
    .correlation_key();

    let (authed, _) = tokio::join!(manager.authenticate(DEVICE), async {
        publisher.wait_for(1).await;
        assert_eq!(manager.auth_state(DEVICE), AuthState::Authenticating);

        let refused = manager.set_output(DEVICE, 1, OutputState::Close, None).await;
        assert!(matches!(refused, Err(CommandError::NotAuthenticated(_))));
        assert_eq!(manager.pending_count(DEVICE), 1);

        // Only the password frame reached the downlink
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(&published[0].1[5..11], b"123456");

        manager.on_frame(DEVICE, &encode_ack(&CorrelationKey::AUTH, None, true));
    });
    assert!(authed.unwrap());
    assert_eq!(manager.auth_state(DEVICE), AuthState::Authenticated);

    let (accepted, _) = tokio::join!(
        manager.set_output(DEVICE, 1, OutputState::Close, None),
        async {
            publisher.wait_for(2).await;
            manager.on_frame(DEVICE, &encode_ack(&key, Some(OutputState::Close), true));
        }
    );
    assert!(accepted.unwrap());
    assert_eq!(publisher.count(), 2);
    assert_eq!(manager.pending_count(DEVICE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_authentication_single_challenge() {
    let (publisher, manager) = setup();
    let ack = encode_ack(&CorrelationKey::AUTH, None, true);

    let (first, second, _) = tokio::join!(
        manager.authenticate(DEVICE),
        manager.authenticate(DEVICE),
        async {
            publisher.wait_for(1).await;
            manager.on_frame(DEVICE, &ack)
        }
    );

    assert!(first.unwrap());
    assert!(second.unwrap());
    assert_eq!(publisher.count(), 1);
    assert_eq!(manager.auth_state(DEVICE), AuthState::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_authentication_shares_timeout() {
    let (publisher, manager) = setup();

    let (first, second) = tokio::join!(manager.authenticate(DEVICE), manager.authenticate(DEVICE));

    assert!(!first.unwrap());
    assert!(!second.unwrap());
    assert_eq!(publisher.count(), 1);
    assert_eq!(manager.auth_state(DEVICE), AuthState::Unauthenticated);
    assert_eq!(manager.pending_count(DEVICE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_auth_timeout() {
    let (publisher, manager) = setup();
    assert!(!manager.authenticate(DEVICE).await.unwrap());

    // Caller-driven retry issues a fresh challenge
    let ack = encode_ack(&CorrelationKey::AUTH, None, true);
    let (ok, _) = tokio::join!(manager.authenticate(DEVICE), async {
        publisher.wait_for(2).await;
        manager.on_frame(DEVICE, &ack)
    });
    assert!(ok.unwrap());
    assert_eq!(publisher.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_auth_ack_after_timeout_is_ignored() {
    let (_publisher, manager) = setup();
    assert!(!manager.authenticate(DEVICE).await.unwrap());

    let ack = encode_ack(&CorrelationKey::AUTH, None, true);
    assert!(!manager.on_frame(DEVICE, &ack));
    assert_eq!(manager.auth_state(DEVICE), AuthState::Unauthenticated);
}

// ============================================================================
// Correlation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_out_of_order_responses() {
    let (publisher, manager) = setup();
    authenticate(&publisher, &manager).await;

    let signal = encode_query_reply(QueryParam::Signal, &[21]);
    let firmware = encode_query_reply(QueryParam::FirmwareVersion, b"V1.0.7");

    let (sig, fw, _) = tokio::join!(
        manager.query(DEVICE, QueryParam::Signal),
        manager.query(DEVICE, QueryParam::FirmwareVersion),
        async {
            publisher.wait_for(3).await;
            // Reverse of send order
            assert!(manager.on_frame(DEVICE, &firmware));
            assert!(manager.on_frame(DEVICE, &signal));
        }
    );

    assert_eq!(sig.unwrap(), Value::Signal(21));
    assert_eq!(fw.unwrap(), Value::Text("V1.0.7".to_string()));
    assert_eq!(manager.pending_count(DEVICE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_outputs_correlated_by_index() {
    let (publisher, manager) = setup();
    authenticate(&publisher, &manager).await;

    let key1 = Command::SetOutput {
        output: 1,
        state: OutputState::Close,
        pulse: None,
    }
    .correlation_key();
    let key2 = CorrelationKey {
        command: CommandType::DoControl,
        sub: Some(2),
    };

    let (one, two, _) = tokio::join!(
        manager.set_output(DEVICE, 1, OutputState::Close, None),
        manager.set_output(DEVICE, 2, OutputState::Open, Some(Duration::from_millis(500))),
        async {
            publisher.wait_for(3).await;
            manager.on_frame(DEVICE, &encode_ack(&key2, Some(OutputState::Open), false));
            manager.on_frame(DEVICE, &encode_ack(&key1, Some(OutputState::Close), true));
        }
    );

    assert!(one.unwrap());
    assert!(!two.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_reset_all_partial_failure() {
    let (publisher, manager) = setup();
    authenticate(&publisher, &manager).await;

    let (outcomes, _) = tokio::join!(manager.reset_all_counters(DEVICE), async {
        publisher.wait_for(2).await;
        manager.on_frame(DEVICE, &counter_ack(1, true));
        // Counter 2 gets no reply
        publisher.wait_for(4).await;
        manager.on_frame(DEVICE, &counter_ack(3, false));
        publisher.wait_for(5).await;
        manager.on_frame(DEVICE, &counter_ack(4, true));
    });

    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[0], Ok(true));
    assert!(matches!(outcomes[1], Err(CommandError::Timeout(_))));
    assert_eq!(outcomes[2], Ok(false));
    assert_eq!(outcomes[3], Ok(true));

    // Frames went out in index order
    let sent: Vec<Command> = publisher
        .published()
        .iter()
        .skip(1)
        .map(|(_, payload)| Command::decode(payload).unwrap())
        .collect();
    assert_eq!(
        sent,
        (1..=4)
            .map(|counter| Command::ResetCounter { counter })
            .collect::<Vec<_>>()
    );
}

// ============================================================================
// Cleanup
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancelled_command_removes_pending() {
    let (publisher, manager) = setup();
    authenticate(&publisher, &manager).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        manager.set_output(DEVICE, 1, OutputState::Close, None),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(manager.pending_count(DEVICE), 0);

    // A late reply finds nothing to resolve
    let key = CorrelationKey {
        command: CommandType::DoControl,
        sub: Some(1),
    };
    assert!(!manager.on_frame(DEVICE, &encode_ack(&key, Some(OutputState::Close), true)));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_frame_sweeps_expired_entries() {
    let (publisher, manager) = setup();
    let manager = Arc::new(manager);
    authenticate(&publisher, &manager).await;

    let task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.reboot(DEVICE).await })
    };
    publisher.wait_for(2).await;
    assert_eq!(manager.pending_count(DEVICE), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    // Any inbound traffic for the device sweeps it
    let report = voltage_iogw::encode_frame(0xF4, &[0x03, 0x01, 0x00]);
    assert!(!manager.on_frame(DEVICE, &report));
    assert_eq!(manager.pending_count(DEVICE), 0);

    let result = task.await.unwrap();
    assert_eq!(
        result,
        Err(CommandError::Timeout("reboot on GW-0001".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resets_sessions() {
    let (publisher, manager) = setup();
    authenticate(&publisher, &manager).await;
    assert_eq!(manager.auth_state(DEVICE), AuthState::Authenticated);

    manager.reset_all();
    assert_eq!(manager.auth_state(DEVICE), AuthState::Unauthenticated);
    assert!(matches!(
        manager.reboot(DEVICE).await,
        Err(CommandError::NotAuthenticated(_))
    ));
}

// ============================================================================
// Frame round trip
// ============================================================================

#[test]
fn test_every_command_round_trips() {
    let builder = CommandBuilder::new(Some("pw-01".to_string()));
    let mut commands = vec![
        Command::Password {
            password: "pw-01".to_string(),
        },
        Command::Reboot,
    ];
    for output in 1..=2 {
        for state in [OutputState::Open, OutputState::Close] {
            for pulse in [None, Some(Duration::from_millis(1)), Some(Duration::from_secs(60))] {
                commands.push(Command::SetOutput {
                    output,
                    state,
                    pulse,
                });
            }
        }
    }
    commands.extend((1..=4).map(|counter| Command::ResetCounter { counter }));
    commands.extend(
        [
            QueryParam::Signal,
            QueryParam::SerialNumber,
            QueryParam::HardwareVersion,
            QueryParam::FirmwareVersion,
        ]
        .map(Command::Query),
    );

    for command in commands {
        let frame = builder.build(command.clone()).unwrap();
        assert_eq!(frame.key, command.correlation_key());
        assert_eq!(Command::decode(&frame.payload).unwrap(), command);
    }
}
