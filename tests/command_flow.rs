//! Integration tests for the command path: wire JSON in, acks out.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use helmlink::{
    AckMessage, BoatConfig, CommandDispatcher, CommandEnvelope, CommandPayload, CommandState,
    CommandTracker, ConfigAction, DispatchOutcome, EmergencyAction, SafetyLimitsPatch,
    SharedBoatState, StatusAction, Submission,
};

fn dispatcher() -> (CommandDispatcher, mpsc::UnboundedReceiver<AckMessage>) {
    let config = BoatConfig::new("boat-1").with_auth_token("secret");
    let state = Arc::new(SharedBoatState::new());
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandDispatcher::new(&config, state, tx), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<AckMessage>) -> Vec<AckMessage> {
    let mut acks = Vec::new();
    while let Ok(ack) = rx.try_recv() {
        acks.push(ack);
    }
    acks
}

fn throttle_wire(command_id: Uuid) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "command_id": command_id.to_string(),
        "timestamp": Utc::now().to_rfc3339(),
        "boat_id": "boat-1",
        "command_type": "control",
        "payload": { "action": "set_throttle", "speed": 25.0, "ramp_time": 0.0 },
    }))
    .unwrap()
}

#[test]
fn wire_command_flows_to_completion() {
    let (mut dispatcher, mut acks) = dispatcher();
    let command_id = Uuid::new_v4();
    let envelope = CommandEnvelope::from_json(&throttle_wire(command_id)).unwrap();
    assert_eq!(envelope.command_id, command_id);

    let now = Utc::now();
    assert_eq!(dispatcher.submit(envelope, now), Submission::Queued);

    let processed = dispatcher.process_next(now).unwrap();
    assert_eq!(processed.command_id, command_id);
    assert_eq!(processed.outcome, DispatchOutcome::Completed);
    assert_eq!(
        dispatcher.ledger().state(&command_id),
        Some(CommandState::Completed)
    );

    // Lifecycle acks in order: accepted, then completed.
    let acks = drain(&mut acks);
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].state, CommandState::Sent);
    assert_eq!(acks[1].state, CommandState::Completed);
    assert!(acks[1].success);
}

#[test]
fn duplicate_delivery_reacks_without_reexecuting() {
    let (mut dispatcher, mut acks) = dispatcher();
    let command_id = Uuid::new_v4();
    let wire = throttle_wire(command_id);
    let now = Utc::now();

    dispatcher.submit(CommandEnvelope::from_json(&wire).unwrap(), now);
    dispatcher.process_next(now);
    drain(&mut acks);

    // Same envelope redelivered (broker retry, operator double-send)
    let again = CommandEnvelope::from_json(&wire).unwrap();
    assert_eq!(
        dispatcher.submit(again, now),
        Submission::DuplicateTerminal(CommandState::Completed)
    );
    assert!(dispatcher.process_next(now).is_none());

    let acks = drain(&mut acks);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].state, CommandState::Completed);
    assert_eq!(acks[0].message, "duplicate delivery");
}

#[test]
fn emergency_jumps_queued_routine_traffic() {
    let (mut dispatcher, _acks) = dispatcher();
    let now = Utc::now();

    let status = CommandEnvelope::new(
        "boat-1",
        CommandPayload::Status(StatusAction::GetStatus { include: None }),
    );
    let stop = CommandEnvelope::new(
        "boat-1",
        CommandPayload::Emergency(EmergencyAction::EmergencyStop {
            reason: "collision risk".to_string(),
        }),
    );
    let stop_id = stop.command_id;

    // Routine command arrives first, emergency second
    dispatcher.submit(status, now);
    dispatcher.submit(stop, now);

    let first = dispatcher.process_next(now).unwrap();
    assert_eq!(first.command_id, stop_id);
}

#[test]
fn config_requires_the_shared_secret() {
    let (mut dispatcher, mut acks) = dispatcher();
    let now = Utc::now();

    let patch = SafetyLimitsPatch {
        max_speed_percent: Some(40.0),
        ..Default::default()
    };

    let bad = CommandEnvelope::new(
        "boat-1",
        CommandPayload::Config(ConfigAction::UpdateSafetyLimits {
            auth_token: "wrong".to_string(),
            limits: patch.clone(),
        }),
    );
    let bad_id = bad.command_id;
    dispatcher.submit(bad, now);
    let processed = dispatcher.process_next(now).unwrap();
    assert!(matches!(processed.outcome, DispatchOutcome::Rejected(_)));
    assert_eq!(
        dispatcher.ledger().state(&bad_id),
        Some(CommandState::Failed)
    );
    assert_eq!(dispatcher.safety().limits().max_speed_percent, 70.0);

    let good = CommandEnvelope::new(
        "boat-1",
        CommandPayload::Config(ConfigAction::UpdateSafetyLimits {
            auth_token: "secret".to_string(),
            limits: patch,
        }),
    );
    dispatcher.submit(good, now);
    let processed = dispatcher.process_next(now).unwrap();
    assert_eq!(processed.outcome, DispatchOutcome::Completed);
    assert_eq!(dispatcher.safety().limits().max_speed_percent, 40.0);

    let failed_ack = drain(&mut acks)
        .into_iter()
        .find(|a| a.command_id == bad_id && a.state == CommandState::Failed)
        .unwrap();
    assert!(!failed_ack.success);
}

#[test]
fn status_reply_carries_data_even_without_ack_request() {
    let (mut dispatcher, mut acks) = dispatcher();
    let now = Utc::now();

    let request = CommandEnvelope::new(
        "boat-1",
        CommandPayload::Status(StatusAction::GetStatus {
            include: Some(vec!["system".to_string()]),
        }),
    )
    .with_requires_ack(false);
    dispatcher.submit(request, now);
    dispatcher.process_next(now);

    let acks = drain(&mut acks);
    // No "accepted" ack (waived), but the reply itself is published
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].state, CommandState::Completed);
    let data = acks[0].data.as_ref().unwrap();
    assert!(data.get("system").is_some());
    assert!(data.get("gps").is_none());
}

#[test]
fn unprocessed_command_times_out_on_sweep() {
    let (mut dispatcher, mut acks) = dispatcher();
    let now = Utc::now();

    let envelope = CommandEnvelope::from_json(&throttle_wire(Uuid::new_v4()))
        .unwrap()
        .with_timeout(5);
    let command_id = envelope.command_id;
    dispatcher.submit(envelope, now);
    drain(&mut acks);

    // Never processed; six seconds later the sweep expires it
    dispatcher.sweep(now + Duration::seconds(6));

    assert_eq!(
        dispatcher.ledger().state(&command_id),
        Some(CommandState::TimedOut)
    );
    let acks = drain(&mut acks);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].state, CommandState::TimedOut);
    assert!(!acks[0].success);
}

#[test]
fn ground_tracker_follows_boat_acks() {
    let (mut dispatcher, mut acks) = dispatcher();
    let mut tracker = CommandTracker::new();
    let now = Utc::now();

    // Ground publishes and tracks the command
    let envelope = CommandEnvelope::from_json(&throttle_wire(Uuid::new_v4())).unwrap();
    let command_id = envelope.command_id;
    tracker.track(&envelope, now);
    assert_eq!(tracker.state(&command_id), Some(CommandState::Sent));

    // Boat executes it; every ack it publishes flows back into the tracker
    dispatcher.submit(envelope, now);
    dispatcher.process_next(now);
    for ack in drain(&mut acks) {
        tracker.apply_ack(&ack, now).unwrap();
    }

    assert_eq!(tracker.state(&command_id), Some(CommandState::Completed));
}
