//! Integration tests for navigation goals running through the dispatcher,
//! the safety gate, and the shared boat state.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use helmlink::{
    AckMessage, BoatConfig, CommandDispatcher, CommandEnvelope, CommandPayload, CommandState,
    ControlAction, EmergencyAction, GpsFix, NavMode, NavigationAction, SharedBoatState,
    ViolationClass,
};

struct Harness {
    dispatcher: CommandDispatcher,
    state: Arc<SharedBoatState>,
    acks: mpsc::UnboundedReceiver<AckMessage>,
}

fn harness() -> Harness {
    let config = BoatConfig::new("boat-1").with_auth_token("secret");
    let state = Arc::new(SharedBoatState::new());
    let (tx, rx) = mpsc::unbounded_channel();
    Harness {
        dispatcher: CommandDispatcher::new(&config, state.clone(), tx),
        state,
        acks: rx,
    }
}

impl Harness {
    fn drain_acks(&mut self) -> Vec<AckMessage> {
        let mut acks = Vec::new();
        while let Ok(ack) = self.acks.try_recv() {
            acks.push(ack);
        }
        acks
    }

    fn run(&mut self, envelope: CommandEnvelope) {
        let now = Utc::now();
        self.dispatcher.submit(envelope, now);
        self.dispatcher.process_next(now);
    }
}

fn fix_at(latitude: f64, longitude: f64, heading: f64) -> GpsFix {
    GpsFix {
        latitude,
        longitude,
        heading,
        speed_knots: 2.0,
        satellites: Some(9),
        fix_time: Utc::now(),
    }
}

fn waypoint(latitude: f64, longitude: f64, max_speed: f64) -> CommandEnvelope {
    CommandEnvelope::new(
        "boat-1",
        CommandPayload::Navigation(NavigationAction::SetWaypoint {
            latitude,
            longitude,
            max_speed,
            arrival_radius: 10.0,
        }),
    )
}

#[test]
fn waypoint_mission_runs_to_completion() {
    let mut h = harness();
    h.state.update_fix(fix_at(52.0, 4.0, 0.0));

    // ~550 m north, within the geofence
    let mission = waypoint(52.005, 4.0, 50.0);
    let mission_id = mission.command_id;
    h.run(mission);
    assert_eq!(h.dispatcher.nav_mode(), NavMode::NavigatingToWaypoint);
    assert_eq!(
        h.dispatcher.ledger().state(&mission_id),
        Some(CommandState::Acknowledged)
    );

    // Underway: full demanded throttle, still in flight
    let out = h.dispatcher.control_tick(1.0, Utc::now());
    assert_eq!(out.setpoints.throttle_percent, 50.0);
    assert!(out.safety_stop.is_none());

    // The boat arrives inside the radius
    h.state.update_fix(fix_at(52.005, 4.0, 0.0));
    let out = h.dispatcher.control_tick(1.0, Utc::now());
    assert_eq!(out.setpoints.throttle_percent, 0.0);

    assert_eq!(h.dispatcher.nav_mode(), NavMode::Idle);
    assert_eq!(
        h.dispatcher.ledger().state(&mission_id),
        Some(CommandState::Completed)
    );
    let completed = h
        .drain_acks()
        .into_iter()
        .find(|a| a.command_id == mission_id && a.state == CommandState::Completed)
        .unwrap();
    assert!(completed.success);
}

#[test]
fn new_goal_supersedes_the_active_one() {
    let mut h = harness();
    h.state.update_fix(fix_at(52.0, 4.0, 0.0));

    let first = waypoint(52.005, 4.0, 50.0);
    let first_id = first.command_id;
    h.run(first);

    let second = waypoint(52.0, 4.005, 40.0);
    let second_id = second.command_id;
    h.run(second);

    assert_eq!(
        h.dispatcher.ledger().state(&first_id),
        Some(CommandState::Failed)
    );
    assert_eq!(
        h.dispatcher.ledger().state(&second_id),
        Some(CommandState::Acknowledged)
    );
    let superseded = h
        .drain_acks()
        .into_iter()
        .find(|a| a.command_id == first_id && a.state == CommandState::Failed)
        .unwrap();
    assert_eq!(superseded.message, "superseded");
}

#[test]
fn overspeed_goal_is_clamped_at_the_gate() {
    let mut h = harness();
    h.state.update_fix(fix_at(52.0, 4.0, 0.0));

    // Demands 100% but the default limit is 70%
    h.run(waypoint(52.005, 4.0, 100.0));

    let out = h.dispatcher.control_tick(1.0, Utc::now());
    assert_eq!(out.setpoints.throttle_percent, 70.0);
    assert!(out.safety_stop.is_none());
    assert_eq!(
        h.dispatcher.safety().violation_count(ViolationClass::Speed),
        1
    );
    // Clamping is not a stop; the mission continues
    assert_eq!(h.dispatcher.nav_mode(), NavMode::NavigatingToWaypoint);
}

#[test]
fn direct_control_is_refused_while_navigating() {
    let mut h = harness();
    h.state.update_fix(fix_at(52.0, 4.0, 0.0));
    h.run(waypoint(52.005, 4.0, 50.0));

    let rudder = CommandEnvelope::new(
        "boat-1",
        CommandPayload::Control(ControlAction::SetRudder { angle: 10.0 }),
    );
    let rudder_id = rudder.command_id;
    h.run(rudder);

    assert_eq!(
        h.dispatcher.ledger().state(&rudder_id),
        Some(CommandState::Failed)
    );
    // The mission is untouched
    assert_eq!(h.dispatcher.nav_mode(), NavMode::NavigatingToWaypoint);
}

#[test]
fn stop_motors_cancels_the_mission() {
    let mut h = harness();
    h.state.update_fix(fix_at(52.0, 4.0, 0.0));

    let mission = waypoint(52.005, 4.0, 50.0);
    let mission_id = mission.command_id;
    h.run(mission);

    h.run(CommandEnvelope::new(
        "boat-1",
        CommandPayload::Control(ControlAction::StopMotors),
    ));

    assert_eq!(h.dispatcher.nav_mode(), NavMode::Idle);
    assert_eq!(
        h.dispatcher.ledger().state(&mission_id),
        Some(CommandState::Failed)
    );
    let out = h.dispatcher.control_tick(1.0, Utc::now());
    assert_eq!(out.setpoints.throttle_percent, 0.0);
}

#[test]
fn emergency_stop_preempts_and_latches() {
    let mut h = harness();
    h.state.update_fix(fix_at(52.0, 4.0, 0.0));

    let mission = waypoint(52.005, 4.0, 50.0);
    let mission_id = mission.command_id;
    h.run(mission);

    h.run(CommandEnvelope::new(
        "boat-1",
        CommandPayload::Emergency(EmergencyAction::EmergencyStop {
            reason: "operator abort".to_string(),
        }),
    ));

    assert_eq!(h.dispatcher.nav_mode(), NavMode::EmergencyStopped);
    assert_eq!(
        h.dispatcher.ledger().state(&mission_id),
        Some(CommandState::Failed)
    );
    let preempted = h
        .drain_acks()
        .into_iter()
        .find(|a| a.command_id == mission_id && a.state == CommandState::Failed)
        .unwrap();
    assert_eq!(preempted.message, "preempted_by_emergency");

    // Latched: a new mission is refused until resume
    let retry = waypoint(52.005, 4.0, 50.0);
    let retry_id = retry.command_id;
    h.run(retry);
    assert_eq!(
        h.dispatcher.ledger().state(&retry_id),
        Some(CommandState::Failed)
    );

    h.run(CommandEnvelope::new(
        "boat-1",
        CommandPayload::Emergency(EmergencyAction::Resume {
            auth_token: "secret".to_string(),
        }),
    ));
    assert_eq!(h.dispatcher.nav_mode(), NavMode::Idle);

    let resumed = waypoint(52.005, 4.0, 50.0);
    let resumed_id = resumed.command_id;
    h.run(resumed);
    assert_eq!(
        h.dispatcher.ledger().state(&resumed_id),
        Some(CommandState::Acknowledged)
    );
}

#[test]
fn geofence_breach_stops_the_mission() {
    let mut h = harness();
    // First fix anchors the geofence at the start position
    h.state.update_fix(fix_at(52.0, 4.0, 0.0));

    let mission = waypoint(52.005, 4.0, 50.0);
    let mission_id = mission.command_id;
    h.run(mission);

    // The boat drifts ~2.2 km from the start, past the 1 km geofence
    h.state.update_fix(fix_at(52.02, 4.0, 0.0));
    let out = h.dispatcher.control_tick(1.0, Utc::now());

    let violation = out.safety_stop.unwrap();
    assert_eq!(violation.class, ViolationClass::Geofence);
    assert_eq!(out.setpoints.throttle_percent, 0.0);
    assert_eq!(h.dispatcher.nav_mode(), NavMode::EmergencyStopped);
    assert_eq!(
        h.dispatcher.ledger().state(&mission_id),
        Some(CommandState::Failed)
    );
    let failed = h
        .drain_acks()
        .into_iter()
        .find(|a| a.command_id == mission_id && a.state == CommandState::Failed)
        .unwrap();
    assert_eq!(failed.message, "safety_override");
}
