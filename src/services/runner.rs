//! Control-loop runner.
//!
//! One task per boat: drains decoded commands into the dispatcher and
//! drives the fixed-period control tick. Each tick polls the hardware,
//! advances navigation, gates the demands through the safety monitor, and
//! writes the result to the actuators. A gate stop publishes a critical
//! log entry alongside the latched emergency mode.
//!
//! Broker I/O never happens here; everything outbound goes through the
//! session's channel, so a dead broker cannot stall a tick.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::dispatch::CommandDispatcher;
use crate::envelope::{CommandEnvelope, LogMessage};
use crate::nav::TICK_SECONDS;
use crate::telemetry::SharedBoatState;
use crate::traits::{Actuator, Clock, Persistence, PositionSource, SystemSensors};

use super::mqtt::OutboundMessage;

/// Drives the dispatcher and the hardware for one boat.
pub struct ControlRunner<A, G, S, C, P> {
    boat_id: String,
    dispatcher: Arc<Mutex<CommandDispatcher>>,
    state: Arc<SharedBoatState>,
    actuator: A,
    gps: G,
    sensors: S,
    clock: C,
    persistence: P,
    commands: mpsc::UnboundedReceiver<CommandEnvelope>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    last_tick: Option<DateTime<Utc>>,
}

impl<A, G, S, C, P> ControlRunner<A, G, S, C, P>
where
    A: Actuator,
    G: PositionSource,
    S: SystemSensors,
    C: Clock,
    P: Persistence,
{
    /// Wire up a runner.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        boat_id: impl Into<String>,
        dispatcher: Arc<Mutex<CommandDispatcher>>,
        state: Arc<SharedBoatState>,
        actuator: A,
        gps: G,
        sensors: S,
        clock: C,
        persistence: P,
        commands: mpsc::UnboundedReceiver<CommandEnvelope>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        Self {
            boat_id: boat_id.into(),
            dispatcher,
            state,
            actuator,
            gps,
            sensors,
            clock,
            persistence,
            commands,
            outbound,
            last_tick: None,
        }
    }

    /// Run until the command channel closes.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(Duration::from_secs_f64(TICK_SECONDS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(boat_id = %self.boat_id, "control loop started");

        loop {
            tokio::select! {
                envelope = self.commands.recv() => match envelope {
                    Some(envelope) => self.handle_command(envelope),
                    None => {
                        info!("command channel closed; stopping control loop");
                        return;
                    }
                },
                _ = interval.tick() => self.tick(),
            }
        }
    }

    /// Feed one decoded command through the dispatcher.
    pub fn handle_command(&mut self, envelope: CommandEnvelope) {
        let now = self.clock.now();
        let mut dispatcher = self.dispatcher.lock().unwrap();
        dispatcher.submit(envelope, now);
        while dispatcher.process_next(now).is_some() {}
    }

    /// One control tick: hardware in, navigation + safety gate, hardware out.
    pub fn tick(&mut self) {
        self.poll_hardware();

        let now = self.clock.now();
        let dt = match self.last_tick {
            Some(last) => ((now - last).num_milliseconds() as f64 / 1000.0).max(0.0),
            None => TICK_SECONDS,
        };
        self.last_tick = Some(now);

        let (output, evicted) = {
            let mut dispatcher = self.dispatcher.lock().unwrap();
            let output = dispatcher.control_tick(dt, now);
            let evicted = dispatcher.sweep(now);
            (output, evicted)
        };

        if self.actuator.set_throttle(output.setpoints.throttle_percent).is_err()
            || self.actuator.set_rudder(output.setpoints.rudder_angle).is_err()
        {
            error!("actuator write failed");
        }
        self.state.record_motors(
            output.setpoints.throttle_percent,
            output.setpoints.rudder_angle,
        );

        if let Some(violation) = output.safety_stop {
            let log = LogMessage::new(
                &self.boat_id,
                "critical",
                format!("safety stop: {}", violation.detail),
            )
            .with_details(serde_json::json!({ "class": violation.class }));
            if self.outbound.send(OutboundMessage::Log(log)).is_err() {
                warn!("outbound channel closed; safety stop not reported");
            }
        }

        for entry in &evicted {
            if self.persistence.record_command(entry).is_err() {
                warn!(command_id = %entry.command_id, "persistence rejected command record");
            }
        }
    }

    fn poll_hardware(&mut self) {
        match self.gps.poll_fix() {
            Ok(Some(fix)) => self.state.update_fix(fix),
            Ok(None) => {}
            Err(_) => warn!("gps poll failed"),
        }
        match self.sensors.read_metrics() {
            Ok(Some(metrics)) => self.state.update_system(metrics),
            Ok(None) => {}
            Err(_) => warn!("sensor read failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandState;
    use crate::config::BoatConfig;
    use crate::envelope::{CommandPayload, ControlAction, NavigationAction};
    use crate::hal::{MockActuator, MockClock, MockGps, MockPersistence, MockSensors};
    use crate::nav::NavMode;

    type TestRunner = ControlRunner<MockActuator, MockGps, MockSensors, MockClock, MockPersistence>;

    struct Harness {
        runner: TestRunner,
        dispatcher: Arc<Mutex<CommandDispatcher>>,
        state: Arc<SharedBoatState>,
        outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    }

    fn harness(gps: MockGps, sensors: MockSensors) -> Harness {
        let config = BoatConfig::new("boat-1").with_auth_token("secret");
        let state = Arc::new(SharedBoatState::new());
        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Mutex::new(CommandDispatcher::new(
            &config,
            state.clone(),
            ack_tx,
        )));
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let runner = ControlRunner::new(
            "boat-1",
            dispatcher.clone(),
            state.clone(),
            MockActuator::new(),
            gps,
            sensors,
            MockClock::new(),
            MockPersistence::new(),
            cmd_rx,
            out_tx,
        );
        Harness {
            runner,
            dispatcher,
            state,
            outbound_rx: out_rx,
        }
    }

    fn throttle_command(speed: f64) -> CommandEnvelope {
        CommandEnvelope::new(
            "boat-1",
            CommandPayload::Control(ControlAction::SetThrottle {
                speed,
                ramp_time: 0.0,
            }),
        )
    }

    #[test]
    fn tick_applies_gated_setpoints_to_actuator() {
        let mut h = harness(MockGps::new(), MockSensors::new());
        h.runner.handle_command(throttle_command(30.0));

        h.runner.clock.advance(1);
        h.runner.tick();

        assert_eq!(h.runner.actuator.throttle(), 30.0);
        assert_eq!(h.state.snapshot().motors.throttle_percent, 30.0);
    }

    #[test]
    fn tick_feeds_gps_into_shared_state() {
        let mut h = harness(MockGps::fixed_at(37.0, -122.0), MockSensors::new());
        h.runner.tick();

        let snapshot = h.state.snapshot();
        assert_eq!(snapshot.fix.unwrap().latitude, 37.0);
        assert_eq!(snapshot.start_position.unwrap().latitude, 37.0);
    }

    #[test]
    fn safety_stop_publishes_critical_log() {
        let mut h = harness(
            MockGps::new(),
            MockSensors::new().with_battery(10.0),
        );

        let nav = CommandEnvelope::new(
            "boat-1",
            CommandPayload::Navigation(NavigationAction::SetWaypoint {
                latitude: 37.0,
                longitude: -122.0,
                max_speed: 50.0,
                arrival_radius: 10.0,
            }),
        );
        let nav_id = nav.command_id;
        h.runner.handle_command(nav);

        h.runner.clock.advance(1);
        h.runner.tick();

        assert_eq!(
            h.dispatcher.lock().unwrap().nav_mode(),
            NavMode::EmergencyStopped
        );
        assert_eq!(
            h.dispatcher.lock().unwrap().ledger().state(&nav_id),
            Some(CommandState::Failed)
        );
        assert_eq!(h.runner.actuator.throttle(), 0.0);

        let mut saw_critical = false;
        while let Ok(message) = h.outbound_rx.try_recv() {
            if let OutboundMessage::Log(log) = message {
                assert_eq!(log.level, "critical");
                saw_critical = true;
            }
        }
        assert!(saw_critical);
    }

    #[test]
    fn evicted_entries_reach_persistence() {
        let mut h = harness(MockGps::new(), MockSensors::new());
        {
            let mut dispatcher = h.dispatcher.lock().unwrap();
            let now = h.runner.clock.now();
            let cmd = throttle_command(10.0);
            dispatcher.submit(cmd, now);
            dispatcher.process_next(now);
        }

        // Past the retention window the completed entry is evicted.
        h.runner.clock.advance(3700);
        h.runner.tick();

        assert_eq!(h.runner.persistence.commands.len(), 1);
        assert_eq!(
            h.runner.persistence.commands[0].state,
            CommandState::Completed
        );
    }
}
