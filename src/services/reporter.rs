//! Periodic telemetry publisher.
//!
//! MQTT Publish (via the session channel):
//! - `boat/{id}/status` full status snapshot
//! - `boat/{id}/gps` position fixes on significant change
//! - `boat/{id}/heartbeat` liveness beacon (retained by the session)
//! - `boat/{id}/logs` system metrics summary
//!
//! One task ticking once a second; each stream fires when the elapsed
//! count reaches its configured period. Periods come from the dispatcher
//! every cycle, so `configure` commands take effect without a restart.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dispatch::CommandDispatcher;
use crate::envelope::{GpsMessage, HeartbeatMessage, LogMessage, StatusMessage};
use crate::telemetry::SharedBoatState;

use super::mqtt::OutboundMessage;

/// Publishes status, GPS, heartbeat, and system telemetry on their periods.
pub struct TelemetryReporter {
    boat_id: String,
    state: Arc<SharedBoatState>,
    dispatcher: Arc<Mutex<CommandDispatcher>>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    elapsed: u64,
}

impl TelemetryReporter {
    /// Wire up a reporter over the shared state and dispatcher.
    pub fn new(
        boat_id: impl Into<String>,
        state: Arc<SharedBoatState>,
        dispatcher: Arc<Mutex<CommandDispatcher>>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        Self {
            boat_id: boat_id.into(),
            state,
            dispatcher,
            outbound,
            elapsed: 0,
        }
    }

    /// Run until the session side of the channel goes away.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(boat_id = %self.boat_id, "telemetry reporter started");

        loop {
            interval.tick().await;
            if self.cycle().is_err() {
                info!("outbound channel closed; stopping reporter");
                return;
            }
        }
    }

    /// One reporter cycle. Returns Err when the outbound channel is closed.
    pub fn cycle(&mut self) -> Result<(), ()> {
        self.elapsed = self.elapsed.wrapping_add(1);
        let intervals = self.dispatcher.lock().unwrap().report_intervals();

        if self.elapsed % intervals.gps_seconds == 0 {
            if let Some(fix) = self.state.check_gps_changes() {
                debug!(lat = fix.latitude, lon = fix.longitude, "publishing gps fix");
                self.send(OutboundMessage::Gps(GpsMessage::new(&self.boat_id, fix)))?;
            }
        }

        if self.elapsed % intervals.status_seconds == 0 {
            let data = self.state.status_data(None);
            self.send(OutboundMessage::Status(StatusMessage::new(
                &self.boat_id,
                data,
            )))?;
        }

        if self.elapsed % intervals.heartbeat_seconds == 0 {
            let snapshot = self.state.snapshot();
            let mut beat = HeartbeatMessage::alive(&self.boat_id, snapshot.uptime_seconds);
            beat.system = Some(snapshot.system);
            self.send(OutboundMessage::Heartbeat(beat))?;
        }

        if self.elapsed % intervals.system_seconds == 0 {
            let metrics = self.state.snapshot().system;
            let log = LogMessage::new(&self.boat_id, "info", "system metrics").with_details(
                serde_json::json!({
                    "cpu_percent": metrics.cpu_percent,
                    "memory_percent": metrics.memory_percent,
                    "temperature_celsius": metrics.temperature_c,
                    "battery_voltage": metrics.battery_voltage,
                }),
            );
            self.send(OutboundMessage::Log(log))?;
        }

        Ok(())
    }

    fn send(&self, message: OutboundMessage) -> Result<(), ()> {
        self.outbound.send(message).map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoatConfig;
    use crate::telemetry::GpsFix;
    use chrono::Utc;

    fn harness() -> (
        TelemetryReporter,
        Arc<SharedBoatState>,
        mpsc::UnboundedReceiver<OutboundMessage>,
    ) {
        let config = BoatConfig::new("boat-1");
        let state = Arc::new(SharedBoatState::new());
        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Mutex::new(CommandDispatcher::new(
            &config,
            state.clone(),
            ack_tx,
        )));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let reporter = TelemetryReporter::new("boat-1", state.clone(), dispatcher, out_tx);
        (reporter, state, out_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn fix_at(latitude: f64, longitude: f64) -> GpsFix {
        GpsFix {
            latitude,
            longitude,
            heading: 90.0,
            speed_knots: 2.0,
            satellites: Some(9),
            fix_time: Utc::now(),
        }
    }

    #[test]
    fn status_fires_on_its_period_only() {
        let (mut reporter, _state, mut rx) = harness();

        for _ in 0..9 {
            reporter.cycle().unwrap();
        }
        assert!(drain(&mut rx)
            .iter()
            .all(|m| !matches!(m, OutboundMessage::Status(_))));

        reporter.cycle().unwrap();
        let batch = drain(&mut rx);
        assert!(batch
            .iter()
            .any(|m| matches!(m, OutboundMessage::Status(_))));
    }

    #[test]
    fn gps_publishes_only_on_change() {
        let (mut reporter, state, mut rx) = harness();
        state.update_fix(fix_at(52.0, 4.0));

        for _ in 0..5 {
            reporter.cycle().unwrap();
        }
        let first: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|m| matches!(m, OutboundMessage::Gps(_)))
            .collect();
        assert_eq!(first.len(), 1);

        // Same position again, next gps window stays quiet.
        for _ in 0..5 {
            reporter.cycle().unwrap();
        }
        assert!(drain(&mut rx)
            .iter()
            .all(|m| !matches!(m, OutboundMessage::Gps(_))));

        state.update_fix(fix_at(52.01, 4.0));
        for _ in 0..5 {
            reporter.cycle().unwrap();
        }
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, OutboundMessage::Gps(_))));
    }

    #[test]
    fn heartbeat_carries_system_metrics() {
        let (mut reporter, _state, mut rx) = harness();

        for _ in 0..30 {
            reporter.cycle().unwrap();
        }
        let beat = drain(&mut rx)
            .into_iter()
            .find_map(|m| match m {
                OutboundMessage::Heartbeat(beat) => Some(beat),
                _ => None,
            })
            .expect("heartbeat after 30 cycles");
        assert!(!beat.is_offline());
        assert!(beat.system.is_some());
    }

    #[test]
    fn system_metrics_logged_each_minute() {
        let (mut reporter, state, mut rx) = harness();
        state.update_system(crate::telemetry::SystemMetrics {
            cpu_percent: 12.5,
            memory_percent: 40.0,
            temperature_c: 52.5,
            battery_voltage: 12.1,
        });

        for _ in 0..60 {
            reporter.cycle().unwrap();
        }
        let log = drain(&mut rx)
            .into_iter()
            .find_map(|m| match m {
                OutboundMessage::Log(log) => Some(log),
                _ => None,
            })
            .expect("system log after 60 cycles");
        assert_eq!(log.level, "info");
        assert_eq!(log.details["temperature_celsius"], 52.5);
        assert_eq!(log.details["battery_voltage"], 12.1);
    }

    #[test]
    fn closed_channel_stops_the_reporter() {
        let (mut reporter, _state, rx) = harness();
        drop(rx);
        for _ in 0..9 {
            assert!(reporter.cycle().is_ok());
        }
        // Tenth cycle hits the status publish and sees the closed channel.
        assert!(reporter.cycle().is_err());
    }
}
