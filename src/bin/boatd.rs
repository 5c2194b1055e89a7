//! Boat-side daemon.
//!
//! Wires the full boat stack together and runs it against a broker:
//! - an MQTT session owning the connection, subscriptions, and last will
//! - a control loop draining commands into the dispatcher and ticking
//!   navigation, safety, and the actuators once a second
//! - a telemetry reporter publishing status, GPS, heartbeat, and metrics
//!
//! Hardware comes in through the `Actuator`, `PositionSource`, and
//! `SystemSensors` traits. This binary runs the mock implementations so the
//! whole stack can be exercised against a real broker from a desk; a
//! deployment substitutes its drivers at the marked seam.
//!
//! # Configuration
//!
//! Everything comes from the environment:
//!
//! ```bash
//! BOAT_ID=boat-01 \
//! MQTT_HOST=broker.local MQTT_PORT=1883 \
//! MQTT_USERNAME=boat MQTT_PASSWORD=secret \
//! BOAT_AUTH_TOKEN=token \
//! RUST_LOG=helmlink=debug \
//! boatd
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use helmlink::hal::{MockActuator, MockGps, MockSensors, WallClock};
use helmlink::services::{BoatSession, ControlRunner, OutboundMessage, TelemetryReporter};
use helmlink::{BoatConfig, CommandDispatcher, MqttConfig, SharedBoatState};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn load_config() -> BoatConfig {
    let boat_id = env_or("BOAT_ID", "boat-01");

    let mut mqtt = MqttConfig::new(
        env_or("MQTT_HOST", "localhost"),
        env_or("MQTT_PORT", "1883").parse().unwrap_or(1883),
    )
    .with_client_id(format!("boat-{}", boat_id));
    if let (Ok(user), Ok(pass)) = (
        std::env::var("MQTT_USERNAME"),
        std::env::var("MQTT_PASSWORD"),
    ) {
        mqtt = mqtt.with_credentials(user, pass);
    }

    let mut config = BoatConfig::new(boat_id).with_mqtt(mqtt);
    if let Ok(token) = std::env::var("BOAT_AUTH_TOKEN") {
        config = config.with_auth_token(token);
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config();
    info!(boat_id = %config.boat_id, host = %config.mqtt.host, "starting boatd");

    // =========================================================================
    // Shared state and channels
    // =========================================================================
    let state = Arc::new(SharedBoatState::new());
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();

    let dispatcher = Arc::new(Mutex::new(CommandDispatcher::new(
        &config,
        state.clone(),
        ack_tx,
    )));

    // Acks produced anywhere in the dispatcher go out like any other message.
    let ack_outbound = outbound_tx.clone();
    tokio::spawn(async move {
        while let Some(ack) = ack_rx.recv().await {
            if ack_outbound.send(OutboundMessage::Ack(ack)).is_err() {
                return;
            }
        }
    });

    // =========================================================================
    // Hardware seam
    // =========================================================================
    let actuator = MockActuator::new();
    let gps = MockGps::fixed_at(52.377, 4.901);
    let sensors = MockSensors::new();

    // =========================================================================
    // Tasks
    // =========================================================================
    let runner = ControlRunner::new(
        &config.boat_id,
        dispatcher.clone(),
        state.clone(),
        actuator,
        gps,
        sensors,
        WallClock,
        (),
        command_rx,
        outbound_tx.clone(),
    );
    tokio::spawn(runner.run());

    let reporter = TelemetryReporter::new(
        &config.boat_id,
        state.clone(),
        dispatcher.clone(),
        outbound_tx,
    );
    tokio::spawn(reporter.run());

    let session = BoatSession::new(
        &config.boat_id,
        config.mqtt.clone(),
        command_tx,
        outbound_rx,
    );
    if let Err(e) = session.run().await {
        error!(error = %e, "transport session ended");
        return Err(e.into());
    }
    Ok(())
}
