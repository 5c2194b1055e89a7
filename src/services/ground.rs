//! Ground-side MQTT session.
//!
//! **Subscribe Topics** (wildcard, every boat):
//! - `boat/+/status`, `boat/+/gps`, `boat/+/ack`, `boat/+/logs`,
//!   `boat/+/heartbeat`
//!
//! **Publish Topics:**
//! - `boat/{id}/commands`, `boat/{id}/config`, `boat/{id}/emergency`
//!
//! Inbound telemetry feeds the boat registry and the command tracker;
//! envelopes handed in on the command channel are published to the target
//! boat's inbound topic and tracked until their terminal ack. A monitor
//! interval flips silent boats offline and expires unanswered commands.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use uuid::Uuid;

use crate::commands::CommandState;
use crate::config::GroundConfig;
use crate::envelope::{
    ground_subscriptions, inbound_topic, parse_telemetry_topic, AckMessage, CommandEnvelope,
    GpsMessage, HeartbeatMessage, LogMessage, StatusMessage, TelemetryKind,
};
use crate::registry::{BoatEntry, BoatRegistry, CommandTracker};
use crate::traits::Persistence;

use super::mqtt::{Backoff, TransportError};

// ============================================================================
// Operator Handle
// ============================================================================

/// Operator-facing view of a running ground session.
///
/// Wraps the command channel and the shared registry and tracker so an
/// embedding application (a console, a REST layer) can issue commands and
/// read fleet state without touching the session internals.
#[derive(Clone)]
pub struct GroundHandle {
    commands: mpsc::UnboundedSender<CommandEnvelope>,
    registry: Arc<Mutex<BoatRegistry>>,
    tracker: Arc<Mutex<CommandTracker>>,
}

impl GroundHandle {
    /// Build a handle over the channel and state a session was given.
    pub fn new(
        commands: mpsc::UnboundedSender<CommandEnvelope>,
        registry: Arc<Mutex<BoatRegistry>>,
        tracker: Arc<Mutex<CommandTracker>>,
    ) -> Self {
        Self {
            commands,
            registry,
            tracker,
        }
    }

    /// Queue a command for publication and return its id.
    pub fn submit_command(&self, envelope: CommandEnvelope) -> Result<Uuid, TransportError> {
        let command_id = envelope.command_id;
        self.commands
            .send(envelope)
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(command_id)
    }

    /// Issue a critical-priority emergency stop and return its id.
    pub fn emergency_stop(&self, boat_id: &str, reason: &str) -> Result<Uuid, TransportError> {
        self.submit_command(CommandEnvelope::emergency_stop(boat_id, reason))
    }

    /// Last known picture of one boat, if the registry has seen it.
    pub fn get_boat_status(&self, boat_id: &str) -> Option<BoatEntry> {
        self.registry.lock().unwrap().get(boat_id).cloned()
    }

    /// Current tracked state of a submitted command.
    pub fn command_state(&self, command_id: &Uuid) -> Option<CommandState> {
        self.tracker.lock().unwrap().state(command_id)
    }
}

/// Registry and tracker state behind the ground session.
///
/// Shared so an embedding application (a console, an API layer) can read
/// the fleet view while the session keeps it current.
struct GroundCore<P> {
    registry: Arc<Mutex<BoatRegistry>>,
    tracker: Arc<Mutex<CommandTracker>>,
    persistence: P,
}

impl<P: Persistence> GroundCore<P> {
    /// Route one inbound telemetry publish. Unknown topics are dropped.
    fn route(&mut self, topic: &str, payload: &[u8], now: chrono::DateTime<chrono::Utc>) {
        let Some((boat_id, kind)) = parse_telemetry_topic(topic) else {
            debug!(topic = %topic, "ignoring unrecognized topic");
            return;
        };

        match kind {
            TelemetryKind::Status => match serde_json::from_slice::<StatusMessage>(payload) {
                Ok(message) => {
                    self.registry.lock().unwrap().apply_status(&message, now);
                    if self
                        .persistence
                        .record_telemetry(boat_id, &message.data)
                        .is_err()
                    {
                        warn!(boat_id = %boat_id, "persistence rejected telemetry record");
                    }
                }
                Err(e) => warn!(topic = %topic, error = %e, "malformed status message"),
            },
            TelemetryKind::Gps => match serde_json::from_slice::<GpsMessage>(payload) {
                Ok(message) => self.registry.lock().unwrap().apply_gps(&message, now),
                Err(e) => warn!(topic = %topic, error = %e, "malformed gps message"),
            },
            TelemetryKind::Heartbeat => {
                match serde_json::from_slice::<HeartbeatMessage>(payload) {
                    Ok(message) => self.registry.lock().unwrap().apply_heartbeat(&message, now),
                    Err(e) => warn!(topic = %topic, error = %e, "malformed heartbeat"),
                }
            }
            TelemetryKind::Logs => match serde_json::from_slice::<LogMessage>(payload) {
                Ok(message) => self.registry.lock().unwrap().apply_log(&message, now),
                Err(e) => warn!(topic = %topic, error = %e, "malformed log message"),
            },
            TelemetryKind::Ack => match serde_json::from_slice::<AckMessage>(payload) {
                Ok(ack) => self.apply_ack(&ack, now),
                Err(e) => warn!(topic = %topic, error = %e, "malformed ack"),
            },
        }
    }

    fn apply_ack(&mut self, ack: &AckMessage, now: chrono::DateTime<chrono::Utc>) {
        let mut tracker = self.tracker.lock().unwrap();
        if let Err(e) = tracker.apply_ack(ack, now) {
            warn!(command_id = %ack.command_id, error = %e, "ack dropped");
            return;
        }
        if ack.state.is_terminal() {
            if let Some(entry) = tracker.get(&ack.command_id) {
                let entry = entry.clone();
                drop(tracker);
                if self.persistence.record_command(&entry).is_err() {
                    warn!(command_id = %ack.command_id, "persistence rejected command record");
                }
            }
        }
    }

    /// Periodic housekeeping: flip silent boats offline, expire unanswered
    /// commands, and hand the expirations to persistence.
    fn monitor(&mut self, now: chrono::DateTime<chrono::Utc>) {
        let offline = self.registry.lock().unwrap().sweep_offline(now);
        for boat_id in &offline {
            warn!(boat_id = %boat_id, "boat went silent; marked offline");
        }

        let expired = self.tracker.lock().unwrap().sweep(now);
        for entry in &expired {
            warn!(command_id = %entry.command_id, "command timed out without an ack");
            if self.persistence.record_command(entry).is_err() {
                warn!(command_id = %entry.command_id, "persistence rejected command record");
            }
        }
    }
}

/// The ground station's broker session.
pub struct GroundSession<P> {
    config: GroundConfig,
    core: GroundCore<P>,
    commands: mpsc::UnboundedReceiver<CommandEnvelope>,
}

impl<P: Persistence> GroundSession<P> {
    /// Build a session over the shared registry and tracker.
    pub fn new(
        config: GroundConfig,
        registry: Arc<Mutex<BoatRegistry>>,
        tracker: Arc<Mutex<CommandTracker>>,
        persistence: P,
        commands: mpsc::UnboundedReceiver<CommandEnvelope>,
    ) -> Self {
        Self {
            config,
            core: GroundCore {
                registry,
                tracker,
                persistence,
            },
            commands,
        }
    }

    /// Run the session until a fatal error.
    pub async fn run(self) -> Result<(), TransportError> {
        let Self {
            config,
            mut core,
            mut commands,
        } = self;

        let mut options =
            MqttOptions::new(&config.mqtt.client_id, &config.mqtt.host, config.mqtt.port);
        options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs as u64));
        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let mut backoff = Backoff::new(&config.mqtt);
        let mut monitor =
            tokio::time::interval(Duration::from_secs(config.monitor_interval_secs.max(1)));
        monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            host = %config.mqtt.host,
            port = config.mqtt.port,
            "starting ground session"
        );

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => match ack.code {
                        ConnectReturnCode::Success => {
                            info!("connected to broker");
                            backoff.on_connected();
                            for topic in ground_subscriptions() {
                                client
                                    .subscribe(&topic, QoS::AtLeastOnce)
                                    .await
                                    .map_err(|e| TransportError::Subscribe(e.to_string()))?;
                            }
                        }
                        ConnectReturnCode::BadUserNamePassword
                        | ConnectReturnCode::NotAuthorized => {
                            error!("broker rejected credentials");
                            return Err(TransportError::AuthRejected);
                        }
                        code => warn!(?code, "broker refused connection"),
                    },
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        core.route(&publish.topic, &publish.payload, Utc::now());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let wait = backoff.on_error();
                        warn!(error = %e, retry_in_secs = wait.as_secs(), "connection lost");
                        tokio::time::sleep(wait).await;
                    }
                },
                envelope = commands.recv() => match envelope {
                    Some(envelope) => {
                        Self::dispatch(&client, &core.tracker, envelope).await;
                    }
                    None => return Err(TransportError::ChannelClosed),
                },
                _ = monitor.tick() => core.monitor(Utc::now()),
            }
        }
    }

    /// Publish one command to its boat and start tracking it.
    async fn dispatch(
        client: &AsyncClient,
        tracker: &Arc<Mutex<CommandTracker>>,
        envelope: CommandEnvelope,
    ) {
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(command_id = %envelope.command_id, error = %e, "unencodable command");
                return;
            }
        };
        let topic = inbound_topic(&envelope.boat_id, envelope.command_type);
        if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            warn!(topic = %topic, error = %e, "command publish failed");
            return;
        }
        debug!(
            command_id = %envelope.command_id,
            topic = %topic,
            "command published"
        );
        tracker.lock().unwrap().track(&envelope, Utc::now());
    }
}
