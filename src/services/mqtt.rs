//! Boat-side MQTT transport session.
//!
//! Owns the broker connection, decodes inbound commands, and publishes
//! telemetry handed over by the reporter and dispatcher:
//!
//! **Subscribe Topics:**
//! - `boat/{id}/commands` - navigation, control, and status commands
//! - `boat/{id}/config` - authenticated configuration commands
//! - `boat/{id}/emergency` - emergency stop and resume
//!
//! **Publish Topics:**
//! - `boat/{id}/status`, `boat/{id}/gps`, `boat/{id}/ack`, `boat/{id}/logs`
//! - `boat/{id}/heartbeat` - retained; the broker last will publishes an
//!   offline heartbeat here when the session dies
//!
//! # Reconnection
//!
//! Connection failures back off exponentially from the configured minimum
//! delay, doubling up to the maximum. A connection that stays up for the
//! sustained window resets the delay. Acknowledgments and critical logs
//! produced while disconnected are buffered (bounded) and flushed
//! oldest-first on reconnect; routine telemetry is dropped, since the next
//! reporter cycle regenerates it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, ConnectReturnCode, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::envelope::{
    command_topic, config_topic, emergency_topic, telemetry_topic, AckMessage, CommandEnvelope,
    GpsMessage, HeartbeatMessage, LogMessage, StatusMessage, TelemetryKind,
};

// ============================================================================
// Errors
// ============================================================================

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The broker rejected our credentials. Not retried.
    #[error("broker rejected credentials")]
    AuthRejected,
    /// Subscribing to a command topic failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    /// The session's channels closed, meaning the rest of the daemon is gone.
    #[error("session channels closed")]
    ChannelClosed,
}

// ============================================================================
// Outbound Messages
// ============================================================================

/// Everything the boat publishes, routed to its topic by kind.
#[derive(Clone, Debug)]
pub enum OutboundMessage {
    /// Periodic status snapshot.
    Status(StatusMessage),
    /// GPS update.
    Gps(GpsMessage),
    /// Command acknowledgment.
    Ack(AckMessage),
    /// Remote log entry.
    Log(LogMessage),
    /// Liveness beacon, published retained.
    Heartbeat(HeartbeatMessage),
}

impl OutboundMessage {
    fn kind(&self) -> TelemetryKind {
        match self {
            OutboundMessage::Status(_) => TelemetryKind::Status,
            OutboundMessage::Gps(_) => TelemetryKind::Gps,
            OutboundMessage::Ack(_) => TelemetryKind::Ack,
            OutboundMessage::Log(_) => TelemetryKind::Logs,
            OutboundMessage::Heartbeat(_) => TelemetryKind::Heartbeat,
        }
    }

    fn topic(&self, boat_id: &str) -> String {
        telemetry_topic(boat_id, self.kind())
    }

    fn retain(&self) -> bool {
        matches!(self, OutboundMessage::Heartbeat(_))
    }

    /// Whether this message is worth holding through a disconnect.
    ///
    /// Acks carry lifecycle state the ground cannot reconstruct, and
    /// critical logs record safety events. Everything else regenerates.
    fn survives_disconnect(&self) -> bool {
        match self {
            OutboundMessage::Ack(_) => true,
            OutboundMessage::Log(log) => log.level == "critical",
            _ => false,
        }
    }

    fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            OutboundMessage::Status(m) => serde_json::to_vec(m),
            OutboundMessage::Gps(m) => serde_json::to_vec(m),
            OutboundMessage::Ack(m) => serde_json::to_vec(m),
            OutboundMessage::Log(m) => serde_json::to_vec(m),
            OutboundMessage::Heartbeat(m) => serde_json::to_vec(m),
        }
    }
}

// ============================================================================
// Disconnect Buffer
// ============================================================================

/// Bounded FIFO for messages produced while disconnected.
struct DisconnectBuffer {
    messages: VecDeque<OutboundMessage>,
    capacity: usize,
}

impl DisconnectBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity,
        }
    }

    /// Hold a message if it survives disconnects. On overflow the oldest
    /// non-critical entry is evicted first; a critical log goes only when
    /// the buffer holds nothing else.
    fn push(&mut self, message: OutboundMessage) {
        if !message.survives_disconnect() {
            return;
        }
        if self.messages.len() >= self.capacity {
            let victim = self
                .messages
                .iter()
                .position(|m| !Self::is_critical(m))
                .unwrap_or(0);
            self.messages.remove(victim);
            warn!("disconnect buffer full; dropped oldest non-critical message");
        }
        self.messages.push_back(message);
    }

    fn is_critical(message: &OutboundMessage) -> bool {
        matches!(message, OutboundMessage::Log(log) if log.level == "critical")
    }

    fn drain(&mut self) -> Vec<OutboundMessage> {
        self.messages.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.messages.len()
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential reconnect delay with a sustained-connection reset.
pub(super) struct Backoff {
    delay: Duration,
    min: Duration,
    max: Duration,
    sustained: Duration,
    connected_since: Option<Instant>,
}

impl Backoff {
    pub(super) fn new(config: &MqttConfig) -> Self {
        let min = Duration::from_secs(config.reconnect_min_secs);
        Self {
            delay: min,
            min,
            max: Duration::from_secs(config.reconnect_max_secs),
            sustained: Duration::from_secs(config.sustained_connection_secs),
            connected_since: None,
        }
    }

    pub(super) fn on_connected(&mut self) {
        self.connected_since = Some(Instant::now());
    }

    /// The delay to wait before the next attempt, advancing the schedule.
    pub(super) fn on_error(&mut self) -> Duration {
        if let Some(since) = self.connected_since.take() {
            if since.elapsed() >= self.sustained {
                self.delay = self.min;
            }
        }
        let wait = self.delay;
        self.delay = (self.delay * 2).min(self.max);
        wait
    }
}

// ============================================================================
// Session
// ============================================================================

/// Everything the session handlers need besides the outbound receiver,
/// split out so the event loop can poll the receiver concurrently.
struct SessionCore {
    boat_id: String,
    config: MqttConfig,
    commands: mpsc::UnboundedSender<CommandEnvelope>,
}

/// The boat's broker session.
///
/// Decoded inbound commands flow out through the command channel; the
/// outbound channel accepts anything the daemon wants published.
pub struct BoatSession {
    core: SessionCore,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl BoatSession {
    /// Build a session for the given boat.
    pub fn new(
        boat_id: impl Into<String>,
        config: MqttConfig,
        commands: mpsc::UnboundedSender<CommandEnvelope>,
        outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    ) -> Self {
        Self {
            core: SessionCore {
                boat_id: boat_id.into(),
                config,
                commands,
            },
            outbound,
        }
    }

    /// Run the session until a fatal error.
    ///
    /// Ordinary connection failures are retried with backoff; only
    /// credential rejection and channel closure end the session.
    pub async fn run(self) -> Result<(), TransportError> {
        let Self { core, mut outbound } = self;

        let mut options =
            MqttOptions::new(&core.config.client_id, &core.config.host, core.config.port);
        options.set_keep_alive(Duration::from_secs(core.config.keep_alive_secs as u64));
        if let (Some(user), Some(pass)) = (&core.config.username, &core.config.password) {
            options.set_credentials(user, pass);
        }

        // The broker publishes this on our behalf if the session dies
        // without a clean disconnect.
        let will = HeartbeatMessage::offline(&core.boat_id);
        let will_payload = serde_json::to_vec(&will).unwrap_or_default();
        options.set_last_will(LastWill::new(
            telemetry_topic(&core.boat_id, TelemetryKind::Heartbeat),
            will_payload,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let mut buffer = DisconnectBuffer::new(core.config.outbound_buffer);
        let mut backoff = Backoff::new(&core.config);
        let mut connected = false;

        info!(
            host = %core.config.host,
            port = core.config.port,
            boat_id = %core.boat_id,
            "starting transport session"
        );

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        match ack.code {
                            ConnectReturnCode::Success => {
                                info!("connected to broker");
                                connected = true;
                                backoff.on_connected();
                                core.subscribe(&client).await?;
                                core.flush(&client, &mut buffer).await;
                            }
                            ConnectReturnCode::BadUserNamePassword
                            | ConnectReturnCode::NotAuthorized => {
                                error!("broker rejected credentials");
                                return Err(TransportError::AuthRejected);
                            }
                            code => {
                                warn!(?code, "broker refused connection");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        core.handle_inbound(&publish.topic, &publish.payload)?;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected = false;
                        let wait = backoff.on_error();
                        warn!(
                            error = %e,
                            retry_in_secs = wait.as_secs(),
                            buffered = buffer.len(),
                            "connection lost"
                        );
                        tokio::time::sleep(wait).await;
                    }
                },
                message = outbound.recv() => match message {
                    Some(message) if connected => {
                        if let Err(message) = core.publish(&client, message).await {
                            buffer.push(message);
                        }
                    }
                    Some(message) => buffer.push(message),
                    None => return Err(TransportError::ChannelClosed),
                },
            }
        }
    }
}

impl SessionCore {
    async fn subscribe(&self, client: &AsyncClient) -> Result<(), TransportError> {
        let topics = [
            command_topic(&self.boat_id),
            config_topic(&self.boat_id),
            emergency_topic(&self.boat_id),
        ];
        for topic in &topics {
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        }
        debug!(?topics, "subscribed");
        Ok(())
    }

    fn handle_inbound(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        // Decode failures mean the message never existed; nothing is acked
        // because nothing was admitted.
        match CommandEnvelope::from_json(payload) {
            Ok(envelope) => {
                debug!(
                    command_id = %envelope.command_id,
                    kind = ?envelope.command_type,
                    topic = %topic,
                    "command received"
                );
                self.commands
                    .send(envelope)
                    .map_err(|_| TransportError::ChannelClosed)?;
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "dropping malformed command");
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        client: &AsyncClient,
        message: OutboundMessage,
    ) -> Result<(), OutboundMessage> {
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "unencodable outbound message");
                return Ok(());
            }
        };
        let topic = message.topic(&self.boat_id);
        let retain = message.retain();
        if let Err(e) = client
            .publish(&topic, QoS::AtLeastOnce, retain, payload)
            .await
        {
            warn!(topic = %topic, error = %e, "publish failed");
            return Err(message);
        }
        Ok(())
    }

    async fn flush(&self, client: &AsyncClient, buffer: &mut DisconnectBuffer) {
        let held = buffer.drain();
        if held.is_empty() {
            return;
        }
        info!(count = held.len(), "flushing buffered messages");
        for message in held {
            if let Err(message) = self.publish(client, message).await {
                buffer.push(message);
            }
        }
    }
}
