//! Wire format for the boat command/telemetry protocol.
//!
//! Every command is a JSON envelope published to one of the boat's inbound
//! topics:
//!
//! **Inbound (ground to boat):**
//! - `boat/{id}/commands` - navigation, control, and status commands
//! - `boat/{id}/config` - safety limit and reporting changes
//! - `boat/{id}/emergency` - emergency stop and resume
//!
//! **Outbound (boat to ground):**
//! - `boat/{id}/status` - periodic status snapshots
//! - `boat/{id}/gps` - position fixes
//! - `boat/{id}/ack` - command acknowledgments
//! - `boat/{id}/logs` - remote log entries
//! - `boat/{id}/heartbeat` - liveness beacon (retained)
//!
//! Envelope decoding is the single place payload schemas are checked. Code
//! downstream of [`CommandEnvelope::from_json`] only ever sees typed payload
//! variants; a message that fails here never reaches the command ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commands::{CommandState, Priority};
use crate::safety::SafetyLimitsPatch;
use crate::telemetry::{GpsFix, StatusData, SystemMetrics};

/// Default envelope timeout when the sender does not provide one.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

// ============================================================================
// Command Kind
// ============================================================================

/// Top-level command category, carried as `command_type` on the wire.
///
/// The set is closed: anything else fails decoding with
/// [`CodecError::UnknownCommandType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Autonomous navigation goals (waypoint, course, hold).
    Navigation,
    /// Direct actuator control (rudder, throttle, stop).
    Control,
    /// Synchronous status snapshot request.
    Status,
    /// Safety limit and reporting interval changes.
    Config,
    /// Emergency stop and authenticated resume.
    Emergency,
}

impl CommandKind {
    /// Wire name of this command kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Navigation => "navigation",
            CommandKind::Control => "control",
            CommandKind::Status => "status",
            CommandKind::Config => "config",
            CommandKind::Emergency => "emergency",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "navigation" => Some(CommandKind::Navigation),
            "control" => Some(CommandKind::Control),
            "status" => Some(CommandKind::Status),
            "config" => Some(CommandKind::Config),
            "emergency" => Some(CommandKind::Emergency),
            _ => None,
        }
    }
}

// ============================================================================
// Payload Variants
// ============================================================================

/// Navigation goal payloads, discriminated by the `action` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NavigationAction {
    /// Steer to a coordinate, completing inside the arrival radius.
    SetWaypoint {
        /// Target latitude in degrees, -90 to 90.
        latitude: f64,
        /// Target longitude in degrees, -180 to 180.
        longitude: f64,
        /// Throttle ceiling in percent while underway.
        #[serde(default = "default_waypoint_speed")]
        max_speed: f64,
        /// Completion radius in meters.
        #[serde(default = "default_arrival_radius")]
        arrival_radius: f64,
    },
    /// Hold a fixed heading and speed for a duration.
    SetCourse {
        /// Heading in degrees, 0 to 360 exclusive.
        heading: f64,
        /// Throttle in percent, 0 to 100.
        speed: f64,
        /// How long to hold the course, in seconds.
        #[serde(default = "default_course_duration")]
        duration: u64,
    },
    /// Stay near the current position, correcting when drift exceeds the limit.
    HoldPosition {
        /// Allowed drift in meters before a correction burst.
        #[serde(default = "default_max_drift")]
        max_drift: f64,
    },
}

/// Direct actuator payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    /// Set the rudder angle in degrees (positive = starboard).
    SetRudder {
        /// Demanded rudder angle in degrees.
        angle: f64,
    },
    /// Set motor throttle with an optional ramp.
    SetThrottle {
        /// Demanded throttle in percent, 0 to 100.
        speed: f64,
        /// Ramp duration in seconds.
        #[serde(default = "default_ramp_time")]
        ramp_time: f64,
    },
    /// Stop all motors and center the rudder.
    StopMotors,
}

/// Status request payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StatusAction {
    /// Return a snapshot of the named sections, or everything when omitted.
    GetStatus {
        /// Section filter (`gps`, `motors`, `navigation`, `system`).
        /// Unknown names are ignored.
        #[serde(default)]
        include: Option<Vec<String>>,
    },
}

/// Configuration payloads. All require a valid `auth_token`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConfigAction {
    /// Replace fields of the active safety limit table.
    UpdateSafetyLimits {
        /// Shared-secret token checked against the boat config.
        auth_token: String,
        /// Fields to change; omitted fields keep their current value.
        limits: SafetyLimitsPatch,
    },
    /// Change telemetry reporting intervals.
    SetReportIntervals {
        /// Shared-secret token checked against the boat config.
        auth_token: String,
        /// Intervals to change, in seconds.
        intervals: ReportIntervalsPatch,
    },
}

/// Emergency payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EmergencyAction {
    /// Immediately stop motors, center rudder, and latch the stopped mode.
    EmergencyStop {
        /// Operator-supplied reason, recorded in the ack and logs.
        #[serde(default = "default_stop_reason")]
        reason: String,
    },
    /// Leave the emergency-stopped mode. The only exit from it.
    Resume {
        /// Shared-secret token checked against the boat config.
        auth_token: String,
    },
}

/// Partial update of telemetry reporting intervals, in seconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportIntervalsPatch {
    /// Status snapshot interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_seconds: Option<u64>,
    /// GPS fix interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_seconds: Option<u64>,
    /// Heartbeat interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_seconds: Option<u64>,
    /// System metrics interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_seconds: Option<u64>,
}

/// Typed command payload, one variant per [`CommandKind`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandPayload {
    /// Navigation goal.
    Navigation(NavigationAction),
    /// Direct actuator demand.
    Control(ControlAction),
    /// Status request.
    Status(StatusAction),
    /// Configuration change.
    Config(ConfigAction),
    /// Emergency action.
    Emergency(EmergencyAction),
}

impl CommandPayload {
    /// The command kind this payload belongs to.
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::Navigation(_) => CommandKind::Navigation,
            CommandPayload::Control(_) => CommandKind::Control,
            CommandPayload::Status(_) => CommandKind::Status,
            CommandPayload::Config(_) => CommandKind::Config,
            CommandPayload::Emergency(_) => CommandKind::Emergency,
        }
    }
}

fn default_waypoint_speed() -> f64 {
    50.0
}

fn default_arrival_radius() -> f64 {
    10.0
}

fn default_course_duration() -> u64 {
    60
}

fn default_max_drift() -> f64 {
    5.0
}

fn default_ramp_time() -> f64 {
    1.0
}

fn default_stop_reason() -> String {
    "unspecified".to_string()
}

// ============================================================================
// Command Envelope
// ============================================================================

/// A fully decoded command envelope.
///
/// Construction goes through [`CommandEnvelope::from_json`], which enforces
/// the schema, or [`CommandEnvelope::new`] on the ground side when building
/// outbound commands.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommandEnvelope {
    /// Unique command identifier, the deduplication key.
    pub command_id: Uuid,
    /// When the sender issued the command.
    pub timestamp: DateTime<Utc>,
    /// Target boat identifier.
    pub boat_id: String,
    /// Command category.
    pub command_type: CommandKind,
    /// Typed payload matching `command_type`.
    pub payload: CommandPayload,
    /// Scheduling priority.
    pub priority: Priority,
    /// Whether the boat must publish acknowledgments for this command.
    pub requires_ack: bool,
    /// Seconds before an unacknowledged command times out. Always >= 1.
    pub timeout_seconds: u64,
}

impl CommandEnvelope {
    /// Build an outbound envelope with a fresh id and current timestamp.
    pub fn new(boat_id: impl Into<String>, payload: CommandPayload) -> Self {
        let command_type = payload.kind();
        Self {
            command_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            boat_id: boat_id.into(),
            command_type,
            payload,
            priority: Priority::default(),
            requires_ack: true,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    /// Build a critical-priority emergency stop for a boat.
    pub fn emergency_stop(boat_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            boat_id,
            CommandPayload::Emergency(EmergencyAction::EmergencyStop {
                reason: reason.into(),
            }),
        )
        .with_priority(Priority::Critical)
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the timeout. Values below one second are raised to one.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds.max(1);
        self
    }

    /// Set whether acknowledgments are required.
    pub fn with_requires_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = requires_ack;
        self
    }

    /// Serialize to the wire JSON form.
    pub fn to_json(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode and validate a wire envelope.
    ///
    /// This is pure: no side effects, no state. Any failure means the message
    /// never existed as far as the ledger is concerned.
    pub fn from_json(bytes: &[u8]) -> Result<Self, CodecError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|_| CodecError::MalformedEnvelope { field: "envelope" })?;

        let obj = value
            .as_object()
            .ok_or(CodecError::MalformedEnvelope { field: "envelope" })?;

        let command_id = obj
            .get("command_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(CodecError::MalformedEnvelope {
                field: "command_id",
            })?;

        let timestamp = obj
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or(CodecError::MalformedEnvelope { field: "timestamp" })?;

        let boat_id = obj
            .get("boat_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(CodecError::MalformedEnvelope { field: "boat_id" })?
            .to_string();

        let type_str = obj
            .get("command_type")
            .and_then(|v| v.as_str())
            .ok_or(CodecError::MalformedEnvelope {
                field: "command_type",
            })?;
        let command_type = CommandKind::from_str(type_str)
            .ok_or_else(|| CodecError::UnknownCommandType(type_str.to_string()))?;

        let priority = match obj.get("priority") {
            None | Some(serde_json::Value::Null) => Priority::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|_| CodecError::MalformedEnvelope { field: "priority" })?,
        };

        let requires_ack = match obj.get("requires_ack") {
            None | Some(serde_json::Value::Null) => true,
            Some(v) => v
                .as_bool()
                .ok_or(CodecError::MalformedEnvelope {
                    field: "requires_ack",
                })?,
        };

        let timeout_seconds = match obj.get("timeout_seconds") {
            None | Some(serde_json::Value::Null) => DEFAULT_TIMEOUT_SECONDS,
            Some(v) => v
                .as_u64()
                .filter(|&t| t >= 1)
                .ok_or(CodecError::MalformedEnvelope {
                    field: "timeout_seconds",
                })?,
        };

        let payload_value = obj
            .get("payload")
            .cloned()
            .ok_or(CodecError::MalformedEnvelope { field: "payload" })?;

        let payload = decode_payload(command_type, payload_value)?;

        Ok(Self {
            command_id,
            timestamp,
            boat_id,
            command_type,
            payload,
            priority,
            requires_ack,
            timeout_seconds,
        })
    }
}

fn decode_payload(
    kind: CommandKind,
    value: serde_json::Value,
) -> Result<CommandPayload, CodecError> {
    let action = value
        .get("action")
        .and_then(|v| v.as_str())
        .ok_or(CodecError::InvalidPayload {
            field: "action",
            reason: "missing or not a string".to_string(),
        })?
        .to_string();

    let unknown_action = || CodecError::InvalidPayload {
        field: "action",
        reason: format!("unknown {} action: {}", kind.as_str(), action),
    };
    let bad_payload = |e: serde_json::Error| CodecError::InvalidPayload {
        field: "payload",
        reason: e.to_string(),
    };

    let payload = match kind {
        CommandKind::Navigation => {
            let action: NavigationAction = serde_json::from_value(value).map_err(|e| {
                if matches!(
                    action.as_str(),
                    "set_waypoint" | "set_course" | "hold_position"
                ) {
                    bad_payload(e)
                } else {
                    unknown_action()
                }
            })?;
            validate_navigation(&action)?;
            CommandPayload::Navigation(action)
        }
        CommandKind::Control => {
            let action: ControlAction = serde_json::from_value(value).map_err(|e| {
                if matches!(action.as_str(), "set_rudder" | "set_throttle" | "stop_motors") {
                    bad_payload(e)
                } else {
                    unknown_action()
                }
            })?;
            validate_control(&action)?;
            CommandPayload::Control(action)
        }
        CommandKind::Status => {
            let action: StatusAction = serde_json::from_value(value).map_err(|e| {
                if action == "get_status" {
                    bad_payload(e)
                } else {
                    unknown_action()
                }
            })?;
            CommandPayload::Status(action)
        }
        CommandKind::Config => {
            let action: ConfigAction = serde_json::from_value(value).map_err(|e| {
                if matches!(
                    action.as_str(),
                    "update_safety_limits" | "set_report_intervals"
                ) {
                    bad_payload(e)
                } else {
                    unknown_action()
                }
            })?;
            CommandPayload::Config(action)
        }
        CommandKind::Emergency => {
            let action: EmergencyAction = serde_json::from_value(value).map_err(|e| {
                if matches!(action.as_str(), "emergency_stop" | "resume") {
                    bad_payload(e)
                } else {
                    unknown_action()
                }
            })?;
            CommandPayload::Emergency(action)
        }
    };

    Ok(payload)
}

fn validate_navigation(action: &NavigationAction) -> Result<(), CodecError> {
    match action {
        NavigationAction::SetWaypoint {
            latitude,
            longitude,
            max_speed,
            arrival_radius,
        } => {
            if !(-90.0..=90.0).contains(latitude) {
                return Err(CodecError::InvalidPayload {
                    field: "latitude",
                    reason: "must be -90 to 90".to_string(),
                });
            }
            if !(-180.0..=180.0).contains(longitude) {
                return Err(CodecError::InvalidPayload {
                    field: "longitude",
                    reason: "must be -180 to 180".to_string(),
                });
            }
            if *max_speed <= 0.0 || *max_speed > 100.0 {
                return Err(CodecError::InvalidPayload {
                    field: "max_speed",
                    reason: "must be above 0 and at most 100".to_string(),
                });
            }
            if *arrival_radius < 0.0 {
                return Err(CodecError::InvalidPayload {
                    field: "arrival_radius",
                    reason: "must be non-negative".to_string(),
                });
            }
        }
        NavigationAction::SetCourse { heading, speed, .. } => {
            if !(0.0..360.0).contains(heading) {
                return Err(CodecError::InvalidPayload {
                    field: "heading",
                    reason: "must be 0 to 360 exclusive".to_string(),
                });
            }
            if !(0.0..=100.0).contains(speed) {
                return Err(CodecError::InvalidPayload {
                    field: "speed",
                    reason: "must be 0 to 100".to_string(),
                });
            }
        }
        NavigationAction::HoldPosition { max_drift } => {
            if *max_drift < 0.0 {
                return Err(CodecError::InvalidPayload {
                    field: "max_drift",
                    reason: "must be non-negative".to_string(),
                });
            }
        }
    }
    Ok(())
}

fn validate_control(action: &ControlAction) -> Result<(), CodecError> {
    match action {
        ControlAction::SetRudder { angle } => {
            if !angle.is_finite() {
                return Err(CodecError::InvalidPayload {
                    field: "angle",
                    reason: "must be a finite number".to_string(),
                });
            }
        }
        ControlAction::SetThrottle { speed, ramp_time } => {
            if !(0.0..=100.0).contains(speed) {
                return Err(CodecError::InvalidPayload {
                    field: "speed",
                    reason: "must be 0 to 100".to_string(),
                });
            }
            if *ramp_time < 0.0 {
                return Err(CodecError::InvalidPayload {
                    field: "ramp_time",
                    reason: "must be non-negative".to_string(),
                });
            }
        }
        ControlAction::StopMotors => {}
    }
    Ok(())
}

// ============================================================================
// Telemetry Messages
// ============================================================================

/// Outbound telemetry topic discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TelemetryKind {
    /// Periodic status snapshot.
    Status,
    /// GPS position fix.
    Gps,
    /// Command acknowledgment.
    Ack,
    /// Remote log entry.
    Logs,
    /// Liveness beacon.
    Heartbeat,
}

impl TelemetryKind {
    /// Topic suffix for this telemetry kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Status => "status",
            TelemetryKind::Gps => "gps",
            TelemetryKind::Ack => "ack",
            TelemetryKind::Logs => "logs",
            TelemetryKind::Heartbeat => "heartbeat",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "status" => Some(TelemetryKind::Status),
            "gps" => Some(TelemetryKind::Gps),
            "ack" => Some(TelemetryKind::Ack),
            "logs" => Some(TelemetryKind::Logs),
            "heartbeat" => Some(TelemetryKind::Heartbeat),
            _ => None,
        }
    }
}

/// Status snapshot message on `boat/{id}/status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Publishing boat.
    pub boat_id: String,
    /// Always `status_update`.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Snapshot sections.
    pub data: StatusData,
}

impl StatusMessage {
    /// Build a status message for the boat.
    pub fn new(boat_id: impl Into<String>, data: StatusData) -> Self {
        Self {
            timestamp: Utc::now(),
            boat_id: boat_id.into(),
            message_type: "status_update".to_string(),
            data,
        }
    }
}

/// GPS fix message on `boat/{id}/gps`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpsMessage {
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Publishing boat.
    pub boat_id: String,
    /// Always `gps_update`.
    #[serde(rename = "type")]
    pub message_type: String,
    /// The fix.
    pub data: GpsFix,
}

impl GpsMessage {
    /// Build a GPS message for the boat.
    pub fn new(boat_id: impl Into<String>, data: GpsFix) -> Self {
        Self {
            timestamp: Utc::now(),
            boat_id: boat_id.into(),
            message_type: "gps_update".to_string(),
            data,
        }
    }
}

/// Command acknowledgment on `boat/{id}/ack`.
///
/// Published when a command reaches `sent` and again at its terminal state,
/// carrying the lifecycle state so the ground tracker can advance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckMessage {
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Publishing boat.
    pub boat_id: String,
    /// The acknowledged command.
    pub command_id: Uuid,
    /// Lifecycle state the command reached.
    pub state: CommandState,
    /// Whether the command succeeded so far.
    pub success: bool,
    /// Human-readable detail (failure reason, result summary).
    pub message: String,
    /// Optional structured result, used by `get_status` responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl AckMessage {
    /// Build an acknowledgment for a command.
    pub fn new(
        boat_id: impl Into<String>,
        command_id: Uuid,
        state: CommandState,
        success: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            boat_id: boat_id.into(),
            command_id,
            state,
            success,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a structured result payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Remote log entry on `boat/{id}/logs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogMessage {
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Publishing boat.
    pub boat_id: String,
    /// Severity: `info`, `warning`, `error`, or `critical`.
    pub level: String,
    /// Log text.
    pub message: String,
    /// Structured context.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl LogMessage {
    /// Build a log entry.
    pub fn new(
        boat_id: impl Into<String>,
        level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            boat_id: boat_id.into(),
            level: level.into(),
            message: message.into(),
            details: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach structured context.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Liveness beacon on `boat/{id}/heartbeat`, published retained.
///
/// The same shape doubles as the broker last will with `status: "offline"`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Publishing boat.
    pub boat_id: String,
    /// `alive` from the running boat, `offline` via last will.
    pub status: String,
    /// Seconds since the boat process started.
    pub uptime_seconds: f64,
    /// Current system metrics, omitted in the last will.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemMetrics>,
}

impl HeartbeatMessage {
    /// Build an `alive` heartbeat.
    pub fn alive(boat_id: impl Into<String>, uptime_seconds: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            boat_id: boat_id.into(),
            status: "alive".to_string(),
            uptime_seconds,
            system: None,
        }
    }

    /// Build the last-will payload announcing the boat offline.
    pub fn offline(boat_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            boat_id: boat_id.into(),
            status: "offline".to_string(),
            uptime_seconds: 0.0,
            system: None,
        }
    }

    /// True when this heartbeat announces the boat offline.
    pub fn is_offline(&self) -> bool {
        self.status == "offline"
    }
}

// ============================================================================
// Topics
// ============================================================================

/// Inbound command topic for a boat.
pub fn command_topic(boat_id: &str) -> String {
    format!("boat/{}/commands", boat_id)
}

/// Inbound config topic for a boat.
pub fn config_topic(boat_id: &str) -> String {
    format!("boat/{}/config", boat_id)
}

/// Inbound emergency topic for a boat.
pub fn emergency_topic(boat_id: &str) -> String {
    format!("boat/{}/emergency", boat_id)
}

/// Inbound topic for a command kind. Config and emergency commands travel on
/// their dedicated topics; everything else on `commands`.
pub fn inbound_topic(boat_id: &str, kind: CommandKind) -> String {
    match kind {
        CommandKind::Config => config_topic(boat_id),
        CommandKind::Emergency => emergency_topic(boat_id),
        _ => command_topic(boat_id),
    }
}

/// Outbound telemetry topic for a boat.
pub fn telemetry_topic(boat_id: &str, kind: TelemetryKind) -> String {
    format!("boat/{}/{}", boat_id, kind.as_str())
}

/// Wildcard subscriptions covering every boat's outbound topics.
pub fn ground_subscriptions() -> Vec<String> {
    [
        TelemetryKind::Status,
        TelemetryKind::Gps,
        TelemetryKind::Ack,
        TelemetryKind::Logs,
        TelemetryKind::Heartbeat,
    ]
    .iter()
    .map(|k| format!("boat/+/{}", k.as_str()))
    .collect()
}

/// Parse `boat/{id}/{kind}` out of a telemetry topic.
pub fn parse_telemetry_topic(topic: &str) -> Option<(&str, TelemetryKind)> {
    let mut parts = topic.split('/');
    if parts.next() != Some("boat") {
        return None;
    }
    let boat_id = parts.next().filter(|s| !s.is_empty())?;
    let kind = TelemetryKind::from_str(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((boat_id, kind))
}

// ============================================================================
// Codec Errors
// ============================================================================

/// Errors produced while decoding or encoding wire messages.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    /// A required envelope field is missing or has the wrong type.
    #[error("malformed envelope: bad or missing field `{field}`")]
    MalformedEnvelope {
        /// The offending field.
        field: &'static str,
    },

    /// `command_type` is outside the closed set.
    #[error("unknown command type: {0}")]
    UnknownCommandType(String),

    /// The payload does not match the schema for its command type.
    #[error("invalid payload field `{field}`: {reason}")]
    InvalidPayload {
        /// The offending payload field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// Serialization failure while encoding an outbound message.
    #[error("encode error: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waypoint_json(extra: &str) -> Vec<u8> {
        format!(
            r#"{{
                "command_id": "3e2f5d1c-8a4b-4f6e-9c1d-2b7a8e5f0a3b",
                "timestamp": "2026-08-28T12:00:00Z",
                "boat_id": "boat-01",
                "command_type": "navigation",
                "payload": {{"action": "set_waypoint", "latitude": 52.1, "longitude": 4.3{}}}
            }}"#,
            extra
        )
        .into_bytes()
    }

    #[test]
    fn decode_waypoint_with_defaults() {
        let env = CommandEnvelope::from_json(&waypoint_json("")).unwrap();
        assert_eq!(env.boat_id, "boat-01");
        assert_eq!(env.command_type, CommandKind::Navigation);
        assert_eq!(env.priority, Priority::Medium);
        assert!(env.requires_ack);
        assert_eq!(env.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);

        match env.payload {
            CommandPayload::Navigation(NavigationAction::SetWaypoint {
                max_speed,
                arrival_radius,
                ..
            }) => {
                assert_eq!(max_speed, 50.0);
                assert_eq!(arrival_radius, 10.0);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn decode_explicit_fields() {
        let env = CommandEnvelope::from_json(&waypoint_json(
            r#", "max_speed": 30, "arrival_radius": 25.0"#,
        ))
        .unwrap();
        match env.payload {
            CommandPayload::Navigation(NavigationAction::SetWaypoint {
                max_speed,
                arrival_radius,
                ..
            }) => {
                assert_eq!(max_speed, 30.0);
                assert_eq!(arrival_radius, 25.0);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn missing_command_id_names_the_field() {
        let bytes = br#"{
            "timestamp": "2026-08-28T12:00:00Z",
            "boat_id": "boat-01",
            "command_type": "navigation",
            "payload": {"action": "hold_position"}
        }"#;
        let err = CommandEnvelope::from_json(bytes).unwrap_err();
        assert_eq!(
            err,
            CodecError::MalformedEnvelope {
                field: "command_id"
            }
        );
    }

    #[test]
    fn bad_uuid_is_malformed() {
        let bytes = br#"{
            "command_id": "not-a-uuid",
            "timestamp": "2026-08-28T12:00:00Z",
            "boat_id": "boat-01",
            "command_type": "navigation",
            "payload": {"action": "hold_position"}
        }"#;
        let err = CommandEnvelope::from_json(bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::MalformedEnvelope {
                field: "command_id"
            }
        ));
    }

    #[test]
    fn unknown_command_type_is_its_own_error() {
        let bytes = br#"{
            "command_id": "3e2f5d1c-8a4b-4f6e-9c1d-2b7a8e5f0a3b",
            "timestamp": "2026-08-28T12:00:00Z",
            "boat_id": "boat-01",
            "command_type": "teleport",
            "payload": {"action": "set_waypoint"}
        }"#;
        let err = CommandEnvelope::from_json(bytes).unwrap_err();
        assert_eq!(err, CodecError::UnknownCommandType("teleport".to_string()));
    }

    #[test]
    fn latitude_out_of_range_names_the_field() {
        let bytes = br#"{
            "command_id": "3e2f5d1c-8a4b-4f6e-9c1d-2b7a8e5f0a3b",
            "timestamp": "2026-08-28T12:00:00Z",
            "boat_id": "boat-01",
            "command_type": "navigation",
            "payload": {"action": "set_waypoint", "latitude": 91.0, "longitude": 4.3}
        }"#;
        let err = CommandEnvelope::from_json(bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidPayload {
                field: "latitude",
                ..
            }
        ));
    }

    #[test]
    fn unknown_action_is_invalid_payload() {
        let bytes = br#"{
            "command_id": "3e2f5d1c-8a4b-4f6e-9c1d-2b7a8e5f0a3b",
            "timestamp": "2026-08-28T12:00:00Z",
            "boat_id": "boat-01",
            "command_type": "navigation",
            "payload": {"action": "fly"}
        }"#;
        let err = CommandEnvelope::from_json(bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidPayload { field: "action", .. }
        ));
    }

    #[test]
    fn set_course_requires_speed() {
        let bytes = br#"{
            "command_id": "3e2f5d1c-8a4b-4f6e-9c1d-2b7a8e5f0a3b",
            "timestamp": "2026-08-28T12:00:00Z",
            "boat_id": "boat-01",
            "command_type": "navigation",
            "payload": {"action": "set_course", "heading": 90.0}
        }"#;
        let err = CommandEnvelope::from_json(bytes).unwrap_err();
        assert!(matches!(err, CodecError::InvalidPayload { .. }));
    }

    #[test]
    fn zero_timeout_rejected() {
        let bytes = br#"{
            "command_id": "3e2f5d1c-8a4b-4f6e-9c1d-2b7a8e5f0a3b",
            "timestamp": "2026-08-28T12:00:00Z",
            "boat_id": "boat-01",
            "command_type": "navigation",
            "payload": {"action": "hold_position"},
            "timeout_seconds": 0
        }"#;
        let err = CommandEnvelope::from_json(bytes).unwrap_err();
        assert_eq!(
            err,
            CodecError::MalformedEnvelope {
                field: "timeout_seconds"
            }
        );
    }

    #[test]
    fn emergency_stop_defaults_reason() {
        let bytes = br#"{
            "command_id": "3e2f5d1c-8a4b-4f6e-9c1d-2b7a8e5f0a3b",
            "timestamp": "2026-08-28T12:00:00Z",
            "boat_id": "boat-01",
            "command_type": "emergency",
            "payload": {"action": "emergency_stop"},
            "priority": "critical"
        }"#;
        let env = CommandEnvelope::from_json(bytes).unwrap();
        assert_eq!(env.priority, Priority::Critical);
        match env.payload {
            CommandPayload::Emergency(EmergencyAction::EmergencyStop { reason }) => {
                assert_eq!(reason, "unspecified");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn action_from_wrong_kind_rejected() {
        // set_waypoint on a control command must not decode
        let bytes = br#"{
            "command_id": "3e2f5d1c-8a4b-4f6e-9c1d-2b7a8e5f0a3b",
            "timestamp": "2026-08-28T12:00:00Z",
            "boat_id": "boat-01",
            "command_type": "control",
            "payload": {"action": "set_waypoint", "latitude": 52.1, "longitude": 4.3}
        }"#;
        let err = CommandEnvelope::from_json(bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidPayload { field: "action", .. }
        ));
    }

    #[test]
    fn roundtrip_outbound_envelope() {
        let env = CommandEnvelope::new(
            "boat-07",
            CommandPayload::Control(ControlAction::SetThrottle {
                speed: 40.0,
                ramp_time: 2.0,
            }),
        )
        .with_priority(Priority::High)
        .with_timeout(15);

        let bytes = env.to_json().unwrap();
        let decoded = CommandEnvelope::from_json(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn emergency_stop_builder_is_critical() {
        let env = CommandEnvelope::emergency_stop("boat-07", "operator abort");
        assert_eq!(env.command_type, CommandKind::Emergency);
        assert_eq!(env.priority, Priority::Critical);
        match env.payload {
            CommandPayload::Emergency(EmergencyAction::EmergencyStop { ref reason }) => {
                assert_eq!(reason, "operator abort");
            }
            ref other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn with_timeout_floors_at_one() {
        let env = CommandEnvelope::new(
            "boat-07",
            CommandPayload::Control(ControlAction::StopMotors),
        )
        .with_timeout(0);
        assert_eq!(env.timeout_seconds, 1);
    }

    #[test]
    fn telemetry_topic_layout() {
        assert_eq!(command_topic("boat-01"), "boat/boat-01/commands");
        assert_eq!(
            telemetry_topic("boat-01", TelemetryKind::Gps),
            "boat/boat-01/gps"
        );
        assert_eq!(
            inbound_topic("boat-01", CommandKind::Emergency),
            "boat/boat-01/emergency"
        );
        assert_eq!(
            inbound_topic("boat-01", CommandKind::Navigation),
            "boat/boat-01/commands"
        );
    }

    #[test]
    fn parse_telemetry_topic_roundtrip() {
        assert_eq!(
            parse_telemetry_topic("boat/alpha/heartbeat"),
            Some(("alpha", TelemetryKind::Heartbeat))
        );
        assert_eq!(parse_telemetry_topic("boat/alpha/commands"), None);
        assert_eq!(parse_telemetry_topic("ship/alpha/status"), None);
        assert_eq!(parse_telemetry_topic("boat/alpha/status/extra"), None);
        assert_eq!(parse_telemetry_topic("boat//status"), None);
    }

    #[test]
    fn heartbeat_offline_shape() {
        let hb = HeartbeatMessage::offline("boat-01");
        assert!(hb.is_offline());
        let json = serde_json::to_string(&hb).unwrap();
        assert!(json.contains(r#""status":"offline""#));
    }

    #[test]
    fn ack_roundtrip_with_data() {
        let ack = AckMessage::new(
            "boat-01",
            Uuid::new_v4(),
            CommandState::Completed,
            true,
            "done",
        )
        .with_data(serde_json::json!({"sections": ["gps"]}));

        let bytes = serde_json::to_vec(&ack).unwrap();
        let decoded: AckMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.command_id, ack.command_id);
        assert_eq!(decoded.state, CommandState::Completed);
        assert!(decoded.data.is_some());
    }
}
