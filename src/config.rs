//! Configuration for the boat daemon and the ground session.
//!
//! Plain structs with defaults and `with_*` builders. Everything here is
//! startup configuration; the only pieces that change at runtime are the
//! safety limit table and the reporting intervals, which go through
//! authenticated config commands.

use serde::{Deserialize, Serialize};

use crate::envelope::ReportIntervalsPatch;
use crate::safety::SafetyLimits;

// ============================================================================
// MQTT
// ============================================================================

/// Broker connection settings, shared by the boat and ground sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional broker username.
    pub username: Option<String>,
    /// Optional broker password.
    pub password: Option<String>,
    /// MQTT client id.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,
    /// First reconnect delay in seconds.
    pub reconnect_min_secs: u64,
    /// Reconnect delay ceiling in seconds.
    pub reconnect_max_secs: u64,
    /// Seconds a connection must stay up before the delay resets.
    pub sustained_connection_secs: u64,
    /// Capacity of the disconnect buffer for acks and emergency reports.
    pub outbound_buffer: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "helmlink".to_string(),
            keep_alive_secs: 30,
            reconnect_min_secs: 1,
            reconnect_max_secs: 60,
            sustained_connection_secs: 30,
            outbound_buffer: 64,
        }
    }
}

impl MqttConfig {
    /// Config for the given broker address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the client id.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set broker credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the reconnect backoff window.
    pub fn with_reconnect_window(mut self, min_secs: u64, max_secs: u64) -> Self {
        self.reconnect_min_secs = min_secs.max(1);
        self.reconnect_max_secs = max_secs.max(self.reconnect_min_secs);
        self
    }
}

// ============================================================================
// Reporting Intervals
// ============================================================================

/// Telemetry reporting periods, in seconds.
///
/// Each interval has a floor so a bad config command cannot flood the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportIntervals {
    /// Status snapshot period.
    pub status_seconds: u64,
    /// GPS fix period.
    pub gps_seconds: u64,
    /// Heartbeat period.
    pub heartbeat_seconds: u64,
    /// System metrics period.
    pub system_seconds: u64,
}

impl Default for ReportIntervals {
    fn default() -> Self {
        Self {
            status_seconds: 10,
            gps_seconds: 5,
            heartbeat_seconds: 30,
            system_seconds: 60,
        }
    }
}

impl ReportIntervals {
    /// Floor for the status period.
    pub const MIN_STATUS: u64 = 1;
    /// Floor for the GPS period.
    pub const MIN_GPS: u64 = 1;
    /// Floor for the heartbeat period.
    pub const MIN_HEARTBEAT: u64 = 10;
    /// Floor for the system metrics period.
    pub const MIN_SYSTEM: u64 = 30;

    /// New intervals with the patch applied and floors enforced.
    pub fn apply_patch(&self, patch: &ReportIntervalsPatch) -> Self {
        Self {
            status_seconds: patch
                .status_seconds
                .unwrap_or(self.status_seconds)
                .max(Self::MIN_STATUS),
            gps_seconds: patch
                .gps_seconds
                .unwrap_or(self.gps_seconds)
                .max(Self::MIN_GPS),
            heartbeat_seconds: patch
                .heartbeat_seconds
                .unwrap_or(self.heartbeat_seconds)
                .max(Self::MIN_HEARTBEAT),
            system_seconds: patch
                .system_seconds
                .unwrap_or(self.system_seconds)
                .max(Self::MIN_SYSTEM),
        }
    }
}

// ============================================================================
// Boat
// ============================================================================

/// Full boat daemon configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BoatConfig {
    /// This boat's identifier, used in every topic.
    pub boat_id: String,
    /// Broker settings.
    pub mqtt: MqttConfig,
    /// Initial reporting intervals.
    pub intervals: ReportIntervals,
    /// Initial safety limit table.
    pub safety: SafetyLimits,
    /// Shared secret for config and resume commands. When unset, those
    /// commands are refused outright.
    pub auth_token: Option<String>,
}

impl BoatConfig {
    /// Config for the given boat id with defaults everywhere else.
    pub fn new(boat_id: impl Into<String>) -> Self {
        let boat_id = boat_id.into();
        let mqtt = MqttConfig::default().with_client_id(format!("boat-{}", boat_id));
        Self {
            boat_id,
            mqtt,
            ..Default::default()
        }
    }

    /// Set the broker settings.
    pub fn with_mqtt(mut self, mqtt: MqttConfig) -> Self {
        self.mqtt = mqtt;
        self
    }

    /// Set the initial safety limits.
    pub fn with_safety(mut self, safety: SafetyLimits) -> Self {
        self.safety = safety;
        self
    }

    /// Set the shared secret for config and resume commands.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Check a presented token against the configured secret.
    pub fn token_matches(&self, presented: &str) -> bool {
        Self::secret_matches(&self.auth_token, presented)
    }

    /// Token check against an optional secret. No secret rejects everything.
    pub(crate) fn secret_matches(secret: &Option<String>, presented: &str) -> bool {
        match secret {
            Some(expected) => expected == presented,
            None => false,
        }
    }
}

// ============================================================================
// Ground
// ============================================================================

/// Ground-side session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroundConfig {
    /// Broker settings.
    pub mqtt: MqttConfig,
    /// Seconds without a heartbeat before a boat is marked offline.
    pub boat_timeout_secs: u64,
    /// How often the offline monitor runs, in seconds.
    pub monitor_interval_secs: u64,
}

impl Default for GroundConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default().with_client_id("helmlink-ground".to_string()),
            boat_timeout_secs: 300,
            monitor_interval_secs: 30,
        }
    }
}

impl GroundConfig {
    /// Set the broker settings.
    pub fn with_mqtt(mut self, mqtt: MqttConfig) -> Self {
        self.mqtt = mqtt;
        self
    }

    /// Set the heartbeat timeout.
    pub fn with_boat_timeout(mut self, secs: u64) -> Self {
        self.boat_timeout_secs = secs;
        self
    }
}
