use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Modem speed setting.
///
/// The speed fixes both the half-duplex window duration and the occupied
/// signal bandwidth. Neither is discoverable from any single protocol
/// message, so both are baked in here as the modem's fixed contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Slow,
    Normal,
    Fast,
    Turbo,
}

impl Speed {
    /// Duration of one rx or tx window half-cycle
    pub fn window_duration(&self) -> Duration {
        match self {
            Speed::Slow => Duration::from_secs(30),
            Speed::Normal => Duration::from_secs(15),
            Speed::Fast => Duration::from_secs(10),
            Speed::Turbo => Duration::from_secs(6),
        }
    }

    /// Occupied signal bandwidth in Hz
    pub fn bandwidth(&self) -> u32 {
        match self {
            Speed::Slow => 25,
            Speed::Normal => 50,
            Speed::Fast => 80,
            Speed::Turbo => 160,
        }
    }

    /// Worst-case bandwidth assumed for a heard signal of unknown speed
    pub const WORST_CASE_BANDWIDTH: u32 = 160;

    /// Submode code used on the wire
    pub fn submode(&self) -> u32 {
        match self {
            Speed::Normal => 0,
            Speed::Fast => 1,
            Speed::Turbo => 2,
            Speed::Slow => 4,
        }
    }

    /// Parses a wire submode code
    pub fn from_submode(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Speed::Normal),
            1 => Ok(Speed::Fast),
            2 => Ok(Speed::Turbo),
            4 => Ok(Speed::Slow),
            other => Err(Error::invalid_state(format!("unknown submode code {other}"))),
        }
    }

    /// Parses a speed name ("slow", "normal", "fast", "turbo")
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "slow" => Ok(Speed::Slow),
            "normal" => Ok(Speed::Normal),
            "fast" => Ok(Speed::Fast),
            "turbo" => Ok(Speed::Turbo),
            other => Err(Error::config(format!("unknown speed '{other}'"))),
        }
    }

    /// Speed name as used in configuration
    pub fn name(&self) -> &'static str {
        match self {
            Speed::Slow => "slow",
            Speed::Normal => "normal",
            Speed::Fast => "fast",
            Speed::Turbo => "turbo",
        }
    }
}

/// Current half of the rx/tx window cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowPhase {
    /// No evidence observed yet, or evidence went stale
    Unknown,
    Receiving,
    Transmitting,
}

impl WindowPhase {
    /// The opposite half. `Unknown` has no opposite.
    pub fn flipped(&self) -> WindowPhase {
        match self {
            WindowPhase::Unknown => WindowPhase::Unknown,
            WindowPhase::Receiving => WindowPhase::Transmitting,
            WindowPhase::Transmitting => WindowPhase::Receiving,
        }
    }
}

/// Derived rx/tx window estimate. Recomputed on every qualifying event,
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowState {
    /// Current half of the cycle
    pub phase: WindowPhase,
    /// Predicted end of the current half
    pub next_transition: Option<DateTime<Utc>>,
    /// Modem speed the estimate is based on
    pub speed: Speed,
}

impl WindowState {
    /// State with no evidence observed
    pub fn unknown(speed: Speed) -> Self {
        WindowState {
            phase: WindowPhase::Unknown,
            next_transition: None,
            speed,
        }
    }
}

/// A heard signal's position in the pass band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetRecord {
    /// Offset frequency in Hz (lower edge of the signal)
    pub offset: u32,
    /// Occupied bandwidth in Hz, derived from the heard speed
    pub bandwidth: u32,
    /// When the signal was last heard
    pub last_seen: DateTime<Utc>,
}

impl OffsetRecord {
    /// Upper edge of the occupied span in Hz
    pub fn upper(&self) -> u32 {
        self.offset + self.bandwidth
    }
}

/// Transport connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Modem application TCP address
    pub host: String,
    /// Modem application TCP port
    pub port: u16,
    /// Upper bound on the initial connect wait; the external application
    /// can take a long time to start on constrained platforms
    pub connect_timeout: Duration,
    /// Interval between periodic local-state refresh requests
    pub refresh_interval: Duration,
    /// Connectivity is declared lost after this long without inbound traffic
    pub inactivity_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: "127.0.0.1".to_string(),
            port: super::DEFAULT_PORT,
            connect_timeout: Duration::from_secs(120),
            refresh_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(300),
        }
    }
}

/// Offset monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetConfig {
    /// Lower edge of the pass band searched for a free span, in Hz
    pub min_offset: u32,
    /// Upper edge of the pass band searched for a free span, in Hz
    pub max_offset: u32,
    /// Safety factor applied to the local bandwidth when judging span width
    pub safety_factor: f64,
    /// Heard signals older than this are pruned before each search
    pub heard_max_age: Duration,
}

impl Default for OffsetConfig {
    fn default() -> Self {
        OffsetConfig {
            min_offset: 1000,
            max_offset: 2500,
            safety_factor: 1.25,
            heard_max_age: Duration::from_secs(100),
        }
    }
}

/// Heartbeat network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between presence transmissions; clamped to at least
    /// [`HeartbeatConfig::MIN_INTERVAL`] to avoid band saturation
    pub interval: Duration,
    /// Lower edge of the reserved heartbeat sub-band in Hz
    pub sub_band_min: u32,
    /// Upper edge of the reserved heartbeat sub-band in Hz
    pub sub_band_max: u32,
    /// Safety factor for sub-band span searches
    pub safety_factor: f64,
    /// Arm the external application's acknowledgement support
    pub acknowledge: bool,
}

impl HeartbeatConfig {
    /// Minimum allowed heartbeat interval
    pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

    /// Interval with the minimum bound applied
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(Self::MIN_INTERVAL)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval: Duration::from_secs(600),
            sub_band_min: 500,
            sub_band_max: 1000,
            safety_factor: 1.1,
            acknowledge: false,
        }
    }
}

/// Source of time drift samples
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriftSource {
    /// Stations addressing a group (ex. "@TIME")
    Group(String),
    /// A single station callsign
    Station(String),
    /// Any recently heard station
    AnyStation,
}

impl Default for DriftSource {
    fn default() -> Self {
        DriftSource::Group("@TIME".to_string())
    }
}

/// Drift monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Which stations' reported drift is consumed
    pub source: DriftSource,
    /// Estimate magnitude that must be exceeded before the local drift
    /// setting is updated, in seconds
    pub threshold: f64,
    /// Samples deviating more than this from the current estimate are
    /// rejected as outliers, in seconds
    pub max_deviation: f64,
    /// Number of samples in the smoothing window
    pub window: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        DriftConfig {
            source: DriftSource::default(),
            threshold: 0.5,
            max_deviation: 2.0,
            window: 10,
        }
    }
}

/// Time master settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeMasterConfig {
    /// Destination of drift-reference transmissions
    pub destination: String,
    /// Text of drift-reference transmissions
    pub text: String,
    /// Interval between drift-reference transmissions
    pub interval: Duration,
}

impl Default for TimeMasterConfig {
    fn default() -> Self {
        TimeMasterConfig {
            destination: "@TIME".to_string(),
            text: "SYNC".to_string(),
            interval: Duration::from_secs(600),
        }
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub offset: OffsetConfig,
    pub heartbeat: HeartbeatConfig,
    pub drift: DriftConfig,
    pub time_master: TimeMasterConfig,
}

/// Lifecycle status of a submitted transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingStatus {
    /// Accepted for transmission, not yet in the transmit text field
    Queued,
    /// Text observed in the transmit text field
    Sending,
    /// Text left the transmit text field after sending
    Complete,
    /// Never observed sent within the allowed number of window cycles
    Failed,
}

/// A submitted transmission tracked through its lifecycle.
///
/// Owned exclusively by the outgoing monitor once submitted; observers
/// receive clones through status-change notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingRecord {
    /// Locally generated id; the modem assigns none of its own
    pub id: String,
    /// Destination callsign or group address
    pub destination: String,
    /// Directed text as composed for the transmit text field
    pub text: String,
    /// Current lifecycle status
    pub status: OutgoingStatus,
    /// When the record was submitted
    pub submitted_at: DateTime<Utc>,
    /// When the text was first observed sending
    pub sending_at: Option<DateTime<Utc>>,
    /// When the record reached `Complete` or `Failed`
    pub finished_at: Option<DateTime<Utc>>,
}

/// A configuration change armed for a wall-clock time.
///
/// Immutable once created; add/remove are the only mutations. An entry
/// whose start time already passed when the schedule is (re)enabled waits
/// for its next natural occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Trigger time of day (local)
    pub start: chrono::NaiveTime,
    /// Dial frequency to apply in Hz, if any
    pub freq: Option<u64>,
    /// Modem speed to apply, if any
    pub speed: Option<Speed>,
    /// Configuration profile to activate, if any
    pub profile: Option<String>,
}

impl ScheduleEntry {
    /// Whether activating this entry after `previous` requires restarting
    /// the external application. Profile and speed changes are only read
    /// from the configuration file at startup; frequency changes apply live.
    pub fn restart_required(&self, previous: Option<&ScheduleEntry>) -> bool {
        match previous {
            None => true,
            Some(previous) => {
                self.profile != previous.profile || self.speed != previous.speed
            }
        }
    }
}
