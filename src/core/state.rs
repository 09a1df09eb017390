//! Shared radio state with a single writer.
//!
//! The transport read loop is the only writer of the cached modem state;
//! monitors hold read handles. The offset and window values that monitors
//! coordinate through are read here and changed only via their owning
//! monitor's narrow update path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::types::Speed;

/// Cached modem application state.
///
/// Fields mirror the modem's asynchronous get/set responses. Absent means
/// the application has not reported the value yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RadioState {
    /// Dial frequency in Hz
    pub dial: Option<u64>,
    /// Dial plus offset frequency in Hz
    pub freq: Option<u64>,
    /// Pass-band offset frequency in Hz
    pub offset: Option<u32>,
    /// Modem speed in effect
    pub speed: Option<Speed>,
    /// Local station callsign
    pub callsign: Option<String>,
    /// Local station grid square
    pub grid: Option<String>,
    /// Local station info field
    pub info: Option<String>,
    /// Contents of the transmit text field
    pub tx_text: Option<String>,
    /// Contents of the receive text field
    pub rx_text: Option<String>,
    /// Callsign selected for directed operation, if any
    pub selected_call: Option<String>,
    /// Push-to-talk signal state
    pub ptt: bool,
    /// Whether the socket is currently believed connected
    pub connected: bool,
}

impl RadioState {
    /// Whether a transmission is being composed or sent.
    ///
    /// The tx text field holds the outgoing text for the whole duration of
    /// a send, so non-empty text means the transmit path is claimed.
    pub fn tx_in_flight(&self) -> bool {
        self.tx_text
            .as_deref()
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Write side of the shared state. Held only by the transport.
pub struct StateWriter {
    tx: watch::Sender<RadioState>,
}

/// Read side of the shared state. Cloneable, held by every monitor.
#[derive(Clone)]
pub struct StateHandle {
    rx: watch::Receiver<RadioState>,
}

/// Creates the shared state pair.
pub fn shared_state() -> (StateWriter, StateHandle) {
    let (tx, rx) = watch::channel(RadioState::default());
    (StateWriter { tx }, StateHandle { rx })
}

impl StateWriter {
    /// Applies a mutation and notifies all read handles.
    pub fn update(&self, apply: impl FnOnce(&mut RadioState)) {
        self.tx.send_modify(apply);
    }

    /// Creates a new read handle.
    pub fn subscribe(&self) -> StateHandle {
        StateHandle {
            rx: self.tx.subscribe(),
        }
    }
}

impl StateHandle {
    /// Snapshot of the current state.
    pub fn current(&self) -> RadioState {
        self.rx.borrow().clone()
    }

    /// Waits until the state changes, returning the new snapshot.
    ///
    /// Returns `None` if the writer has been dropped (transport shut down).
    pub async fn changed(&mut self) -> Option<RadioState> {
        match self.rx.changed().await {
            Ok(()) => Some(self.rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }
}

/// A heard-station record kept for monitor queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    /// Origin callsign
    pub origin: Option<String>,
    /// Destination callsign or group address
    pub destination: Option<String>,
    /// Offset frequency in Hz
    pub offset: Option<u32>,
    /// Signal-to-noise ratio in dB
    pub snr: Option<i32>,
    /// Heard modem speed
    pub speed: Option<Speed>,
    /// Reported time drift in seconds
    pub tdrift: Option<f64>,
    /// Grid square
    pub grid: Option<String>,
    /// When the signal was heard
    pub timestamp: DateTime<Utc>,
}

impl Spot {
    /// Age of the spot relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether two spots describe the same station event.
    ///
    /// The application reports one decode through several message types
    /// milliseconds apart; origin plus offset plus snr identifies the event.
    fn same_event(&self, other: &Spot) -> bool {
        self.origin == other.origin && self.offset == other.offset && self.snr == other.snr
    }
}

/// Filter for [`SpotLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SpotFilter {
    /// Maximum age of returned spots
    pub max_age: Option<Duration>,
    /// Restrict to a single origin callsign
    pub origin: Option<String>,
    /// Restrict to a destination callsign or group address
    pub destination: Option<String>,
}

/// Bounded in-memory store of heard-station records.
///
/// Written by the transport read loop, queried by the offset and drift
/// monitors. Duplicate reports of the same station event within a short
/// interval are suppressed.
#[derive(Clone)]
pub struct SpotLog {
    inner: Arc<Mutex<SpotLogInner>>,
}

struct SpotLogInner {
    spots: VecDeque<Spot>,
    max_spots: usize,
}

/// Window within which duplicate reports of one event are suppressed.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(10);

impl SpotLog {
    /// Creates an empty log bounded at `max_spots` entries.
    pub fn new(max_spots: usize) -> Self {
        SpotLog {
            inner: Arc::new(Mutex::new(SpotLogInner {
                spots: VecDeque::new(),
                max_spots,
            })),
        }
    }

    /// Records a heard station, dropping the oldest entry when full.
    pub fn record(&self, spot: Spot) {
        let mut inner = self.inner.lock().expect("spot log lock poisoned");

        let duplicate = inner.spots.iter().rev().any(|existing| {
            existing.same_event(&spot)
                && spot.age(existing.timestamp) < DUPLICATE_WINDOW
                && existing.age(spot.timestamp) < DUPLICATE_WINDOW
        });
        if duplicate {
            return;
        }

        inner.spots.push_back(spot);
        while inner.spots.len() > inner.max_spots {
            inner.spots.pop_front();
        }
    }

    /// Returns spots matching the filter, oldest first.
    pub fn query(&self, filter: &SpotFilter) -> Vec<Spot> {
        let now = Utc::now();
        let inner = self.inner.lock().expect("spot log lock poisoned");

        inner
            .spots
            .iter()
            .filter(|spot| {
                if let Some(max_age) = filter.max_age {
                    if spot.age(now) > max_age {
                        return false;
                    }
                }
                if let Some(origin) = &filter.origin {
                    if spot.origin.as_deref() != Some(origin.as_str()) {
                        return false;
                    }
                }
                if let Some(destination) = &filter.destination {
                    if spot.destination.as_deref() != Some(destination.as_str()) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    /// All stored spots, oldest first. Used for snapshots.
    pub fn all(&self) -> Vec<Spot> {
        let inner = self.inner.lock().expect("spot log lock poisoned");
        inner.spots.iter().cloned().collect()
    }

    /// Replaces the stored spots. Used when resuming after a restart.
    pub fn restore(&self, spots: Vec<Spot>) {
        let mut inner = self.inner.lock().expect("spot log lock poisoned");
        inner.spots = spots.into();
        while inner.spots.len() > inner.max_spots {
            inner.spots.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot(origin: &str, offset: u32, snr: i32, timestamp: DateTime<Utc>) -> Spot {
        Spot {
            origin: Some(origin.to_string()),
            destination: None,
            offset: Some(offset),
            snr: Some(snr),
            speed: Some(Speed::Normal),
            tdrift: None,
            grid: None,
            timestamp,
        }
    }

    #[test]
    fn test_single_writer_updates() {
        let (writer, handle) = shared_state();
        writer.update(|state| state.offset = Some(1500));
        assert_eq!(handle.current().offset, Some(1500));
    }

    #[test]
    fn test_tx_in_flight() {
        let mut state = RadioState::default();
        assert!(!state.tx_in_flight());
        state.tx_text = Some("  ".to_string());
        assert!(!state.tx_in_flight());
        state.tx_text = Some("KT7RUN: @ALLCALL HELLO".to_string());
        assert!(state.tx_in_flight());
    }

    #[test]
    fn test_spot_log_duplicate_suppression() {
        let log = SpotLog::new(100);
        let now = Utc::now();
        log.record(spot("KT7RUN", 1500, -10, now));
        log.record(spot("KT7RUN", 1500, -10, now + chrono::Duration::seconds(2)));
        assert_eq!(log.query(&SpotFilter::default()).len(), 1);

        // same station, different event
        log.record(spot("KT7RUN", 1800, -12, now + chrono::Duration::seconds(3)));
        assert_eq!(log.query(&SpotFilter::default()).len(), 2);
    }

    #[test]
    fn test_spot_log_bounded() {
        let log = SpotLog::new(3);
        let now = Utc::now();
        for i in 0..5 {
            log.record(spot("KT7RUN", 1000 + i * 100, -5, now + chrono::Duration::seconds(i as i64 * 20)));
        }
        let spots = log.query(&SpotFilter::default());
        assert_eq!(spots.len(), 3);
        assert_eq!(spots[0].offset, Some(1200));
    }

    #[test]
    fn test_spot_log_filters() {
        let log = SpotLog::new(100);
        let now = Utc::now();
        let mut group_spot = spot("KT7RUN", 1500, -10, now);
        group_spot.destination = Some("@TIME".to_string());
        log.record(group_spot);
        log.record(spot("N0CALL", 2000, -3, now));

        let by_origin = log.query(&SpotFilter {
            origin: Some("N0CALL".to_string()),
            ..SpotFilter::default()
        });
        assert_eq!(by_origin.len(), 1);

        let by_destination = log.query(&SpotFilter {
            destination: Some("@TIME".to_string()),
            ..SpotFilter::default()
        });
        assert_eq!(by_destination.len(), 1);
        assert_eq!(by_destination[0].origin.as_deref(), Some("KT7RUN"));
    }
}
