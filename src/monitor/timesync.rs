use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::core::settings::SETTING_TIME_DRIFT;
use crate::core::{DriftConfig, DriftSource, SettingsStore, StateHandle, TimeMasterConfig};
use crate::monitor::Control;
use crate::network::transport::{Event, TransportHandle};
use crate::protocol::Message;

/// Smoothed clock-drift estimate against heard stations.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftEstimate {
    /// Smoothed drift in seconds; positive means the network is ahead
    pub drift: Option<f64>,
    /// Which stations feed the estimate
    pub source: DriftSource,
    /// When the estimate last changed
    pub last_update: Option<DateTime<Utc>>,
}

/// Outcome of ingesting one drift sample.
#[derive(Debug, PartialEq)]
enum Ingest {
    /// Sample deviated too far from the estimate and was dropped
    Rejected,
    /// Estimate updated, below the apply threshold
    Updated(f64),
    /// Estimate crossed the threshold; the returned seconds should be
    /// applied to the local drift setting
    Apply(f64),
}

struct Samples {
    window: VecDeque<f64>,
    smoothed: Option<f64>,
    last_update: Option<DateTime<Utc>>,
}

impl Samples {
    fn new() -> Samples {
        Samples {
            window: VecDeque::new(),
            smoothed: None,
            last_update: None,
        }
    }

    /// Folds a sample into the windowed mean, rejecting single-sample
    /// outliers beyond the configured deviation.
    fn ingest(&mut self, sample: f64, config: &DriftConfig, now: DateTime<Utc>) -> Ingest {
        if let Some(current) = self.smoothed {
            if (sample - current).abs() > config.max_deviation {
                return Ingest::Rejected;
            }
        }

        self.window.push_back(sample);
        while self.window.len() > config.window.max(1) {
            self.window.pop_front();
        }

        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        self.smoothed = Some(mean);
        self.last_update = Some(now);

        if mean.abs() >= config.threshold {
            // the local setting absorbs the estimate; start fresh
            self.window.clear();
            self.smoothed = None;
            Ingest::Apply(mean)
        } else {
            Ingest::Updated(mean)
        }
    }
}

/// Estimates clock drift from heard stations and applies it to the shared
/// local-drift setting.
///
/// Consumes any message carrying a drift field whose origin matches the
/// configured source selector. A station never syncs to its own
/// transmissions, which makes the time-master role and self-synchronization
/// mutually exclusive in effect.
#[derive(Clone)]
pub struct DriftMonitor {
    control: Control,
    inner: Arc<DriftInner>,
}

struct DriftInner {
    config: DriftConfig,
    state: StateHandle,
    settings: Arc<dyn SettingsStore>,
    samples: Mutex<Samples>,
}

impl DriftMonitor {
    /// Starts the monitor on the given event stream. Enabled immediately.
    pub fn spawn(
        config: DriftConfig,
        state: StateHandle,
        settings: Arc<dyn SettingsStore>,
        events: broadcast::Receiver<Event>,
    ) -> DriftMonitor {
        let monitor = DriftMonitor {
            control: Control::new(),
            inner: Arc::new(DriftInner {
                config,
                state,
                settings,
                samples: Mutex::new(Samples::new()),
            }),
        };
        monitor.control.enable();
        tokio::spawn(monitor.clone().event_task(events));
        monitor
    }

    /// Monitor control.
    pub fn control(&self) -> &Control {
        &self.control
    }

    /// Current estimate.
    pub fn estimate(&self) -> DriftEstimate {
        let samples = self.inner.samples.lock().expect("drift samples lock poisoned");
        DriftEstimate {
            drift: samples.smoothed,
            source: self.inner.config.source.clone(),
            last_update: samples.last_update,
        }
    }

    /// Applied drift setting in milliseconds.
    pub fn applied_drift_ms(&self) -> i64 {
        self.inner
            .settings
            .get(SETTING_TIME_DRIFT)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Restores the sample window from a snapshot.
    pub fn restore_samples(&self, window: Vec<f64>, last_update: Option<DateTime<Utc>>) {
        let mut samples = self.inner.samples.lock().expect("drift samples lock poisoned");
        samples.smoothed = if window.is_empty() {
            None
        } else {
            Some(window.iter().sum::<f64>() / window.len() as f64)
        };
        samples.window = window.into();
        samples.last_update = last_update;
    }

    /// Sample window for snapshots.
    pub fn sample_window(&self) -> (Vec<f64>, Option<DateTime<Utc>>) {
        let samples = self.inner.samples.lock().expect("drift samples lock poisoned");
        (samples.window.iter().copied().collect(), samples.last_update)
    }

    async fn event_task(self, mut events: broadcast::Receiver<Event>) {
        let mut enabled = self.control.enabled_watch();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(Event::Rx(inbound)) => {
                        if !self.control.is_paused() {
                            self.observe(&inbound.message, inbound.received_at);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target: "modemlink::timesync", skipped, "event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = enabled.changed() => {
                    if !self.control.is_enabled() {
                        return;
                    }
                }
            }
        }
    }

    fn observe(&self, message: &Message, at: DateTime<Utc>) {
        let Some(sample) = message.params.tdrift else { return };

        let origin = message.params.origin.as_deref();
        let destination = message.params.destination.as_deref();
        if !matches_source(&self.inner.config.source, origin, destination) {
            return;
        }

        // never sync to our own transmissions
        let own = self.inner.state.current().callsign;
        if origin.is_some() && origin == own.as_deref() {
            return;
        }

        let outcome = {
            let mut samples = self.inner.samples.lock().expect("drift samples lock poisoned");
            samples.ingest(sample, &self.inner.config, at)
        };

        match outcome {
            Ingest::Rejected => {
                debug!(target: "modemlink::timesync", sample, "rejected drift outlier");
            }
            Ingest::Updated(mean) => {
                debug!(target: "modemlink::timesync", mean, "drift estimate updated");
            }
            Ingest::Apply(mean) => {
                // a station ahead of us needs a negative local adjustment
                let adjust_ms = (mean * 1000.0) as i64;
                let applied = self.applied_drift_ms() - adjust_ms;
                self.inner
                    .settings
                    .set(SETTING_TIME_DRIFT, &applied.to_string());
                info!(target: "modemlink::timesync", mean, applied, "applied drift correction");
            }
        }
    }
}

/// Whether a message's origin/destination matches the source selector.
fn matches_source(source: &DriftSource, origin: Option<&str>, destination: Option<&str>) -> bool {
    match source {
        DriftSource::Group(group) => destination == Some(group.as_str()),
        DriftSource::Station(station) => origin == Some(station.as_str()),
        DriftSource::AnyStation => origin.is_some(),
    }
}

/// Periodically transmits a drift-reference message other stations can
/// sync to.
#[derive(Clone)]
pub struct TimeMaster {
    control: Control,
    inner: Arc<MasterInner>,
}

struct MasterInner {
    config: TimeMasterConfig,
    transport: TransportHandle,
    last_outgoing: Mutex<Option<DateTime<Utc>>>,
}

impl TimeMaster {
    /// Creates the time master in the disabled state.
    pub fn new(config: TimeMasterConfig, transport: TransportHandle) -> TimeMaster {
        TimeMaster {
            control: Control::new(),
            inner: Arc::new(MasterInner {
                config,
                transport,
                last_outgoing: Mutex::new(None),
            }),
        }
    }

    /// Monitor control.
    pub fn control(&self) -> &Control {
        &self.control
    }

    /// Enables periodic drift-reference transmissions.
    pub fn enable(&self) {
        if self.control.enable() {
            tokio::spawn(self.clone().run());
        }
    }

    /// Disables drift-reference transmissions.
    pub fn disable(&self) {
        self.control.disable();
    }

    async fn run(self) {
        let mut enabled = self.control.enabled_watch();

        loop {
            tokio::select! {
                _ = sleep(Duration::from_secs(1)) => {}
                _ = enabled.changed() => {
                    if !self.control.is_enabled() {
                        return;
                    }
                    continue;
                }
            }

            if self.control.is_paused() {
                continue;
            }

            let due = {
                let last = self.inner.last_outgoing.lock().expect("time master lock poisoned");
                match *last {
                    None => true,
                    Some(at) => {
                        Utc::now() - at
                            >= chrono::Duration::from_std(self.inner.config.interval)
                                .unwrap_or_else(|_| chrono::Duration::zero())
                    }
                }
            };
            if !due {
                continue;
            }

            let message =
                Message::directed(&self.inner.config.destination, None, &self.inner.config.text);
            match self.inner.transport.send(message).await {
                Ok(()) => {
                    info!(
                        target: "modemlink::timesync",
                        destination = %self.inner.config.destination,
                        "sent drift reference"
                    );
                    *self.inner.last_outgoing.lock().expect("time master lock poisoned") =
                        Some(Utc::now());
                }
                Err(error) => {
                    debug!(target: "modemlink::timesync", %error, "drift reference send failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DriftConfig {
        DriftConfig {
            source: DriftSource::Group("@TIME".to_string()),
            threshold: 0.5,
            max_deviation: 2.0,
            window: 4,
        }
    }

    #[test]
    fn test_matches_source() {
        let group = DriftSource::Group("@TIME".to_string());
        assert!(matches_source(&group, Some("KT7RUN"), Some("@TIME")));
        assert!(!matches_source(&group, Some("KT7RUN"), Some("@ALLCALL")));

        let station = DriftSource::Station("KT7RUN".to_string());
        assert!(matches_source(&station, Some("KT7RUN"), None));
        assert!(!matches_source(&station, Some("N0CALL"), None));

        assert!(matches_source(&DriftSource::AnyStation, Some("N0CALL"), None));
        assert!(!matches_source(&DriftSource::AnyStation, None, None));
    }

    #[test]
    fn test_smoothing_below_threshold() {
        let mut samples = Samples::new();
        let config = config();
        let now = Utc::now();

        assert_eq!(samples.ingest(0.2, &config, now), Ingest::Updated(0.2));
        match samples.ingest(0.4, &config, now) {
            Ingest::Updated(mean) => assert!((mean - 0.3).abs() < 1e-9),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_outlier_rejected() {
        let mut samples = Samples::new();
        let config = config();
        let now = Utc::now();

        samples.ingest(0.1, &config, now);
        assert_eq!(samples.ingest(5.0, &config, now), Ingest::Rejected);
        // the estimate is unchanged by the outlier
        assert_eq!(samples.smoothed, Some(0.1));
    }

    #[test]
    fn test_threshold_triggers_apply_and_resets() {
        let mut samples = Samples::new();
        let config = config();
        let now = Utc::now();

        match samples.ingest(0.8, &config, now) {
            Ingest::Apply(mean) => assert!((mean - 0.8).abs() < 1e-9),
            other => panic!("unexpected outcome {other:?}"),
        }
        // window restarted after applying
        assert_eq!(samples.smoothed, None);
        assert!(samples.window.is_empty());
    }

    #[test]
    fn test_window_is_bounded() {
        let mut samples = Samples::new();
        let config = DriftConfig {
            threshold: 10.0, // never apply in this test
            ..config()
        };
        let now = Utc::now();

        for sample in [0.1, 0.2, 0.3, 0.4, 0.5] {
            samples.ingest(sample, &config, now);
        }
        assert_eq!(samples.window.len(), 4);
        // oldest sample (0.1) rolled out
        let mean = samples.smoothed.unwrap();
        assert!((mean - 0.35).abs() < 1e-9);
    }
}
