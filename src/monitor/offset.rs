use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::core::{Error, OffsetConfig, OffsetRecord, Result, Speed, SpotFilter, StateHandle};
use crate::monitor::Control;
use crate::network::transport::{Event, TransportHandle};
use crate::protocol::{Message, MessageKind};

/// Keeps the local transmit offset clear of heard signals.
///
/// Each heard signal occupies a span derived from its offset and speed.
/// When a new record's span intersects the local offset's span, the
/// monitor searches the pass band for the widest contiguous free span and
/// relocates the offset to its center. Failure to find one is an accepted
/// degradation: it is logged here and never raised to callers.
///
/// All relocations, including the heartbeat sub-band excursion, go through
/// this monitor; at most one is in flight at a time.
#[derive(Clone)]
pub struct OffsetMonitor {
    control: Control,
    inner: Arc<Inner>,
}

struct Inner {
    config: OffsetConfig,
    transport: TransportHandle,
    state: StateHandle,
    /// Guards the single relocation path
    relocation: Mutex<()>,
}

impl OffsetMonitor {
    /// Starts the monitor on the given event stream. Enabled immediately.
    pub fn spawn(
        config: OffsetConfig,
        transport: TransportHandle,
        events: broadcast::Receiver<Event>,
    ) -> OffsetMonitor {
        let inner = Arc::new(Inner {
            state: transport.state(),
            config,
            transport,
            relocation: Mutex::new(()),
        });

        let control = Control::new();
        control.enable();

        let monitor = OffsetMonitor {
            control: control.clone(),
            inner,
        };
        tokio::spawn(monitor.clone().event_task(events, control));
        monitor
    }

    /// Monitor control.
    pub fn control(&self) -> &Control {
        &self.control
    }

    async fn event_task(self, mut events: broadcast::Receiver<Event>, control: Control) {
        let mut enabled = control.enabled_watch();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(Event::Rx(inbound)) => {
                        let heard = matches!(
                            inbound.message.kind,
                            MessageKind::RxSpot | MessageKind::RxDirected | MessageKind::RxActivity
                        ) && inbound.message.params.offset.is_some();

                        if heard && !control.is_paused() {
                            self.check_collision().await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target: "modemlink::offset", skipped, "event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = enabled.changed() => {
                    if !control.is_enabled() {
                        return;
                    }
                }
            }
        }
    }

    /// Relocates the local offset if a heard signal collides with it.
    async fn check_collision(&self) {
        let state = self.inner.state.current();

        // do not shift the offset mid-transmission
        if state.tx_in_flight() {
            return;
        }
        let Some(own_offset) = state.offset else { return };
        let Some(dial) = state.dial else { return };
        let own_bandwidth = state.speed.unwrap_or(Speed::Normal).bandwidth();

        let signals = self.recent_signals();
        let config = &self.inner.config;

        let Some(new_offset) = compute_relocation(
            &signals,
            own_offset,
            own_bandwidth,
            (config.min_offset, config.max_offset),
            config.safety_factor,
        ) else {
            return;
        };

        // at most one relocation in flight; a concurrent one wins
        let Ok(_guard) = self.inner.relocation.try_lock() else {
            debug!(target: "modemlink::offset", "relocation already in flight");
            return;
        };

        debug!(target: "modemlink::offset", old = own_offset, new = new_offset, "relocating offset");
        if let Err(error) = self
            .inner
            .transport
            .send(Message::set_offset(dial, new_offset))
            .await
        {
            warn!(target: "modemlink::offset", %error, "offset relocation send failed");
        }
    }

    /// Moves the offset into `band`, used by the heartbeat network for its
    /// reserved sub-band. Returns the chosen offset, or `None` when the
    /// band holds no wide-enough free span.
    pub async fn relocate_into(&self, band: (u32, u32), safety_factor: f64) -> Result<Option<u32>> {
        let state = self.inner.state.current();
        let Some(dial) = state.dial else {
            return Err(Error::invalid_state("dial frequency unknown"));
        };
        let own_bandwidth = state.speed.unwrap_or(Speed::Normal).bandwidth();

        let signals = self.recent_signals();
        let width = required_width(own_bandwidth, safety_factor);
        let spans = free_spans(&signals, band);
        let reference = (band.0 + band.1) / 2;

        let _guard = self.inner.relocation.lock().await;
        match choose_span(&spans, width, reference) {
            Some(span) => {
                let offset = place_in_span(span, own_bandwidth);
                self.inner
                    .transport
                    .send(Message::set_offset(dial, offset))
                    .await?;
                Ok(Some(offset))
            }
            None => {
                warn!(target: "modemlink::offset", ?band, "no free spectrum in sub-band");
                Ok(None)
            }
        }
    }

    /// Restores a previously saved offset through the single relocation
    /// path.
    pub async fn restore(&self, offset: u32) -> Result<()> {
        let state = self.inner.state.current();
        let Some(dial) = state.dial else {
            return Err(Error::invalid_state("dial frequency unknown"));
        };

        let _guard = self.inner.relocation.lock().await;
        self.inner
            .transport
            .send(Message::set_offset(dial, offset))
            .await
    }

    /// Non-expired heard signals, sorted by lower edge. Records older than
    /// the configured age were already filtered out by the spot query.
    fn recent_signals(&self) -> Vec<OffsetRecord> {
        let spots = self.inner.transport.spots().query(&SpotFilter {
            max_age: Some(self.inner.config.heard_max_age),
            ..SpotFilter::default()
        });

        let mut records: Vec<OffsetRecord> = spots
            .iter()
            .filter_map(|spot| {
                let offset = spot.offset?;
                let bandwidth = spot
                    .speed
                    .map(|speed| speed.bandwidth())
                    .unwrap_or(Speed::WORST_CASE_BANDWIDTH);
                Some(OffsetRecord {
                    offset,
                    bandwidth,
                    last_seen: spot.timestamp,
                })
            })
            .collect();
        records.sort_unstable_by_key(|record| record.offset);
        records
    }
}

/// Width a free span must have to host our signal, in Hz.
fn required_width(bandwidth: u32, safety_factor: f64) -> u32 {
    (bandwidth as f64 * safety_factor).ceil() as u32
}

/// Whether two spans intersect.
fn spans_overlap(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

/// Contiguous free spans of the band left uncovered by `records`.
///
/// `records` must be sorted by lower edge.
fn free_spans(records: &[OffsetRecord], band: (u32, u32)) -> Vec<(u32, u32)> {
    let mut spans = Vec::new();
    let mut cursor = band.0;

    for record in records {
        let (low, high) = (record.offset, record.upper());
        if high <= band.0 || low >= band.1 {
            continue;
        }
        let low = low.max(band.0);
        if low > cursor {
            spans.push((cursor, low));
        }
        cursor = cursor.max(high.min(band.1));
    }
    if cursor < band.1 {
        spans.push((cursor, band.1));
    }
    spans
}

/// Picks the widest span at least `min_width` wide; ties go to the span
/// whose center is closest to `reference`, minimizing drift across
/// relocations.
fn choose_span(spans: &[(u32, u32)], min_width: u32, reference: u32) -> Option<(u32, u32)> {
    let mut best: Option<(u32, u32)> = None;

    for &span in spans {
        let width = span.1 - span.0;
        if width < min_width {
            continue;
        }
        best = match best {
            None => Some(span),
            Some(current) => {
                let current_width = current.1 - current.0;
                if width > current_width {
                    Some(span)
                } else if width == current_width {
                    let center = |s: (u32, u32)| (s.0 + s.1) / 2;
                    let distance = |s: (u32, u32)| center(s).abs_diff(reference);
                    if distance(span) < distance(current) {
                        Some(span)
                    } else {
                        Some(current)
                    }
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

/// Centers an occupied bandwidth inside a free span.
fn place_in_span(span: (u32, u32), bandwidth: u32) -> u32 {
    let width = span.1 - span.0;
    span.0 + width.saturating_sub(bandwidth) / 2
}

/// New offset when a heard signal collides with the current one, `None`
/// when there is no collision or no wide-enough free span.
fn compute_relocation(
    records: &[OffsetRecord],
    own_offset: u32,
    own_bandwidth: u32,
    band: (u32, u32),
    safety_factor: f64,
) -> Option<u32> {
    let own_span = (own_offset, own_offset + own_bandwidth);
    let collision = records
        .iter()
        .any(|record| spans_overlap((record.offset, record.upper()), own_span));
    if !collision {
        return None;
    }

    let spans = free_spans(records, band);
    let width = required_width(own_bandwidth, safety_factor);
    match choose_span(&spans, width, own_offset) {
        Some(span) => Some(place_in_span(span, own_bandwidth)),
        None => {
            // accepted degradation: keep the current offset
            warn!(target: "modemlink::offset", "no free spectrum wide enough, keeping offset");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(offset: u32, bandwidth: u32) -> OffsetRecord {
        OffsetRecord {
            offset,
            bandwidth,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_spans_overlap() {
        assert!(spans_overlap((1500, 1550), (1510, 1550)));
        assert!(spans_overlap((1500, 1550), (1450, 1510)));
        assert!(!spans_overlap((1500, 1550), (1550, 1600)));
        assert!(!spans_overlap((1500, 1550), (1400, 1500)));
    }

    #[test]
    fn test_free_spans_gaps_and_edges() {
        let records = [record(1200, 100), record(1250, 150), record(2000, 100)];
        let spans = free_spans(&records, (1000, 2500));
        assert_eq!(spans, vec![(1000, 1200), (1400, 2000), (2100, 2500)]);
    }

    #[test]
    fn test_free_spans_signal_outside_band_ignored() {
        let records = [record(500, 100), record(2600, 100)];
        assert_eq!(free_spans(&records, (1000, 2500)), vec![(1000, 2500)]);
    }

    #[test]
    fn test_free_spans_fully_occupied() {
        let records = [record(900, 1700)];
        assert!(free_spans(&records, (1000, 2500)).is_empty());
    }

    #[test]
    fn test_choose_span_widest_wins() {
        let spans = [(1000, 1200), (1400, 2000)];
        assert_eq!(choose_span(&spans, 63, 1500), Some((1400, 2000)));
    }

    #[test]
    fn test_choose_span_tie_breaks_closest() {
        // equal widths; reference sits nearer the first
        let spans = [(1000, 1200), (2300, 2500)];
        assert_eq!(choose_span(&spans, 100, 1250), Some((1000, 1200)));
        assert_eq!(choose_span(&spans, 100, 2250), Some((2300, 2500)));
    }

    #[test]
    fn test_choose_span_none_wide_enough() {
        let spans = [(1000, 1050)];
        assert_eq!(choose_span(&spans, 63, 1500), None);
    }

    #[test]
    fn test_relocation_on_collision() {
        // own signal at 1500 Hz, 50 Hz wide; new record at 1510 Hz, 40 Hz
        // wide, overlaps it
        let records = [record(1510, 40)];
        let new_offset =
            compute_relocation(&records, 1500, 50, (1000, 2500), 1.25).unwrap();

        assert_ne!(new_offset, 1500);
        // the chosen position must not overlap the heard signal
        let own = (new_offset, new_offset + 50);
        assert!(!spans_overlap(own, (1510, 1550)));
        // widest free span is (1550, 2500), centered placement
        assert_eq!(new_offset, 1550 + (950 - 50) / 2);
    }

    #[test]
    fn test_no_relocation_without_collision() {
        let records = [record(2000, 50)];
        assert_eq!(compute_relocation(&records, 1500, 50, (1000, 2500), 1.25), None);
    }

    #[test]
    fn test_no_relocation_when_band_saturated() {
        let records = [record(1000, 1500)];
        assert_eq!(compute_relocation(&records, 1500, 50, (1000, 2500), 1.25), None);
    }

    #[test]
    fn test_place_in_span_centers_signal() {
        assert_eq!(place_in_span((1000, 1200), 50), 1075);
        // span exactly as wide as the signal
        assert_eq!(place_in_span((1000, 1050), 50), 1000);
    }
}
