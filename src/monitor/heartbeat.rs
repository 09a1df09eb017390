use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::core::settings::SETTING_HEARTBEAT_ACK;
use crate::core::{HeartbeatConfig, RadioState, SettingsStore, Speed, WindowPhase, WindowState};
use crate::monitor::offset::OffsetMonitor;
use crate::monitor::window::WindowMonitor;
use crate::monitor::Control;
use crate::network::transport::TransportHandle;
use crate::protocol::Message;

/// Schedules periodic network-presence transmissions in the reserved
/// heartbeat sub-band.
///
/// A heartbeat fires only when the interval has elapsed, the window
/// monitor reports a known window, no manual target is selected, the
/// modem is not in turbo mode, and no transmission is in flight. Before
/// transmitting, the offset is relocated into the sub-band through the
/// offset monitor's single relocation path and restored afterwards.
#[derive(Clone)]
pub struct HeartbeatNetwork {
    control: Control,
    inner: Arc<Inner>,
}

struct Inner {
    config: HeartbeatConfig,
    transport: TransportHandle,
    window: WindowMonitor,
    offset: OffsetMonitor,
    settings: Arc<dyn SettingsStore>,
    last_outgoing: Mutex<DateTime<Utc>>,
}

/// Cadence of the readiness check
const TICK: Duration = Duration::from_secs(1);

impl HeartbeatNetwork {
    /// Creates the network in the disabled state.
    pub fn new(
        config: HeartbeatConfig,
        transport: TransportHandle,
        window: WindowMonitor,
        offset: OffsetMonitor,
        settings: Arc<dyn SettingsStore>,
    ) -> HeartbeatNetwork {
        HeartbeatNetwork {
            control: Control::new(),
            inner: Arc::new(Inner {
                config,
                transport,
                window,
                offset,
                settings,
                last_outgoing: Mutex::new(Utc::now()),
            }),
        }
    }

    /// Monitor control.
    pub fn control(&self) -> &Control {
        &self.control
    }

    /// Enables periodic heartbeat transmissions.
    pub fn enable(&self) {
        if !self.control.enable() {
            return;
        }

        if self.inner.config.acknowledge {
            // arm the application's own acknowledgement support
            self.inner.settings.set(SETTING_HEARTBEAT_ACK, "true");
        }

        *self.inner.last_outgoing.lock().expect("heartbeat lock poisoned") = Utc::now();
        tokio::spawn(self.clone().run());
    }

    /// Disables heartbeat transmissions.
    pub fn disable(&self) {
        self.control.disable();
    }

    /// When the last heartbeat went out. Used for snapshots.
    pub fn last_outgoing(&self) -> DateTime<Utc> {
        *self.inner.last_outgoing.lock().expect("heartbeat lock poisoned")
    }

    /// Restores the interval timer from a snapshot.
    pub fn restore_last_outgoing(&self, at: DateTime<Utc>) {
        *self.inner.last_outgoing.lock().expect("heartbeat lock poisoned") = at;
    }

    async fn run(self) {
        let mut enabled = self.control.enabled_watch();
        let interval = self.inner.config.effective_interval();

        loop {
            tokio::select! {
                _ = sleep(TICK) => {}
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

            let state = self.inner.transport.state().current();
            let window = self.inner.window.window_state();
            let last = self.last_outgoing();

            // our own outgoing traffic also announces presence
            if state.tx_in_flight() {
                self.restore_last_outgoing(Utc::now());
                continue;
            }

            if !ready_to_fire(&state, &window, last, interval, Utc::now()) {
                continue;
            }

            // line up with the start of a fresh window half
            if self.inner.window.wait_for_transition().await.is_none() {
                return;
            }

            // allow disable and pause as late as possible
            if !self.control.is_enabled() {
                return;
            }
            if self.control.is_paused() {
                continue;
            }
            let state = self.inner.transport.state().current();
            if state.tx_in_flight() || state.selected_call.is_some() {
                continue;
            }

            self.transmit(&state).await;
            self.restore_last_outgoing(Utc::now());
        }
    }

    /// One sub-band excursion: relocate, send, restore.
    async fn transmit(&self, state: &RadioState) {
        let config = &self.inner.config;
        let band = (config.sub_band_min, config.sub_band_max);
        let prior_offset = state.offset;

        let chosen = match self
            .inner
            .offset
            .relocate_into(band, config.safety_factor)
            .await
        {
            Ok(Some(offset)) => Some(offset),
            Ok(None) => {
                // no free span and no activity knowledge: pre-set a random
                // sub-band offset through the same relocation path
                let bandwidth = state.speed.unwrap_or(Speed::Normal).bandwidth();
                let upper = band.1.saturating_sub(bandwidth).max(band.0 + 1);
                let offset = rand::thread_rng().gen_range(band.0..upper);
                match self.inner.offset.restore(offset).await {
                    Ok(()) => Some(offset),
                    Err(error) => {
                        warn!(target: "modemlink::heartbeat", %error, "sub-band fallback failed");
                        None
                    }
                }
            }
            Err(error) => {
                warn!(target: "modemlink::heartbeat", %error, "sub-band relocation failed");
                None
            }
        };

        info!(target: "modemlink::heartbeat", offset = ?chosen, "sending heartbeat");
        if let Err(error) = self
            .inner
            .transport
            .send(Message::heartbeat(state.grid.as_deref()))
            .await
        {
            warn!(target: "modemlink::heartbeat", %error, "heartbeat send failed");
        }

        // let the transmit cycle complete before touching the offset again
        for _ in 0..2 {
            if self.inner.window.wait_for_transition().await.is_none() {
                break;
            }
        }

        if let Some(prior) = prior_offset {
            debug!(target: "modemlink::heartbeat", offset = prior, "restoring offset");
            if let Err(error) = self.inner.offset.restore(prior).await {
                warn!(target: "modemlink::heartbeat", %error, "offset restore failed");
            }
        }
    }
}

/// The firing predicate, factored out for testability.
///
/// A heartbeat may fire when the interval has elapsed, the window phase is
/// known, no manual target is selected, and the modem is not in turbo
/// mode.
fn ready_to_fire(
    state: &RadioState,
    window: &WindowState,
    last_outgoing: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> bool {
    let due = now - last_outgoing >= chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());

    due && window.phase != WindowPhase::Unknown
        && window.next_transition.is_some()
        && state.selected_call.is_none()
        && state.speed != Some(Speed::Turbo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known_window() -> WindowState {
        WindowState {
            phase: WindowPhase::Receiving,
            next_transition: Some(Utc::now() + chrono::Duration::seconds(5)),
            speed: Speed::Normal,
        }
    }

    fn idle_state() -> RadioState {
        RadioState {
            speed: Some(Speed::Normal),
            offset: Some(1500),
            dial: Some(7_078_000),
            connected: true,
            ..RadioState::default()
        }
    }

    #[test]
    fn test_fires_when_due_and_safe() {
        let last = Utc::now() - chrono::Duration::seconds(700);
        assert!(ready_to_fire(
            &idle_state(),
            &known_window(),
            last,
            Duration::from_secs(600),
            Utc::now(),
        ));
    }

    #[test]
    fn test_never_fires_with_unknown_window() {
        let last = Utc::now() - chrono::Duration::seconds(700);
        let window = WindowState::unknown(Speed::Normal);
        assert!(!ready_to_fire(
            &idle_state(),
            &window,
            last,
            Duration::from_secs(600),
            Utc::now(),
        ));
    }

    #[test]
    fn test_never_fires_with_manual_target_selected() {
        let last = Utc::now() - chrono::Duration::seconds(700);
        let state = RadioState {
            selected_call: Some("N0CALL".to_string()),
            ..idle_state()
        };
        assert!(!ready_to_fire(
            &state,
            &known_window(),
            last,
            Duration::from_secs(600),
            Utc::now(),
        ));
    }

    #[test]
    fn test_never_fires_in_turbo_mode() {
        let last = Utc::now() - chrono::Duration::seconds(700);
        let state = RadioState {
            speed: Some(Speed::Turbo),
            ..idle_state()
        };
        assert!(!ready_to_fire(
            &state,
            &known_window(),
            last,
            Duration::from_secs(600),
            Utc::now(),
        ));
    }

    #[test]
    fn test_does_not_fire_before_interval() {
        let last = Utc::now() - chrono::Duration::seconds(30);
        assert!(!ready_to_fire(
            &idle_state(),
            &known_window(),
            last,
            Duration::from_secs(600),
            Utc::now(),
        ));
    }
}
