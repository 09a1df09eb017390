use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::debug;

use crate::core::{Speed, StateHandle, WindowPhase, WindowState};
use crate::monitor::Control;
use crate::network::dispatch::{Dispatcher, Notification};
use crate::network::transport::Event;
use crate::protocol::MessageKind;

/// Tracks the modem's rx/tx window cycle.
///
/// The modem emits no explicit window clock, so the boundary is derived
/// from whichever evidence arrives first: a transmit frame or PTT signal
/// (start of a transmit half) or an incoming decode (delivered about one
/// second before the end of a half). Both kinds refine the estimate. The
/// half-cycle duration comes from the active modem speed's fixed table.
///
/// With no evidence yet, or evidence gone stale, the phase is `Unknown`
/// and consumers must not assume a safe window.
#[derive(Clone)]
pub struct WindowMonitor {
    control: Control,
    shared: Arc<Shared>,
}

struct Shared {
    estimate: Mutex<Estimate>,
    /// Bumped once per predicted transition so waiters wake without polling
    transitions: watch::Sender<u64>,
    state: StateHandle,
    dispatcher: Dispatcher,
}

struct Estimate {
    phase: WindowPhase,
    next_transition: Option<DateTime<Utc>>,
    duration: Duration,
    last_evidence: Option<DateTime<Utc>>,
    last_rx_evidence: Option<DateTime<Utc>>,
}

/// Decodes arrive about this long before the end of the window half
const DECODE_LEAD: Duration = Duration::from_secs(1);
/// Poll cadence while no boundary estimate exists yet
const IDLE_POLL: Duration = Duration::from_millis(500);

impl WindowMonitor {
    /// Starts the monitor on the given event stream.
    pub fn spawn(
        events: broadcast::Receiver<Event>,
        state: StateHandle,
        dispatcher: Dispatcher,
    ) -> WindowMonitor {
        let speed = state.current().speed.unwrap_or(Speed::Normal);
        let (transitions, _) = watch::channel(0u64);

        let shared = Arc::new(Shared {
            estimate: Mutex::new(Estimate {
                phase: WindowPhase::Unknown,
                next_transition: None,
                duration: speed.window_duration(),
                last_evidence: None,
                last_rx_evidence: None,
            }),
            transitions,
            state,
            dispatcher,
        });

        let control = Control::new();
        control.enable();

        tokio::spawn(event_task(
            Arc::clone(&shared),
            events,
            control.clone(),
        ));
        tokio::spawn(timer_task(Arc::clone(&shared), control.clone()));

        WindowMonitor { control, shared }
    }

    /// Monitor control (pause suppresses transition notifications).
    pub fn control(&self) -> &Control {
        &self.control
    }

    /// Current window estimate.
    pub fn window_state(&self) -> WindowState {
        let estimate = self.shared.estimate.lock().expect("window estimate lock poisoned");
        WindowState {
            phase: estimate.phase,
            next_transition: estimate.next_transition,
            speed: self.shared.state.current().speed.unwrap_or(Speed::Normal),
        }
    }

    /// Predicted timestamp of the `cycles`-th next transition.
    ///
    /// Returns `default` while no evidence has been observed. `cycles`
    /// counts boundaries: 1 is the next one.
    pub fn next_transition(
        &self,
        cycles: u32,
        default: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let estimate = self.shared.estimate.lock().expect("window estimate lock poisoned");
        match estimate.next_transition {
            None => default,
            Some(next) => {
                let ahead = estimate.duration * cycles.saturating_sub(1);
                Some(next + chrono::Duration::from_std(ahead).unwrap_or_else(|_| chrono::Duration::zero()))
            }
        }
    }

    /// Suspends until the next window transition.
    ///
    /// Returns the post-transition state, or `None` if the monitor was
    /// disabled while waiting. Never busy-polls: wakes on the monitor's
    /// own transition signal.
    pub async fn wait_for_transition(&self) -> Option<WindowState> {
        let mut transitions = self.shared.transitions.subscribe();
        let mut enabled = self.control.enabled_watch();

        loop {
            tokio::select! {
                changed = transitions.changed() => {
                    return match changed {
                        Ok(()) => Some(self.window_state()),
                        Err(_) => None,
                    };
                }
                _ = enabled.changed() => {
                    if !*enabled.borrow() {
                        return None;
                    }
                }
            }
        }
    }
}

async fn event_task(shared: Arc<Shared>, mut events: broadcast::Receiver<Event>, control: Control) {
    let mut enabled = control.enabled_watch();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(Event::Rx(inbound)) => {
                    if !control.is_paused() {
                        observe(&shared, inbound.message.kind.clone(), inbound.message.value.as_deref(), inbound.received_at);
                    }
                }
                // estimates are kept best-effort through an outage
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(target: "modemlink::window", skipped, "event stream lagged");
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

/// Applies one piece of evidence to the estimate.
fn observe(shared: &Shared, kind: MessageKind, value: Option<&str>, at: DateTime<Utc>) {
    let speed = shared.state.current().speed.unwrap_or(Speed::Normal);
    let mut estimate = shared.estimate.lock().expect("window estimate lock poisoned");
    estimate.duration = speed.window_duration();
    let duration = chrono::Duration::from_std(estimate.duration).unwrap_or_else(|_| chrono::Duration::zero());

    match kind {
        MessageKind::TxFrame => {
            // a tx frame opens the transmit half; boundary is one duration out
            estimate.phase = WindowPhase::Transmitting;
            estimate.next_transition = Some(at + duration);
            estimate.last_evidence = Some(at);
        }
        MessageKind::RigPtt => {
            estimate.phase = if value == Some("on") {
                WindowPhase::Transmitting
            } else {
                WindowPhase::Receiving
            };
            if estimate.next_transition.is_none() {
                estimate.next_transition = Some(at + duration);
            }
            estimate.last_evidence = Some(at);
        }
        MessageKind::RxDirected | MessageKind::RxActivity => {
            // only the first decode per half-cycle refines the boundary
            let fresh = match estimate.last_rx_evidence {
                None => true,
                Some(last) => at - last > duration / 2,
            };
            if fresh {
                estimate.last_rx_evidence = Some(at);
                estimate.last_evidence = Some(at);
                estimate.phase = WindowPhase::Receiving;

                // decodes land about one second before the boundary
                let candidate = at + chrono::Duration::from_std(DECODE_LEAD).unwrap_or_else(|_| chrono::Duration::zero());
                estimate.next_transition = Some(match estimate.next_transition {
                    None => candidate,
                    // same boundary: refine forward only; a later boundary resets
                    Some(next) if candidate > next + duration / 2 => candidate,
                    Some(next) => next.max(candidate),
                });
            }
        }
        _ => {}
    }
}

async fn timer_task(shared: Arc<Shared>, control: Control) {
    let mut enabled = control.enabled_watch();

    loop {
        let target = {
            let estimate = shared.estimate.lock().expect("window estimate lock poisoned");
            estimate.next_transition
        };

        let wait = match target {
            None => IDLE_POLL,
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        };

        tokio::select! {
            _ = sleep(wait) => {}
            _ = enabled.changed() => {
                if !control.is_enabled() {
                    return;
                }
                continue;
            }
        }

        let Some(predicted) = target else { continue };
        if Utc::now() < predicted {
            continue;
        }

        let speed = shared.state.current().speed.unwrap_or(Speed::Normal);
        let phase = {
            let mut estimate = shared.estimate.lock().expect("window estimate lock poisoned");

            // evidence may have moved the boundary while we slept
            if estimate.next_transition != Some(predicted) {
                continue;
            }

            // update duration in case the speed setting changed
            estimate.duration = speed.window_duration();
            let duration = chrono::Duration::from_std(estimate.duration).unwrap_or_else(|_| chrono::Duration::zero());

            // stale evidence degrades to Unknown rather than asserting a half
            let full_cycle = duration * 2;
            let stale = match estimate.last_evidence {
                None => true,
                Some(evidence) => Utc::now() - evidence > full_cycle * 2,
            };
            estimate.phase = if stale {
                WindowPhase::Unknown
            } else {
                estimate.phase.flipped()
            };
            estimate.next_transition = Some(predicted + duration);
            estimate.phase
        };

        shared.transitions.send_modify(|count| *count += 1);
        if !control.is_paused() {
            shared.dispatcher.notify(Notification::WindowTransition {
                phase,
                at: predicted,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared_state;
    use crate::network::transport::Inbound;
    use crate::protocol::Message;

    fn rx_event(kind: MessageKind, at: DateTime<Utc>) -> Event {
        Event::Rx(Arc::new(Inbound {
            message: Message::of_kind(kind),
            received_at: at,
        }))
    }

    fn monitor_with_speed(speed: Speed) -> (WindowMonitor, broadcast::Sender<Event>) {
        let (writer, handle) = shared_state();
        writer.update(|state| state.speed = Some(speed));

        let (events, events_rx) = broadcast::channel(64);
        let monitor = WindowMonitor::spawn(events_rx, handle, Dispatcher::new());
        (monitor, events)
    }

    #[tokio::test]
    async fn test_no_evidence_returns_default() {
        let (monitor, _events) = monitor_with_speed(Speed::Normal);
        assert_eq!(monitor.window_state().phase, WindowPhase::Unknown);
        assert_eq!(monitor.next_transition(1, None), None);

        let fallback = Utc::now();
        assert_eq!(monitor.next_transition(1, Some(fallback)), Some(fallback));
    }

    #[tokio::test]
    async fn test_tx_frame_fixes_boundary() {
        let (monitor, events) = monitor_with_speed(Speed::Normal);
        let start = Utc::now();
        events.send(rx_event(MessageKind::TxFrame, start)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // at t=+5 the predicted boundary is still start + 15s
        let predicted = monitor.next_transition(1, None).unwrap();
        let expected = start + chrono::Duration::seconds(15);
        assert!((predicted - expected).num_milliseconds().abs() < 100);
        assert_eq!(monitor.window_state().phase, WindowPhase::Transmitting);

        // one extra cycle is one duration further out
        let second = monitor.next_transition(2, None).unwrap();
        assert_eq!((second - predicted).num_seconds(), 15);
    }

    #[tokio::test]
    async fn test_decode_refinement_is_monotonic() {
        let (monitor, events) = monitor_with_speed(Speed::Normal);
        let start = Utc::now();

        events.send(rx_event(MessageKind::RxDirected, start)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = monitor.next_transition(1, None).unwrap();

        // a second decode in the same half-cycle must not move the
        // boundary backwards
        events
            .send(rx_event(MessageKind::RxActivity, start + chrono::Duration::milliseconds(200)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = monitor.next_transition(1, None).unwrap();
        assert!(second >= first);
        assert_eq!(monitor.window_state().phase, WindowPhase::Receiving);
    }

    #[tokio::test]
    async fn test_transition_fires_and_flips_phase() {
        let (monitor, events) = monitor_with_speed(Speed::Normal);

        // place the boundary almost immediately
        let at = Utc::now() - chrono::Duration::milliseconds(900);
        events.send(rx_event(MessageKind::RxDirected, at)).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(2), monitor.wait_for_transition())
            .await
            .expect("transition did not fire")
            .expect("monitor disabled");

        assert_eq!(state.phase, WindowPhase::Transmitting);
        // boundary advanced by one duration
        assert!(state.next_transition.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_wait_cancelled_by_disable() {
        let (monitor, _events) = monitor_with_speed(Speed::Normal);
        let control = monitor.control().clone();

        let waited = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            control.disable();
        });

        assert!(monitor.wait_for_transition().await.is_none());
        waited.await.unwrap();
    }
}
