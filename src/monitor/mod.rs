//! Real-time monitors
//!
//! Each monitor is an independent background task reacting to the
//! transport's inbound event stream and its own timer. Monitors share
//! state only through [`crate::core::state`] and the offset monitor's
//! single relocation path.

pub mod heartbeat;
pub mod offset;
pub mod outgoing;
pub mod schedule;
pub mod timesync;
pub mod window;

pub use self::heartbeat::HeartbeatNetwork;
pub use self::offset::OffsetMonitor;
pub use self::outgoing::OutgoingMonitor;
pub use self::schedule::ScheduleMonitor;
pub use self::timesync::{DriftMonitor, TimeMaster};
pub use self::window::WindowMonitor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Pause/resume/enable/disable control shared between a monitor's public
/// handle and its background task.
///
/// Pausing takes effect before the next scheduled action: tasks check
/// `is_paused` at the top of every iteration, never mid-action. Disabling
/// ends the task; waiters observing the enabled flag wake immediately.
#[derive(Clone)]
pub struct Control {
    enabled: watch::Sender<bool>,
    paused: Arc<AtomicBool>,
}

impl Control {
    /// Control in the disabled, unpaused state.
    pub fn new() -> Control {
        let (enabled, _) = watch::channel(false);
        Control {
            enabled,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the monitor enabled. Returns false if it already was, so
    /// callers can avoid spawning a second task.
    pub fn enable(&self) -> bool {
        let was_enabled = *self.enabled.borrow();
        let _ = self.enabled.send(true);
        !was_enabled
    }

    /// Marks the monitor disabled, ending its task before the next action.
    pub fn disable(&self) {
        let _ = self.enabled.send(false);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Receiver for observing enable/disable edges in select loops.
    pub fn enabled_watch(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }
}

impl Default for Control {
    fn default() -> Self {
        Control::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_lifecycle() {
        let control = Control::new();
        assert!(!control.is_enabled());
        assert!(control.enable());
        assert!(!control.enable()); // second enable is a no-op
        assert!(control.is_enabled());

        control.pause();
        assert!(control.is_paused());
        control.resume();
        assert!(!control.is_paused());

        control.disable();
        assert!(!control.is_enabled());
    }

    #[tokio::test]
    async fn test_enabled_watch_wakes_on_disable() {
        let control = Control::new();
        control.enable();
        let mut watch = control.enabled_watch();

        let waiter = tokio::spawn(async move {
            watch.changed().await.unwrap();
            *watch.borrow()
        });

        control.disable();
        assert!(!waiter.await.unwrap());
    }
}
