//! Callback dispatch worker.
//!
//! Notifications to application code are enqueued and executed on a
//! dedicated task, so a slow or failing callback cannot stall event
//! delivery from the transport read loop.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{OutgoingRecord, ScheduleEntry, Spot, WindowPhase};
use crate::protocol::message::normalize_callsign;
use crate::protocol::Message;

/// Notification delivered to registered callbacks.
#[derive(Debug, Clone)]
pub enum Notification {
    /// The rx/tx window crossed a transition
    WindowTransition {
        phase: WindowPhase,
        at: DateTime<Utc>,
    },
    /// A station was heard
    Spot(Spot),
    /// A watched station or group was heard
    StationHeard { watched: String, spot: Spot },
    /// The application reported new inbox contents
    InboxUpdate(Message),
    /// A tracked outgoing transmission changed status
    OutgoingStatus(OutgoingRecord),
    /// A schedule entry was activated
    ScheduleActivated(ScheduleEntry),
    /// The transport connected or disconnected
    ConnectionState { connected: bool },
}

type Callback = Box<dyn Fn(&Notification) + Send + Sync>;

struct Registry {
    callbacks: Vec<Callback>,
    watched: HashSet<String>,
}

/// Queued notification dispatcher.
///
/// Cloneable handle; all clones share one worker task and one registry.
#[derive(Clone)]
pub struct Dispatcher {
    queue: mpsc::UnboundedSender<Notification>,
    registry: Arc<RwLock<Registry>>,
}

impl Dispatcher {
    /// Creates the dispatcher and spawns its worker task.
    pub fn new() -> Dispatcher {
        let (queue, mut rx) = mpsc::unbounded_channel::<Notification>();
        let registry = Arc::new(RwLock::new(Registry {
            callbacks: Vec::new(),
            watched: HashSet::new(),
        }));

        let worker_registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                Self::deliver(&worker_registry, notification);
            }
        });

        Dispatcher { queue, registry }
    }

    fn deliver(registry: &Arc<RwLock<Registry>>, notification: Notification) {
        // expand spot notifications for watched stations before delivery
        let extra = match &notification {
            Notification::Spot(spot) => {
                let guard = registry.read().expect("dispatch registry lock poisoned");
                let mut hits = Vec::new();
                for watched in &guard.watched {
                    let heard = spot.origin.as_deref() == Some(watched.as_str())
                        || spot.destination.as_deref() == Some(watched.as_str());
                    if heard {
                        hits.push(Notification::StationHeard {
                            watched: watched.clone(),
                            spot: spot.clone(),
                        });
                    }
                }
                hits
            }
            _ => Vec::new(),
        };

        let guard = registry.read().expect("dispatch registry lock poisoned");
        for callback in &guard.callbacks {
            callback(&notification);
            for hit in &extra {
                callback(hit);
            }
        }
    }

    /// Registers a callback invoked for every notification.
    pub fn register(&self, callback: impl Fn(&Notification) + Send + Sync + 'static) {
        let mut guard = self.registry.write().expect("dispatch registry lock poisoned");
        guard.callbacks.push(Box::new(callback));
    }

    /// Adds a station or group address to the watch list.
    pub fn watch(&self, station: &str) {
        let mut guard = self.registry.write().expect("dispatch registry lock poisoned");
        guard.watched.insert(normalize_callsign(station));
    }

    /// Removes a station or group address from the watch list.
    pub fn unwatch(&self, station: &str) {
        let mut guard = self.registry.write().expect("dispatch registry lock poisoned");
        guard.watched.remove(&normalize_callsign(station));
    }

    /// Enqueues a notification for asynchronous delivery.
    pub fn notify(&self, notification: Notification) {
        if self.queue.send(notification).is_err() {
            debug!(target: "modemlink::dispatch", "dispatch worker gone, notification dropped");
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn spot_from(origin: &str) -> Spot {
        Spot {
            origin: Some(origin.to_string()),
            destination: Some("@ALLCALL".to_string()),
            offset: Some(1500),
            snr: Some(-3),
            speed: None,
            tdrift: None,
            grid: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_notifications_reach_callbacks() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&count);
        dispatcher.register(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.notify(Notification::ConnectionState { connected: true });
        dispatcher.notify(Notification::Spot(spot_from("KT7RUN")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_watched_station_expansion() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&hits);
        dispatcher.register(move |notification| {
            if let Notification::StationHeard { watched, .. } = notification {
                assert_eq!(watched, "KT7RUN");
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        dispatcher.watch("kt7run");
        dispatcher.notify(Notification::Spot(spot_from("KT7RUN")));
        dispatcher.notify(Notification::Spot(spot_from("N0CALL")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_block_notify() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(|_| {
            std::thread::sleep(Duration::from_millis(100));
        });

        let start = std::time::Instant::now();
        for _ in 0..10 {
            dispatcher.notify(Notification::ConnectionState { connected: false });
        }
        // enqueueing never waits on callback execution
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
