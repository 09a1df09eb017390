use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::core::settings::{SETTING_PROFILE, SETTING_SPEED};
use crate::core::{ScheduleEntry, SettingsStore};
use crate::monitor::Control;
use crate::network::dispatch::{Dispatcher, Notification};
use crate::network::transport::TransportHandle;
use crate::protocol::Message;

/// Fires configuration changes at wall-clock times.
///
/// Firing is edge-triggered on the trigger time crossing, evaluated once
/// per minute. An entry whose trigger time already passed when the
/// schedule is (re)enabled is skipped until its next natural occurrence;
/// run flags reset at midnight rollover.
#[derive(Clone)]
pub struct ScheduleMonitor {
    control: Control,
    inner: Arc<Inner>,
}

struct Inner {
    transport: TransportHandle,
    settings: Arc<dyn SettingsStore>,
    dispatcher: Dispatcher,
    entries: Mutex<Entries>,
}

/// Entry plus its once-per-day bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryState {
    pub entry: ScheduleEntry,
    /// Already fired in the current day
    pub run: bool,
}

struct Entries {
    states: Vec<EntryState>,
    active: Option<ScheduleEntry>,
    last_tick: NaiveTime,
}

impl ScheduleMonitor {
    /// Creates the monitor in the disabled state.
    pub fn new(
        transport: TransportHandle,
        settings: Arc<dyn SettingsStore>,
        dispatcher: Dispatcher,
    ) -> ScheduleMonitor {
        ScheduleMonitor {
            control: Control::new(),
            inner: Arc::new(Inner {
                transport,
                settings,
                dispatcher,
                entries: Mutex::new(Entries {
                    states: Vec::new(),
                    active: None,
                    last_tick: now_local(),
                }),
            }),
        }
    }

    /// Monitor control.
    pub fn control(&self) -> &Control {
        &self.control
    }

    /// Adds an entry; duplicates are ignored.
    pub fn add(&self, entry: ScheduleEntry) {
        let mut entries = self.inner.entries.lock().expect("schedule lock poisoned");
        if entries.states.iter().any(|state| state.entry == entry) {
            return;
        }
        entries.states.push(EntryState { entry, run: false });
        entries.states.sort_by_key(|state| state.entry.start);
    }

    /// Removes all entries with the given trigger time.
    pub fn remove(&self, start: NaiveTime) {
        let mut entries = self.inner.entries.lock().expect("schedule lock poisoned");
        entries.states.retain(|state| state.entry.start != start);
    }

    /// All entries in trigger-time order.
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        let entries = self.inner.entries.lock().expect("schedule lock poisoned");
        entries.states.iter().map(|state| state.entry.clone()).collect()
    }

    /// Entry states for snapshots.
    pub fn snapshot_entries(&self) -> Vec<EntryState> {
        let entries = self.inner.entries.lock().expect("schedule lock poisoned");
        entries.states.clone()
    }

    /// Restores entry states from a snapshot.
    pub fn restore(&self, states: Vec<EntryState>) {
        let mut entries = self.inner.entries.lock().expect("schedule lock poisoned");
        entries.states = states;
        entries.states.sort_by_key(|state| state.entry.start);
    }

    /// Enables schedule evaluation.
    ///
    /// Entries already past due today are marked run so they wait for
    /// their next natural occurrence.
    pub fn enable(&self) {
        if !self.control.enable() {
            return;
        }

        {
            let mut entries = self.inner.entries.lock().expect("schedule lock poisoned");
            let now = now_local();
            mark_past_due(&mut entries.states, now);
            entries.last_tick = now;
        }

        tokio::spawn(self.clone().run());
    }

    /// Disables schedule evaluation.
    pub fn disable(&self) {
        self.control.disable();
    }

    async fn run(self) {
        let mut enabled = self.control.enabled_watch();

        loop {
            // wake one second after the next minute rollover
            let second = now_local().second();
            let wait = Duration::from_secs(u64::from(61 - second.min(60)));

            tokio::select! {
                _ = sleep(wait) => {}
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
                let mut entries = self.inner.entries.lock().expect("schedule lock poisoned");
                let now = now_local();
                let last = entries.last_tick;
                entries.last_tick = now;
                collect_due(&mut entries.states, last, now)
            };

            for entry in due {
                self.activate(entry).await;
            }
        }
    }

    /// Applies one entry's configuration changes.
    async fn activate(&self, entry: ScheduleEntry) {
        let previous = {
            let mut entries = self.inner.entries.lock().expect("schedule lock poisoned");
            let previous = entries.active.clone();
            entries.active = Some(entry.clone());
            previous
        };

        info!(target: "modemlink::schedule", start = %entry.start, "activating schedule entry");

        if let Some(profile) = &entry.profile {
            self.inner.settings.set(SETTING_PROFILE, profile);
        }
        if let Some(speed) = entry.speed {
            self.inner.settings.set(SETTING_SPEED, speed.name());
            if let Err(error) = self.inner.transport.send(Message::set_speed(speed)).await {
                warn!(target: "modemlink::schedule", %error, "speed change send failed");
            }
        }
        if let Some(freq) = entry.freq {
            let offset = self
                .inner
                .transport
                .state()
                .current()
                .offset
                .unwrap_or(1500);
            if let Err(error) = self
                .inner
                .transport
                .send(Message::set_offset(freq, offset))
                .await
            {
                warn!(target: "modemlink::schedule", %error, "frequency change send failed");
            }
        }

        if entry.restart_required(previous.as_ref()) {
            // profile and speed settings are read at startup; the process
            // lifecycle collaborator performs the actual restart
            info!(target: "modemlink::schedule", "entry requires application restart");
        }

        self.inner
            .dispatcher
            .notify(Notification::ScheduleActivated(entry));
    }
}

/// Local wall-clock time of day.
fn now_local() -> NaiveTime {
    chrono::Local::now().time()
}

/// Marks entries whose trigger already passed today as run, so a
/// (re)enable never fires them immediately.
fn mark_past_due(states: &mut [EntryState], now: NaiveTime) {
    for state in states {
        if state.entry.start <= now {
            state.run = true;
        }
    }
}

/// One evaluation tick: resets run flags across midnight and returns the
/// entries whose trigger time was crossed, marking them run.
fn collect_due(states: &mut [EntryState], last: NaiveTime, now: NaiveTime) -> Vec<ScheduleEntry> {
    // time rolled over at midnight (23:59 -> 00:00)
    if last > now {
        for state in states.iter_mut() {
            state.run = false;
        }
    }

    let mut due = Vec::new();
    for state in states.iter_mut() {
        if !state.run && state.entry.start <= now {
            state.run = true;
            due.push(state.entry.clone());
        }
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Speed;

    fn entry(start: NaiveTime) -> EntryState {
        EntryState {
            entry: ScheduleEntry {
                start,
                freq: Some(7_078_000),
                speed: Some(Speed::Normal),
                profile: None,
            },
            run: false,
        }
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_past_due_entry_skipped_on_enable() {
        let mut states = vec![entry(time(8, 0)), entry(time(20, 0))];
        mark_past_due(&mut states, time(12, 0));

        assert!(states[0].run, "past entry must wait for next occurrence");
        assert!(!states[1].run, "future entry stays armed");

        // the past-due entry does not fire on the next tick
        let due = collect_due(&mut states, time(12, 0), time(12, 1));
        assert!(due.is_empty());
    }

    #[test]
    fn test_entry_fires_on_crossing() {
        let mut states = vec![entry(time(12, 30))];

        let due = collect_due(&mut states, time(12, 29), time(12, 30));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].start, time(12, 30));

        // edge-triggered: does not fire again
        let due = collect_due(&mut states, time(12, 30), time(12, 31));
        assert!(due.is_empty());
    }

    #[test]
    fn test_midnight_rollover_rearms() {
        let mut states = vec![entry(time(8, 0))];
        states[0].run = true;

        // crossing midnight resets, then the entry fires at its time
        let due = collect_due(&mut states, time(23, 59), time(0, 0));
        assert!(due.is_empty());
        assert!(!states[0].run);

        let due = collect_due(&mut states, time(7, 59), time(8, 0));
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_past_due_fires_at_next_natural_occurrence() {
        // enabled at 12:00 with an 08:00 entry: it must only fire after
        // the next midnight plus crossing 08:00
        let mut states = vec![entry(time(8, 0))];
        mark_past_due(&mut states, time(12, 0));

        assert!(collect_due(&mut states, time(12, 0), time(18, 0)).is_empty());
        assert!(collect_due(&mut states, time(23, 59), time(0, 1)).is_empty());
        let due = collect_due(&mut states, time(7, 59), time(8, 0));
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_restart_required_rules() {
        let a = ScheduleEntry {
            start: time(8, 0),
            freq: Some(7_078_000),
            speed: Some(Speed::Normal),
            profile: Some("Default".to_string()),
        };
        let mut b = a.clone();
        b.start = time(9, 0);
        b.freq = Some(14_078_000);

        // frequency-only change applies live
        assert!(!b.restart_required(Some(&a)));

        b.speed = Some(Speed::Slow);
        assert!(b.restart_required(Some(&a)));

        // no previous entry: conservative restart
        assert!(a.restart_required(None));
    }
}
