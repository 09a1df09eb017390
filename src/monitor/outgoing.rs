use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::debug;

use crate::core::{Error, OutgoingRecord, OutgoingStatus, Result, Speed, StateHandle};
use crate::monitor::Control;
use crate::network::dispatch::{Dispatcher, Notification};
use crate::network::transport::Event;
use crate::protocol::message::EOM;
use crate::protocol::{Command, Message, MessageKind};

/// Tracks each submitted transmission from submission through completion.
///
/// The modem assigns no id of its own, so status is derived from its
/// transmit text field feedback: a record goes `Sending` when its exact
/// composed text appears in the field, `Complete` when the text leaves the
/// field again, and `Failed` if never observed sent within the allowed
/// number of window cycles.
///
/// Matching is by exact text; among several identical queued records the
/// oldest matches first. Two concurrently queued messages with identical
/// text and destination are indistinguishable, since the wire format
/// round-trips no correlation token.
#[derive(Clone)]
pub struct OutgoingMonitor {
    control: Control,
    inner: Arc<Inner>,
}

struct Inner {
    state: StateHandle,
    dispatcher: Dispatcher,
    queue: Mutex<VecDeque<Tracked>>,
}

struct Tracked {
    record: OutgoingRecord,
    cmd: Option<Command>,
}

/// A record not observed sent within this many window cycles has failed
const MAX_AGE_CYCLES: u32 = 60;
/// Cadence of the timeout sweep
const SWEEP_TICK: Duration = Duration::from_secs(1);

impl OutgoingMonitor {
    /// Starts the monitor on the given event stream. Enabled immediately.
    pub fn spawn(
        state: StateHandle,
        dispatcher: Dispatcher,
        events: broadcast::Receiver<Event>,
    ) -> OutgoingMonitor {
        let monitor = OutgoingMonitor {
            control: Control::new(),
            inner: Arc::new(Inner {
                state,
                dispatcher,
                queue: Mutex::new(VecDeque::new()),
            }),
        };
        monitor.control.enable();
        tokio::spawn(monitor.clone().run(events));
        monitor
    }

    /// Monitor control.
    pub fn control(&self) -> &Control {
        &self.control
    }

    /// Begins tracking a submitted transmission.
    ///
    /// Ownership of the record's lifecycle passes to this monitor; the
    /// returned clone is a point-in-time view.
    pub fn track(&self, message: &Message) -> Result<OutgoingRecord> {
        if message.kind != MessageKind::TxSendMessage {
            return Err(Error::invalid_state(
                "only outgoing transmissions can be tracked",
            ));
        }
        let text = message
            .value
            .clone()
            .ok_or_else(|| Error::invalid_state("outgoing message has no text"))?;

        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();

        let record = OutgoingRecord {
            id,
            destination: message
                .params
                .destination
                .clone()
                .unwrap_or_default(),
            text,
            status: OutgoingStatus::Queued,
            submitted_at: Utc::now(),
            sending_at: None,
            finished_at: None,
        };

        let mut queue = self.inner.queue.lock().expect("outgoing queue lock poisoned");
        queue.push_back(Tracked {
            record: record.clone(),
            cmd: message.params.cmd,
        });
        Ok(record)
    }

    /// Point-in-time view of all tracked records.
    pub fn records(&self) -> Vec<OutgoingRecord> {
        let queue = self.inner.queue.lock().expect("outgoing queue lock poisoned");
        queue.iter().map(|tracked| tracked.record.clone()).collect()
    }

    /// Restores tracked records from a snapshot. Completed and failed
    /// records are not re-queued.
    pub fn restore(&self, records: Vec<OutgoingRecord>) {
        let mut queue = self.inner.queue.lock().expect("outgoing queue lock poisoned");
        queue.clear();
        for record in records {
            if matches!(record.status, OutgoingStatus::Queued | OutgoingStatus::Sending) {
                queue.push_back(Tracked { record, cmd: None });
            }
        }
    }

    async fn run(self, mut events: broadcast::Receiver<Event>) {
        let mut enabled = self.control.enabled_watch();
        let mut sweep = interval(SWEEP_TICK);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(Event::Rx(inbound)) => {
                        if inbound.message.kind == MessageKind::TxText && !self.control.is_paused() {
                            let field = inbound.message.value.clone().unwrap_or_default();
                            self.advance(Some(&field));
                        }
                    }
                    // queued records survive an outage untouched
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target: "modemlink::outgoing", skipped, "event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = sweep.tick() => {
                    if !self.control.is_paused() {
                        // timeout sweep against the cached field state
                        self.advance(None);
                    }
                }
                _ = enabled.changed() => {
                    if !self.control.is_enabled() {
                        return;
                    }
                }
            }
        }
    }

    /// Advances record lifecycles against the transmit text field.
    fn advance(&self, field: Option<&str>) {
        let state = self.inner.state.current();
        let field = match field {
            Some(field) => field.to_string(),
            None => match state.tx_text.clone() {
                Some(field) => field,
                // field contents unknown; timeouts still apply
                None => String::new(),
            },
        };

        let speed = state.speed.unwrap_or(Speed::Normal);
        let max_age = speed.window_duration() * MAX_AGE_CYCLES;

        let changed = {
            let mut queue = self.inner.queue.lock().expect("outgoing queue lock poisoned");
            advance_queue(&mut queue, &field, max_age, Utc::now())
        };

        for record in changed {
            self.inner
                .dispatcher
                .notify(Notification::OutgoingStatus(record));
        }
    }
}

/// Strips the local callsign prefix and end-of-message mark the modem adds
/// around the submitted text.
fn normalize_tx_field(raw: &str) -> String {
    let body = match raw.split_once(':') {
        Some((_, rest)) => rest,
        None => raw,
    };
    body.trim_matches(|c: char| c.is_whitespace() || c == EOM)
        .to_string()
}

/// Text with its trailing checksum token removed.
fn without_checksum(text: &str) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    match tokens.split_last() {
        Some((_, rest)) => rest.join(" "),
        None => String::new(),
    }
}

/// Lifecycle pass over the queue. Returns records whose status changed.
fn advance_queue(
    queue: &mut VecDeque<Tracked>,
    raw_field: &str,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Vec<OutgoingRecord> {
    let field = normalize_tx_field(raw_field);
    let field_without_checksum = without_checksum(&field);
    let mut changed = Vec::new();
    let mut claimed_sending = false;

    let mut index = 0;
    while index < queue.len() {
        let (status, matches, age) = {
            let tracked = &queue[index];
            let checksummed = tracked.cmd.map(|cmd| cmd.carries_checksum()).unwrap_or(false);
            let matches = !field.is_empty()
                && (tracked.record.text == field
                    || (checksummed && tracked.record.text == field_without_checksum));
            let age = (now - tracked.record.submitted_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            (tracked.record.status, matches, age)
        };

        if status == OutgoingStatus::Queued && matches && !claimed_sending {
            // oldest queued record claims the field
            claimed_sending = true;
            let record = &mut queue[index].record;
            record.status = OutgoingStatus::Sending;
            record.sending_at = Some(now);
            changed.push(record.clone());
            index += 1;
        } else if status == OutgoingStatus::Sending && !matches {
            // text left the field: transmission completed
            let mut record = queue.remove(index).expect("index in bounds").record;
            record.status = OutgoingStatus::Complete;
            record.finished_at = Some(now);
            changed.push(record);
        } else if status == OutgoingStatus::Queued && age > max_age {
            let mut record = queue.remove(index).expect("index in bounds").record;
            record.status = OutgoingStatus::Failed;
            record.finished_at = Some(now);
            changed.push(record);
        } else {
            index += 1;
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(text: &str, cmd: Option<Command>, submitted_at: DateTime<Utc>) -> Tracked {
        Tracked {
            record: OutgoingRecord {
                id: "test".to_string(),
                destination: "N0CALL".to_string(),
                text: text.to_string(),
                status: OutgoingStatus::Queued,
                submitted_at,
                sending_at: None,
                finished_at: None,
            },
            cmd,
        }
    }

    #[test]
    fn test_normalize_tx_field() {
        assert_eq!(
            normalize_tx_field(" KT7RUN: N0CALL MSG HELLO ♢ "),
            "N0CALL MSG HELLO"
        );
        assert_eq!(normalize_tx_field("N0CALL ACK"), "N0CALL ACK");
        assert_eq!(normalize_tx_field(""), "");
    }

    #[test]
    fn test_queued_to_sending_to_complete() {
        let now = Utc::now();
        let mut queue = VecDeque::from([tracked("N0CALL SNR?", None, now)]);
        let max_age = Duration::from_secs(900);

        // text appears in the field
        let changed = advance_queue(&mut queue, "KT7RUN: N0CALL SNR?", max_age, now);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, OutgoingStatus::Sending);

        // still in the field: no change
        let changed = advance_queue(&mut queue, "KT7RUN: N0CALL SNR?", max_age, now);
        assert!(changed.is_empty());

        // text gone: complete, record dropped from the queue
        let changed = advance_queue(&mut queue, "", max_age, now);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, OutgoingStatus::Complete);
        assert!(changed[0].finished_at.is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_different_text_does_not_match() {
        let now = Utc::now();
        let mut queue = VecDeque::from([tracked("N0CALL SNR?", None, now)]);

        // a coincidentally similar message must not claim the record
        let changed = advance_queue(
            &mut queue,
            "KT7RUN: N0CALL SNR? EXTRA",
            Duration::from_secs(900),
            now,
        );
        assert!(changed.is_empty());
        assert_eq!(queue[0].record.status, OutgoingStatus::Queued);
    }

    #[test]
    fn test_checksummed_command_matches_without_trailing_token() {
        let now = Utc::now();
        let mut queue = VecDeque::from([tracked("N0CALL MSG HELLO", Some(Command::Msg), now)]);

        // the modem appended a checksum token to the field text
        let changed = advance_queue(
            &mut queue,
            "KT7RUN: N0CALL MSG HELLO J2K4",
            Duration::from_secs(900),
            now,
        );
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, OutgoingStatus::Sending);
    }

    #[test]
    fn test_oldest_identical_record_claims_first() {
        let now = Utc::now();
        let older = now - chrono::Duration::seconds(10);
        let mut queue = VecDeque::from([
            tracked("N0CALL ACK", None, older),
            tracked("N0CALL ACK", None, now),
        ]);

        let changed = advance_queue(&mut queue, "KT7RUN: N0CALL ACK", Duration::from_secs(900), now);
        assert_eq!(changed.len(), 1);
        assert_eq!(queue[0].record.status, OutgoingStatus::Sending);
        assert_eq!(queue[1].record.status, OutgoingStatus::Queued);
    }

    #[test]
    fn test_timeout_fails_queued_record() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(1000);
        let mut queue = VecDeque::from([tracked("N0CALL SNR?", None, old)]);

        let changed = advance_queue(&mut queue, "", Duration::from_secs(900), now);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, OutgoingStatus::Failed);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_record_stays_queued_without_feedback() {
        // a disconnect produces no field feedback; the record must remain
        // queued rather than be silently lost
        let now = Utc::now();
        let mut queue = VecDeque::from([tracked("N0CALL SNR?", None, now)]);

        let changed = advance_queue(&mut queue, "", Duration::from_secs(900), now);
        assert!(changed.is_empty());
        assert_eq!(queue[0].record.status, OutgoingStatus::Queued);
    }
}
