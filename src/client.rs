use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::{
    ClientConfig, MemorySettings, OutgoingRecord, Result, SettingsStore, Spot, SpotFilter,
    SpotLog, StateHandle, MAX_SPOTS,
};
use crate::monitor::schedule::EntryState;
use crate::monitor::{
    DriftMonitor, HeartbeatNetwork, OffsetMonitor, OutgoingMonitor, ScheduleMonitor, TimeMaster,
    WindowMonitor,
};
use crate::network::dispatch::{Dispatcher, Notification};
use crate::network::transport::{spot_from, spottable, Event, Transport, TransportHandle};
use crate::protocol::{Command, Message, MessageKind};

/// Serializable state carried across an external-application restart.
///
/// Taken before teardown and applied before event delivery resumes, so a
/// reconnect restores monitor state instead of reinitializing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub spots: Vec<Spot>,
    pub outgoing: Vec<OutgoingRecord>,
    pub schedule: Vec<EntryState>,
    pub drift_window: Vec<f64>,
    pub drift_last_update: Option<DateTime<Utc>>,
    pub heartbeat_last_outgoing: DateTime<Utc>,
}

/// Control-plane client for the modem application.
///
/// Composition root: owns the transport and the monitors, and relays
/// inbound events to the callback dispatcher. Monitors are exposed as
/// fields for direct control.
pub struct Client {
    transport: Transport,
    handle: TransportHandle,
    dispatcher: Dispatcher,
    settings: Arc<dyn SettingsStore>,

    pub window: WindowMonitor,
    pub offset: OffsetMonitor,
    pub heartbeat: HeartbeatNetwork,
    pub drift: DriftMonitor,
    pub time_master: TimeMaster,
    pub outgoing: OutgoingMonitor,
    pub schedule: ScheduleMonitor,
}

impl Client {
    /// Connects to the modem application and starts the monitors.
    ///
    /// The window, offset, drift, and outgoing monitors start enabled;
    /// heartbeat, time master, and schedule are opt-in via their handles.
    pub async fn start(config: ClientConfig, settings: Arc<dyn SettingsStore>) -> Result<Client> {
        let (writer, _) = crate::core::shared_state();
        let spots = SpotLog::new(MAX_SPOTS);

        let transport = Transport::connect(config.transport.clone(), writer, spots).await?;
        let handle = transport.handle();
        let dispatcher = Dispatcher::new();

        let window = WindowMonitor::spawn(handle.subscribe(), handle.state(), dispatcher.clone());
        let offset = OffsetMonitor::spawn(config.offset.clone(), handle.clone(), handle.subscribe());
        let drift = DriftMonitor::spawn(
            config.drift.clone(),
            handle.state(),
            Arc::clone(&settings),
            handle.subscribe(),
        );
        let outgoing = OutgoingMonitor::spawn(handle.state(), dispatcher.clone(), handle.subscribe());
        let heartbeat = HeartbeatNetwork::new(
            config.heartbeat.clone(),
            handle.clone(),
            window.clone(),
            offset.clone(),
            Arc::clone(&settings),
        );
        let time_master = TimeMaster::new(config.time_master.clone(), handle.clone());
        let schedule = ScheduleMonitor::new(handle.clone(), Arc::clone(&settings), dispatcher.clone());

        tokio::spawn(relay_task(
            handle.subscribe(),
            dispatcher.clone(),
            heartbeat.clone(),
            schedule.clone(),
        ));

        Ok(Client {
            transport,
            handle,
            dispatcher,
            settings,
            window,
            offset,
            heartbeat,
            drift,
            time_master,
            outgoing,
            schedule,
        })
    }

    /// Connects with an in-memory settings store.
    pub async fn start_default(config: ClientConfig) -> Result<Client> {
        Client::start(config, Arc::new(MemorySettings::new())).await
    }

    /// Transport handle for sending and subscribing directly.
    pub fn transport(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Read handle onto the cached modem state.
    pub fn state(&self) -> StateHandle {
        self.handle.state()
    }

    /// The callback dispatcher; register callbacks and station watches
    /// here.
    pub fn callbacks(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The settings collaborator.
    pub fn settings(&self) -> Arc<dyn SettingsStore> {
        Arc::clone(&self.settings)
    }

    /// Sends a free-text transmission.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        self.handle.send(Message::send_text(text)).await
    }

    /// Sends a directed transmission, tracked through its lifecycle.
    ///
    /// The record is tracked before the send, so a send failing with
    /// `NotConnected` leaves it queued rather than lost; it resumes
    /// waiting for feedback after the next reconnect.
    pub async fn send_directed(
        &self,
        destination: &str,
        cmd: Option<Command>,
        text: &str,
    ) -> Result<OutgoingRecord> {
        let message = Message::directed(destination, cmd, text);
        let record = self.outgoing.track(&message)?;
        self.handle.send(message).await?;
        Ok(record)
    }

    /// Heard stations matching the filter.
    pub fn station_spots(&self, filter: &SpotFilter) -> Vec<Spot> {
        self.handle.spots().query(filter)
    }

    /// Captures restart-safe monitor state.
    pub fn snapshot(&self) -> ClientSnapshot {
        let (drift_window, drift_last_update) = self.drift.sample_window();
        ClientSnapshot {
            spots: self.handle.spots().all(),
            outgoing: self.outgoing.records(),
            schedule: self.schedule.snapshot_entries(),
            drift_window,
            drift_last_update,
            heartbeat_last_outgoing: self.heartbeat.last_outgoing(),
        }
    }

    /// Applies a previously captured snapshot.
    pub fn resume(&self, snapshot: ClientSnapshot) {
        self.handle.spots().restore(snapshot.spots);
        self.outgoing.restore(snapshot.outgoing);
        self.schedule.restore(snapshot.schedule);
        self.drift
            .restore_samples(snapshot.drift_window, snapshot.drift_last_update);
        self.heartbeat
            .restore_last_outgoing(snapshot.heartbeat_last_outgoing);
        info!(target: "modemlink::client", "monitor state resumed from snapshot");
    }

    /// Shuts down the transport and all monitors.
    pub fn stop(&self) {
        self.window.control().disable();
        self.offset.control().disable();
        self.heartbeat.disable();
        self.drift.control().disable();
        self.time_master.disable();
        self.outgoing.control().disable();
        self.schedule.disable();
        self.transport.shutdown();
    }
}

/// Relays transport events to the dispatcher and manages the
/// outage-pause policy: heartbeat and schedule pause during a disconnect
/// and resume on reconnect, while the estimating monitors keep running
/// best-effort.
async fn relay_task(
    mut events: broadcast::Receiver<Event>,
    dispatcher: Dispatcher,
    heartbeat: HeartbeatNetwork,
    schedule: ScheduleMonitor,
) {
    let mut paused_by_outage = false;

    loop {
        match events.recv().await {
            Ok(Event::Connected) => {
                dispatcher.notify(Notification::ConnectionState { connected: true });
                if paused_by_outage {
                    heartbeat.control().resume();
                    schedule.control().resume();
                    paused_by_outage = false;
                }
            }
            Ok(Event::Disconnected) => {
                dispatcher.notify(Notification::ConnectionState { connected: false });
                if !heartbeat.control().is_paused() || !schedule.control().is_paused() {
                    heartbeat.control().pause();
                    schedule.control().pause();
                    paused_by_outage = true;
                }
            }
            Ok(Event::Rx(inbound)) => {
                if inbound.message.kind == MessageKind::InboxMessages {
                    dispatcher.notify(Notification::InboxUpdate(inbound.message.clone()));
                }
                if spottable(&inbound.message) {
                    dispatcher.notify(Notification::Spot(spot_from(&inbound.message)));
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(target: "modemlink::client", skipped, "relay lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
