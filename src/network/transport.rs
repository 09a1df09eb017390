use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::core::{
    Error, Result, Spot, SpotLog, StateHandle, StateWriter, TransportConfig,
};
use crate::protocol::{Message, MessageCodec, MessageKind};

/// An inbound message together with its arrival time.
#[derive(Debug)]
pub struct Inbound {
    pub message: Message,
    pub received_at: DateTime<Utc>,
}

/// Event delivered to transport subscribers, in socket order.
#[derive(Debug, Clone)]
pub enum Event {
    /// Socket (re)established
    Connected,
    /// Socket lost; sends fail with `NotConnected` until reconnected
    Disconnected,
    /// Parsed inbound message
    Rx(Arc<Inbound>),
}

/// Delay between reconnect attempts after a drop
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// Per-attempt TCP connect timeout inside the retry loop
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Capacity of the subscriber event channel
const EVENT_CAPACITY: usize = 512;
/// Capacity of the serialized outbound queue
const OUTBOUND_CAPACITY: usize = 64;

/// Cloneable handle for sending and subscribing.
#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<Message>,
    events: broadcast::Sender<Event>,
    state: StateHandle,
    spots: SpotLog,
}

impl TransportHandle {
    /// Enqueues a message on the serialized FIFO write path.
    ///
    /// Fails with [`Error::NotConnected`] while the socket is down;
    /// messages are never silently buffered across an outage.
    pub async fn send(&self, message: Message) -> Result<()> {
        if !self.state.current().connected {
            return Err(Error::NotConnected);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Subscribes to the inbound event stream.
    ///
    /// Every subscriber observes events in the order received from the
    /// socket. The sequence is unbounded; restart it by resubscribing
    /// after a disconnect if receiving lagged.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Read handle onto the cached modem state.
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// The heard-station log fed by the read loop.
    pub fn spots(&self) -> SpotLog {
        self.spots.clone()
    }
}

/// Owns the socket connection to the modem application.
///
/// A supervisor task maintains the connection: it reads and parses frames,
/// writes queued outbound messages FIFO, issues periodic local-state
/// refresh requests, and reconnects after a drop, surfacing
/// [`Event::Connected`]/[`Event::Disconnected`] edges to subscribers.
pub struct Transport {
    handle: TransportHandle,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    /// Establishes the initial connection and starts the supervisor.
    ///
    /// Fails with a connection error if the application does not accept
    /// within `config.connect_timeout`; the bound is generous because the
    /// external application can be slow to start.
    pub async fn connect(config: TransportConfig, state: StateWriter, spots: SpotLog) -> Result<Transport> {
        let stream = connect_with_retry(&config, config.connect_timeout).await?;
        info!(target: "modemlink::transport", host = %config.host, port = config.port, "connected");
        // mark connected before the supervisor runs so sends are accepted
        // as soon as this returns
        state.update(|state| state.connected = true);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = TransportHandle {
            outbound: outbound_tx,
            events: events_tx.clone(),
            state: state.subscribe(),
            spots: spots.clone(),
        };

        let supervisor = Supervisor {
            config,
            state,
            spots,
            events: events_tx,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            last_rx: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        };
        tokio::spawn(supervisor.run(stream));

        Ok(Transport {
            handle,
            shutdown: shutdown_tx,
        })
    }

    /// Cloneable handle for sending and subscribing.
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Stops the supervisor and closes the connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// TCP connect retry loop bounded by `deadline_in`.
async fn connect_with_retry(config: &TransportConfig, deadline_in: Duration) -> Result<TcpStream> {
    let address = format!("{}:{}", config.host, config.port);
    let deadline = tokio::time::Instant::now() + deadline_in;

    loop {
        match timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(error)) => {
                debug!(target: "modemlink::transport", %error, "connect attempt failed");
            }
            Err(_) => {
                debug!(target: "modemlink::transport", "connect attempt timed out");
            }
        }

        if tokio::time::Instant::now() + Duration::from_secs(1) > deadline {
            return Err(Error::connection(format!(
                "no response from {address} within {deadline_in:?}"
            )));
        }
        sleep(Duration::from_secs(1)).await;
    }
}

struct Supervisor {
    config: TransportConfig,
    state: StateWriter,
    spots: SpotLog,
    events: broadcast::Sender<Event>,
    outbound: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
    last_rx: Arc<AtomicI64>,
}

impl Supervisor {
    async fn run(mut self, initial: TcpStream) {
        let mut stream = Some(initial);

        loop {
            let connection = match stream.take() {
                Some(connection) => connection,
                None => match connect_with_retry(&self.config, self.config.connect_timeout).await {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!(target: "modemlink::transport", %error, "reconnect failed, retrying");
                        if *self.shutdown.borrow() {
                            return;
                        }
                        sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                },
            };

            self.state.update(|state| state.connected = true);
            let _ = self.events.send(Event::Connected);
            self.last_rx
                .store(Utc::now().timestamp_millis(), Ordering::SeqCst);

            self.drive(connection).await;

            self.state.update(|state| state.connected = false);
            let _ = self.events.send(Event::Disconnected);

            if *self.shutdown.borrow() {
                return;
            }
            info!(target: "modemlink::transport", "connection lost, reconnecting");
            sleep(RECONNECT_DELAY).await;
        }
    }

    /// Runs one connection until it drops or goes inactive.
    async fn drive(&mut self, connection: TcpStream) {
        let mut framed = Framed::new(connection, MessageCodec::new());
        let mut refresh = interval(self.config.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(message)) => {
                        self.last_rx
                            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
                        self.process(message);
                    }
                    Some(Err(Error::MalformedMessage(detail))) => {
                        // logged and dropped; the read loop must not abort
                        warn!(target: "modemlink::transport", %detail, "dropping malformed frame");
                    }
                    Some(Err(error)) => {
                        warn!(target: "modemlink::transport", %error, "socket read failed");
                        return;
                    }
                    None => {
                        info!(target: "modemlink::transport", "socket closed by peer");
                        return;
                    }
                },

                queued = self.outbound.recv() => match queued {
                    Some(message) => {
                        if let Err(error) = framed.send(message).await {
                            warn!(target: "modemlink::transport", %error, "socket write failed");
                            return;
                        }
                    }
                    // all handles dropped
                    None => return,
                },

                _ = refresh.tick() => {
                    let idle_ms = Utc::now().timestamp_millis()
                        - self.last_rx.load(Ordering::SeqCst);
                    if idle_ms > self.config.inactivity_timeout.as_millis() as i64 {
                        warn!(
                            target: "modemlink::transport",
                            idle_ms, "no inbound traffic, declaring connection lost"
                        );
                        return;
                    }
                    for request in refresh_requests() {
                        if let Err(error) = framed.send(request).await {
                            warn!(target: "modemlink::transport", %error, "refresh write failed");
                            return;
                        }
                    }
                }

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Updates the cached state and publishes the message to subscribers.
    fn process(&self, message: Message) {
        match message.kind {
            MessageKind::RigFreq => self.state.update(|state| {
                state.dial = message.params.dial.or(state.dial);
                state.freq = message.params.freq.or(state.freq);
                state.offset = message.params.offset.or(state.offset);
            }),
            MessageKind::StationStatus => self.state.update(|state| {
                state.dial = message.params.dial.or(state.dial);
                state.freq = message.params.freq.or(state.freq);
                state.offset = message.params.offset.or(state.offset);
                state.speed = message.params.speed.or(state.speed);
            }),
            MessageKind::ModeSpeed => self.state.update(|state| {
                state.speed = message.params.speed.or(state.speed);
            }),
            MessageKind::RigPtt => self.state.update(|state| {
                state.ptt = message.value.as_deref() == Some("on");
            }),
            MessageKind::StationCallsign => self.state.update(|state| {
                state.callsign = message.value.clone();
            }),
            MessageKind::StationGrid => self.state.update(|state| {
                state.grid = message.value.clone();
            }),
            MessageKind::StationInfo => self.state.update(|state| {
                state.info = message.value.clone();
            }),
            MessageKind::TxText => self.state.update(|state| {
                state.tx_text = Some(message.value.clone().unwrap_or_default());
            }),
            MessageKind::RxText => self.state.update(|state| {
                state.rx_text = Some(message.value.clone().unwrap_or_default());
            }),
            MessageKind::RxSelectedCall => self.state.update(|state| {
                state.selected_call = message
                    .value
                    .clone()
                    .filter(|call| !call.is_empty() && call != "CALLSIGN");
            }),
            _ => {}
        }

        if spottable(&message) {
            self.spots.record(spot_from(&message));
        }

        let _ = self.events.send(Event::Rx(Arc::new(Inbound {
            message,
            received_at: Utc::now(),
        })));
    }
}

/// Requests issued on the refresh interval so dependent monitors always
/// observe fresh cached state without redundant queries of their own.
fn refresh_requests() -> Vec<Message> {
    vec![
        Message::of_kind(MessageKind::StationGetCallsign),
        Message::of_kind(MessageKind::StationGetGrid),
        Message::of_kind(MessageKind::RigGetFreq),
        Message::of_kind(MessageKind::ModeGetSpeed),
        Message::of_kind(MessageKind::TxGetText),
        Message::of_kind(MessageKind::RxGetSelectedCall),
    ]
}

/// Whether the message evidences a heard station worth spotting.
pub(crate) fn spottable(message: &Message) -> bool {
    match message.kind {
        MessageKind::RxSpot | MessageKind::RxDirected => true,
        // a directed command heard through any other message kind
        _ => message.params.cmd.is_some() && message.params.origin.is_some(),
    }
}

/// Builds a heard-station record from an inbound message.
pub(crate) fn spot_from(message: &Message) -> Spot {
    let timestamp = message
        .params
        .utc
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    Spot {
        origin: message.params.origin.clone(),
        destination: message.params.destination.clone(),
        offset: message.params.offset,
        snr: message.params.snr,
        speed: message.params.speed,
        tdrift: message.params.tdrift,
        grid: message.params.grid.clone(),
        timestamp,
    }
}
