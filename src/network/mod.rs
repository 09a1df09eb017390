//! Transport and event delivery
//!
//! This module owns the socket connection to the modem application and the
//! queued callback dispatch that keeps application code off the read loop.

pub mod dispatch;
pub mod transport;

pub use self::dispatch::{Dispatcher, Notification};
pub use self::transport::{Event, Inbound, Transport, TransportHandle};
