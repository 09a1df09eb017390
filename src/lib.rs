//! modemlink: control-plane client for a half-duplex digital radio modem
//!
//! The modem application handles RF modulation and demodulation and exposes
//! a line-oriented JSON message API over a local TCP socket. This library
//! is everything needed to operate it safely in real time: the socket
//! transport, the typed message model, and the timing-sensitive monitors
//! (window, offset, heartbeat, time drift, outgoing lifecycle, schedule)
//! that coordinate independently-clocked activities against the single
//! shared radio without collisions or missed windows.

pub mod client;
pub mod core;
pub mod monitor;
pub mod network;
pub mod protocol;
pub mod util;

// Re-export commonly used items
pub use crate::client::{Client, ClientSnapshot};
pub use crate::core::{ClientConfig, Error, Result, Speed, WindowPhase};
pub use crate::network::dispatch::Notification;
pub use crate::protocol::{Command, Message, MessageKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
