//! Core types and traits for modemlink
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod settings;
pub mod state;
pub mod types;

pub use self::error::{Error, Result};
pub use self::settings::{MemorySettings, SettingsStore};
pub use self::state::{shared_state, RadioState, Spot, SpotFilter, SpotLog, StateHandle, StateWriter};
pub use self::types::{
    ClientConfig,
    DriftConfig,
    DriftSource,
    HeartbeatConfig,
    OffsetConfig,
    OffsetRecord,
    OutgoingRecord,
    OutgoingStatus,
    ScheduleEntry,
    Speed,
    TimeMasterConfig,
    TransportConfig,
    WindowPhase,
    WindowState,
};

/// Default TCP port of the modem application's message API
pub const DEFAULT_PORT: u16 = 2442;

/// Maximum stored heard-station records before old entries are dropped
pub const MAX_SPOTS: usize = 5000;
