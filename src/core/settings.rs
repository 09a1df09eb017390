//! Configuration collaborator interface.
//!
//! The external key/value store (file-backed in production) is modeled as
//! a synchronous get/set interface. Monitors read modem settings at
//! startup and write changes back; the file mechanics live outside this
//! crate.

use std::collections::HashMap;
use std::sync::RwLock;

/// Synchronous key/value settings access.
pub trait SettingsStore: Send + Sync {
    /// Reads a setting, `None` when unset.
    fn get(&self, key: &str) -> Option<String>;

    /// Writes a setting.
    fn set(&self, key: &str, value: &str);
}

/// Setting key for the applied time drift, in milliseconds.
pub const SETTING_TIME_DRIFT: &str = "TimeDrift";
/// Setting key arming the application's heartbeat acknowledgements.
pub const SETTING_HEARTBEAT_ACK: &str = "HeartbeatAcknowledgements";
/// Setting key for the active configuration profile.
pub const SETTING_PROFILE: &str = "Profile";
/// Setting key for the configured modem speed name.
pub const SETTING_SPEED: &str = "Speed";

/// In-memory store, the default and the test double.
#[derive(Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        MemorySettings::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .expect("settings lock poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .expect("settings lock poisoned")
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_settings_round_trip() {
        let settings = MemorySettings::new();
        assert_eq!(settings.get(SETTING_TIME_DRIFT), None);
        settings.set(SETTING_TIME_DRIFT, "-250");
        assert_eq!(settings.get(SETTING_TIME_DRIFT).as_deref(), Some("-250"));
    }
}
