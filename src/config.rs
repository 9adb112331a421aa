//! Decoder tuning and persisted sensor state.

use serde::{Deserialize, Serialize};

use crate::sensor::SensorType;

pub const DEFAULT_FRAM_WRITE_DELAY_MINUTES: u32 = 3;
pub const DEFAULT_BLE_HISTORY_DELAY_MINUTES: u32 = 2;
pub const DEFAULT_HISTORY_CAPACITY: usize = 32;

/// Empirical constants used while decoding.
///
/// The write delays are reverse-engineered from sensor behavior and are
/// heuristics, not documented values.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// Minutes the sensor lags before committing a history slot.
    pub fram_write_delay_minutes: u32,
    /// Delay subtracted from the wear time before rounding BLE history ids.
    pub ble_history_delay_minutes: u32,
    /// Generation whose memory body carries bogus bytes that break its CRC
    /// even on good reads. Libre 2 images are known to do this after
    /// decryption. Body CRC failures for it are tolerated once a history
    /// exists.
    pub crc_tolerant_type: Option<SensorType>,
    /// Size of the merged history kept by a reader.
    pub history_capacity: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            fram_write_delay_minutes: DEFAULT_FRAM_WRITE_DELAY_MINUTES,
            ble_history_delay_minutes: DEFAULT_BLE_HISTORY_DELAY_MINUTES,
            crc_tolerant_type: Some(SensorType::Libre2),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Sensor identity remembered between connections.
///
/// Owned by the application's settings store; transmitters take it on
/// construction so a reconnect does not have to rediscover the sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    #[serde(default)]
    pub patch_uid: Option<Vec<u8>>,
    #[serde(default)]
    pub patch_info: Option<Vec<u8>>,
    /// Monotonic count of streaming unlocks sent to a Libre 2 sensor.
    #[serde(default)]
    pub unlock_count: u16,
    /// Sensor activation time (Unix seconds) used to derive unlock payloads.
    #[serde(default)]
    pub activation_time: u32,
}

impl ResumeState {
    pub fn is_known_sensor(&self) -> bool {
        self.patch_uid.as_ref().is_some_and(|uid| uid.len() == 8)
            && self.patch_info.as_ref().is_some_and(|info| info.len() >= 6)
    }
}

#[cfg(test)]
mod tests {
    use super::{DecoderConfig, ResumeState};
    use crate::sensor::SensorType;

    #[test]
    fn defaults() {
        let config = DecoderConfig::default();
        assert_eq!(config.fram_write_delay_minutes, 3);
        assert_eq!(config.ble_history_delay_minutes, 2);
        assert_eq!(config.crc_tolerant_type, Some(SensorType::Libre2));
    }

    #[test]
    fn resume_state_round_trips_through_settings_json() {
        let json = r#"{"patch_uid":[1,2,3,4,5,6,7,8],"patch_info":[157,8,48,1,34,45],"unlock_count":4}"#;
        let state: ResumeState = serde_json::from_str(json).expect("valid resume json");
        assert!(state.is_known_sensor());
        assert_eq!(state.unlock_count, 4);
        assert_eq!(state.activation_time, 0);

        let empty: ResumeState = serde_json::from_str("{}").expect("empty resume json");
        assert!(!empty.is_known_sensor());
    }
}
