//! Sensor identity, state and the decoded memory contents.

use log::{info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::{Display, EnumIter, IntoStaticStr};
use time::OffsetDateTime;

use crate::codec::{serial_number_with_prefix, to_hex};
use crate::config::DecoderConfig;
use crate::fram::{self, CrcReport, FramError};
use crate::glucose::Glucose;
use crate::temperature::CalibrationInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum SensorType {
    #[strum(serialize = "Libre 1")]
    Libre1,
    #[strum(serialize = "Libre US 14d")]
    LibreUS14day,
    #[strum(serialize = "Libre Pro/H")]
    LibreProH,
    #[strum(serialize = "Libre 2")]
    Libre2,
    #[strum(serialize = "Unknown")]
    Unknown,
}

const PATCH_INFO_TAGS: [([u8; 4], SensorType); 4] = [
    ([0xDF, 0x00, 0x00, 0x01], SensorType::Libre1),
    ([0xE5, 0x00, 0x03, 0x02], SensorType::LibreUS14day),
    ([0x70, 0x00, 0x10, 0x00], SensorType::LibreProH),
    ([0x9D, 0x08, 0x30, 0x01], SensorType::Libre2),
];

impl SensorType {
    /// Classifies a sensor by the first four bytes of its patch info.
    pub fn from_patch_info(patch_info: &[u8]) -> Self {
        let Some(tag) = patch_info.get(..4) else {
            return Self::Unknown;
        };

        PATCH_INFO_TAGS
            .iter()
            .find(|(known, _)| known.as_slice() == tag)
            .map(|&(_, sensor_type)| sensor_type)
            .unwrap_or(Self::Unknown)
    }

    /// The 4-byte patch info tag identifying this generation.
    pub fn patch_info_tag(self) -> Option<[u8; 4]> {
        PATCH_INFO_TAGS
            .iter()
            .find(|&&(_, sensor_type)| sensor_type == self)
            .map(|&(tag, _)| tag)
    }

    /// First character of the printed serial number.
    pub fn serial_prefix(self) -> char {
        match self {
            Self::Libre1 | Self::LibreUS14day | Self::Unknown => '0',
            Self::LibreProH => '1',
            Self::Libre2 => '3',
        }
    }

    /// Generations whose memory image is encrypted.
    pub fn has_encrypted_fram(self) -> bool {
        matches!(self, Self::Libre2 | Self::LibreUS14day)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive, Display, IntoStaticStr,
)]
#[repr(u8)]
pub enum SensorState {
    #[strum(serialize = "unknown")]
    Unknown = 0x00,
    #[strum(serialize = "not started")]
    NotStarted = 0x01,
    #[strum(serialize = "starting")]
    Starting = 0x02,
    #[strum(serialize = "ready")]
    Ready = 0x03,
    #[strum(serialize = "expired")]
    Expired = 0x04,
    #[strum(serialize = "shutdown")]
    Shutdown = 0x05,
    #[strum(serialize = "failure")]
    Failure = 0x06,
}

/// What happened to the readings when a memory image was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramOutcome {
    Decoded,
    /// Body CRC failed for the tolerant generation; decoded anyway.
    DecodedDespiteBodyCrc,
    /// Body CRC failed; the previous trend and history were kept.
    KeptPrevious,
}

/// A sensor as seen through its transmitter.
///
/// Derived fields (type, serial, trend, history) are only ever recomputed
/// by the setters below, so they always reflect the latest inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    sensor_type: SensorType,
    state: SensorState,
    uid: Vec<u8>,
    patch_info: Vec<u8>,
    serial: String,
    age: u32,
    last_reading_date: Option<OffsetDateTime>,
    fram: Option<Vec<u8>>,
    crc_report: Option<CrcReport>,
    calibration_info: Option<CalibrationInfo>,
    trend: Vec<Glucose>,
    history: Vec<Glucose>,
}

impl Default for Sensor {
    fn default() -> Self {
        Self::new()
    }
}

impl Sensor {
    pub fn new() -> Self {
        Self {
            sensor_type: SensorType::Unknown,
            state: SensorState::Unknown,
            uid: Vec::new(),
            patch_info: Vec::new(),
            serial: String::new(),
            age: 0,
            last_reading_date: None,
            fram: None,
            crc_report: None,
            calibration_info: None,
            trend: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Sensor already known from persisted settings.
    pub fn resumed(uid: Option<&[u8]>, patch_info: Option<&[u8]>) -> Self {
        let mut sensor = Self::new();
        if let Some(patch_info) = patch_info {
            sensor.set_patch_info(patch_info);
        }
        if let Some(uid) = uid {
            sensor.set_uid(uid);
        }
        sensor
    }

    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    pub fn state(&self) -> SensorState {
        self.state
    }

    pub fn uid(&self) -> Option<&[u8]> {
        (self.uid.len() == 8).then_some(self.uid.as_slice())
    }

    pub fn patch_info(&self) -> Option<&[u8]> {
        (!self.patch_info.is_empty()).then_some(self.patch_info.as_slice())
    }

    /// Empty until an 8-byte uid has been assigned.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn last_reading_date(&self) -> Option<OffsetDateTime> {
        self.last_reading_date
    }

    pub fn fram(&self) -> Option<&[u8]> {
        self.fram.as_deref()
    }

    pub fn crc_report(&self) -> Option<&CrcReport> {
        self.crc_report.as_ref()
    }

    pub fn calibration_info(&self) -> Option<&CalibrationInfo> {
        self.calibration_info.as_ref()
    }

    pub fn trend(&self) -> &[Glucose] {
        &self.trend
    }

    pub fn history(&self) -> &[Glucose] {
        &self.history
    }

    /// Sets the patch info and re-derives type and serial prefix.
    pub fn set_patch_info(&mut self, patch_info: &[u8]) {
        self.patch_info = patch_info.to_vec();
        self.sensor_type = SensorType::from_patch_info(patch_info);
        self.refresh_serial();
    }

    /// Sets the uid and re-derives the serial number.
    pub fn set_uid(&mut self, uid: &[u8]) {
        if uid.len() != 8 {
            warn!("sensor uid must be 8 bytes, got {}: {}", uid.len(), to_hex(uid));
        }
        self.uid = uid.to_vec();
        self.refresh_serial();
    }

    pub fn set_age(&mut self, age: u32) {
        self.age = age;
    }

    pub fn set_state(&mut self, state: SensorState) {
        self.state = state;
    }

    /// Replaces trend and history with samples decoded outside the memory
    /// image path (BLE packets, bridge values).
    pub fn set_readings(&mut self, trend: Vec<Glucose>, history: Vec<Glucose>, read_at: OffsetDateTime) {
        self.trend = trend;
        self.history = history;
        self.last_reading_date = Some(read_at);
    }

    /// Assigns a plaintext memory image read at `read_at`.
    ///
    /// CRCs are checked per region; header and footer failures are only
    /// logged. A body failure keeps the previous readings if there are any,
    /// or is decoded anyway for the configured tolerant generation, and is an
    /// error otherwise. On error the sensor is left untouched.
    pub fn set_fram(
        &mut self,
        image: &[u8],
        read_at: OffsetDateTime,
        config: &DecoderConfig,
    ) -> Result<FramOutcome, FramError> {
        let report = fram::crc_report(image)?;
        info!("{report}");

        let mut outcome = FramOutcome::Decoded;
        if !report.body.is_ok() {
            let has_history = !self.history.is_empty();
            if has_history && config.crc_tolerant_type == Some(self.sensor_type) {
                warn!("{}: tolerating body CRC failure", self.sensor_type);
                outcome = FramOutcome::DecodedDespiteBodyCrc;
            } else if has_history {
                warn!("body CRC failed, keeping previous readings");
                self.crc_report = Some(report);
                return Ok(FramOutcome::KeptPrevious);
            } else {
                return Err(FramError::BodyCrc {
                    stored: report.body.stored,
                    computed: report.body.computed,
                });
            }
        }

        let contents = fram::decode(image, read_at, config.fram_write_delay_minutes)?;
        if let Some(state) = contents.state {
            self.state = state;
        }
        self.age = contents.age;
        self.trend = contents.trend;
        self.history = contents.history;
        self.calibration_info = Some(CalibrationInfo::from_fram(image));
        self.crc_report = Some(report);
        self.fram = Some(image.to_vec());
        self.last_reading_date = Some(read_at);

        info!(
            "sensor {} ({}): state {}, age {} min ({:.1} days)",
            self.serial,
            self.sensor_type,
            self.state,
            self.age,
            f64::from(self.age) / 60.0 / 24.0
        );
        Ok(outcome)
    }

    fn refresh_serial(&mut self) {
        self.serial = serial_number_with_prefix(&self.uid, self.sensor_type.serial_prefix());
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::{FramOutcome, Sensor, SensorState, SensorType};
    use crate::config::DecoderConfig;
    use crate::fram::FramError;
    use crate::fram::tests::{READ_DATE, golden_fram};

    const UID: [u8; 8] = [0x9a, 0x1b, 0x2c, 0x00, 0x00, 0xa4, 0x07, 0xe0];

    #[test]
    fn resolves_known_patch_info() {
        assert_eq!(
            SensorType::from_patch_info(&[0x9D, 0x08, 0x30, 0x01, 0x22, 0x2D]),
            SensorType::Libre2
        );
        assert_eq!(SensorType::from_patch_info(&[0xDF, 0, 0, 1, 1, 2]), SensorType::Libre1);
        assert_eq!(SensorType::from_patch_info(&[0x70, 0, 0x10, 0]), SensorType::LibreProH);
        assert_eq!(SensorType::from_patch_info(&[0x9D, 0x08, 0x30]), SensorType::Unknown);
        assert_eq!(SensorType::from_patch_info(&[0x9D, 0x08, 0x30, 0x02]), SensorType::Unknown);
        assert_eq!(SensorType::iter().count(), 5);
        assert_eq!(SensorType::LibreUS14day.to_string(), "Libre US 14d");
    }

    #[test]
    fn serial_prefix_independent_of_assignment_order() {
        let mut a = Sensor::new();
        a.set_uid(&UID);
        a.set_patch_info(&[0x9D, 0x08, 0x30, 0x01, 0x00, 0x00]);

        let mut b = Sensor::new();
        b.set_patch_info(&[0x9D, 0x08, 0x30, 0x01, 0x00, 0x00]);
        b.set_uid(&UID);

        assert_eq!(a.serial(), "3MH000C0VL8");
        assert_eq!(a.serial(), b.serial());

        a.set_patch_info(&[0xDF, 0x00, 0x00, 0x01]);
        assert_eq!(a.serial(), "0MH000C0VL8");
        assert_eq!(a.sensor_type(), SensorType::Libre1);
    }

    #[test]
    fn wrong_uid_length_has_no_serial() {
        let mut sensor = Sensor::new();
        sensor.set_uid(&[1, 2, 3]);
        assert_eq!(sensor.serial(), "");
        assert_eq!(sensor.uid(), None);
    }

    #[test]
    fn state_byte_round_trip() {
        assert_eq!(SensorState::try_from(0x03), Ok(SensorState::Ready));
        assert!(SensorState::try_from(0x07).is_err());
        assert_eq!(u8::from(SensorState::Failure), 0x06);
        assert_eq!(SensorState::NotStarted.to_string(), "not started");
    }

    #[test]
    fn fram_assignment_decodes() {
        let mut sensor = Sensor::new();
        let outcome = sensor
            .set_fram(&golden_fram(), READ_DATE, &DecoderConfig::default())
            .expect("valid fram");
        assert_eq!(outcome, FramOutcome::Decoded);
        assert_eq!(sensor.state(), SensorState::Ready);
        assert_eq!(sensor.age(), 4320);
        assert_eq!(sensor.trend().len(), 16);
        assert_eq!(sensor.history().len(), 32);
        assert!(sensor.crc_report().expect("report").all_ok());
        assert_eq!(sensor.last_reading_date(), Some(READ_DATE));
    }

    #[test]
    fn body_crc_failure_without_history_is_an_error() {
        let mut fram = golden_fram();
        fram[100] ^= 0xFF;
        let mut sensor = Sensor::new();
        let err = sensor
            .set_fram(&fram, READ_DATE, &DecoderConfig::default())
            .expect_err("body crc");
        assert!(matches!(err, FramError::BodyCrc { .. }));
        assert!(sensor.history().is_empty());
        assert!(sensor.fram().is_none());
    }

    #[test]
    fn body_crc_failure_keeps_previous_history() {
        let config = DecoderConfig::default();
        let mut sensor = Sensor::new();
        sensor.set_fram(&golden_fram(), READ_DATE, &config).expect("valid fram");
        let previous = sensor.history().to_vec();

        let mut fram = golden_fram();
        fram[130] ^= 0xFF;
        let outcome = sensor.set_fram(&fram, READ_DATE, &config).expect("fallback");
        assert_eq!(outcome, FramOutcome::KeptPrevious);
        assert_eq!(sensor.history(), previous.as_slice());
        assert!(!sensor.crc_report().expect("report").body.is_ok());
    }

    #[test]
    fn tolerant_generation_decodes_despite_body_crc() {
        let config = DecoderConfig::default();
        let mut sensor = Sensor::new();
        sensor.set_patch_info(&[0x9D, 0x08, 0x30, 0x01, 0x76, 0x25]);
        sensor.set_fram(&golden_fram(), READ_DATE, &config).expect("valid fram");

        let mut fram = golden_fram();
        fram[124] ^= 0x01;
        let outcome = sensor.set_fram(&fram, READ_DATE, &config).expect("tolerated");
        assert_eq!(outcome, FramOutcome::DecodedDespiteBodyCrc);
        assert_ne!(sensor.fram(), Some(golden_fram().as_slice()));
    }

    #[test]
    fn resumed_sensor_has_identity() {
        let sensor = Sensor::resumed(Some(&UID), Some(&[0x9D, 0x08, 0x30, 0x01, 0x22, 0x2D]));
        assert_eq!(sensor.uid(), Some(UID.as_slice()));
        assert_eq!(sensor.sensor_type(), SensorType::Libre2);
        assert!(sensor.serial().starts_with('3'));
    }
}
