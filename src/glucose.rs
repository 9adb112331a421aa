//! Glucose samples and history merging.

use strum_macros::{Display, IntoStaticStr};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum GlucoseSource {
    /// Decoded from a sensor memory image.
    #[strum(serialize = "FRAM")]
    Fram,
    /// Decoded from a Libre 2 streaming packet.
    #[strum(serialize = "BLE")]
    Ble,
    /// Returned by the OOP calibration service.
    #[strum(serialize = "OOP")]
    Oop,
    /// Reported directly by a bridge device.
    #[strum(serialize = "Bridge")]
    Bridge,
}

/// One sensor reading.
///
/// `id` is the number of minutes since sensor start and is the identity of
/// the reading: two samples with the same `id` are the same reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Glucose {
    pub id: i32,
    pub date: OffsetDateTime,
    pub raw: u32,
    pub raw_temperature: u32,
    pub temperature_adjustment: i32,
    pub has_error: bool,
    pub data_quality: u16,
    pub data_quality_flags: u8,
    /// Calibrated value in mg/dL, `None` until a calibration is applied.
    pub value: Option<i32>,
    /// Derived temperature in °C.
    pub temperature: Option<f64>,
    pub source: GlucoseSource,
}

impl Glucose {
    pub fn raw(
        id: i32,
        date: OffsetDateTime,
        raw: u32,
        raw_temperature: u32,
        temperature_adjustment: i32,
        source: GlucoseSource,
    ) -> Self {
        Self {
            id,
            date,
            raw,
            raw_temperature,
            temperature_adjustment,
            has_error: false,
            data_quality: 0,
            data_quality_flags: 0,
            value: None,
            temperature: None,
            source,
        }
    }

    pub fn with_value(id: i32, date: OffsetDateTime, value: i32, source: GlucoseSource) -> Self {
        Self {
            value: Some(value),
            ..Self::raw(id, date, 0, 0, 0, source)
        }
    }
}

/// Merges `incoming` into `history` keyed by `id`.
///
/// Incoming samples replace existing ones with the same id. The result is
/// sorted by descending id and truncated to `capacity`.
pub fn merge_history(history: &mut Vec<Glucose>, incoming: &[Glucose], capacity: usize) {
    for sample in incoming {
        match history.iter_mut().find(|g| g.id == sample.id) {
            Some(existing) => *existing = sample.clone(),
            None => history.push(sample.clone()),
        }
    }

    history.sort_by(|a, b| b.id.cmp(&a.id));
    history.dedup_by_key(|g| g.id);
    history.truncate(capacity);
}
