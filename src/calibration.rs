//! Linear calibration of raw sensor samples.

use log::info;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::glucose::Glucose;

/// Calibration coefficients.
///
/// The slope and offset each have a temperature-dependent term, plus an
/// extra user correction applied on top. Field names match the OOP service
/// JSON (`slope_slope`, `offset_offset`, ...); missing fields read as zero,
/// except `extra_slope` which defaults to `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(default)]
    pub slope: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub slope_slope: f64,
    #[serde(default)]
    pub slope_offset: f64,
    #[serde(default)]
    pub offset_offset: f64,
    #[serde(default)]
    pub offset_slope: f64,
    #[serde(default = "default_extra_slope")]
    pub extra_slope: f64,
    #[serde(default)]
    pub extra_offset: f64,
}

fn default_extra_slope() -> f64 {
    1.0
}

/// `offset_offset` value the OOP service uses to decline calibration.
pub const NULL_CALIBRATION_OFFSET_OFFSET: f64 = -2.0;

impl Default for Calibration {
    fn default() -> Self {
        Self {
            slope: 0.0,
            offset: 0.0,
            slope_slope: 0.0,
            slope_offset: 0.0,
            offset_offset: 0.0,
            offset_slope: 0.0,
            extra_slope: default_extra_slope(),
            extra_offset: 0.0,
        }
    }
}

impl Calibration {
    /// `value == raw`.
    pub fn identity() -> Self {
        Self {
            slope: 1.0,
            ..Self::default()
        }
    }

    pub fn linear(slope: f64, offset: f64) -> Self {
        Self {
            slope,
            offset,
            ..Self::default()
        }
    }

    /// The sentinel the OOP service returns when it declines to calibrate.
    pub fn null() -> Self {
        Self {
            offset_offset: NULL_CALIBRATION_OFFSET_OFFSET,
            ..Self::default()
        }
    }

    pub fn is_null(&self) -> bool {
        self.offset_offset == NULL_CALIBRATION_OFFSET_OFFSET
            && self.slope_slope == 0.0
            && self.slope_offset == 0.0
            && self.offset_slope == 0.0
    }

    /// Calibrated value in mg/dL for `raw` at `raw_temperature`.
    pub fn value(&self, raw: u32, raw_temperature: u32) -> i32 {
        let raw = f64::from(raw);
        let raw_temperature = f64::from(raw_temperature);
        let slope = (self.slope + self.slope_slope * raw_temperature + self.offset_slope)
            * self.extra_slope;
        let offset = self.offset
            + self.slope_offset * raw_temperature
            + self.offset_offset
            + self.extra_offset;
        (slope * raw + offset).round() as i32
    }

    pub fn apply(&self, sample: &Glucose) -> i32 {
        self.value(sample.raw, sample.raw_temperature)
    }

    /// Copy of `sample` with `value` filled in. Raw fields are untouched.
    pub fn calibrated(&self, sample: &Glucose) -> Glucose {
        Glucose {
            value: Some(self.apply(sample)),
            ..sample.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CalibrationSource {
    #[strum(serialize = "OOP")]
    Oop,
    #[strum(serialize = "user")]
    User,
    #[strum(serialize = "saved default")]
    SavedDefault,
}

/// The calibration currently in effect and where it came from.
///
/// Coefficients are interdependent, so the only way to change them is to
/// [`replace`](CalibrationModel::replace) the whole set.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationModel {
    calibration: Calibration,
    source: CalibrationSource,
}

impl CalibrationModel {
    pub fn new(calibration: Calibration, source: CalibrationSource) -> Self {
        Self {
            calibration,
            source,
        }
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn source(&self) -> CalibrationSource {
        self.source
    }

    /// Installs a new calibration. A null calibration from the OOP service is
    /// rejected and the previous one kept; returns whether it was installed.
    pub fn replace(&mut self, calibration: Calibration, source: CalibrationSource) -> bool {
        if source == CalibrationSource::Oop && calibration.is_null() {
            info!("OOP service declined to calibrate, keeping {} calibration", self.source);
            return false;
        }

        self.calibration = calibration;
        self.source = source;
        true
    }

    pub fn apply_all(&self, samples: &[Glucose]) -> Vec<Glucose> {
        samples
            .iter()
            .map(|g| self.calibration.calibrated(g))
            .collect()
    }
}

impl Default for CalibrationModel {
    fn default() -> Self {
        Self::new(Calibration::identity(), CalibrationSource::SavedDefault)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::{Calibration, CalibrationModel, CalibrationSource};
    use crate::glucose::{Glucose, GlucoseSource};

    #[test]
    fn linear_calibration_reduces_to_slope_and_offset() {
        let calibration = Calibration::linear(0.1, -20.0);
        assert_eq!(calibration.value(1500, 7000), 130);
        assert_eq!(calibration.value(1505, 0), 131);
        assert_eq!(calibration.value(0, 0), -20);
    }

    #[test]
    fn temperature_terms_contribute() {
        let calibration = Calibration {
            slope: 0.1,
            slope_slope: 0.000001,
            offset_offset: -10.0,
            slope_offset: 0.001,
            extra_slope: 2.0,
            extra_offset: 5.0,
            ..Calibration::default()
        };
        // slope = (0.1 + 0.01) * 2 = 0.22; offset = 10 - 10 + 5 = 5
        assert_eq!(calibration.value(1000, 10_000), 225);
    }

    #[test]
    fn calibrated_leaves_raw_fields() {
        let sample = Glucose::raw(
            10,
            datetime!(2024-01-01 0:00 UTC),
            1200,
            6000,
            -8,
            GlucoseSource::Fram,
        );
        let calibrated = Calibration::linear(0.1, 0.0).calibrated(&sample);
        assert_eq!(calibrated.value, Some(120));
        assert_eq!(calibrated.raw, 1200);
        assert_eq!(calibrated.raw_temperature, 6000);
        assert_eq!(sample.value, None);
    }

    #[test]
    fn deserializes_with_defaults() {
        let calibration: Calibration =
            serde_json::from_str(r#"{"slope_slope": 0.00001, "offset_offset": -20.5}"#)
                .expect("valid calibration json");
        assert_eq!(calibration.extra_slope, 1.0);
        assert_eq!(calibration.slope, 0.0);
        assert_eq!(calibration.offset_offset, -20.5);
        assert!(!calibration.is_null());
    }

    #[test]
    fn null_calibration_is_rejected_from_oop_only() {
        let mut model = CalibrationModel::default();
        assert!(Calibration::null().is_null());
        assert!(!model.replace(Calibration::null(), CalibrationSource::Oop));
        assert_eq!(model.calibration(), Calibration::identity());
        assert!(model.replace(Calibration::linear(0.11, -3.0), CalibrationSource::User));
        assert_eq!(model.source(), CalibrationSource::User);
        assert_eq!(model.calibration().slope, 0.11);
    }
}
