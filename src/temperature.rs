//! Factory temperature compensation.

use crate::codec::read_bits;
use crate::glucose::Glucose;

const FOOTER_CALIBRATION_OFFSET: usize = 0x150;

/// Scaled thermistor reference.
const THERMISTOR_SCALE: f64 = 1000.0 + 71500.0;
const THERMISTOR_OFFSET: f64 = 1000.0;

// Steinhart-Hart style cubic in ln(R).
const CA: f64 = 0.0009180023;
const CB: f64 = 0.0001964561;
const CC: f64 = 0.0000007061775;
const CD: f64 = 0.00000005283566;

/// Factory calibration constants stored in the memory image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationInfo {
    pub i1: u32,
    pub i2: u32,
    pub i3: i32,
    pub i4: u32,
    pub i5: u32,
    pub i6: u32,
}

impl CalibrationInfo {
    pub fn from_fram(fram: &[u8]) -> Self {
        let mut i3 = read_bits(fram, FOOTER_CALIBRATION_OFFSET, 0, 8) as i32;
        if read_bits(fram, FOOTER_CALIBRATION_OFFSET, 0x21, 1) != 0 {
            i3 = -i3;
        }

        Self {
            i1: read_bits(fram, 2, 0, 3),
            i2: read_bits(fram, 2, 3, 0xa),
            i3,
            i4: read_bits(fram, FOOTER_CALIBRATION_OFFSET, 8, 0xe),
            i5: read_bits(fram, FOOTER_CALIBRATION_OFFSET, 0x28, 0xc) << 2,
            i6: read_bits(fram, FOOTER_CALIBRATION_OFFSET, 0x34, 0xc) << 2,
        }
    }
}

/// Temperature in °C for a raw temperature reading, or `None` when the
/// constants give a non-physical resistance.
pub fn temperature(raw_temperature: u32, temperature_adjustment: i32, info: &CalibrationInfo) -> Option<f64> {
    let denominator = f64::from(temperature_adjustment) + f64::from(info.i6);
    if denominator == 0.0 {
        return None;
    }

    let resistance = f64::from(raw_temperature) * THERMISTOR_SCALE / denominator - THERMISTOR_OFFSET;
    if resistance <= 0.0 {
        return None;
    }

    let ln_r = resistance.ln();
    let d = CD * ln_r.powi(3) + CC * ln_r.powi(2) + CB * ln_r + CA;
    Some(1.0 / d - 273.15)
}

/// Copy of `sample` with its temperature derived from the factory constants.
///
/// `value` is only scaled from `raw`; converting raw counts to mg/dL is left
/// to the OOP service or a [`Calibration`](crate::calibration::Calibration).
pub fn factory_glucose(sample: &Glucose, info: &CalibrationInfo) -> Glucose {
    Glucose {
        value: Some(sample.raw as i32 * 10),
        temperature: temperature(sample.raw_temperature, sample.temperature_adjustment, info),
        ..sample.clone()
    }
}
