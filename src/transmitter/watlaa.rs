//! Watch-strap relay. Forwards MiaoMiao frames on its data characteristic
//! and exposes its own settings on further characteristics.

use log::{debug, info};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;
use time::{Duration, OffsetDateTime};

use super::miaomiao::{self, MiaoMiao};
use super::{FrameError, FrameEvent, ModelProfile, matches_uuid};
use crate::calibration::Calibration;
use crate::codec::read_u16_le;
use crate::config::{DecoderConfig, ResumeState};
use crate::glucose::{Glucose, GlucoseSource};

const DATA_UUID: &str = "00001011-1212-EFDE-0137-875F45AC0113";
const LAST_GLUCOSE_UUID: &str = "00001012-1212-EFDE-0137-875F45AC0113";
const CALIBRATION_UUID: &str = "00001014-1212-EFDE-0137-875F45AC0113";
const GLUCOSE_UNIT_UUID: &str = "00001015-1212-EFDE-0137-875F45AC0113";
const ALERT_SETTINGS_UUID: &str = "00001016-1212-EFDE-0137-875F45AC0113";
const BRIDGE_STATUS_UUID: &str = "00001019-1212-EFDE-0137-875F45AC0113";

pub(super) const PROFILE: ModelProfile = ModelProfile {
    name: "Watlaa",
    service_uuid: "00001010-1212-EFDE-0137-875F45AC0113",
    write_uuid: Some(DATA_UUID),
    read_uuid: DATA_UUID,
    extra_notify_uuids: &[
        LAST_GLUCOSE_UUID,
        CALIBRATION_UUID,
        GLUCOSE_UNIT_UUID,
        ALERT_SETTINGS_UUID,
        BRIDGE_STATUS_UUID,
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Display)]
#[repr(u8)]
pub enum GlucoseUnit {
    #[strum(serialize = "mg/dL")]
    MgDl = 0,
    #[strum(serialize = "mmol/L")]
    MmolL = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Display)]
#[repr(u8)]
pub enum BridgeStatus {
    #[strum(serialize = "not ready")]
    NotReady = 0,
    #[strum(serialize = "ready")]
    Ready = 1,
    #[strum(serialize = "no sensor")]
    NoSensor = 2,
}

/// Alarm thresholds in mg/dL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertThresholds {
    pub low: u16,
    pub high: u16,
}

#[derive(Debug, Clone)]
pub struct Watlaa {
    pub(super) inner: MiaoMiao,
    last_glucose: Option<Glucose>,
    calibration: Option<Calibration>,
    unit: Option<GlucoseUnit>,
    alerts: Option<AlertThresholds>,
    bridge_status: Option<BridgeStatus>,
}

impl Watlaa {
    pub fn new(resume: ResumeState, config: DecoderConfig) -> Self {
        Self {
            inner: MiaoMiao::new(resume, config),
            last_glucose: None,
            calibration: None,
            unit: None,
            alerts: None,
            bridge_status: None,
        }
    }

    /// Latest value computed by the watch itself.
    pub fn last_glucose(&self) -> Option<&Glucose> {
        self.last_glucose.as_ref()
    }

    /// Linear calibration configured on the watch.
    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn unit(&self) -> Option<GlucoseUnit> {
        self.unit
    }

    pub fn alerts(&self) -> Option<AlertThresholds> {
        self.alerts
    }

    pub fn bridge_status(&self) -> Option<BridgeStatus> {
        self.bridge_status
    }

    pub(super) fn start_read_command(&self, interval_minutes: u8) -> Vec<u8> {
        miaomiao::start_read_command(interval_minutes)
    }

    pub(super) fn on_data(
        &mut self,
        bytes: &[u8],
        characteristic: &str,
        read_at: OffsetDateTime,
    ) -> Result<FrameEvent, FrameError> {
        if matches_uuid(characteristic, DATA_UUID) {
            return miaomiao::receive(&mut self.inner.session, PROFILE.name, bytes, read_at);
        }

        if matches_uuid(characteristic, LAST_GLUCOSE_UUID) {
            self.on_last_glucose(bytes, read_at)?;
        } else if matches_uuid(characteristic, CALIBRATION_UUID) {
            let calibration = bytes
                .get(..8)
                .map(|b| {
                    let slope = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    let intercept = f32::from_le_bytes([b[4], b[5], b[6], b[7]]);
                    Calibration::linear(f64::from(slope), f64::from(intercept))
                })
                .ok_or(FrameError::Malformed("Watlaa calibration needs 8 bytes"))?;
            info!(
                "Watlaa: calibration slope {}, intercept {}",
                calibration.slope, calibration.offset
            );
            self.calibration = Some(calibration);
        } else if matches_uuid(characteristic, GLUCOSE_UNIT_UUID) {
            let unit = GlucoseUnit::try_from(bytes[0])
                .map_err(|_| FrameError::Malformed("Watlaa glucose unit out of range"))?;
            info!("Watlaa: unit {unit}");
            self.unit = Some(unit);
        } else if matches_uuid(characteristic, ALERT_SETTINGS_UUID) {
            if bytes.len() < 4 {
                return Err(FrameError::Malformed("Watlaa alert settings need 4 bytes"));
            }
            let alerts = AlertThresholds {
                low: read_u16_le(bytes, 0),
                high: read_u16_le(bytes, 2),
            };
            info!("Watlaa: alerts below {} and above {}", alerts.low, alerts.high);
            self.alerts = Some(alerts);
        } else if matches_uuid(characteristic, BRIDGE_STATUS_UUID) {
            let status = BridgeStatus::try_from(bytes[0])
                .map_err(|_| FrameError::Malformed("Watlaa bridge status out of range"))?;
            self.inner.session.set_status(format!("Watlaa: {status}"));
            self.bridge_status = Some(status);
        } else {
            debug!("Watlaa: ignoring notification on {characteristic}");
        }

        Ok(FrameEvent::StillAccumulating)
    }

    /// `u16` value in mg/dL followed by its age in minutes.
    fn on_last_glucose(&mut self, bytes: &[u8], read_at: OffsetDateTime) -> Result<(), FrameError> {
        if bytes.len() < 4 {
            return Err(FrameError::Malformed("Watlaa last glucose needs 4 bytes"));
        }
        let value = read_u16_le(bytes, 0);
        let minutes_ago = i32::from(read_u16_le(bytes, 2));
        let sensor_age = self
            .inner
            .session
            .sensor
            .as_ref()
            .map_or(0, |s| s.age() as i32);

        self.last_glucose = Some(Glucose::with_value(
            sensor_age - minutes_ago,
            read_at - Duration::minutes(i64::from(minutes_ago)),
            i32::from(value),
            GlucoseSource::Bridge,
        ));
        info!("Watlaa: last glucose {value} mg/dL, {minutes_ago} min ago");
        Ok(())
    }
}
