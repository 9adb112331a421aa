//! Boundary types for the remote OOP calibration service.
//!
//! The service itself is an external collaborator behind
//! [`CalibrationService`]; this module only builds requests and interprets
//! responses.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use time::{Duration, OffsetDateTime};

use crate::calibration::{Calibration, CalibrationModel, CalibrationSource};
use crate::codec::to_hex;
use crate::glucose::{Glucose, GlucoseSource};

#[derive(Debug)]
pub enum OopError {
    Json(serde_json::Error),
    /// The service answered with a non-zero error code.
    Service(i64),
    /// Transport-level failure reported by the service implementation.
    Unavailable(String),
}

impl core::fmt::Display for OopError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "invalid OOP response: {err}"),
            Self::Service(code) => write!(f, "OOP service error code {code}"),
            Self::Unavailable(reason) => write!(f, "OOP service unavailable: {reason}"),
        }
    }
}

impl std::error::Error for OopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::Service(_) | Self::Unavailable(_) => None,
        }
    }
}

impl From<serde_json::Error> for OopError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// What gets sent to the service: the raw image and the sensor identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OopRequest {
    /// Hex-encoded 344-byte memory image.
    pub content: String,
    #[serde(rename = "patchUid")]
    pub patch_uid: String,
    #[serde(rename = "patchInfo")]
    pub patch_info: String,
    #[serde(with = "time::serde::timestamp")]
    pub timestamp: OffsetDateTime,
}

impl OopRequest {
    pub fn new(fram: &[u8], patch_uid: &[u8], patch_info: &[u8], timestamp: OffsetDateTime) -> Self {
        Self {
            content: to_hex(fram),
            patch_uid: to_hex(patch_uid),
            patch_info: to_hex(patch_info),
            timestamp,
        }
    }

    pub fn to_json(&self) -> Result<String, OopError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `{errcode, slope}` calibration answer.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct OopCalibrationResponse {
    #[serde(default)]
    pub errcode: Option<i64>,
    #[serde(default)]
    pub slope: Option<Calibration>,
}

impl OopCalibrationResponse {
    pub fn from_json(json: &str) -> Result<Self, OopError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The coefficients, or why there are none.
    ///
    /// `Ok(None)` means the answer carried no slope object at all.
    pub fn calibration(&self) -> Result<Option<Calibration>, OopError> {
        match self.errcode {
            Some(code) if code != 0 => Err(OopError::Service(code)),
            _ => Ok(self.slope),
        }
    }

    /// Installs the returned coefficients, unless the service declined.
    pub fn install(&self, model: &mut CalibrationModel) -> Result<bool, OopError> {
        let Some(calibration) = self.calibration()? else {
            warn!("OOP calibration response had no slope object");
            return Ok(false);
        };
        Ok(model.replace(calibration, CalibrationSource::Oop))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendArrow {
    #[default]
    NotDetermined,
    FallingQuickly,
    Falling,
    Stable,
    Rising,
    RisingQuickly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    #[default]
    NotDetermined,
    LowGlucose,
    ProjectedLowGlucose,
    GlucoseOk,
    ProjectedHighGlucose,
    HighGlucose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OopGlucose {
    /// Minutes since sensor start.
    pub id: i32,
    #[serde(default)]
    pub value: i32,
    /// Non-zero when the service flags the reading as unreliable.
    #[serde(default)]
    pub quality: i32,
}

/// `{alarm, trendArrow, realTimeGlucose, historicGlucose[]}` history answer.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct OopHistoryResponse {
    #[serde(default)]
    pub alarm: Option<String>,
    #[serde(default, rename = "trendArrow")]
    pub trend_arrow: Option<String>,
    #[serde(default, rename = "realTimeGlucose")]
    pub real_time_glucose: Option<OopGlucose>,
    #[serde(default, rename = "historicGlucose")]
    pub historic_glucose: Vec<OopGlucose>,
}

impl OopHistoryResponse {
    pub fn from_json(json: &str) -> Result<Self, OopError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Unknown or missing strings read as `NotDetermined`.
    pub fn trend_arrow(&self) -> TrendArrow {
        self.trend_arrow
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn alarm(&self) -> AlarmState {
        self.alarm
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    /// Readings as [`Glucose`] records, most recent first.
    ///
    /// Dates are reconstructed from the sensor age at `read_at`.
    pub fn glucose(&self, sensor_age: u32, read_at: OffsetDateTime) -> Vec<Glucose> {
        let age = sensor_age as i32;
        let mut readings: Vec<Glucose> = self
            .real_time_glucose
            .iter()
            .chain(&self.historic_glucose)
            .filter(|g| g.value > 0)
            .map(|g| Glucose {
                has_error: g.quality != 0,
                ..Glucose::with_value(
                    g.id,
                    read_at - Duration::minutes(i64::from(age - g.id)),
                    g.value,
                    GlucoseSource::Oop,
                )
            })
            .collect();
        readings.sort_by(|a, b| b.id.cmp(&a.id));
        readings.dedup_by_key(|g| g.id);
        info!(
            "OOP history: {} readings, trend {}, alarm {}",
            readings.len(),
            self.trend_arrow(),
            self.alarm()
        );
        readings
    }
}

/// The remote calibration service.
pub trait CalibrationService {
    fn calibration(&mut self, request: &OopRequest) -> Result<OopCalibrationResponse, OopError>;

    fn history(&mut self, request: &OopRequest) -> Result<OopHistoryResponse, OopError>;
}

#[cfg(test)]
mod tests {
    use time::Duration;
    use time::macros::datetime;

    use super::{
        AlarmState, CalibrationService, OopCalibrationResponse, OopError, OopHistoryResponse,
        OopRequest, TrendArrow,
    };
    use crate::calibration::{Calibration, CalibrationModel, CalibrationSource};

    struct CannedService {
        calibration: &'static str,
        history: &'static str,
    }

    impl CalibrationService for CannedService {
        fn calibration(
            &mut self,
            _request: &OopRequest,
        ) -> Result<OopCalibrationResponse, OopError> {
            OopCalibrationResponse::from_json(self.calibration)
        }

        fn history(&mut self, _request: &OopRequest) -> Result<OopHistoryResponse, OopError> {
            OopHistoryResponse::from_json(self.history)
        }
    }

    fn request() -> OopRequest {
        OopRequest::new(
            &[0xDE, 0xAD],
            &[1, 2, 3, 4, 5, 6, 7, 8],
            &[0xDF, 0, 0, 1, 1, 2],
            datetime!(2024-03-01 12:00 UTC),
        )
    }

    #[test]
    fn request_serializes_hex_fields() {
        let json = request().to_json().expect("serialize");
        assert!(json.contains(r#""content":"dead""#), "{json}");
        assert!(json.contains(r#""patchUid":"0102030405060708""#), "{json}");
        assert!(json.contains(r#""timestamp":1709294400"#), "{json}");
    }

    #[test]
    fn installs_service_calibration() {
        let mut service = CannedService {
            calibration: r#"{"errcode": 0, "slope": {"slope_slope": 0.00001, "slope_offset": -0.0002, "offset_slope": 0.002, "offset_offset": -20.5}}"#,
            history: "{}",
        };
        let response = service.calibration(&request()).expect("response");
        let mut model = CalibrationModel::default();
        assert!(response.install(&mut model).expect("installed"));
        assert_eq!(model.source(), CalibrationSource::Oop);
        assert_eq!(model.calibration().offset_offset, -20.5);
        assert_eq!(model.calibration().extra_slope, 1.0);
    }

    #[test]
    fn null_calibration_keeps_previous() {
        let response = OopCalibrationResponse::from_json(
            r#"{"slope": {"slope_slope": 0.0, "slope_offset": 0.0, "offset_slope": 0.0, "offset_offset": -2.0}}"#,
        )
        .expect("parse");
        let mut model = CalibrationModel::new(Calibration::linear(0.1, 0.0), CalibrationSource::User);
        assert!(!response.install(&mut model).expect("no service error"));
        assert_eq!(model.source(), CalibrationSource::User);
    }

    #[test]
    fn error_code_surfaces() {
        let response = OopCalibrationResponse::from_json(r#"{"errcode": 4, "slope": null}"#)
            .expect("parse");
        assert!(matches!(response.calibration(), Err(OopError::Service(4))));
        assert!(OopCalibrationResponse::from_json("not json").is_err());
    }

    #[test]
    fn history_tolerates_missing_fields() {
        let empty = OopHistoryResponse::from_json("{}").expect("parse");
        assert_eq!(empty.trend_arrow(), TrendArrow::NotDetermined);
        assert_eq!(empty.alarm(), AlarmState::NotDetermined);
        assert!(empty.glucose(100, datetime!(2024-03-01 12:00 UTC)).is_empty());

        let odd = OopHistoryResponse::from_json(r#"{"trendArrow": "SIDEWAYS", "alarm": null}"#)
            .expect("parse");
        assert_eq!(odd.trend_arrow(), TrendArrow::NotDetermined);
    }

    #[test]
    fn history_converts_to_glucose() {
        let mut service = CannedService {
            calibration: "{}",
            history: r#"{
                "alarm": "GLUCOSE_OK",
                "trendArrow": "RISING",
                "realTimeGlucose": {"id": 4320, "value": 112, "quality": 0},
                "historicGlucose": [
                    {"id": 4290, "value": 98, "quality": 0},
                    {"id": 4305, "value": 104, "quality": 1},
                    {"id": 4275, "value": 0, "quality": 0}
                ]
            }"#,
        };
        let read_at = datetime!(2024-03-01 12:00 UTC);
        let response = service.history(&request()).expect("response");
        assert_eq!(response.trend_arrow(), TrendArrow::Rising);
        assert_eq!(response.alarm(), AlarmState::GlucoseOk);

        let readings = response.glucose(4320, read_at);
        let ids: Vec<i32> = readings.iter().map(|g| g.id).collect();
        assert_eq!(ids, [4320, 4305, 4290]);
        assert_eq!(readings[0].value, Some(112));
        assert!(readings[1].has_error);
        assert_eq!(readings[2].date, read_at - Duration::minutes(30));
        assert_eq!(readings[0].source.to_string(), "OOP");
    }
}
