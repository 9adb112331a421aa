//! Text protocol: each notification is one whitespace separated line.
//!
//! `<raw><type> <error code> <battery> <age / 10>`, where `<type>` is a
//! two-digit sensor generation code.

use log::{debug, warn};
use time::OffsetDateTime;

use super::{FrameError, FrameEvent, ModelProfile, Session, matches_uuid};
use crate::config::{DecoderConfig, ResumeState};
use crate::glucose::{Glucose, GlucoseSource};
use crate::sensor::{SensorState, SensorType};

pub(super) const PROFILE: ModelProfile = ModelProfile {
    name: "Limitter",
    service_uuid: "C97433F0-BE8F-4DC8-B6F0-5343E6100EB4",
    write_uuid: Some("C97433F1-BE8F-4DC8-B6F0-5343E6100EB4"),
    read_uuid: "C97433F2-BE8F-4DC8-B6F0-5343E6100EB4",
    extra_notify_uuids: &[],
};

/// Sensors older than 14.5 days are expired.
const MAX_SENSOR_AGE_MINUTES: u32 = 14 * 24 * 60 + 12 * 60;

#[derive(Debug, Clone)]
pub struct Limitter {
    pub(super) session: Session,
}

impl Limitter {
    pub fn new(resume: ResumeState, config: DecoderConfig) -> Self {
        Self {
            session: Session::new(resume, config),
        }
    }

    pub(super) fn on_data(
        &mut self,
        bytes: &[u8],
        characteristic: &str,
        read_at: OffsetDateTime,
    ) -> Result<FrameEvent, FrameError> {
        if !matches_uuid(characteristic, PROFILE.read_uuid) {
            debug!("Limitter: ignoring notification on {characteristic}");
            return Ok(FrameEvent::StillAccumulating);
        }

        let line = String::from_utf8_lossy(bytes);
        debug!("Limitter: {}", line.trim());
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(&value) = fields.first() else {
            return Ok(FrameEvent::StillAccumulating);
        };

        if value.starts_with("000") {
            self.session.set_status("Limitter: no sensor data");
            return Ok(FrameEvent::NoSensor);
        }
        if value.ends_with("999") {
            let code = fields.get(1).copied().unwrap_or("?");
            return Err(FrameError::Device(format!("Limitter error code {code}")));
        }
        if fields.len() < 4 || value.len() < 3 || !value.is_ascii() {
            return Err(FrameError::Malformed("Limitter line needs four fields"));
        }

        let (raw, type_code) = value.split_at(value.len() - 2);
        let raw: u32 = raw
            .parse()
            .map_err(|_| FrameError::Malformed("Limitter raw value is not a number"))?;
        let sensor_type = match type_code {
            "10" | "20" => SensorType::Libre1,
            "30" => SensorType::LibreUS14day,
            "40" => SensorType::LibreProH,
            other => {
                warn!("Limitter: unknown sensor type code {other}");
                SensorType::Unknown
            }
        };
        let battery: u8 = fields[2]
            .parse()
            .map_err(|_| FrameError::Malformed("Limitter battery is not a number"))?;
        let age: u32 = fields[3]
            .parse::<u32>()
            .map_err(|_| FrameError::Malformed("Limitter age is not a number"))?
            .saturating_mul(10);

        self.session.device.battery = Some(battery.min(100));
        if let Some(tag) = sensor_type.patch_info_tag() {
            self.session.adopt_patch_info(&tag);
        }

        let sensor = self.session.sensor_mut();
        sensor.set_age(age);
        sensor.set_state(if age < MAX_SENSOR_AGE_MINUTES {
            SensorState::Ready
        } else {
            SensorState::Expired
        });
        let reading = Glucose::raw(age as i32, read_at, raw, 0, 0, GlucoseSource::Bridge);
        sensor.set_readings(vec![reading], Vec::new(), read_at);
        let snapshot = Box::new(sensor.clone());

        self.session
            .set_status(format!("Limitter: raw {raw}, battery {battery}%, age {age} min"));
        Ok(FrameEvent::FrameReady(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{DecoderConfig, ResumeState};
    use crate::fram::tests::READ_DATE;
    use crate::sensor::{SensorState, SensorType};
    use crate::transmitter::{FrameError, FrameEvent, Transmitter, TransmitterModel};

    const READ_UUID: &str = "C97433F2-BE8F-4DC8-B6F0-5343E6100EB4";

    fn limitter() -> Transmitter {
        Transmitter::new(TransmitterModel::Limitter, ResumeState::default(), DecoderConfig::default())
    }

    #[test]
    fn parses_reading_line() {
        let mut transmitter = limitter();
        let event = transmitter
            .on_data_at(b"165030 0 87 1440\r\n", READ_UUID, READ_DATE)
            .expect("valid line");
        let FrameEvent::FrameReady(sensor) = event else {
            panic!("expected a reading");
        };
        assert_eq!(sensor.sensor_type(), SensorType::LibreUS14day);
        assert_eq!(sensor.age(), 14400);
        assert_eq!(sensor.state(), SensorState::Ready);
        assert_eq!(sensor.trend()[0].raw, 1650);
        assert_eq!(transmitter.device_info().battery, Some(87));
    }

    #[test]
    fn old_sensor_is_expired() {
        let mut transmitter = limitter();
        transmitter
            .on_data_at(b"120010 0 50 2100", READ_UUID, READ_DATE)
            .expect("valid line");
        let sensor = transmitter.sensor().expect("sensor");
        assert_eq!(sensor.state(), SensorState::Expired);
        assert_eq!(sensor.sensor_type(), SensorType::Libre1);
    }

    #[test]
    fn no_data_and_errors() {
        let mut transmitter = limitter();
        assert_eq!(
            transmitter.on_data_at(b"000999 0 50 0", READ_UUID, READ_DATE),
            Ok(FrameEvent::NoSensor)
        );
        assert_eq!(
            transmitter.on_data_at(b"123999 7 50 0", READ_UUID, READ_DATE),
            Err(FrameError::Device("Limitter error code 7".into()))
        );
        assert!(matches!(
            transmitter.on_data_at(b"123410 x", READ_UUID, READ_DATE),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn non_ascii_value_is_malformed() {
        let mut transmitter = limitter();
        for line in [&b"1\xff0 0 50 10"[..], "12é10 0 50 10".as_bytes()] {
            assert!(matches!(
                transmitter.on_data_at(line, READ_UUID, READ_DATE),
                Err(FrameError::Malformed(_))
            ));
        }
        assert!(transmitter.sensor().is_none());
    }
}
