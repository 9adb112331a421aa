use log::{debug, info, warn};
use time::OffsetDateTime;

use super::{FrameError, FrameEvent, ModelProfile, Session, matches_uuid};
use crate::codec::to_hex;
use crate::config::{DecoderConfig, ResumeState};
use crate::libre2::{BLE_PACKET_LENGTH, decrypt_ble, parse_ble_data, streaming_unlock_payload};
use crate::sensor::SensorState;

pub(super) const PROFILE: ModelProfile = ModelProfile {
    name: "Libre 2",
    service_uuid: "0000FDE3-0000-1000-8000-00805F9B34FB",
    write_uuid: Some(LOGIN_UUID),
    read_uuid: COMPOSITE_RAW_DATA_UUID,
    extra_notify_uuids: &[],
};

const LOGIN_UUID: &str = "0000F001-0000-1000-8000-00805F9B34FB";
const COMPOSITE_RAW_DATA_UUID: &str = "0000F002-0000-1000-8000-00805F9B34FB";

/// A Libre 2 sensor streaming its own encrypted packets.
///
/// The packet arrives as 20 + 18 + 8 byte notifications.
#[derive(Debug, Clone)]
pub struct Abbott {
    pub(super) session: Session,
}

impl Abbott {
    pub fn new(resume: ResumeState, config: DecoderConfig) -> Self {
        Self {
            session: Session::new(resume, config),
        }
    }

    /// Unlock payload for this connection. Consumes one unlock count.
    pub(super) fn start_read_command(&mut self) -> Option<Vec<u8>> {
        let resume = &mut self.session.resume;
        let (Some(uid), Some(patch_info)) = (resume.patch_uid.as_deref(), resume.patch_info.as_deref())
        else {
            self.session
                .set_status("Libre 2: sensor must be scanned before streaming can be enabled");
            return None;
        };

        let count = resume.unlock_count.wrapping_add(1);
        match streaming_unlock_payload(uid, patch_info, resume.activation_time, count) {
            Ok(payload) => {
                resume.unlock_count = count;
                info!("Libre 2: unlock payload #{count}: {}", to_hex(&payload));
                Some(payload.to_vec())
            }
            Err(err) => {
                self.session.set_status(format!("Libre 2: cannot unlock: {err}"));
                None
            }
        }
    }

    pub(super) fn on_data(
        &mut self,
        bytes: &[u8],
        characteristic: &str,
        read_at: OffsetDateTime,
    ) -> Result<FrameEvent, FrameError> {
        if !matches_uuid(characteristic, COMPOSITE_RAW_DATA_UUID) {
            debug!("Libre 2: {} on {characteristic}", to_hex(bytes));
            return Ok(FrameEvent::StillAccumulating);
        }

        self.session.buffer.push(bytes);
        let Some(packet) = self.session.buffer.take_frame(BLE_PACKET_LENGTH) else {
            debug!(
                "Libre 2: buffered {} of {BLE_PACKET_LENGTH} bytes",
                self.session.buffer.len()
            );
            return Ok(FrameEvent::StillAccumulating);
        };

        let uid = self
            .session
            .resume
            .patch_uid
            .clone()
            .ok_or(FrameError::UnknownSensor)?;
        let payload = decrypt_ble(&uid, &packet).inspect_err(|err| {
            warn!("Libre 2: dropping packet: {err}");
        })?;
        let reading = parse_ble_data(&payload, read_at, self.session.config.ble_history_delay_minutes)?;
        if !reading.crc_ok {
            self.session.set_status("Libre 2: BLE packet CRC failed");
        } else {
            self.session.set_status("Libre 2: BLE packet received");
        }

        let sensor = self.session.sensor_mut();
        sensor.set_age(reading.wear_time);
        sensor.set_state(SensorState::Ready);
        sensor.set_readings(reading.trend, reading.history, read_at);
        info!(
            "Libre 2: wear time {} min, latest raw {}",
            reading.wear_time,
            sensor.trend().first().map_or(0, |g| g.raw)
        );
        Ok(FrameEvent::FrameReady(Box::new(sensor.clone())))
    }
}
