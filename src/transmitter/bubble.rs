use log::{debug, info};
use num_enum::TryFromPrimitive;
use time::OffsetDateTime;

use super::{
    FrameError, FrameEvent, ModelProfile, NORDIC_UART_READ, NORDIC_UART_SERVICE,
    NORDIC_UART_WRITE, Session, matches_uuid,
};
use crate::codec::to_hex;
use crate::config::{DecoderConfig, ResumeState};
use crate::fram::FRAM_LENGTH;
use crate::sensor::SensorType;

pub(super) const PROFILE: ModelProfile = ModelProfile {
    name: "Bubble",
    service_uuid: NORDIC_UART_SERVICE,
    write_uuid: Some(NORDIC_UART_WRITE),
    read_uuid: NORDIC_UART_READ,
    extra_notify_uuids: &[],
};

const PACKET_HEADER_LENGTH: usize = 4;
const DECRYPTED_DATA_FIRMWARE: (u8, u8) = (2, 6);
const LONG_PATCH_INFO_FIRMWARE: (u8, u8) = (1, 35);

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum ResponseType {
    DataInfo = 0x80,
    DataPacket = 0x82,
    DecryptedDataPacket = 0x88,
    SecurityChallenge = 0x8A,
    NoSensor = 0xBF,
    SerialNumber = 0xC0,
    PatchInfo = 0xC1,
}

#[derive(Debug, Clone)]
pub struct Bubble {
    pub(super) session: Session,
    firmware: Option<(u8, u8)>,
}

impl Bubble {
    pub fn new(resume: ResumeState, config: DecoderConfig) -> Self {
        Self {
            session: Session::new(resume, config),
            firmware: None,
        }
    }

    pub(super) fn start_read_command(&self, interval_minutes: u8) -> Vec<u8> {
        vec![0x00, 0x00, interval_minutes]
    }

    pub(super) fn on_data(
        &mut self,
        bytes: &[u8],
        characteristic: &str,
        read_at: OffsetDateTime,
    ) -> Result<FrameEvent, FrameError> {
        if !matches_uuid(characteristic, PROFILE.read_uuid) {
            debug!("Bubble: ignoring notification on {characteristic}");
            return Ok(FrameEvent::StillAccumulating);
        }
        let Some(&marker) = bytes.first() else {
            return Ok(FrameEvent::StillAccumulating);
        };

        let response = ResponseType::try_from(marker).map_err(|_| FrameError::UnknownResponse {
            model: PROFILE.name,
            marker: format!("{marker:02x}"),
        })?;

        match response {
            ResponseType::DataInfo => {
                self.data_info(bytes)?;
                Ok(FrameEvent::StillAccumulating)
            }
            ResponseType::SerialNumber => {
                let uid = bytes
                    .get(2..10)
                    .ok_or(FrameError::Malformed("Bubble serial response shorter than 10 bytes"))?;
                self.session.buffer.clear();
                let changed = self.session.adopt_uid(uid);
                self.session.set_status(format!("Bubble: sensor uid {}", to_hex(uid)));
                Ok(if changed {
                    FrameEvent::NewSensor
                } else {
                    FrameEvent::StillAccumulating
                })
            }
            ResponseType::PatchInfo => {
                let range = if self.firmware.is_some_and(|fw| fw < LONG_PATCH_INFO_FIRMWARE) {
                    3..9
                } else {
                    5..11
                };
                let patch_info = bytes
                    .get(range)
                    .ok_or(FrameError::Malformed("Bubble patch info response too short"))?;
                self.session.adopt_patch_info(patch_info);
                info!("Bubble: patch info {}", to_hex(patch_info));
                Ok(FrameEvent::StillAccumulating)
            }
            ResponseType::NoSensor => {
                self.session.buffer.clear();
                self.session.set_status("Bubble: no sensor");
                Ok(FrameEvent::NoSensor)
            }
            ResponseType::SecurityChallenge => {
                self.session.set_status("Bubble: security challenge received");
                Ok(FrameEvent::StillAccumulating)
            }
            ResponseType::DataPacket => self.data_packet(bytes, true, read_at),
            ResponseType::DecryptedDataPacket => self.data_packet(bytes, false, read_at),
        }
    }

    /// Battery and versions; also acknowledges so the bubble starts sending.
    fn data_info(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        if bytes.len() < 6 {
            return Err(FrameError::Malformed("Bubble data info shorter than 6 bytes"));
        }

        let firmware = (bytes[2], bytes[3]);
        let hardware = &bytes[bytes.len() - 2..];
        self.firmware = Some(firmware);
        self.session.device.battery = Some(bytes[4]);
        self.session.device.firmware = Some(format!("{}.{}", firmware.0, firmware.1));
        self.session.device.hardware = Some(format!("{}.{}", hardware[0], hardware[1]));
        self.session.buffer.clear();
        self.session.set_status(format!(
            "Bubble: battery {}%, firmware {}.{}",
            bytes[4], firmware.0, firmware.1
        ));

        let sensor_type = self
            .session
            .sensor
            .as_ref()
            .map_or(SensorType::Unknown, |s| s.sensor_type());
        let wants_decrypted = firmware >= DECRYPTED_DATA_FIRMWARE
            && matches!(sensor_type, SensorType::Libre2 | SensorType::LibreUS14day);
        let request = if wants_decrypted { 0x08 } else { 0x02 };
        self.session
            .commands
            .push_back(vec![request, 0x01, 0x00, 0x00, 0x00, 0x2B]);
        Ok(())
    }

    fn data_packet(
        &mut self,
        bytes: &[u8],
        encrypted: bool,
        read_at: OffsetDateTime,
    ) -> Result<FrameEvent, FrameError> {
        self.session
            .buffer
            .push(bytes.get(PACKET_HEADER_LENGTH..).unwrap_or_default());
        let Some(fram) = self.session.buffer.take_frame(FRAM_LENGTH) else {
            debug!("Bubble: buffered {} of {FRAM_LENGTH} bytes", self.session.buffer.len());
            return Ok(FrameEvent::StillAccumulating);
        };
        self.session.complete_fram(&fram, encrypted, read_at)
    }
}
