use log::{debug, info};
use num_enum::TryFromPrimitive;
use time::OffsetDateTime;

use super::{
    FrameError, FrameEvent, ModelProfile, NORDIC_UART_READ, NORDIC_UART_SERVICE,
    NORDIC_UART_WRITE, Session, matches_uuid,
};
use crate::codec::{read_u16_be, to_hex};
use crate::config::{DecoderConfig, ResumeState};
use crate::fram::FRAM_LENGTH;

pub(super) const PROFILE: ModelProfile = ModelProfile {
    name: "MiaoMiao",
    service_uuid: NORDIC_UART_SERVICE,
    write_uuid: Some(NORDIC_UART_WRITE),
    read_uuid: NORDIC_UART_READ,
    extra_notify_uuids: &[],
};

const FRAME_LENGTH: usize = 363;
const FRAME_WITH_PATCH_INFO_LENGTH: usize = 369;
const FRAM_OFFSET: usize = 18;
const PATCH_INFO_OFFSET: usize = 363;
/// Assumed when older firmware does not send the patch info.
const DEFAULT_PATCH_INFO: [u8; 6] = [0xDF, 0x00, 0x00, 0x01, 0x01, 0x02];

const START_READING: u8 = 0xF0;
const CHANGE_FREQUENCY: u8 = 0xD1;
const ALLOW_NEW_SENSOR: [u8; 2] = [0xD3, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum ResponseType {
    DataPacket = 0x28,
    NewSensor = 0x32,
    NoSensor = 0x34,
    FrequencyChange = 0xD1,
}

#[derive(Debug, Clone)]
pub struct MiaoMiao {
    pub(super) session: Session,
}

impl MiaoMiao {
    pub fn new(resume: ResumeState, config: DecoderConfig) -> Self {
        Self {
            session: Session::new(resume, config),
        }
    }

    pub(super) fn start_read_command(&self, interval_minutes: u8) -> Vec<u8> {
        start_read_command(interval_minutes)
    }

    pub(super) fn on_data(
        &mut self,
        bytes: &[u8],
        characteristic: &str,
        read_at: OffsetDateTime,
    ) -> Result<FrameEvent, FrameError> {
        if !matches_uuid(characteristic, PROFILE.read_uuid) {
            debug!("MiaoMiao: ignoring notification on {characteristic}");
            return Ok(FrameEvent::StillAccumulating);
        }
        receive(&mut self.session, PROFILE.name, bytes, read_at)
    }
}

/// `0xF0`, preceded by a frequency change for the supported 1 and 3 minute
/// intervals.
pub(super) fn start_read_command(interval_minutes: u8) -> Vec<u8> {
    match interval_minutes {
        1 | 3 => vec![CHANGE_FREQUENCY, interval_minutes, START_READING],
        _ => vec![START_READING],
    }
}

/// Framing shared by every bridge speaking the MiaoMiao packet format.
pub(super) fn receive(
    session: &mut Session,
    model: &'static str,
    bytes: &[u8],
    read_at: OffsetDateTime,
) -> Result<FrameEvent, FrameError> {
    let Some(&marker) = bytes.first() else {
        return Ok(FrameEvent::StillAccumulating);
    };

    if session.buffer.is_idle() {
        let response =
            ResponseType::try_from(marker).map_err(|_| FrameError::UnknownResponse {
                model,
                marker: format!("{marker:02x}"),
            })?;

        match response {
            ResponseType::DataPacket => session.set_status(format!("{model}: receiving data")),
            ResponseType::NewSensor => {
                session.set_status(format!("{model}: new sensor detected"));
                session.commands.push_back(ALLOW_NEW_SENSOR.to_vec());
                session.commands.push_back(vec![START_READING]);
                return Ok(FrameEvent::NewSensor);
            }
            ResponseType::NoSensor => {
                session.set_status(format!("{model}: no sensor"));
                return Ok(FrameEvent::NoSensor);
            }
            ResponseType::FrequencyChange => {
                let outcome = if bytes.get(1) == Some(&0x01) {
                    "success"
                } else {
                    "failure"
                };
                session.set_status(format!("{model}: reading interval change {outcome}"));
                return Ok(FrameEvent::StillAccumulating);
            }
        }
    }

    session.buffer.push(bytes);
    let expected = expected_length(session.buffer.as_slice());
    let Some(frame) = session.buffer.take_frame(expected) else {
        debug!("{model}: buffered {} of {expected} bytes", session.buffer.len());
        return Ok(FrameEvent::StillAccumulating);
    };

    parse_frame(session, model, &frame, read_at)
}

/// The frame announces its own length; only the two known lengths are
/// accepted.
fn expected_length(buffer: &[u8]) -> usize {
    if buffer.len() >= 3 && usize::from(read_u16_be(buffer, 1)) == FRAME_WITH_PATCH_INFO_LENGTH {
        FRAME_WITH_PATCH_INFO_LENGTH
    } else {
        FRAME_LENGTH
    }
}

fn parse_frame(
    session: &mut Session,
    model: &'static str,
    frame: &[u8],
    read_at: OffsetDateTime,
) -> Result<FrameEvent, FrameError> {
    if frame.len() < FRAME_LENGTH {
        return Err(FrameError::Malformed("MiaoMiao frame shorter than 363 bytes"));
    }

    let age = read_u16_be(frame, 3);
    let uid = &frame[5..13];
    session.device.battery = Some(frame[13]);
    session.device.firmware = Some(to_hex(&frame[14..16]));
    session.device.hardware = Some(to_hex(&frame[16..18]));
    info!(
        "{model}: sensor age {age} min, uid {}, battery {}%, firmware {}, hardware {}",
        to_hex(uid),
        frame[13],
        to_hex(&frame[14..16]),
        to_hex(&frame[16..18])
    );

    if session.adopt_uid(uid) {
        info!("{model}: sensor changed");
    }
    match frame.get(PATCH_INFO_OFFSET..FRAME_WITH_PATCH_INFO_LENGTH) {
        Some(patch_info) => session.adopt_patch_info(patch_info),
        None if session.sensor_mut().patch_info().is_none() => {
            session.adopt_patch_info(&DEFAULT_PATCH_INFO)
        }
        None => {}
    }

    session.complete_fram(&frame[FRAM_OFFSET..FRAM_OFFSET + FRAM_LENGTH], true, read_at)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{DEFAULT_PATCH_INFO, start_read_command};
    use crate::config::{DecoderConfig, ResumeState};
    use crate::fram::tests::{READ_DATE, golden_fram};
    use crate::libre2::decrypt_fram;
    use crate::libre2::tests::{PATCH_INFO, UID};
    use crate::sensor::SensorType;
    use crate::transmitter::{FrameError, FrameEvent, Transmitter, TransmitterModel};

    const READ_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

    /// A complete MiaoMiao packet around `fram`.
    pub(crate) fn frame(fram: &[u8], patch_info: Option<&[u8]>) -> Vec<u8> {
        let length = 363 + patch_info.map_or(0, <[u8]>::len);
        let mut frame = vec![0x28];
        frame.extend_from_slice(&(length as u16).to_be_bytes());
        frame.extend_from_slice(&4320_u16.to_be_bytes());
        frame.extend_from_slice(&UID);
        frame.push(87);
        frame.extend_from_slice(&[0x00, 0x39]);
        frame.extend_from_slice(&[0x00, 0x01]);
        frame.extend_from_slice(fram);
        frame.push(0x29);
        if let Some(patch_info) = patch_info {
            frame.extend_from_slice(patch_info);
        }
        assert_eq!(frame.len(), length);
        frame
    }

    fn miaomiao() -> Transmitter {
        Transmitter::new(TransmitterModel::MiaoMiao, ResumeState::default(), DecoderConfig::default())
    }

    fn feed(transmitter: &mut Transmitter, stream: &[u8]) -> Vec<FrameEvent> {
        stream
            .chunks(20)
            .map(|chunk| {
                transmitter
                    .on_data_at(chunk, READ_UUID, READ_DATE)
                    .expect("valid notification")
            })
            .collect()
    }

    #[test]
    fn reassembles_fragmented_frame() {
        let mut transmitter = miaomiao();
        let events = feed(&mut transmitter, &frame(&golden_fram(), None));

        assert_eq!(events.len(), 19);
        let (last, rest) = events.split_last().expect("events");
        assert!(rest.iter().all(|e| *e == FrameEvent::StillAccumulating));
        let FrameEvent::FrameReady(sensor) = last else {
            panic!("expected a frame, got {last:?}");
        };
        assert_eq!(sensor.age(), 4320);
        assert_eq!(sensor.uid(), Some(UID.as_slice()));
        assert_eq!(sensor.patch_info(), Some(DEFAULT_PATCH_INFO.as_slice()));
        assert_eq!(sensor.sensor_type(), SensorType::Libre1);
        assert_eq!(sensor.trend().len(), 16);
        assert_eq!(transmitter.buffered(), 0);
        assert_eq!(transmitter.device_info().battery, Some(87));
        assert_eq!(transmitter.device_info().firmware.as_deref(), Some("0039"));
    }

    #[test]
    fn decrypts_frame_with_patch_info() {
        let encrypted =
            decrypt_fram(SensorType::Libre2, &UID, &PATCH_INFO, &golden_fram()).expect("encrypt");
        let mut transmitter = miaomiao();
        let events = feed(&mut transmitter, &frame(&encrypted, Some(&PATCH_INFO)));

        let ready: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, FrameEvent::FrameReady(_)))
            .collect();
        assert_eq!(ready.len(), 1);
        let sensor = transmitter.sensor().expect("sensor");
        assert_eq!(sensor.sensor_type(), SensorType::Libre2);
        assert_eq!(sensor.fram(), Some(golden_fram().as_slice()));
        assert_eq!(sensor.serial(), "3MH001DG75W");
        assert_eq!(
            transmitter.resume_state().patch_info.as_deref(),
            Some(PATCH_INFO.as_slice())
        );
    }

    #[test]
    fn status_responses() {
        let mut transmitter = miaomiao();
        assert_eq!(
            transmitter.on_data_at(&[0x34], READ_UUID, READ_DATE),
            Ok(FrameEvent::NoSensor)
        );
        assert_eq!(
            transmitter.on_data_at(&[0xD1, 0x01], READ_UUID, READ_DATE),
            Ok(FrameEvent::StillAccumulating)
        );
        assert!(transmitter.status().contains("success"));

        assert_eq!(
            transmitter.on_data_at(&[0x32], READ_UUID, READ_DATE),
            Ok(FrameEvent::NewSensor)
        );
        assert_eq!(transmitter.next_command(), Some(vec![0xD3, 0x01]));
        assert_eq!(transmitter.next_command(), Some(vec![0xF0]));
        assert_eq!(transmitter.next_command(), None);
    }

    #[test]
    fn unknown_response_resets_buffer() {
        let mut transmitter = miaomiao();
        let err = transmitter
            .on_data_at(&[0x55, 0x01], READ_UUID, READ_DATE)
            .expect_err("unknown");
        assert!(matches!(err, FrameError::UnknownResponse { .. }));
        assert!(transmitter.status().contains("unknown response 55"));

        let events = feed(&mut transmitter, &frame(&golden_fram(), None));
        assert!(matches!(events.last(), Some(FrameEvent::FrameReady(_))));
    }

    #[test]
    fn start_commands() {
        assert_eq!(start_read_command(1), vec![0xD1, 0x01, 0xF0]);
        assert_eq!(start_read_command(3), vec![0xD1, 0x03, 0xF0]);
        assert_eq!(start_read_command(5), vec![0xF0]);
    }
}
