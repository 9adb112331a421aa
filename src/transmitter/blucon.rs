//! Challenge/response protocol: every response dispatches the next request.
//!
//! The bridge firmware expects exactly this order:
//! wakeup, sensor info, ack, firmware, battery, patch info, patch uid,
//! FRAM, sleep.

use log::{debug, info, warn};
use time::OffsetDateTime;

use super::{FrameError, FrameEvent, ModelProfile, Session, matches_uuid};
use crate::codec::to_hex;
use crate::config::{DecoderConfig, ResumeState};
use crate::fram::FRAM_LENGTH;

pub(super) const PROFILE: ModelProfile = ModelProfile {
    name: "BluCon",
    service_uuid: "436A62C0-082E-4CE8-A08B-01D81F195B24",
    write_uuid: Some("436A0C82-082E-4CE8-A08B-01D81F195B24"),
    read_uuid: "436AA6E9-082E-4CE8-A08B-01D81F195B24",
    extra_notify_uuids: &[],
};

const MULTIPLE_BLOCK_HEADER_LENGTH: usize = 4;

/// Response prefixes. Longer prefixes come first so they win over shorter
/// ones sharing a head.
const RESPONSES: [(&[u8], Response); 10] = [
    (&[0x8b, 0x1a, 0x02, 0x00, 0x14], Response::Timeout),
    (&[0x8b, 0x1a, 0x02, 0x00, 0x0f], Response::NoSensor),
    (&[0x8b, 0x0a, 0x00], Response::Ack),
    (&[0xcb, 0x01, 0x00, 0x00], Response::Wakeup),
    (&[0x8b, 0x0e], Response::PatchUidInfo),
    (&[0x8b, 0xd9], Response::SensorInfo),
    (&[0x8b, 0xda], Response::Battery),
    (&[0x8b, 0xdb], Response::Firmware),
    (&[0x8b, 0xde], Response::SingleBlock),
    (&[0x8b, 0xdf], Response::MultipleBlock),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Response {
    Ack,
    PatchUidInfo,
    Timeout,
    Wakeup,
    NoSensor,
    SensorInfo,
    Battery,
    Firmware,
    SingleBlock,
    MultipleBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Ack,
    Sleep,
    SensorInfo,
    Fram,
    Battery,
    Firmware,
    PatchUid,
    PatchInfo,
}

impl Request {
    fn bytes(self) -> &'static [u8] {
        match self {
            Self::Ack => &[0x81, 0x0a, 0x00],
            Self::Sleep => &[0x01, 0x0c, 0x0e, 0x00],
            Self::SensorInfo => &[0x01, 0x0d, 0x09, 0x00],
            Self::Fram => &[0x01, 0x0d, 0x0f, 0x02, 0x00, 0x2b],
            Self::Battery => &[0x01, 0x0d, 0x0a, 0x00],
            Self::Firmware => &[0x01, 0x0d, 0x0b, 0x00],
            Self::PatchUid => &[0x01, 0x0e, 0x00, 0x03, 0x26, 0x01, 0x00],
            Self::PatchInfo => &[0x01, 0x0e, 0x00, 0x03, 0x02, 0xa1, 0x07],
        }
    }
}

/// Where the linear sequence currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluConStep {
    AwaitingWakeup,
    AwaitingSensorInfo,
    AwaitingAck,
    AwaitingFirmware,
    AwaitingBattery,
    AwaitingPatchInfo,
    AwaitingPatchUid,
    ReadingFram,
    Sleeping,
}

#[derive(Debug, Clone)]
pub struct BluCon {
    pub(super) session: Session,
    step: BluConStep,
}

impl BluCon {
    pub fn new(resume: ResumeState, config: DecoderConfig) -> Self {
        Self {
            session: Session::new(resume, config),
            step: BluConStep::AwaitingWakeup,
        }
    }

    pub fn step(&self) -> BluConStep {
        self.step
    }

    pub(super) fn restart(&mut self) {
        self.step = BluConStep::AwaitingWakeup;
    }

    pub(super) fn on_data(
        &mut self,
        bytes: &[u8],
        characteristic: &str,
        read_at: OffsetDateTime,
    ) -> Result<FrameEvent, FrameError> {
        if !matches_uuid(characteristic, PROFILE.read_uuid) {
            debug!("BluCon: ignoring notification on {characteristic}");
            return Ok(FrameEvent::StillAccumulating);
        }

        let Some(&(_, response)) = RESPONSES.iter().find(|(prefix, _)| bytes.starts_with(prefix))
        else {
            return Err(FrameError::UnknownResponse {
                model: PROFILE.name,
                marker: to_hex(bytes),
            });
        };
        debug!("BluCon: {response:?} in step {:?}", self.step);

        match response {
            Response::Wakeup => {
                self.session.buffer.clear();
                self.session.set_status("BluCon: woke up");
                self.advance(BluConStep::AwaitingSensorInfo, Request::SensorInfo);
            }
            Response::SensorInfo => {
                info!("BluCon: sensor info {}", to_hex(&bytes[2..]));
                self.advance(BluConStep::AwaitingAck, Request::Ack);
            }
            Response::Ack => self.advance(BluConStep::AwaitingFirmware, Request::Firmware),
            Response::Firmware => {
                let firmware = String::from_utf8_lossy(&bytes[2..]).trim_matches('\0').to_string();
                self.session.device.firmware = Some(firmware);
                self.advance(BluConStep::AwaitingBattery, Request::Battery);
            }
            Response::Battery => {
                self.session.device.battery = bytes.get(2).map(|&b| b.min(100));
                self.advance(BluConStep::AwaitingPatchInfo, Request::PatchInfo);
            }
            Response::PatchUidInfo => return self.patch_uid_info(bytes),
            Response::MultipleBlock => return self.fram_block(bytes, read_at),
            Response::SingleBlock => {
                debug!("BluCon: unsolicited single block {}", to_hex(&bytes[2..]));
            }
            Response::Timeout => {
                warn!("BluCon: sensor read timed out");
                self.sleep("BluCon: timeout");
            }
            Response::NoSensor => {
                self.sleep("BluCon: no sensor");
                return Ok(FrameEvent::NoSensor);
            }
        }
        Ok(FrameEvent::StillAccumulating)
    }

    /// Patch info and patch uid answers share a prefix; the step tells them
    /// apart.
    fn patch_uid_info(&mut self, bytes: &[u8]) -> Result<FrameEvent, FrameError> {
        match self.step {
            BluConStep::AwaitingPatchInfo => {
                let patch_info = bytes
                    .get(3..9)
                    .ok_or(FrameError::Malformed("BluCon patch info response too short"))?;
                self.session.adopt_patch_info(patch_info);
                self.advance(BluConStep::AwaitingPatchUid, Request::PatchUid);
                Ok(FrameEvent::StillAccumulating)
            }
            BluConStep::AwaitingPatchUid => {
                let uid = bytes
                    .get(4..12)
                    .ok_or(FrameError::Malformed("BluCon patch uid response too short"))?;
                let changed = self.session.adopt_uid(uid);
                self.session.set_status(format!("BluCon: sensor uid {}", to_hex(uid)));
                self.advance(BluConStep::ReadingFram, Request::Fram);
                Ok(if changed {
                    FrameEvent::NewSensor
                } else {
                    FrameEvent::StillAccumulating
                })
            }
            step => {
                warn!("BluCon: patch response out of sequence in {step:?}");
                Ok(FrameEvent::StillAccumulating)
            }
        }
    }

    fn fram_block(&mut self, bytes: &[u8], read_at: OffsetDateTime) -> Result<FrameEvent, FrameError> {
        if self.step != BluConStep::ReadingFram {
            warn!("BluCon: FRAM block out of sequence in {:?}", self.step);
            return Ok(FrameEvent::StillAccumulating);
        }

        self.session
            .buffer
            .push(bytes.get(MULTIPLE_BLOCK_HEADER_LENGTH..).unwrap_or_default());
        let Some(fram) = self.session.buffer.take_frame(FRAM_LENGTH) else {
            debug!("BluCon: buffered {} of {FRAM_LENGTH} bytes", self.session.buffer.len());
            return Ok(FrameEvent::StillAccumulating);
        };

        self.step = BluConStep::Sleeping;
        self.queue(Request::Sleep);
        self.session.complete_fram(&fram, true, read_at)
    }

    fn sleep(&mut self, status: &str) {
        self.session.buffer.clear();
        self.session.set_status(status);
        self.step = BluConStep::Sleeping;
        self.queue(Request::Sleep);
    }

    fn advance(&mut self, next: BluConStep, request: Request) {
        self.step = next;
        self.queue(request);
    }

    fn queue(&mut self, request: Request) {
        self.session.commands.push_back(request.bytes().to_vec());
    }
}
