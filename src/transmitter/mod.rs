//! Per-model framing state machines for sensor bridges.
//!
//! Every model turns `(bytes, characteristic)` notifications into
//! [`FrameEvent`]s and queues the write commands its protocol needs next.
//! Models form a closed set and are dispatched by [`Transmitter`].

mod abbott;
mod blucon;
mod bubble;
mod limitter;
mod miaomiao;
mod watlaa;

use std::collections::VecDeque;

use log::{debug, info, warn};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};
use time::OffsetDateTime;

use crate::config::{DecoderConfig, ResumeState};
use crate::fram::FramError;
use crate::libre2::{DecryptError, decrypt_fram};
use crate::sensor::{FramOutcome, Sensor};

pub use abbott::Abbott;
pub use blucon::{BluCon, BluConStep};
pub use bubble::Bubble;
pub use limitter::Limitter;
pub use miaomiao::MiaoMiao;
pub use watlaa::{AlertThresholds, BridgeStatus, GlucoseUnit, Watlaa};

#[cfg(test)]
pub(crate) use miaomiao::tests::frame as miaomiao_frame;

const NORDIC_UART_SERVICE: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";
const NORDIC_UART_WRITE: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";
const NORDIC_UART_READ: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";

/// Constant table of one transmitter model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    pub name: &'static str,
    pub service_uuid: &'static str,
    pub write_uuid: Option<&'static str>,
    pub read_uuid: &'static str,
    /// Further characteristics the model notifies on.
    pub extra_notify_uuids: &'static [&'static str],
}

impl ModelProfile {
    /// Characteristics a transport should subscribe to.
    pub fn notify_uuids(&self) -> impl Iterator<Item = &'static str> + '_ {
        core::iter::once(self.read_uuid).chain(self.extra_notify_uuids.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr)]
pub enum TransmitterModel {
    #[strum(serialize = "MiaoMiao")]
    MiaoMiao,
    #[strum(serialize = "Bubble")]
    Bubble,
    #[strum(serialize = "Libre 2")]
    Libre2,
    #[strum(serialize = "Limitter")]
    Limitter,
    #[strum(serialize = "Watlaa")]
    Watlaa,
    #[strum(serialize = "BluCon")]
    BluCon,
}

impl TransmitterModel {
    pub fn profile(self) -> &'static ModelProfile {
        match self {
            Self::MiaoMiao => &miaomiao::PROFILE,
            Self::Bubble => &bubble::PROFILE,
            Self::Libre2 => &abbott::PROFILE,
            Self::Limitter => &limitter::PROFILE,
            Self::Watlaa => &watlaa::PROFILE,
            Self::BluCon => &blucon::PROFILE,
        }
    }

    /// Guesses the model from an advertised peripheral name.
    pub fn from_advertised_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.starts_with("miaomiao") {
            Some(Self::MiaoMiao)
        } else if name.starts_with("bubble") {
            Some(Self::Bubble)
        } else if name.starts_with("abbott") {
            Some(Self::Libre2)
        } else if name.starts_with("limitter") || name.starts_with("droplet") {
            Some(Self::Limitter)
        } else if name.starts_with("watlaa") {
            Some(Self::Watlaa)
        } else if name.starts_with("blu") {
            Some(Self::BluCon)
        } else {
            None
        }
    }
}

/// Outcome of feeding one notification to a transmitter.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    StillAccumulating,
    NoSensor,
    NewSensor,
    FrameReady(Box<Sensor>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Response marker with no match in the model's response table.
    UnknownResponse { model: &'static str, marker: String },
    /// A complete frame whose fixed fields could not be read.
    Malformed(&'static str),
    /// The bridge reported an error condition.
    Device(String),
    /// Data needs a sensor identity the transmitter has not learned yet.
    UnknownSensor,
    Fram(FramError),
    Decrypt(DecryptError),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownResponse { model, marker } => {
                write!(f, "{model}: unknown response {marker}")
            }
            Self::Malformed(what) => write!(f, "malformed frame: {what}"),
            Self::Device(reason) => write!(f, "transmitter reported: {reason}"),
            Self::UnknownSensor => write!(f, "sensor uid and patch info are not known yet"),
            Self::Fram(err) => write!(f, "FRAM error: {err}"),
            Self::Decrypt(err) => write!(f, "decryption error: {err}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fram(err) => Some(err),
            Self::Decrypt(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FramError> for FrameError {
    fn from(value: FramError) -> Self {
        Self::Fram(value)
    }
}

impl From<DecryptError> for FrameError {
    fn from(value: DecryptError) -> Self {
        Self::Decrypt(value)
    }
}

/// Hardware details some bridges report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Percent.
    pub battery: Option<u8>,
    pub firmware: Option<String>,
    pub hardware: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Idle,
    Accumulating,
}

/// Reassembly buffer for one frame.
#[derive(Debug, Clone)]
pub(crate) struct FrameBuffer {
    state: BufferState,
    data: Vec<u8>,
}

impl FrameBuffer {
    pub(crate) fn new() -> Self {
        Self {
            state: BufferState::Idle,
            data: Vec::new(),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state == BufferState::Idle
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.state = BufferState::Accumulating;
        self.data.extend_from_slice(chunk);
    }

    /// Takes a frame of `size` bytes once enough data has arrived.
    ///
    /// Oversized buffers yield their trailing `size` bytes. The buffer is
    /// back to idle afterwards.
    pub(crate) fn take_frame(&mut self, size: usize) -> Option<Vec<u8>> {
        if self.data.len() < size {
            return None;
        }

        let mut data = core::mem::take(&mut self.data);
        self.state = BufferState::Idle;
        if data.len() > size {
            debug!("discarding {} leading bytes of an oversized frame", data.len() - size);
            data.drain(..data.len() - size);
        }
        Some(data)
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.state = BufferState::Idle;
    }
}

/// State every model keeps for one connection.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) buffer: FrameBuffer,
    pub(crate) sensor: Option<Sensor>,
    pub(crate) device: DeviceInfo,
    pub(crate) status: String,
    pub(crate) commands: VecDeque<Vec<u8>>,
    pub(crate) resume: ResumeState,
    pub(crate) config: DecoderConfig,
}

impl Session {
    pub(crate) fn new(resume: ResumeState, config: DecoderConfig) -> Self {
        Self {
            buffer: FrameBuffer::new(),
            sensor: None,
            device: DeviceInfo::default(),
            status: String::from("idle"),
            commands: VecDeque::new(),
            resume,
            config,
        }
    }

    pub(crate) fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
        info!("{}", self.status);
    }

    /// Active sensor, created from the resume state on first use.
    pub(crate) fn sensor_mut(&mut self) -> &mut Sensor {
        let resume = &self.resume;
        self.sensor.get_or_insert_with(|| {
            Sensor::resumed(resume.patch_uid.as_deref(), resume.patch_info.as_deref())
        })
    }

    /// Drops the current sensor when a different uid shows up.
    /// Returns whether the sensor changed.
    pub(crate) fn adopt_uid(&mut self, uid: &[u8]) -> bool {
        let changed = self
            .sensor
            .as_ref()
            .and_then(Sensor::uid)
            .is_some_and(|known| known != uid);
        if changed {
            self.sensor = None;
            self.resume.patch_info = None;
        }
        self.sensor_mut().set_uid(uid);
        self.resume.patch_uid = Some(uid.to_vec());
        changed
    }

    pub(crate) fn adopt_patch_info(&mut self, patch_info: &[u8]) {
        self.sensor_mut().set_patch_info(patch_info);
        self.resume.patch_info = Some(patch_info.to_vec());
    }

    /// Terminal step of a FRAM reading cycle.
    ///
    /// Decrypts the image for encrypted generations when `decrypt` is set,
    /// then assigns it to the sensor.
    pub(crate) fn complete_fram(
        &mut self,
        image: &[u8],
        decrypt: bool,
        read_at: OffsetDateTime,
    ) -> Result<FrameEvent, FrameError> {
        let config = self.config.clone();
        let sensor = self.sensor_mut();

        let plain = if decrypt && sensor.sensor_type().has_encrypted_fram() {
            let uid = sensor.uid().ok_or(FrameError::UnknownSensor)?;
            let patch_info = sensor.patch_info().ok_or(FrameError::UnknownSensor)?;
            decrypt_fram(sensor.sensor_type(), uid, patch_info, image)?
        } else {
            image.to_vec()
        };

        let status = match sensor.set_fram(&plain, read_at, &config)? {
            FramOutcome::Decoded => "FRAM received",
            FramOutcome::DecodedDespiteBodyCrc => "FRAM received, body CRC tolerated",
            FramOutcome::KeptPrevious => {
                // The previous readings stay on the sensor but are not new.
                let body = sensor.crc_report().map(|report| report.body);
                return Err(FrameError::Fram(FramError::BodyCrc {
                    stored: body.map_or(0, |crc| crc.stored),
                    computed: body.map_or(0, |crc| crc.computed),
                }));
            }
        };
        let snapshot = Box::new(sensor.clone());
        self.set_status(status);
        Ok(FrameEvent::FrameReady(snapshot))
    }
}

pub(crate) fn matches_uuid(characteristic: &str, uuid: &str) -> bool {
    characteristic.eq_ignore_ascii_case(uuid)
}

/// One connected bridge.
#[derive(Debug, Clone)]
pub enum Transmitter {
    MiaoMiao(MiaoMiao),
    Bubble(Bubble),
    Libre2(Abbott),
    Limitter(Limitter),
    Watlaa(Watlaa),
    BluCon(BluCon),
}

impl Transmitter {
    pub fn new(model: TransmitterModel, resume: ResumeState, config: DecoderConfig) -> Self {
        match model {
            TransmitterModel::MiaoMiao => Self::MiaoMiao(MiaoMiao::new(resume, config)),
            TransmitterModel::Bubble => Self::Bubble(Bubble::new(resume, config)),
            TransmitterModel::Libre2 => Self::Libre2(Abbott::new(resume, config)),
            TransmitterModel::Limitter => Self::Limitter(Limitter::new(resume, config)),
            TransmitterModel::Watlaa => Self::Watlaa(Watlaa::new(resume, config)),
            TransmitterModel::BluCon => Self::BluCon(BluCon::new(resume, config)),
        }
    }

    pub fn model(&self) -> TransmitterModel {
        match self {
            Self::MiaoMiao(_) => TransmitterModel::MiaoMiao,
            Self::Bubble(_) => TransmitterModel::Bubble,
            Self::Libre2(_) => TransmitterModel::Libre2,
            Self::Limitter(_) => TransmitterModel::Limitter,
            Self::Watlaa(_) => TransmitterModel::Watlaa,
            Self::BluCon(_) => TransmitterModel::BluCon,
        }
    }

    pub fn profile(&self) -> &'static ModelProfile {
        self.model().profile()
    }

    /// Feeds one notification, timestamping a completed frame with the
    /// current time.
    pub fn on_data(&mut self, bytes: &[u8], characteristic: &str) -> Result<FrameEvent, FrameError> {
        self.on_data_at(bytes, characteristic, OffsetDateTime::now_utc())
    }

    pub fn on_data_at(
        &mut self,
        bytes: &[u8],
        characteristic: &str,
        read_at: OffsetDateTime,
    ) -> Result<FrameEvent, FrameError> {
        if bytes.is_empty() {
            return Ok(FrameEvent::StillAccumulating);
        }

        let result = match self {
            Self::MiaoMiao(t) => t.on_data(bytes, characteristic, read_at),
            Self::Bubble(t) => t.on_data(bytes, characteristic, read_at),
            Self::Libre2(t) => t.on_data(bytes, characteristic, read_at),
            Self::Limitter(t) => t.on_data(bytes, characteristic, read_at),
            Self::Watlaa(t) => t.on_data(bytes, characteristic, read_at),
            Self::BluCon(t) => t.on_data(bytes, characteristic, read_at),
        };

        if let Err(err) = &result {
            warn!("{}: {err}", self.model());
            let session = self.session_mut();
            session.buffer.clear();
            session.status = err.to_string();
        }
        result
    }

    /// Command to write once per connection to start streaming, if the model
    /// has one.
    pub fn start_read_command(&mut self, interval_minutes: u8) -> Option<Vec<u8>> {
        match self {
            Self::MiaoMiao(t) => Some(t.start_read_command(interval_minutes)),
            Self::Bubble(t) => Some(t.start_read_command(interval_minutes)),
            Self::Libre2(t) => t.start_read_command(),
            Self::Limitter(_) => None,
            Self::Watlaa(t) => Some(t.start_read_command(interval_minutes)),
            Self::BluCon(_) => None,
        }
    }

    /// Next queued write command, in protocol order.
    pub fn next_command(&mut self) -> Option<Vec<u8>> {
        self.session_mut().commands.pop_front()
    }

    /// Abandons the reading cycle in progress.
    pub fn reset(&mut self) {
        let session = self.session_mut();
        session.buffer.clear();
        session.commands.clear();
        if let Self::BluCon(t) = self {
            t.restart();
        }
    }

    /// Last event, for display.
    pub fn status(&self) -> &str {
        &self.session().status
    }

    pub fn sensor(&self) -> Option<&Sensor> {
        self.session().sensor.as_ref()
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.session().device
    }

    /// Sensor identity and counters to persist for the next connection.
    pub fn resume_state(&self) -> &ResumeState {
        &self.session().resume
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.session().config
    }

    /// Bytes buffered towards the next frame.
    pub fn buffered(&self) -> usize {
        self.session().buffer.len()
    }

    fn session(&self) -> &Session {
        match self {
            Self::MiaoMiao(t) => &t.session,
            Self::Bubble(t) => &t.session,
            Self::Libre2(t) => &t.session,
            Self::Limitter(t) => &t.session,
            Self::Watlaa(t) => &t.inner.session,
            Self::BluCon(t) => &t.session,
        }
    }

    fn session_mut(&mut self) -> &mut Session {
        match self {
            Self::MiaoMiao(t) => &mut t.session,
            Self::Bubble(t) => &mut t.session,
            Self::Libre2(t) => &mut t.session,
            Self::Limitter(t) => &mut t.session,
            Self::Watlaa(t) => &mut t.inner.session,
            Self::BluCon(t) => &mut t.session,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::{FrameBuffer, Transmitter, TransmitterModel};
    use crate::config::{DecoderConfig, ResumeState};

    #[test]
    fn every_model_has_a_profile() {
        for model in TransmitterModel::iter() {
            let profile = model.profile();
            assert!(!profile.service_uuid.is_empty());
            assert!(profile.notify_uuids().next().is_some());
            let transmitter = Transmitter::new(model, ResumeState::default(), DecoderConfig::default());
            assert_eq!(transmitter.model(), model);
            assert_eq!(transmitter.status(), "idle");
            assert!(transmitter.sensor().is_none());
        }
        assert_eq!(TransmitterModel::from_str("Libre 2"), Ok(TransmitterModel::Libre2));
    }

    #[test]
    fn advertised_names() {
        assert_eq!(
            TransmitterModel::from_advertised_name("miaomiao2_abcd"),
            Some(TransmitterModel::MiaoMiao)
        );
        assert_eq!(
            TransmitterModel::from_advertised_name("ABBOTT3MH001DG75W"),
            Some(TransmitterModel::Libre2)
        );
        assert_eq!(TransmitterModel::from_advertised_name("keyboard"), None);
    }

    #[test]
    fn frame_buffer_keeps_trailing_window() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.is_idle());
        buffer.push(&[9, 9]);
        buffer.push(&[1, 2, 3]);
        assert!(!buffer.is_idle());
        assert_eq!(buffer.take_frame(6), None);
        assert_eq!(buffer.take_frame(3), Some(vec![1, 2, 3]));
        assert!(buffer.is_idle());
        assert_eq!(buffer.len(), 0);
    }
}
