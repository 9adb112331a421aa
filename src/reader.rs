//! Drives one transmitter over one notification transport.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use crate::calibration::CalibrationModel;
use crate::glucose::{Glucose, merge_history};
use crate::sensor::Sensor;
use crate::temperature::factory_glucose;
use crate::transmitter::{FrameError, FrameEvent, Transmitter};

/// One characteristic update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: String,
    pub value: Vec<u8>,
}

impl Notification {
    pub fn new(characteristic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic: characteristic.into(),
            value: value.into(),
        }
    }
}

/// Delivers notifications in arrival order and writes to characteristics.
pub trait NotificationTransport {
    /// Blocks until the next notification arrives.
    fn next_notification(&mut self) -> std::io::Result<Notification>;

    fn write(&mut self, characteristic: &str, data: &[u8]) -> std::io::Result<()>;
}

/// Consumer of decoded readings, such as a history store or an uploader.
pub trait GlucoseSink {
    fn push(&mut self, sensor: &Sensor, readings: &[Glucose]);
}

impl GlucoseSink for Sender<Vec<Glucose>> {
    fn push(&mut self, _sensor: &Sensor, readings: &[Glucose]) {
        if self.send(readings.to_vec()).is_err() {
            debug!("glucose receiver dropped");
        }
    }
}

/// The single sensor currently considered active, shared between readers.
///
/// The last reader to complete a frame wins.
#[derive(Debug, Clone, Default)]
pub struct ActiveSensor {
    slot: Arc<Mutex<Option<Sensor>>>,
}

impl ActiveSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sensor: Sensor) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(sensor);
    }

    pub fn get(&self) -> Option<Sensor> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[derive(Debug)]
pub enum ReaderError {
    Io(std::io::Error),
    Frame(FrameError),
    /// The model has nowhere to write commands to.
    NoWriteCharacteristic,
    NoSensor,
}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Frame(err) => write!(f, "Frame error: {err}"),
            Self::NoWriteCharacteristic => write!(f, "Transmitter has no write characteristic"),
            Self::NoSensor => write!(f, "Transmitter reports no sensor"),
        }
    }
}

impl std::error::Error for ReaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Frame(err) => Some(err),
            Self::NoWriteCharacteristic | Self::NoSensor => None,
        }
    }
}

impl From<std::io::Error> for ReaderError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<FrameError> for ReaderError {
    fn from(value: FrameError) -> Self {
        Self::Frame(value)
    }
}

pub struct Reader<T> {
    transport: T,
    transmitter: Transmitter,
    calibration: CalibrationModel,
    history: Vec<Glucose>,
    active: ActiveSensor,
    sinks: Vec<Box<dyn GlucoseSink + Send>>,
}

impl<T: NotificationTransport> Reader<T> {
    pub fn new(transport: T, transmitter: Transmitter) -> Self {
        Self {
            transport,
            transmitter,
            calibration: CalibrationModel::default(),
            history: Vec::new(),
            active: ActiveSensor::new(),
            sinks: Vec::new(),
        }
    }

    pub fn with_active_sensor(mut self, active: ActiveSensor) -> Self {
        self.active = active;
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationModel) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn add_sink(&mut self, sink: impl GlucoseSink + Send + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn transmitter(&self) -> &Transmitter {
        &self.transmitter
    }

    pub fn calibration_mut(&mut self) -> &mut CalibrationModel {
        &mut self.calibration
    }

    /// Merged, calibrated readings, most recent first.
    pub fn history(&self) -> &[Glucose] {
        &self.history
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sends the model's start command and anything it queued.
    pub fn start(&mut self, interval_minutes: u8) -> Result<(), ReaderError> {
        if let Some(command) = self.transmitter.start_read_command(interval_minutes) {
            self.write(&command)?;
        }
        self.flush_commands()
    }

    /// Processes one notification.
    pub fn poll(&mut self) -> Result<FrameEvent, ReaderError> {
        let (event, _) = self.step()?;
        Ok(event)
    }

    /// Reads until a frame completes and returns its calibrated readings.
    ///
    /// Frame errors end the current cycle only and reading continues.
    pub fn read_next_frame(&mut self) -> Result<Vec<Glucose>, ReaderError> {
        loop {
            match self.step() {
                Ok((FrameEvent::FrameReady(_), readings)) => return Ok(readings),
                Ok((FrameEvent::NoSensor, _)) => return Err(ReaderError::NoSensor),
                Ok(_) => {}
                Err(ReaderError::Frame(err)) => warn!("dropping frame: {err}"),
                Err(err) => return Err(err),
            }
        }
    }

    fn step(&mut self) -> Result<(FrameEvent, Vec<Glucose>), ReaderError> {
        let notification = self.transport.next_notification()?;
        let result = self
            .transmitter
            .on_data(&notification.value, &notification.characteristic);
        self.flush_commands()?;

        let event = result?;
        let readings = match &event {
            FrameEvent::FrameReady(sensor) => self.publish(sensor),
            _ => Vec::new(),
        };
        Ok((event, readings))
    }

    fn publish(&mut self, sensor: &Sensor) -> Vec<Glucose> {
        let raw: Vec<Glucose> = sensor
            .trend()
            .iter()
            .chain(sensor.history())
            .map(|g| match sensor.calibration_info() {
                Some(info) => factory_glucose(g, info),
                None => g.clone(),
            })
            .collect();
        let readings = self.calibration.apply_all(&raw);

        let capacity = self.transmitter.config().history_capacity;
        merge_history(&mut self.history, &readings, capacity);
        for sink in &mut self.sinks {
            sink.push(sensor, &readings);
        }
        self.active.set(sensor.clone());

        info!(
            "{}: {} readings, latest {:?} mg/dL ({} calibration)",
            self.transmitter.model(),
            readings.len(),
            readings.first().and_then(|g| g.value),
            self.calibration.source()
        );
        readings
    }

    fn flush_commands(&mut self) -> Result<(), ReaderError> {
        while let Some(command) = self.transmitter.next_command() {
            self.write(&command)?;
        }
        Ok(())
    }

    fn write(&mut self, command: &[u8]) -> Result<(), ReaderError> {
        let characteristic = self
            .transmitter
            .profile()
            .write_uuid
            .ok_or(ReaderError::NoWriteCharacteristic)?;
        debug!("writing {command:02x?} to {characteristic}");
        self.transport.write(characteristic, command)?;
        Ok(())
    }
}
