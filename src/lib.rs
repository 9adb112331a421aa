//! Decoder for FreeStyle Libre sensor bridges.
//!
//! The recommended API surface is:
//! - [`Reader`] to drive one transmitter over a [`NotificationTransport`]
//! - [`Transmitter`] for the per-model framing state machines
//! - [`Sensor`] for decoded sensor state and readings
//! - [`CalibrationModel`] for turning raw counts into mg/dL
//! - [`transport`] for BLE I/O (`ble` feature)
//!
//! The lower-level decoders ([`fram`], [`libre2`], [`codec`]) are public for
//! tools working on raw memory images and packets.

pub mod calibration;
pub mod codec;
pub mod config;
pub mod fram;
pub mod glucose;
pub mod libre2;
/// Boundary types for the remote calibration service.
pub mod oop;
mod reader;
pub mod sensor;
pub mod temperature;
pub mod transmitter;
/// Transport adapters for connecting to a sensor bridge.
pub mod transport;

pub use calibration::{Calibration, CalibrationModel, CalibrationSource};
pub use config::{DecoderConfig, ResumeState};
pub use glucose::{Glucose, GlucoseSource};
/// Reading session over one transport.
pub use reader::{
    ActiveSensor, GlucoseSink, Notification, NotificationTransport, Reader, ReaderError,
};
pub use sensor::{Sensor, SensorState, SensorType};
pub use transmitter::{FrameError, FrameEvent, Transmitter, TransmitterModel};
