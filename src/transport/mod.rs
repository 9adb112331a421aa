//! Notification transports for [`Reader`](crate::reader::Reader).
//!
//! Enable the `ble` feature for [`ble::BleTransport`].

#[cfg(feature = "ble")]
pub mod ble;

pub use crate::reader::{Notification, NotificationTransport};
