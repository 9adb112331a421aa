use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::reader::{Notification, NotificationTransport};
use crate::transmitter::ModelProfile;

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);
/// Bridges notify every one to five minutes.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(6 * 60);

#[derive(Debug, Clone)]
pub struct BleConnectOptions {
    pub scan_timeout: Duration,
    pub read_timeout: Duration,
    pub name_contains: Option<String>,
}

impl Default for BleConnectOptions {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            name_contains: None,
        }
    }
}

#[derive(Debug)]
pub enum BleTransportError {
    RuntimeInit(std::io::Error),
    Btleplug(btleplug::Error),
    Uuid(uuid::Error),
    NoAdapter,
    NoMatchingPeripheral,
    MissingCharacteristic(&'static str),
    SetupChannelClosed,
}

impl std::fmt::Display for BleTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RuntimeInit(err) => write!(f, "failed to initialize runtime: {err}"),
            Self::Btleplug(err) => write!(f, "ble error: {err}"),
            Self::Uuid(err) => write!(f, "uuid parse error: {err}"),
            Self::NoAdapter => write!(f, "no bluetooth adapter available"),
            Self::NoMatchingPeripheral => write!(f, "no matching transmitter found"),
            Self::MissingCharacteristic(uuid) => write!(f, "characteristic {uuid} not found"),
            Self::SetupChannelClosed => write!(f, "ble worker initialization channel closed"),
        }
    }
}

impl std::error::Error for BleTransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RuntimeInit(err) => Some(err),
            Self::Btleplug(err) => Some(err),
            Self::Uuid(err) => Some(err),
            Self::NoAdapter
            | Self::NoMatchingPeripheral
            | Self::MissingCharacteristic(_)
            | Self::SetupChannelClosed => None,
        }
    }
}

impl From<btleplug::Error> for BleTransportError {
    fn from(value: btleplug::Error) -> Self {
        Self::Btleplug(value)
    }
}

impl From<uuid::Error> for BleTransportError {
    fn from(value: uuid::Error) -> Self {
        Self::Uuid(value)
    }
}

/// Notification transport backed by a btleplug connection.
///
/// The connection lives on a worker thread with its own runtime; this
/// handle only exchanges messages with it.
pub struct BleTransport {
    write_tx: UnboundedSender<(Uuid, Vec<u8>)>,
    read_rx: Receiver<Notification>,
    read_timeout: Duration,
    peripheral_name: Option<String>,
}

impl BleTransport {
    pub fn connect_first(profile: &'static ModelProfile) -> Result<Self, BleTransportError> {
        Self::connect_with_options(profile, BleConnectOptions::default())
    }

    pub fn connect_with_options(
        profile: &'static ModelProfile,
        options: BleConnectOptions,
    ) -> Result<Self, BleTransportError> {
        let read_timeout = options.read_timeout;
        let (write_tx, write_rx) = tokio::sync::mpsc::unbounded_channel::<(Uuid, Vec<u8>)>();
        let (read_tx, read_rx) = mpsc::channel::<Notification>();
        let (setup_tx, setup_rx) = mpsc::channel::<Result<Option<String>, BleTransportError>>();

        thread::spawn(move || {
            let runtime = match Runtime::new() {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = setup_tx.send(Err(BleTransportError::RuntimeInit(err)));
                    return;
                }
            };

            if let Err(err) =
                runtime.block_on(run_ble_worker(profile, write_rx, read_tx, setup_tx, options))
            {
                warn!("{}: connection lost: {err}", profile.name);
            }
        });

        match setup_rx.recv() {
            Ok(Ok(peripheral_name)) => Ok(Self {
                write_tx,
                read_rx,
                read_timeout,
                peripheral_name,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BleTransportError::SetupChannelClosed),
        }
    }

    /// Advertised name of the connected transmitter.
    pub fn peripheral_name(&self) -> Option<&str> {
        self.peripheral_name.as_deref()
    }
}

impl NotificationTransport for BleTransport {
    fn next_notification(&mut self) -> std::io::Result<Notification> {
        self.read_rx
            .recv_timeout(self.read_timeout)
            .map_err(|err| match err {
                mpsc::RecvTimeoutError::Timeout => std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for BLE data",
                ),
                mpsc::RecvTimeoutError::Disconnected => std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "ble transport disconnected",
                ),
            })
    }

    fn write(&mut self, characteristic: &str, data: &[u8]) -> std::io::Result<()> {
        let uuid = Uuid::parse_str(characteristic)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        self.write_tx.send((uuid, data.to_vec())).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "ble transport worker is not running",
            )
        })
    }
}

struct Connection {
    peripheral: Peripheral,
    name: Option<String>,
    notify: Vec<Characteristic>,
    writable: HashMap<Uuid, (Characteristic, WriteType)>,
}

async fn run_ble_worker(
    profile: &'static ModelProfile,
    mut write_rx: UnboundedReceiver<(Uuid, Vec<u8>)>,
    read_tx: mpsc::Sender<Notification>,
    setup_tx: mpsc::Sender<Result<Option<String>, BleTransportError>>,
    options: BleConnectOptions,
) -> Result<(), BleTransportError> {
    let connection = match connect_peripheral(profile, &options).await {
        Ok(v) => v,
        Err(err) => {
            let _ = setup_tx.send(Err(err));
            return Ok(());
        }
    };
    let peripheral = &connection.peripheral;

    for characteristic in &connection.notify {
        if let Err(err) = peripheral.subscribe(characteristic).await {
            let _ = setup_tx.send(Err(err.into()));
            return Ok(());
        }
    }
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = setup_tx.send(Err(err.into()));
            return Ok(());
        }
    };
    info!(
        "{}: connected to {}",
        profile.name,
        connection.name.as_deref().unwrap_or("unnamed peripheral")
    );
    let _ = setup_tx.send(Ok(connection.name.clone()));

    loop {
        tokio::select! {
            maybe_notification = notifications.next() => {
                let Some(notification) = maybe_notification else {
                    break;
                };
                let forwarded = Notification::new(notification.uuid.to_string(), notification.value);
                if read_tx.send(forwarded).is_err() {
                    break;
                }
            }
            maybe_write = write_rx.recv() => {
                let Some((uuid, data)) = maybe_write else {
                    break;
                };
                let Some((characteristic, write_type)) = connection.writable.get(&uuid) else {
                    warn!("{}: no writable characteristic {uuid}", profile.name);
                    continue;
                };
                debug!("{}: write {data:02x?} to {uuid}", profile.name);
                peripheral.write(characteristic, &data, *write_type).await?;
            }
        }
    }

    let _ = peripheral.disconnect().await;
    Ok(())
}

async fn connect_peripheral(
    profile: &ModelProfile,
    options: &BleConnectOptions,
) -> Result<Connection, BleTransportError> {
    let service_uuid = Uuid::parse_str(profile.service_uuid)?;
    let read_uuid = Uuid::parse_str(profile.read_uuid)?;

    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    let adapter = adapters
        .into_iter()
        .next()
        .ok_or(BleTransportError::NoAdapter)?;

    adapter
        .start_scan(ScanFilter {
            services: vec![service_uuid],
        })
        .await?;
    tokio::time::sleep(options.scan_timeout).await;

    let (peripheral, name) = select_peripheral(&adapter, service_uuid, options).await?;
    peripheral.connect().await?;
    peripheral.discover_services().await?;
    let characteristics = peripheral.characteristics();

    let mut notify = Vec::new();
    for uuid in profile.notify_uuids() {
        let uuid = Uuid::parse_str(uuid)?;
        if let Some(characteristic) = characteristics.iter().find(|ch| ch.uuid == uuid) {
            notify.push(characteristic.clone());
        } else if uuid != read_uuid {
            debug!("{}: optional characteristic {uuid} not offered", profile.name);
        }
    }
    if !notify.iter().any(|ch| ch.uuid == read_uuid) {
        return Err(BleTransportError::MissingCharacteristic(profile.read_uuid));
    }

    let mut writable = HashMap::new();
    if let Some(write_uuid) = profile.write_uuid {
        let uuid = Uuid::parse_str(write_uuid)?;
        let characteristic = characteristics
            .iter()
            .find(|ch| ch.uuid == uuid)
            .ok_or(BleTransportError::MissingCharacteristic(write_uuid))?;
        writable.insert(uuid, (characteristic.clone(), write_type(characteristic)));
    }

    Ok(Connection {
        peripheral,
        name,
        notify,
        writable,
    })
}

fn write_type(characteristic: &Characteristic) -> WriteType {
    if characteristic
        .properties
        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}

async fn select_peripheral(
    adapter: &Adapter,
    service_uuid: Uuid,
    options: &BleConnectOptions,
) -> Result<(Peripheral, Option<String>), BleTransportError> {
    let peripherals = adapter.peripherals().await?;
    for peripheral in peripherals {
        let Some(props) = peripheral.properties().await? else {
            continue;
        };

        if !props.services.contains(&service_uuid) {
            continue;
        }

        if let Some(needle) = &options.name_contains {
            let Some(local_name) = props.local_name.as_deref() else {
                continue;
            };
            if !local_name.contains(needle) {
                continue;
            }
        }

        return Ok((peripheral, props.local_name));
    }

    Err(BleTransportError::NoMatchingPeripheral)
}
