//! BLE transport: scan, connect, chunked writes, notifications

use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt, future, stream};
use std::time::Duration;
use tracing::{debug, info, warn};

use bitremote_proto::fragment_line;

use crate::profile::{self, Endpoints, MICROBIT_UART_SERVICE_UUID, NUS_SERVICE_UUID, Profile, WriteMode};
use crate::queue::LineSink;
use crate::{ConnectError, NotifyStartError, Settings, WriteError};

/// A discovered device
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises a UART service or matches the configured name prefix
    pub is_microbit: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, ConnectError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(ConnectError::NoAdapter)
}

fn name_matches(name: &str, prefix: &str) -> bool {
    // Some stacks report "nimble [BBC micro:bit ...]"
    name.starts_with(prefix) || name.contains(&format!("[{prefix}"))
}

/// Scan for BLE devices for `duration`.
pub async fn scan(duration: Duration, name_prefix: &str) -> Result<Vec<Device>, ConnectError> {
    let adapter = get_adapter().await?;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let address = peripheral.address().to_string();
            let advertises_uart = props
                .services
                .iter()
                .any(|s| *s == MICROBIT_UART_SERVICE_UUID || *s == NUS_SERVICE_UUID);
            let is_microbit = advertises_uart || name_matches(&name, name_prefix);

            devices.push(Device { name, address, rssi: props.rssi, is_microbit });
        }
    }

    adapter.stop_scan().await?;
    debug!(count = devices.len(), "scan finished");
    Ok(devices)
}

/// Find a device whose name or address contains `target`, or the first one
/// matching the name prefix.
pub async fn find_device(
    adapter: &Adapter,
    target: Option<&str>,
    settings: &Settings,
) -> Result<Peripheral, ConnectError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(settings.scan_duration()).await;

    let peripherals = adapter.peripherals().await?;

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_default();
            let address = peripheral.address().to_string();

            let matches = match target {
                Some(t) => name.contains(t) || address.contains(t),
                None => name_matches(&name, &settings.name_prefix),
            };

            if matches {
                adapter.stop_scan().await?;
                info!(%name, %address, "found device");
                return Ok(peripheral);
            }
        }
    }

    adapter.stop_scan().await?;
    Err(ConnectError::DeviceNotFound)
}

/// Find, connect and negotiate. Failure is final for this attempt.
pub async fn connect(target: Option<&str>, settings: &Settings) -> Result<Connection, ConnectError> {
    let adapter = get_adapter().await?;
    let peripheral = find_device(&adapter, target, settings).await?;
    peripheral.connect().await?;

    match open(adapter, &peripheral, settings).await {
        Ok(connection) => Ok(connection),
        Err(err) => {
            if let Err(disconnect_err) = peripheral.disconnect().await {
                debug!(error = %disconnect_err, "disconnect after failed negotiation");
            }
            Err(err)
        }
    }
}

async fn open(adapter: Adapter, peripheral: &Peripheral, settings: &Settings) -> Result<Connection, ConnectError> {
    peripheral.discover_services().await?;
    let chars = peripheral.characteristics();
    let (profile, mut endpoints) = profile::negotiate(&chars).ok_or(ConnectError::NoUartService)?;

    if let Err(err) = peripheral.subscribe(&endpoints.notify).await {
        warn!(%profile, characteristic = %endpoints.notify.uuid, error = %err, "subscribe failed, rescanning");
        peripheral.discover_services().await?;
        let chars = peripheral.characteristics();
        endpoints = profile::rescan_by_capability(&chars, profile.service_uuid(), endpoints);
        peripheral.subscribe(&endpoints.notify).await.map_err(|source| NotifyStartError {
            characteristic: endpoints.notify.uuid,
            source,
        })?;
    }

    let Endpoints { write, notify } = endpoints;
    let write_mode = WriteMode::for_characteristic(&write);
    info!(%profile, ?write_mode, "connected");

    Ok(Connection {
        adapter,
        peripheral: peripheral.clone(),
        write_char: write,
        notify_char: notify,
        profile,
        write_mode,
        chunk_size: settings.chunk_size.max(1),
    })
}

/// An open link to a device. Clones share the same peripheral.
#[derive(Debug, Clone)]
pub struct Connection {
    adapter: Adapter,
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
    profile: Profile,
    write_mode: WriteMode,
    chunk_size: usize,
}

impl Connection {
    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Notification payloads from the notify characteristic, one item per
    /// notification. Ends when the adapter reports this device disconnected.
    pub async fn inbound(&self) -> Result<impl Stream<Item = Vec<u8>> + Send + Unpin + 'static, btleplug::Error> {
        let uuid = self.notify_char.uuid;
        let id = self.peripheral.id();

        let events = self.adapter.events().await?;
        let notifications = self.peripheral.notifications().await?;

        let payloads = notifications.filter_map(move |n| future::ready((n.uuid == uuid).then_some(n.value)));
        let gone = events.filter_map(move |event| {
            future::ready(matches!(event, CentralEvent::DeviceDisconnected(ref d) if *d == id).then_some(()))
        });
        Ok(until_disconnected(payloads, gone))
    }

    pub async fn disconnect(&self) -> Result<(), btleplug::Error> {
        if let Err(err) = self.peripheral.unsubscribe(&self.notify_char).await {
            debug!(error = %err, "unsubscribe failed");
        }
        self.peripheral.disconnect().await
    }
}

/// Pass `payloads` through until either `payloads` ends or `disconnects`
/// yields.
pub fn until_disconnected<P, D>(payloads: P, disconnects: D) -> impl Stream<Item = Vec<u8>> + Send + Unpin + 'static
where
    P: Stream<Item = Vec<u8>> + Send + Unpin + 'static,
    D: Stream<Item = ()> + Send + Unpin + 'static,
{
    let payloads = payloads.map(Some).chain(stream::once(future::ready(None)));
    stream::select(payloads, disconnects.map(|()| None))
        .take_while(|item| future::ready(item.is_some()))
        .filter_map(future::ready)
}

impl LineSink for Connection {
    async fn write_line(&self, line: &str) -> Result<(), WriteError> {
        let write_type = self.write_mode.write_type();
        for chunk in fragment_line(line, self.chunk_size) {
            self.peripheral
                .write(&self.write_char, &chunk, write_type)
                .await
                .map_err(WriteError::from_ble)?;
        }
        Ok(())
    }
}
