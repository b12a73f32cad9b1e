//! UART service profiles and characteristic selection
//!
//! Two compatible services are supported. The micro:bit UART service is
//! matched by UUID alone. For the Nordic UART Service the UUID match is
//! double-checked against the declared properties, because some firmware
//! exposes the right UUIDs with the wrong capabilities; a side that fails
//! the check is picked again by capability.

use std::collections::BTreeSet;
use std::fmt;

use btleplug::api::{CharPropFlags, Characteristic, WriteType};
use tracing::debug;
use uuid::Uuid;

/// micro:bit UART service: e95d0753-251d-470a-a062-fa1922dfa9a8
pub const MICROBIT_UART_SERVICE_UUID: Uuid = Uuid::from_u128(0xe95d0753_251d_470a_a062_fa1922dfa9a8);
/// micro:bit UART RX (host writes)
pub const MICROBIT_UART_RX_UUID: Uuid = Uuid::from_u128(0xe95d93ee_251d_470a_a062_fa1922dfa9a8);
/// micro:bit UART TX (device notifies)
pub const MICROBIT_UART_TX_UUID: Uuid = Uuid::from_u128(0xe95d9250_251d_470a_a062_fa1922dfa9a8);

/// Nordic UART service: 6e400001-b5a3-f393-e0a9-e50e24dcca9e
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const NUS_RX_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const NUS_TX_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    MicrobitUart,
    Nus,
}

impl Profile {
    pub fn service_uuid(self) -> Uuid {
        match self {
            Profile::MicrobitUart => MICROBIT_UART_SERVICE_UUID,
            Profile::Nus => NUS_SERVICE_UUID,
        }
    }

    pub fn write_uuid(self) -> Uuid {
        match self {
            Profile::MicrobitUart => MICROBIT_UART_RX_UUID,
            Profile::Nus => NUS_RX_UUID,
        }
    }

    pub fn notify_uuid(self) -> Uuid {
        match self {
            Profile::MicrobitUart => MICROBIT_UART_TX_UUID,
            Profile::Nus => NUS_TX_UUID,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Profile::MicrobitUart => "microbit-uart",
            Profile::Nus => "nus",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

impl WriteMode {
    /// Write-without-response whenever the characteristic allows it.
    pub fn for_characteristic(characteristic: &Characteristic) -> Self {
        if characteristic.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteMode::WithoutResponse
        } else {
            WriteMode::WithResponse
        }
    }

    pub fn write_type(self) -> WriteType {
        match self {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        }
    }
}

pub fn can_notify(characteristic: &Characteristic) -> bool {
    characteristic.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
}

pub fn can_write(characteristic: &Characteristic) -> bool {
    characteristic.properties.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
}

/// The pair of characteristics a connection talks through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub write: Characteristic,
    pub notify: Characteristic,
}

fn in_service(chars: &BTreeSet<Characteristic>, service: Uuid) -> impl Iterator<Item = &Characteristic> {
    chars.iter().filter(move |c| c.service_uuid == service)
}

fn by_uuid(chars: &BTreeSet<Characteristic>, service: Uuid, uuid: Uuid) -> Option<&Characteristic> {
    in_service(chars, service).find(|c| c.uuid == uuid)
}

/// Exact UUID match, no property checks.
pub fn select_by_uuid(chars: &BTreeSet<Characteristic>, profile: Profile) -> Option<Endpoints> {
    let service = profile.service_uuid();
    Some(Endpoints {
        write: by_uuid(chars, service, profile.write_uuid())?.clone(),
        notify: by_uuid(chars, service, profile.notify_uuid())?.clone(),
    })
}

/// First writable and first notifying characteristic of the service.
pub fn select_by_capability(chars: &BTreeSet<Characteristic>, service: Uuid) -> Option<Endpoints> {
    Some(Endpoints {
        write: in_service(chars, service).find(|c| can_write(c))?.clone(),
        notify: in_service(chars, service).find(|c| can_notify(c))?.clone(),
    })
}

/// NUS: UUID match validated by properties, each failing side re-picked by
/// capability.
pub fn select_nus(chars: &BTreeSet<Characteristic>) -> Option<Endpoints> {
    let write = by_uuid(chars, NUS_SERVICE_UUID, NUS_RX_UUID).filter(|c| can_write(c));
    let notify = by_uuid(chars, NUS_SERVICE_UUID, NUS_TX_UUID).filter(|c| can_notify(c));

    if write.is_none() || notify.is_none() {
        debug!("NUS characteristic properties mismatch, rescanning by capability");
    }
    let write = write.or_else(|| in_service(chars, NUS_SERVICE_UUID).find(|c| can_write(c)))?;
    let notify = notify.or_else(|| in_service(chars, NUS_SERVICE_UUID).find(|c| can_notify(c)))?;

    Some(Endpoints { write: write.clone(), notify: notify.clone() })
}

/// micro:bit UART first, then NUS.
pub fn negotiate(chars: &BTreeSet<Characteristic>) -> Option<(Profile, Endpoints)> {
    if let Some(endpoints) = select_by_uuid(chars, Profile::MicrobitUart) {
        return Some((Profile::MicrobitUart, endpoints));
    }
    debug!("micro:bit UART not found, falling back to NUS");
    select_nus(chars).map(|endpoints| (Profile::Nus, endpoints))
}

/// After a failed notification start: keep each side of `current` unless
/// the service offers a capable replacement.
pub fn rescan_by_capability(chars: &BTreeSet<Characteristic>, service: Uuid, current: Endpoints) -> Endpoints {
    let write = in_service(chars, service).find(|c| can_write(c)).cloned();
    let notify = in_service(chars, service).find(|c| can_notify(c)).cloned();
    Endpoints {
        write: write.unwrap_or(current.write),
        notify: notify.unwrap_or(current.notify),
    }
}
