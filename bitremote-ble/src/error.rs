use std::time::Duration;

use uuid::Uuid;

/// Establishing a connection failed. Never retried internally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("no matching device found")]
    DeviceNotFound,
    #[error("no UART service with usable characteristics found")]
    NoUartService,
    #[error(transparent)]
    Notify(#[from] NotifyStartError),
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// The notify characteristic refused to start notifications.
#[derive(Debug, thiserror::Error)]
#[error("could not enable notifications on {characteristic}: {source}")]
pub struct NotifyStartError {
    pub characteristic: Uuid,
    #[source]
    pub source: btleplug::Error,
}

/// A single line write failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("not connected")]
    NotConnected,
    #[error("link lost: {0}")]
    Disconnected(String),
    #[error("write failed: {0}")]
    Transient(String),
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

impl WriteError {
    /// The link is gone; retrying is pointless.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, WriteError::NotConnected | WriteError::Disconnected(_))
    }

    pub fn from_ble(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => {
                WriteError::Disconnected(err.to_string())
            }
            other => {
                let message = other.to_string();
                let lower = message.to_lowercase();
                if lower.contains("disconnected") || lower.contains("gatt server") {
                    WriteError::Disconnected(message)
                } else {
                    WriteError::Transient(message)
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("could not determine home directory")]
    NoHome,
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
}
