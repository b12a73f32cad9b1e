//! bitremote BLE client
//!
//! Connects to a micro:bit (or any device speaking the Nordic UART Service),
//! fetches its control layout and exchanges `SET`/`UPD` lines.
//!
//! # Example
//!
//! ```ignore
//! use bitremote_ble::{Session, SessionEvent, Settings, transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load_default()?;
//!     let connection = transport::connect(None, &settings).await?;
//!     let inbound = connection.inbound().await?;
//!
//!     let (session, mut events) = Session::start(connection.clone(), inbound, &settings);
//!     session.request_config_after_delay().await;
//!
//!     while let Some(event) = events.recv().await {
//!         if let SessionEvent::Config(config) = event {
//!             println!("{} widgets", config.widgets.len());
//!             session.set("btn1", "1");
//!             break;
//!         }
//!     }
//!
//!     connection.disconnect().await?;
//!     Ok(())
//! }
//! ```

mod error;
pub mod profile;
pub mod queue;
mod session;
mod settings;
pub mod transport;

pub use error::{ConnectError, NotifyStartError, SettingsError, WriteError};
pub use profile::{Profile, WriteMode};
pub use queue::{LineSink, QueueNotice, QueueSettings, QueueSnapshot, SendQueue};
pub use session::{Session, SessionEvent};
pub use settings::{Settings, bitremote_home};
pub use transport::{Connection, Device};
