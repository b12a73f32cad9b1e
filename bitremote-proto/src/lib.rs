//! bitremote wire protocol - line grammar, reassembly and config framing
//!
//! A host and a BLE UART device exchange newline-terminated ASCII lines:
//!
//! | Direction     | Line                                         |
//! |---------------|----------------------------------------------|
//! | host → device | `GETCFG`                                     |
//! | device → host | `CFGBEGIN <len>`, JSON, empty line, `CFGEND` |
//! | device → host | `CFGB64BEGIN <n> <len>`, `CFGB64 <i> <part>`, `CFGB64END` |
//! | host → device | `SET <id> <value...>`                        |
//! | device → host | `UPD <id> <value...>`                        |
//!
//! This crate does no I/O. Feed notification bytes to a [`LineBuffer`], the
//! lines it yields to a [`Decoder`], and act on the [`Decoded`] values.

mod codec;
mod config;
mod decoder;
pub mod device;
mod error;
pub mod line;
mod reassembler;

pub use codec::{
    ConfigSource, Encoding, choose_encoding, chunk_base64, decode_base64, decode_framed_json,
};
pub use config::{Config, GaugeScale, GraphOptions, Grid, SliderRange, WidgetKind, WidgetSpec};
pub use decoder::{Decoded, Decoder, Progress};
pub use error::{ConfigDecodeError, ProtocolError};
pub use line::{Event, Line, fragment_line};
pub use reassembler::{LineBuffer, Lines};

/// BLE ATT default payload: the largest single write.
pub const TRANSPORT_CHUNK_SIZE: usize = 20;

/// Characters per `CFGB64` part, so `CFGB64 <i> <part>` stays close to one
/// transport chunk.
pub const BASE64_FRAGMENT_LEN: usize = 18;

/// Layouts whose JSON is longer than this go base64 when parts are available.
pub const BASE64_THRESHOLD: usize = 500;

/// Partial lines beyond this size are discarded.
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;
