//! Device side of the protocol: answer `GETCFG`, surface `SET`, report `UPD`

use tracing::debug;

use crate::codec::ConfigSource;
use crate::line::{Event, Line};
use crate::{Decoded, Decoder};

/// What the device should do about an inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write these lines back, in order.
    Reply(Vec<String>),
    /// Hand the event to the application's widget logic.
    Set(Event),
    Ignore,
}

/// Line handler for a device serving a layout.
#[derive(Debug)]
pub struct Responder {
    source: ConfigSource,
    decoder: Decoder,
}

impl Responder {
    pub fn new(source: ConfigSource) -> Self {
        Self { source, decoder: Decoder::new() }
    }

    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    pub fn handle_line(&mut self, line: &str) -> Action {
        match self.decoder.handle_line(line) {
            Some(Decoded::ConfigRequest) => {
                debug!(encoding = ?self.source.encoding(), "serving config");
                Action::Reply(self.source.lines())
            }
            Some(Decoded::Set(event)) => Action::Set(event),
            _ => Action::Ignore,
        }
    }
}

/// `UPD <id> <value>`
pub fn update_line(id: &str, value: &str) -> String {
    Line::Update(Event::new(id, value)).to_string()
}
