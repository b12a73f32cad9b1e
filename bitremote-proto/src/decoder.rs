//! Line-level state machine: config transfers and the live event stream

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::codec::{decode_base64, decode_framed_json};
use crate::line::{CFGB64END, CFGBEGIN, CFGB64BEGIN, CFGEND, Event, Line};
use crate::{Config, ConfigDecodeError, ProtocolError};

/// What a line produced, if anything.
#[derive(Debug)]
pub enum Decoded {
    Config(Config),
    ConfigError(ConfigDecodeError),
    /// `UPD` from the device
    Update(Event),
    /// `SET` from the host (device side)
    Set(Event),
    /// `GETCFG` (device side)
    ConfigRequest,
}

impl From<Result<Config, ConfigDecodeError>> for Decoded {
    fn from(result: Result<Config, ConfigDecodeError>) -> Self {
        match result {
            Ok(config) => Decoded::Config(config),
            Err(err) => Decoded::ConfigError(err),
        }
    }
}

/// How far an open config transfer has got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Bytes { received: usize, expected: Option<usize> },
    Chunks { received: usize, expected: usize },
}

#[derive(Debug, Default)]
struct FramedAssembly {
    json: String,
    expected_len: Option<usize>,
    /// `CFG <part>` lines of the older base64-in-frame transfer
    base64: String,
    base64_lines: usize,
}

impl FramedAssembly {
    fn finish(self) -> Result<Config, ConfigDecodeError> {
        if self.base64_lines > 0 {
            debug!(lines = self.base64_lines, "decoding base64 framed config");
            return decode_base64(&self.base64);
        }
        let json = self.json.trim_end();
        if let Some(expected) = self.expected_len {
            if expected != json.len() {
                debug!(expected, received = json.len(), "framed config length differs from header");
            }
        }
        decode_framed_json(json)
    }
}

#[derive(Debug)]
struct Base64Assembly {
    expected_chunks: usize,
    expected_len: usize,
    chunks: BTreeMap<usize, String>,
}

impl Base64Assembly {
    fn finish(mut self) -> Result<Config, ConfigDecodeError> {
        let mut joined = String::new();
        for index in 0..self.expected_chunks {
            let chunk = self.chunks.remove(&index).ok_or(ConfigDecodeError::MissingChunk {
                index,
                expected: self.expected_chunks,
            })?;
            joined.push_str(&chunk);
        }
        if joined.len() != self.expected_len {
            warn!(expected = self.expected_len, received = joined.len(), "base64 config length differs from header");
        }
        decode_base64(&joined)
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    FramedJson(FramedAssembly),
    Base64(Base64Assembly),
}

/// Consumes lines in arrival order. Never fails: bad lines are logged and
/// dropped, bad transfers come out as [`Decoded::ConfigError`].
#[derive(Debug, Default)]
pub struct Decoder {
    state: State,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_line(&mut self, line: &str) -> Option<Decoded> {
        let line = match Line::parse(line) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "dropping malformed line");
                return None;
            }
        };

        let (next, decoded) = match std::mem::take(&mut self.state) {
            State::Idle => Self::idle(line),
            State::FramedJson(assembly) => Self::framed_json(assembly, line),
            State::Base64(assembly) => Self::base64(assembly, line),
        };
        self.state = next;
        decoded
    }

    /// Abandon any open transfer.
    pub fn reset(&mut self) {
        if !matches!(self.state, State::Idle) {
            debug!("abandoning open config transfer");
        }
        self.state = State::Idle;
    }

    pub fn is_assembling(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    pub fn progress(&self) -> Option<Progress> {
        match &self.state {
            State::Idle => None,
            State::FramedJson(a) if a.base64_lines > 0 => Some(Progress::Bytes {
                received: a.base64.len(),
                expected: None,
            }),
            State::FramedJson(a) => Some(Progress::Bytes {
                received: a.json.trim_end().len(),
                expected: a.expected_len,
            }),
            State::Base64(a) => Some(Progress::Chunks {
                received: a.chunks.len(),
                expected: a.expected_chunks,
            }),
        }
    }

    fn idle(line: Line<'_>) -> (State, Option<Decoded>) {
        match line {
            Line::GetConfig => (State::Idle, Some(Decoded::ConfigRequest)),
            Line::Set(event) => (State::Idle, Some(Decoded::Set(event))),
            Line::Update(event) => (State::Idle, Some(Decoded::Update(event))),
            Line::ConfigBegin { len } => {
                debug!(?len, "framed config transfer started");
                let assembly = FramedAssembly { expected_len: len, ..Default::default() };
                (State::FramedJson(assembly), None)
            }
            Line::Base64Begin { chunks, len } => {
                debug!(chunks, len, "base64 config transfer started");
                let assembly = Base64Assembly {
                    expected_chunks: chunks,
                    expected_len: len,
                    chunks: BTreeMap::new(),
                };
                (State::Base64(assembly), None)
            }
            Line::ConfigChunk(_) | Line::ConfigEnd | Line::Base64Chunk { .. } | Line::Base64End => {
                warn!(error = %ProtocolError::NoOpenTransfer(line.token()), "dropping line");
                (State::Idle, None)
            }
            Line::Other(text) => {
                debug!(line = text, "ignoring unrecognized line");
                (State::Idle, None)
            }
        }
    }

    fn framed_json(mut assembly: FramedAssembly, line: Line<'_>) -> (State, Option<Decoded>) {
        match line {
            Line::Other(text) => {
                assembly.json.push_str(text);
                assembly.json.push('\n');
            }
            Line::ConfigChunk(data) => {
                assembly.base64.push_str(data);
                assembly.base64_lines += 1;
            }
            Line::ConfigEnd => return (State::Idle, Some(assembly.finish().into())),
            Line::Base64End => {
                let err = ConfigDecodeError::MismatchedEnd { open: CFGBEGIN, found: CFGB64END };
                return (State::Idle, Some(Decoded::ConfigError(err)));
            }
            Line::ConfigBegin { .. } | Line::Base64Begin { .. } => {
                warn!("new config transfer started before {CFGEND}, abandoning the open one");
                return Self::idle(line);
            }
            Line::Set(_) | Line::Update(_) => {
                warn!(error = %ProtocolError::EventDuringTransfer(line.token()), "dropping line");
            }
            Line::GetConfig | Line::Base64Chunk { .. } => {
                debug!(token = line.token(), "ignoring line inside framed config");
            }
        }
        (State::FramedJson(assembly), None)
    }

    fn base64(mut assembly: Base64Assembly, line: Line<'_>) -> (State, Option<Decoded>) {
        match line {
            Line::Base64Chunk { index, data } => {
                if index >= assembly.expected_chunks {
                    let err = ProtocolError::ChunkOutOfRange { index, expected: assembly.expected_chunks };
                    warn!(error = %err, "dropping chunk");
                } else if assembly.chunks.insert(index, data.to_string()).is_some() {
                    debug!(index, "chunk received twice, keeping the latest");
                }
            }
            Line::Base64End => return (State::Idle, Some(assembly.finish().into())),
            Line::ConfigEnd => {
                let err = ConfigDecodeError::MismatchedEnd { open: CFGB64BEGIN, found: CFGEND };
                return (State::Idle, Some(Decoded::ConfigError(err)));
            }
            Line::ConfigBegin { .. } | Line::Base64Begin { .. } => {
                warn!("new config transfer started before {CFGB64END}, abandoning the open one");
                return Self::idle(line);
            }
            Line::Set(_) | Line::Update(_) => {
                warn!(error = %ProtocolError::EventDuringTransfer(line.token()), "dropping line");
            }
            Line::GetConfig | Line::ConfigChunk(_) | Line::Other(_) => {
                debug!(token = line.token(), "ignoring line inside base64 config");
            }
        }
        (State::Base64(assembly), None)
    }
}
