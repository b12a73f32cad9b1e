//! Line grammar: classification of inbound lines and rendering of outbound ones

use std::fmt;

use crate::ProtocolError;

pub const GETCFG: &str = "GETCFG";
pub const CFGBEGIN: &str = "CFGBEGIN";
pub const CFG: &str = "CFG";
pub const CFGEND: &str = "CFGEND";
pub const CFGB64BEGIN: &str = "CFGB64BEGIN";
pub const CFGB64: &str = "CFGB64";
pub const CFGB64END: &str = "CFGB64END";
pub const SET: &str = "SET";
pub const UPD: &str = "UPD";

/// A widget value change: `SET` from the host, `UPD` from the device.
///
/// Values are opaque to the protocol ("42", "180 50", "VOL 60", a 25-char
/// LED bitstring, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    pub id: String,
    pub value: String,
}

impl Event {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self { id: id.into(), value: value.into() }
    }

    /// Split `<id> <value...>` on the first space; the value keeps any
    /// further spaces verbatim.
    fn from_args(token: &'static str, args: &str, line: &str) -> Result<Self, ProtocolError> {
        let missing = || ProtocolError::MissingTokens { token, line: line.to_string() };
        let (id, value) = args.split_once(' ').ok_or_else(missing)?;
        if id.is_empty() || value.is_empty() {
            return Err(missing());
        }
        Ok(Self::new(id, value))
    }
}

/// One line of the wire protocol, without its `\n` terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    /// `GETCFG`
    GetConfig,
    /// `CFGBEGIN [<jsonByteLength>]`
    ConfigBegin { len: Option<usize> },
    /// `CFG <base64>`, the older framing where the JSON travels base64
    /// encoded inside a `CFGBEGIN`/`CFGEND` pair
    ConfigChunk(&'a str),
    /// `CFGEND`
    ConfigEnd,
    /// `CFGB64BEGIN <chunkCount> <totalBase64Length>`
    Base64Begin { chunks: usize, len: usize },
    /// `CFGB64 <index> <fragment>`
    Base64Chunk { index: usize, data: &'a str },
    /// `CFGB64END`
    Base64End,
    /// `SET <id> <value...>`
    Set(Event),
    /// `UPD <id> <value...>`
    Update(Event),
    /// Anything else: raw JSON content or a line from a newer protocol.
    Other(&'a str),
}

impl<'a> Line<'a> {
    /// Classify a trimmed line by its leading token.
    pub fn parse(line: &'a str) -> Result<Self, ProtocolError> {
        let (head, rest) = match line.split_once(' ') {
            Some((head, rest)) => (head, Some(rest)),
            None => (line, None),
        };

        let malformed = |token| ProtocolError::MalformedHeader { token, line: line.to_string() };

        let parsed = match (head, rest) {
            (GETCFG, None) => Line::GetConfig,
            (CFGBEGIN, None) => Line::ConfigBegin { len: None },
            (CFGBEGIN, Some(rest)) => {
                let len = rest.trim().parse().map_err(|_| malformed(CFGBEGIN))?;
                Line::ConfigBegin { len: Some(len) }
            }
            (CFG, Some(rest)) => Line::ConfigChunk(rest.trim()),
            (CFGEND, None) => Line::ConfigEnd,
            (CFGB64BEGIN, rest) => {
                let mut fields = rest.unwrap_or_default().split_whitespace();
                let mut number = || -> Option<usize> { fields.next()?.parse().ok() };
                match (number(), number()) {
                    (Some(chunks), Some(len)) => Line::Base64Begin { chunks, len },
                    _ => return Err(malformed(CFGB64BEGIN)),
                }
            }
            (CFGB64, Some(rest)) => {
                let bad_index = || ProtocolError::BadChunkIndex(line.to_string());
                let (index, data) = rest.split_once(' ').ok_or_else(bad_index)?;
                let index = index.parse().map_err(|_| bad_index())?;
                Line::Base64Chunk { index, data: data.trim() }
            }
            (CFGB64END, None) => Line::Base64End,
            (SET, rest) => Line::Set(Event::from_args(SET, rest.unwrap_or_default(), line)?),
            (UPD, rest) => Line::Update(Event::from_args(UPD, rest.unwrap_or_default(), line)?),
            _ => Line::Other(line),
        };
        Ok(parsed)
    }

    /// The leading token, for log messages.
    pub fn token(&self) -> &'static str {
        match self {
            Line::GetConfig => GETCFG,
            Line::ConfigBegin { .. } => CFGBEGIN,
            Line::ConfigChunk(_) => CFG,
            Line::ConfigEnd => CFGEND,
            Line::Base64Begin { .. } => CFGB64BEGIN,
            Line::Base64Chunk { .. } => CFGB64,
            Line::Base64End => CFGB64END,
            Line::Set(_) => SET,
            Line::Update(_) => UPD,
            Line::Other(_) => "line",
        }
    }
}

impl fmt::Display for Line<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::GetConfig => f.write_str(GETCFG),
            Line::ConfigBegin { len: Some(len) } => write!(f, "{CFGBEGIN} {len}"),
            Line::ConfigBegin { len: None } => f.write_str(CFGBEGIN),
            Line::ConfigChunk(data) => write!(f, "{CFG} {data}"),
            Line::ConfigEnd => f.write_str(CFGEND),
            Line::Base64Begin { chunks, len } => write!(f, "{CFGB64BEGIN} {chunks} {len}"),
            Line::Base64Chunk { index, data } => write!(f, "{CFGB64} {index} {data}"),
            Line::Base64End => f.write_str(CFGB64END),
            Line::Set(event) => write!(f, "{SET} {} {}", event.id, event.value),
            Line::Update(event) => write!(f, "{UPD} {} {}", event.id, event.value),
            Line::Other(text) => f.write_str(text),
        }
    }
}

/// Append the single `\n` terminator to a logical line and split the bytes
/// into transport-sized writes.
pub fn fragment_line(line: &str, chunk_size: usize) -> Vec<Vec<u8>> {
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(b'\n');
    data.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect()
}
