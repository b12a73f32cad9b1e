//! Config framing: the two wire encodings of a layout and the choice between them

use data_encoding::{BASE64, BASE64_NOPAD};

use crate::line::Line;
use crate::{BASE64_FRAGMENT_LEN, BASE64_THRESHOLD, Config, ConfigDecodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// `CFGBEGIN <len>`, the JSON text, an empty line, `CFGEND`
    FramedJson,
    /// `CFGB64BEGIN <n> <len>`, `n` × `CFGB64 <i> <part>`, `CFGB64END`
    ChunkedBase64,
}

/// Base64 is only worth it for large layouts, and only when the parts were
/// computed ahead of time: splitting strings at runtime is what a small
/// device handles worst.
pub fn choose_encoding(json_len: usize, has_base64_parts: bool) -> Encoding {
    if json_len > BASE64_THRESHOLD && has_base64_parts {
        Encoding::ChunkedBase64
    } else {
        Encoding::FramedJson
    }
}

/// Base64 of the UTF-8 bytes of `json`, split into `fragment_len` parts.
pub fn chunk_base64(json: &str, fragment_len: usize) -> Vec<String> {
    let encoded = BASE64.encode(json.as_bytes());
    encoded
        .as_bytes()
        .chunks(fragment_len.max(1))
        .map(|part| part.iter().map(|&b| char::from(b)).collect())
        .collect()
}

pub fn decode_framed_json(text: &str) -> Result<Config, ConfigDecodeError> {
    Config::from_json(text.trim())
}

/// Base64 → bytes → UTF-8 → JSON. Missing padding and embedded whitespace
/// are tolerated.
pub fn decode_base64(text: &str) -> Result<Config, ConfigDecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64_NOPAD.decode(compact.trim_end_matches('=').as_bytes())?;
    let json = String::from_utf8(bytes)?;
    Config::from_json(&json)
}

/// A layout as a device serves it.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    json: String,
    base64_parts: Vec<String>,
}

impl ConfigSource {
    pub fn new(config: &Config) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(config.to_json()?))
    }

    /// `json` must not contain raw newlines.
    pub fn from_json(json: impl Into<String>) -> Self {
        Self { json: json.into(), base64_parts: Vec::new() }
    }

    /// Supply parts computed ahead of time, as firmware does.
    pub fn with_base64_parts(mut self, parts: Vec<String>) -> Self {
        self.base64_parts = parts;
        self
    }

    pub fn with_generated_base64(self) -> Self {
        let parts = chunk_base64(&self.json, BASE64_FRAGMENT_LEN);
        self.with_base64_parts(parts)
    }

    pub fn json(&self) -> &str {
        &self.json
    }

    pub fn base64_parts(&self) -> &[String] {
        &self.base64_parts
    }

    pub fn encoding(&self) -> Encoding {
        choose_encoding(self.json.len(), !self.base64_parts.is_empty())
    }

    /// The complete transfer in the automatically chosen encoding.
    pub fn lines(&self) -> Vec<String> {
        self.lines_for(self.encoding())
    }

    /// Base64 without parts falls back to framed JSON.
    pub fn lines_for(&self, encoding: Encoding) -> Vec<String> {
        match encoding {
            Encoding::ChunkedBase64 if !self.base64_parts.is_empty() => {
                let len = self.base64_parts.iter().map(String::len).sum();
                let mut lines = Vec::with_capacity(self.base64_parts.len() + 2);
                lines.push(Line::Base64Begin { chunks: self.base64_parts.len(), len }.to_string());
                for (index, data) in self.base64_parts.iter().enumerate() {
                    lines.push(Line::Base64Chunk { index, data }.to_string());
                }
                lines.push(Line::Base64End.to_string());
                lines
            }
            _ => vec![
                Line::ConfigBegin { len: Some(self.json.len()) }.to_string(),
                self.json.clone(),
                String::new(),
                Line::ConfigEnd.to_string(),
            ],
        }
    }
}
