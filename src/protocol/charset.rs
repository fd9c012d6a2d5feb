//! Text encodings accepted on the wire.

use serde::{Deserialize, Serialize};

/// Character set used to turn payload text into bytes before armoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum Charset {
    /// UTF-8 (default).
    #[default]
    #[serde(rename = "UTF-8", alias = "utf-8", alias = "utf8")]
    Utf8,
    /// UTF-16, big-endian, no byte order mark.
    #[serde(rename = "UTF-16BE", alias = "UTF-16", alias = "utf-16", alias = "utf-16be")]
    Utf16Be,
    /// UTF-16, little-endian, no byte order mark.
    #[serde(rename = "UTF-16LE", alias = "utf-16le")]
    Utf16Le,
}

impl Charset {
    /// Encode text into bytes.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Charset::Utf8 => text.as_bytes().to_vec(),
            Charset::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            Charset::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        }
    }

    /// Decode bytes back into text. Returns `None` on malformed input.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Charset::Utf8 => String::from_utf8(bytes.to_vec()).ok(),
            Charset::Utf16Be => decode_utf16(bytes, u16::from_be_bytes),
            Charset::Utf16Le => decode_utf16(bytes, u16::from_le_bytes),
        }
    }

    /// Canonical name, as written in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Utf16Be => "UTF-16BE",
            Charset::Utf16Le => "UTF-16LE",
        }
    }
}

impl std::fmt::Display for Charset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}
