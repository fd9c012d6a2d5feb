//! Message framing and classification.
//!
//! # Responsibilities
//! - Tag outbound application payloads and armor them
//! - De-armor inbound frames and classify them as control or data
//! - Produce the canonical control frames (ping, hello, server-ready)
//!
//! # Classification
//! ```text
//! decoded text has data_tag at data_tag_offset? ── yes ─▶ Data(text without that tag)
//!        │ no
//!        ▼
//! text == ping          ─▶ Ping
//! text == hello         ─▶ Hello
//! text == server_ready  ─▶ ServerReady
//! otherwise             ─▶ UndefinedInputType
//! ```
//! The tag check is positional: only the characters starting exactly at the
//! offset are compared.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

use crate::config::CodecConfig;
use crate::protocol::armor::Armor;
use crate::protocol::cipher::{Cipher, CipherError};

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame is malformed or matches neither data nor a control token.
    #[error("undefined input type")]
    UndefinedInputType,

    /// The payload is shorter than the configured tag offset.
    #[error("data tag offset {offset} is beyond payload of {chars} characters")]
    TagOffsetOutOfRange { offset: usize, chars: usize },

    /// The armored body does not fit the envelope length field.
    #[error("frame body of {0} bytes is too large")]
    FrameTooLarge(usize),

    /// The encryption provider refused the payload.
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Liveness ping; carries nothing.
    Ping,
    /// Client greeting.
    Hello,
    /// Server's answer to hello.
    ServerReady,
    /// Application payload with the data tag removed.
    Data(String),
}

impl Inbound {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Ping => "ping",
            Inbound::Hello => "hello",
            Inbound::ServerReady => "server_ready",
            Inbound::Data(_) => "data",
        }
    }
}

/// Encodes and decodes wire frames for one connection pair.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    config: CodecConfig,
    armor: Armor,
}

impl MessageCodec {
    /// Codec without encryption.
    pub fn new(config: CodecConfig) -> Self {
        let armor = Armor::new(config.charset);
        Self { config, armor }
    }

    /// Codec whose frame bodies pass through `cipher`.
    pub fn with_cipher(config: CodecConfig, cipher: Arc<dyn Cipher>) -> Self {
        let armor = Armor::with_cipher(config.charset, cipher);
        Self { config, armor }
    }

    /// Configuration this codec was built from.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Tag and armor an application payload.
    pub fn encode(&self, payload: &str) -> Result<Bytes, CodecError> {
        let offset = self.config.data_tag_offset;
        let at = char_to_byte(payload, offset).ok_or_else(|| CodecError::TagOffsetOutOfRange {
            offset,
            chars: payload.chars().count(),
        })?;

        let tag = &self.config.data_tag;
        let mut tagged = String::with_capacity(payload.len() + tag.len());
        tagged.push_str(&payload[..at]);
        tagged.push_str(tag);
        tagged.push_str(&payload[at..]);

        self.armor.seal(&tagged)
    }

    /// De-armor and classify an inbound frame.
    pub fn decode(&self, frame: &[u8]) -> Result<Inbound, CodecError> {
        let text = self.armor.open(frame)?;
        self.classify(text)
    }

    /// Armored ping token.
    pub fn encode_ping(&self) -> Result<Bytes, CodecError> {
        self.armor.seal(&self.config.ping)
    }

    /// Armored hello token.
    pub fn encode_hello(&self) -> Result<Bytes, CodecError> {
        self.armor.seal(&self.config.hello)
    }

    /// Armored server-ready token.
    pub fn encode_server_ready(&self) -> Result<Bytes, CodecError> {
        self.armor.seal(&self.config.server_ready)
    }

    fn classify(&self, mut text: String) -> Result<Inbound, CodecError> {
        let tag = &self.config.data_tag;
        if let Some(start) = tag_at(&text, tag, self.config.data_tag_offset) {
            text.replace_range(start..start + tag.len(), "");
            return Ok(Inbound::Data(text));
        }

        if text == self.config.ping {
            Ok(Inbound::Ping)
        } else if text == self.config.hello {
            Ok(Inbound::Hello)
        } else if text == self.config.server_ready {
            Ok(Inbound::ServerReady)
        } else {
            Err(CodecError::UndefinedInputType)
        }
    }
}

/// Byte index of the `offset`-th character, or `text.len()` when `offset`
/// equals the character count.
pub(crate) fn char_to_byte(text: &str, offset: usize) -> Option<usize> {
    text.char_indices()
        .map(|(index, _)| index)
        .chain(std::iter::once(text.len()))
        .nth(offset)
}

/// Byte index where `tag` starts if it sits exactly at character `offset`.
pub(crate) fn tag_at(text: &str, tag: &str, offset: usize) -> Option<usize> {
    let start = char_to_byte(text, offset)?;
    text[start..].starts_with(tag).then_some(start)
}
