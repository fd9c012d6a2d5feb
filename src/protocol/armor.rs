//! Binary-safe envelope around one text payload.
//!
//! ```text
//! text ─ charset.encode ─▶ bytes ─ cipher.encrypt ─▶ body
//!
//! envelope = [ 0xA7 ][ body length: u32 BE ][ body ... ]
//! ```
//!
//! The envelope travels as the content of a single length-delimited
//! transport frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::protocol::charset::Charset;
use crate::protocol::cipher::{Cipher, Identity};
use crate::protocol::codec::CodecError;

/// Marks the start of every envelope.
pub const ENVELOPE_MAGIC: u8 = 0xA7;

/// Magic byte plus the body length.
pub const ENVELOPE_HEADER_LEN: usize = 1 + 4;

/// Reversible text ⇄ frame transform.
#[derive(Clone)]
pub struct Armor {
    charset: Charset,
    cipher: Arc<dyn Cipher>,
}

impl Armor {
    /// Armor without encryption.
    pub fn new(charset: Charset) -> Self {
        Self::with_cipher(charset, Arc::new(Identity))
    }

    /// Armor that encrypts bodies with the given provider.
    pub fn with_cipher(charset: Charset, cipher: Arc<dyn Cipher>) -> Self {
        Self { charset, cipher }
    }

    /// Charset in use.
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Turn text into an envelope.
    pub fn seal(&self, text: &str) -> Result<Bytes, CodecError> {
        let encoded = self.charset.encode(text);
        let body = self.cipher.encrypt(&encoded)?;
        let declared = u32::try_from(body.len()).map_err(|_| CodecError::FrameTooLarge(body.len()))?;

        let mut envelope = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + body.len());
        envelope.put_u8(ENVELOPE_MAGIC);
        envelope.put_u32(declared);
        envelope.put_slice(&body);
        Ok(envelope.freeze())
    }

    /// Recover text from an envelope.
    ///
    /// Any malformation (short header, wrong magic, length mismatch, failed
    /// decryption, invalid charset bytes) is reported as
    /// [`CodecError::UndefinedInputType`].
    pub fn open(&self, mut envelope: &[u8]) -> Result<String, CodecError> {
        if envelope.len() < ENVELOPE_HEADER_LEN || envelope.get_u8() != ENVELOPE_MAGIC {
            return Err(CodecError::UndefinedInputType);
        }
        let declared = envelope.get_u32() as usize;
        if declared != envelope.remaining() {
            return Err(CodecError::UndefinedInputType);
        }

        let decrypted = self.cipher.decrypt(envelope).map_err(|e| {
            tracing::debug!(error = %e, "Envelope body failed to decrypt");
            CodecError::UndefinedInputType
        })?;

        self.charset
            .decode(&decrypted)
            .ok_or(CodecError::UndefinedInputType)
    }
}

impl std::fmt::Debug for Armor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Armor").field("charset", &self.charset).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_layout() {
        let armor = Armor::new(Charset::Utf8);
        let sealed = armor.seal("ab").unwrap();
        assert_eq!(&sealed[..], &[ENVELOPE_MAGIC, 0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn empty_text_still_has_a_header() {
        let armor = Armor::new(Charset::Utf8);
        let sealed = armor.seal("").unwrap();
        assert_eq!(sealed.len(), ENVELOPE_HEADER_LEN);
        assert_eq!(armor.open(&sealed).unwrap(), "");
    }

    #[test]
    fn malformed_envelopes_are_undefined() {
        let armor = Armor::new(Charset::Utf8);

        // Too short
        assert!(matches!(armor.open(&[ENVELOPE_MAGIC, 0]), Err(CodecError::UndefinedInputType)));
        // Wrong magic
        assert!(matches!(armor.open(&[0x00, 0, 0, 0, 0]), Err(CodecError::UndefinedInputType)));
        // Declared length longer than the body
        assert!(matches!(
            armor.open(&[ENVELOPE_MAGIC, 0, 0, 0, 9, b'x']),
            Err(CodecError::UndefinedInputType)
        ));
        // Not UTF-8
        assert!(matches!(
            armor.open(&[ENVELOPE_MAGIC, 0, 0, 0, 1, 0xff]),
            Err(CodecError::UndefinedInputType)
        ));
    }

    #[test]
    fn charset_mismatch_is_detected_or_garbled() {
        let sender = Armor::new(Charset::Utf16Be);
        let receiver = Armor::new(Charset::Utf8);
        let sealed = sender.seal("hi").unwrap();
        // UTF-16 "hi" is valid UTF-8 bytes ("\0h\0i") but not the same text.
        assert_ne!(receiver.open(&sealed).ok().as_deref(), Some("hi"));
    }
}
