//! Pluggable payload encryption.
//!
//! The algorithm itself lives outside this crate. Both ends of a connection
//! must be configured with matching providers; without one, [`Identity`]
//! passes bytes through untouched.

use thiserror::Error;

/// Failure reported by a [`Cipher`] implementation.
#[derive(Debug, Error)]
#[error("cipher operation failed: {0}")]
pub struct CipherError(pub String);

/// Capability to encrypt outbound and decrypt inbound payload bytes.
pub trait Cipher: Send + Sync {
    /// Encrypt bytes destined for the peer.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Decrypt bytes received from the peer.
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Pass-through provider used when no encryption is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Cipher for Identity {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plain.to_vec())
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(sealed.to_vec())
    }
}
