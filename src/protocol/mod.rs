//! Wire protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     payload → codec.rs (insert data tag at offset)
//!             → armor.rs (charset encode → cipher.rs encrypt → envelope)
//!             → length-delimited transport frame
//!
//! Inbound:
//!     transport frame → armor.rs (envelope → decrypt → charset decode)
//!                     → codec.rs (classify: Data | Ping | Hello | ServerReady)
//! ```
//!
//! # Handshake
//! ```text
//! client ── hello ───────▶ server
//! client ◀── server-ready ── server
//! then both sides interleave ping and data frames
//! ```

pub mod armor;
pub mod charset;
pub mod cipher;
pub mod codec;

pub use charset::Charset;
pub use cipher::{Cipher, CipherError, Identity};
pub use codec::{CodecError, Inbound, MessageCodec};
