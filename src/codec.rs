//! Length-prefixed frame encoding for EPP over TCP (RFC 5734).
//!
//! Each frame on the wire is a 4-byte unsigned big-endian length followed
//! by the payload. The declared length counts the header itself, so the
//! smallest legal value is 4 (an empty payload).
//!
//! Pure byte manipulation; the read/write state machines live in
//! [`crate::channel`].

use crate::error::{Error, Result};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Prefix `payload` with its length header.
///
/// Fails with [`Error::Protocol`] if the total frame size does not fit in
/// the 32-bit length field.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    let total = payload
        .len()
        .checked_add(HEADER_LEN)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| Error::Protocol(format!("frame too large: {} bytes", payload.len())))?;

    let mut buf = Vec::with_capacity(payload.len() + HEADER_LEN);
    buf.extend_from_slice(&total.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parse a length header, returning the declared total frame size.
///
/// The declared length includes the header itself, so anything below 4 is
/// a protocol violation. The payload that follows is `declared - 4` bytes.
pub fn decode_header(header: [u8; HEADER_LEN]) -> Result<usize> {
    let declared = u32::from_be_bytes(header) as usize;
    if declared < HEADER_LEN {
        return Err(Error::Protocol(format!(
            "frame header declares {declared} bytes, minimum is {HEADER_LEN}"
        )));
    }
    Ok(declared)
}
