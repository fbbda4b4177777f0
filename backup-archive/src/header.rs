// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Nonce metadata header codec.
//!
//! Remote backups start with a small plaintext header that carries the metadata the
//! secret recovery service needs to give back the forward secrecy token. It is read
//! before the rest of the (possibly remote) file is available, so the parser works on
//! a prefix and reports how long a prefix it needs.
//!
//! ```text
//! [8-byte magic][LEB128 body length, at most 3 bytes][body, at most 65535 bytes]
//! ```

use crate::{
    config::{HEADER_MAGIC, MAX_HEADER_BODY_LEN, MAX_HEADER_VARINT_LEN},
    error::HeaderError,
};

/// Result of [`parse_header`] on a prefix of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderParse<'a> {
    /// The header is complete. `consumed` is the total header length; the
    /// encrypted body starts at that offset.
    Complete { body: &'a [u8], consumed: usize },
    /// The prefix is too short. The value is a total prefix length that is
    /// sufficient for the next parse step: exact once the length varint is
    /// readable, otherwise the largest possible header length.
    NeedMoreBytes(usize),
}

/// Longest possible header: magic, full varint and maximum body.
pub const MAX_HEADER_LEN: usize = HEADER_MAGIC.len() + MAX_HEADER_VARINT_LEN + MAX_HEADER_BODY_LEN;

/// Parse the header from the first bytes of an archive.
///
/// A signature mismatch in any supplied byte is rejected immediately, even if the
/// prefix is shorter than the signature.
pub fn parse_header(prefix: &[u8]) -> Result<HeaderParse<'_>, HeaderError> {
    let magic_len = HEADER_MAGIC.len();
    let checked = prefix.len().min(magic_len);
    if prefix[..checked] != HEADER_MAGIC[..checked] {
        return Err(HeaderError::MalformedSignature);
    }

    let mut len: u64 = 0;
    for index in 0..MAX_HEADER_VARINT_LEN {
        let pos = magic_len + index;
        let Some(&byte) = prefix.get(pos) else {
            return Ok(HeaderParse::NeedMoreBytes(MAX_HEADER_LEN));
        };
        len |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 != 0 {
            continue;
        }
        if len > MAX_HEADER_BODY_LEN as u64 {
            return Err(HeaderError::BodyTooLong {
                len,
                max: MAX_HEADER_BODY_LEN,
            });
        }
        #[allow(clippy::cast_possible_truncation)] // bounded above
        let total = pos + 1 + len as usize;
        if prefix.len() < total {
            return Ok(HeaderParse::NeedMoreBytes(total));
        }
        return Ok(HeaderParse::Complete {
            body: &prefix[pos + 1..total],
            consumed: total,
        });
    }
    Err(HeaderError::LengthOverflow)
}

/// Serialize a header body. The result is prepended verbatim to the encrypted archive.
pub fn serialize_header(body: &[u8]) -> Result<Vec<u8>, HeaderError> {
    if body.len() > MAX_HEADER_BODY_LEN {
        return Err(HeaderError::BodyTooLong {
            len: body.len() as u64,
            max: MAX_HEADER_BODY_LEN,
        });
    }
    let mut out = Vec::with_capacity(HEADER_MAGIC.len() + MAX_HEADER_VARINT_LEN + body.len());
    out.extend_from_slice(&HEADER_MAGIC);
    let mut len = body.len();
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let byte = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out.extend_from_slice(body);
    Ok(out)
}
