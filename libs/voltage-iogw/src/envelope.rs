//! Frame envelope parsing and encoding
//!
//! Every frame, inbound report or outbound command, shares one envelope:
//!
//! ```text
//! [start:1][payload_type:1][length:2 BE][version:1][body:length][end:1]
//! ```
//!
//! Three wire variants exist in the field. They differ only in framing and
//! are tried in a fixed priority order: the official binary format first,
//! then the cellular binary format, then the legacy ASCII-hex encoding of an
//! official frame.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{DecodeError, DecodeResult};

/// Official frame start/end marker
pub const OFFICIAL_MARKER: u8 = 0x7E;
/// Cellular frame start marker
pub const CELLULAR_START: u8 = 0x68;
/// Cellular frame end marker
pub const CELLULAR_END: u8 = 0x16;
/// ASCII form of the official marker used by legacy hex payloads
pub const LEGACY_HEX_MARKER: &[u8; 2] = b"7E";

/// start + payload type + length(2) + version
pub const HEADER_LEN: usize = 5;
/// Header plus end marker, no body
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;
/// Protocol version written into outbound frames
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Supported wire variants, in parse priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireVariant {
    Official,
    Cellular,
    LegacyHex,
}

impl WireVariant {
    /// Parse priority: official format first, then legacy/cellular variants
    pub const PRIORITY: [WireVariant; 3] = [
        WireVariant::Official,
        WireVariant::Cellular,
        WireVariant::LegacyHex,
    ];

    /// Binary start/end marker pair, `None` for the text variant
    pub fn binary_markers(&self) -> Option<(u8, u8)> {
        match self {
            WireVariant::Official => Some((OFFICIAL_MARKER, OFFICIAL_MARKER)),
            WireVariant::Cellular => Some((CELLULAR_START, CELLULAR_END)),
            WireVariant::LegacyHex => None,
        }
    }

    fn matches(&self, bytes: &[u8]) -> bool {
        match self.binary_markers() {
            Some((start, end)) => bytes.first() == Some(&start) && bytes.last() == Some(&end),
            None => {
                bytes.len() >= 2 * LEGACY_HEX_MARKER.len()
                    && bytes[..2].eq_ignore_ascii_case(LEGACY_HEX_MARKER)
                    && bytes[bytes.len() - 2..].eq_ignore_ascii_case(LEGACY_HEX_MARKER)
            },
        }
    }
}

impl std::fmt::Display for WireVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireVariant::Official => write!(f, "official"),
            WireVariant::Cellular => write!(f, "cellular"),
            WireVariant::LegacyHex => write!(f, "legacy-hex"),
        }
    }
}

/// A validated frame with markers stripped
///
/// `body` borrows from the input for binary variants. Legacy hex frames own
/// their single decoded buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub variant: WireVariant,
    pub start_marker: u8,
    pub payload_type: u8,
    pub length: u16,
    pub version: u8,
    pub body: Cow<'a, [u8]>,
    pub end_marker: u8,
}

impl Envelope<'_> {
    /// Body bytes
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Re-encode with this envelope's variant
    pub fn encode(&self) -> Vec<u8> {
        encode_frame_with(self.variant, self.payload_type, self.version, &self.body)
    }
}

/// Header fields of a binary frame, body addressed by range
struct FrameHeader {
    payload_type: u8,
    length: u16,
    version: u8,
    start_marker: u8,
    end_marker: u8,
}

fn split_binary(bytes: &[u8]) -> DecodeResult<FrameHeader> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort {
            len: bytes.len(),
            min: MIN_FRAME_LEN,
        });
    }

    let length = u16::from_be_bytes([bytes[2], bytes[3]]);
    let actual = bytes.len() - MIN_FRAME_LEN;
    if usize::from(length) != actual {
        return Err(DecodeError::LengthMismatch {
            declared: usize::from(length),
            actual,
        });
    }

    Ok(FrameHeader {
        start_marker: bytes[0],
        payload_type: bytes[1],
        length,
        version: bytes[4],
        end_marker: bytes[bytes.len() - 1],
    })
}

/// Validate and strip the outer frame
///
/// Never panics on arbitrary input.
pub fn parse_envelope(bytes: &[u8]) -> DecodeResult<Envelope<'_>> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort {
            len: bytes.len(),
            min: MIN_FRAME_LEN,
        });
    }

    for variant in WireVariant::PRIORITY {
        if !variant.matches(bytes) {
            continue;
        }
        trace!("Frame matches {} markers ({} bytes)", variant, bytes.len());

        if variant == WireVariant::LegacyHex {
            return parse_legacy_hex(bytes);
        }

        let header = split_binary(bytes)?;
        let body = &bytes[HEADER_LEN..bytes.len() - 1];
        return Ok(Envelope {
            variant,
            start_marker: header.start_marker,
            payload_type: header.payload_type,
            length: header.length,
            version: header.version,
            body: Cow::Borrowed(body),
            end_marker: header.end_marker,
        });
    }

    let start = bytes[0];
    let end = bytes[bytes.len() - 1];
    debug!("No wire variant for markers {:02X}/{:02X}", start, end);
    Err(DecodeError::BadMarker { start, end })
}

fn parse_legacy_hex(text: &[u8]) -> DecodeResult<Envelope<'static>> {
    let mut decoded = hex::decode(text).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
    let header = split_binary(&decoded)?;

    // Reuse the decoded buffer as the body: one copy of the payload total
    decoded.truncate(decoded.len() - 1);
    decoded.drain(..HEADER_LEN);

    Ok(Envelope {
        variant: WireVariant::LegacyHex,
        start_marker: header.start_marker,
        payload_type: header.payload_type,
        length: header.length,
        version: header.version,
        body: Cow::Owned(decoded),
        end_marker: header.end_marker,
    })
}

/// Encode an official frame with the current protocol version
pub fn encode_frame(payload_type: u8, body: &[u8]) -> Vec<u8> {
    encode_frame_with(WireVariant::Official, payload_type, PROTOCOL_VERSION, body)
}

/// Encode a frame for any wire variant
///
/// The length field is a u16; a longer body is cut to `u16::MAX` bytes so
/// the header always matches what is sent.
pub fn encode_frame_with(
    variant: WireVariant,
    payload_type: u8,
    version: u8,
    body: &[u8],
) -> Vec<u8> {
    let length = u16::try_from(body.len()).unwrap_or_else(|_| {
        warn!(
            "Frame body of {} bytes exceeds the length field, cut to {}",
            body.len(),
            u16::MAX
        );
        u16::MAX
    });
    let body = &body[..usize::from(length)];
    let (start, end) = variant
        .binary_markers()
        .unwrap_or((OFFICIAL_MARKER, OFFICIAL_MARKER));

    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + body.len());
    frame.push(start);
    frame.push(payload_type);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(version);
    frame.extend_from_slice(body);
    frame.push(end);

    if variant == WireVariant::LegacyHex {
        hex::encode_upper(&frame).into_bytes()
    } else {
        frame
    }
}
