//! Text encoding of binary columns.
//!
//! A binary value is stored as `\x` followed by two lowercase hex digits per
//! byte. Decoding also accepts the bare hex form. Empty content (`""` or
//! `\x`) is no data.

/// Prefix of every encoded value.
pub const PREFIX: &str = "\\x";

/// Errors decoding a bytea string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteaError {
    /// A character outside `[0-9a-fA-F]`.
    InvalidHex { index: usize, found: char },
    /// An odd number of hex digits.
    OddLength(usize),
}

impl std::fmt::Display for ByteaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteaError::InvalidHex { index, found } => {
                write!(f, "Invalid hex character {found:?} at {index}")
            }
            ByteaError::OddLength(len) => write!(f, "Odd number of hex digits: {len}"),
        }
    }
}

impl std::error::Error for ByteaError {}

/// Encode bytes as `\x` + lowercase hex.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(PREFIX.len() + bytes.len() * 2);
    out.push_str(PREFIX);
    out.push_str(&hex::encode(bytes));
    out
}

/// Decode a bytea string. Returns `None` for empty content.
pub fn decode(text: &str) -> Result<Option<Vec<u8>>, ByteaError> {
    let digits = text.strip_prefix(PREFIX).unwrap_or(text);
    if digits.is_empty() {
        return Ok(None);
    }
    hex::decode(digits).map(Some).map_err(|e| match e {
        hex::FromHexError::InvalidHexCharacter { c, index } => ByteaError::InvalidHex { index, found: c },
        _ => ByteaError::OddLength(digits.len()),
    })
}
