//! Checksum utilities for donut
//!
//! Objects are identified by the MD5 of their payload (S3 ETag
//! compatible). Callers may supply the expected digest either as hex or
//! as the base64 form carried by a `Content-MD5` header.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Streaming MD5 calculator that also counts bytes
pub struct Md5Calculator {
    context: md5::Context,
    size: u64,
}

impl Md5Calculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self {
            context: md5::Context::new(),
            size: 0,
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
        self.size += data.len() as u64;
    }

    /// Bytes consumed so far
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Finalize and return the lowercase hex digest
    #[must_use]
    pub fn finalize(self) -> String {
        format!("{:x}", self.context.compute())
    }
}

impl Default for Md5Calculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the lowercase hex MD5 of a buffer
#[must_use]
pub fn compute_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Normalize a caller supplied MD5 into lowercase hex
///
/// Returns `None` for an empty string (no verification requested).
pub fn normalize_md5(expected: &str) -> Result<Option<String>> {
    let expected = expected.trim().trim_matches('"');
    if expected.is_empty() {
        return Ok(None);
    }

    if expected.len() == 32 && expected.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(Some(expected.to_ascii_lowercase()));
    }

    match STANDARD.decode(expected) {
        Ok(bytes) if bytes.len() == 16 => Ok(Some(hex::encode(bytes))),
        _ => Err(Error::invalid_argument(format!(
            "expected checksum is neither hex nor base64 md5: {expected}"
        ))),
    }
}
