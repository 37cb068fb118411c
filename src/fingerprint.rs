//! Content fingerprinting for captured screenshots.
//!
//! A fingerprint is the SHA-256 digest of the normalized image bytes: the
//! width and height as little-endian `u32`, followed by the raw RGBA pixels.
//! It is the only identity the result cache knows about, so two captures with
//! the same pixels and dimensions are the same screenshot regardless of when
//! they were taken.

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Digest length in bytes (256 bits)
pub const FINGERPRINT_LEN: usize = 32;

/// Fixed-length content digest of a screenshot
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentFingerprint([u8; FINGERPRINT_LEN]);

impl ContentFingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Full 64-character lowercase hex form, used as the cache key
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(FINGERPRINT_LEN * 2);
        for byte in self.0.iter() {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// First 8 hex chars, for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    /// Parse the 64-character hex form back into a fingerprint
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != FINGERPRINT_LEN * 2 || !hex.is_ascii() {
            return None;
        }

        let mut bytes = [0u8; FINGERPRINT_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentFingerprint({})", self.short())
    }
}

impl From<ContentFingerprint> for String {
    fn from(fp: ContentFingerprint) -> Self {
        fp.to_hex()
    }
}

impl TryFrom<String> for ContentFingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value).ok_or_else(|| format!("invalid fingerprint: {}", value))
    }
}

/// Computes content fingerprints for screenshots
pub struct ContentHasher;

impl ContentHasher {
    /// Fingerprint an RGBA image
    pub fn fingerprint(image: &RgbaImage) -> ContentFingerprint {
        Self::fingerprint_raw(image.width(), image.height(), image.as_raw())
    }

    /// Fingerprint raw RGBA pixel data with its dimensions
    pub fn fingerprint_raw(width: u32, height: u32, pixels: &[u8]) -> ContentFingerprint {
        let mut hasher = Sha256::new();
        hasher.update(width.to_le_bytes());
        hasher.update(height.to_le_bytes());
        hasher.update(pixels);

        let digest = hasher.finalize();
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&digest);
        ContentFingerprint(bytes)
    }
}
