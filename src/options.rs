//! Archive write options.
//!
//! ```json
//! { "compression": "zstd", "level": 3, "integrity": "mac", "segment_size": 65536 }
//! ```
//! Every field is optional; missing ones take their defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::CodecId;
use crate::error::{Error, IoContext, Result};

pub const DEFAULT_SEGMENT_SIZE: u32 = 64 * 1024;
pub const DEFAULT_LEVEL: i32 = 3;

/// Outermost verification stage of each encrypted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Integrity {
    None,
    /// Unkeyed BLAKE3 over the plaintext.
    Digest,
    /// Keyed BLAKE3 over the plaintext under the archive MAC key.
    #[default]
    Mac,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveOptions {
    pub compression:  CodecId,
    pub level:        i32,
    pub integrity:    Integrity,
    pub segment_size: u32,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression:  CodecId::Zstd,
            level:        DEFAULT_LEVEL,
            integrity:    Integrity::Mac,
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

impl ArchiveOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(text)
            .map_err(|e| Error::format(format!("invalid archive options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).context(&format!("reading options {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::format(format!("cannot serialise archive options: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(Error::format("segment_size must be at least 1"));
        }
        Ok(())
    }
}
