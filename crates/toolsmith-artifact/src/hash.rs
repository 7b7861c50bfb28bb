//! Prompt hashing primitives
//!
//! Provides [`PromptHash`], a strongly-typed 32-byte digest identifying a
//! cached tool by the prompt that generated it.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Normalize a prompt before hashing (trim surrounding whitespace, lowercase)
///
/// Prompts that differ only in letter case or leading/trailing whitespace
/// collide intentionally.
#[inline]
#[must_use]
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.trim().to_lowercase()
}

/// A 32-byte prompt digest (Blake3)
///
/// Identity key for cached tools. Pure function of the normalized prompt
/// text; the runtime input is never folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PromptHash([u8; 32]);

impl PromptHash {
    /// Create a new PromptHash from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create hash from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    #[inline]
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != 32 {
            return Err(HashError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Hash a prompt after normalization
    ///
    /// Always succeeds, including for the empty string. Callers reject empty
    /// prompts before reaching this point.
    #[inline]
    #[must_use]
    pub fn of_prompt(prompt: &str) -> Self {
        let normalized = normalize_prompt(prompt);
        Self::new(*blake3::hash(normalized.as_bytes()).as_bytes())
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Key under which the production isolate for this tool runs
    #[inline]
    #[must_use]
    pub fn execution_key(&self) -> String {
        format!("tool:{self}")
    }

    /// Key under which the one-shot validation isolate runs
    #[inline]
    #[must_use]
    pub fn validation_key(&self) -> String {
        format!("validate:{self}")
    }
}

impl Display for PromptHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PromptHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8; 32]> for PromptHash {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl serde::Serialize for PromptHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> serde::Deserialize<'de> for PromptHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PromptHashVisitor;

        impl serde::de::Visitor<'_> for PromptHashVisitor {
            type Value = PromptHash;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a 32-byte hash as hex string or byte array")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }

            fn visit_bytes<E>(self, value: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                PromptHash::from_slice(value).map_err(serde::de::Error::custom)
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(PromptHashVisitor)
        } else {
            deserializer.deserialize_bytes(PromptHashVisitor)
        }
    }
}

/// Errors that can occur when parsing prompt hashes
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Invalid hash length
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
