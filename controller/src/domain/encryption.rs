//! Payload encryption seam
//!
//! Event payloads and async-call requests are stored encrypted under a
//! per-subsystem key space. Actual key management lives outside the
//! controller; the in-tree implementation is a passthrough used for local
//! and embedded deployments. Decryption failures surface as payload errors,
//! which the executor treats as non-retryable.

use std::fmt;

use thiserror::Error;

/// Which subsystem key a payload is sealed under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpace {
    Async,
    Logs,
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Async => write!(f, "async"),
            Self::Logs => write!(f, "logs"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to encrypt {space} payload: {message}")]
    Encrypt { space: KeySpace, message: String },

    #[error("failed to decrypt {space} payload: {message}")]
    Decrypt { space: KeySpace, message: String },
}

/// Seals and opens payloads for storage
pub trait PayloadCodec: Send + Sync {
    fn encrypt(&self, space: KeySpace, plaintext: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decrypt(&self, space: KeySpace, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// No-op codec for deployments without an external key service
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl PayloadCodec for PassthroughCodec {
    fn encrypt(&self, _space: KeySpace, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, _space: KeySpace, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(ciphertext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_roundtrip() {
        let codec = PassthroughCodec;
        let sealed = codec.encrypt(KeySpace::Async, b"payload").unwrap();
        assert_eq!(codec.decrypt(KeySpace::Async, &sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_key_space_display() {
        assert_eq!(KeySpace::Async.to_string(), "async");
        assert_eq!(KeySpace::Logs.to_string(), "logs");
    }
}
