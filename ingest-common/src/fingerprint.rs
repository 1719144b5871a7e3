use std::fmt;

use sha2::{Digest, Sha256};

/// A SHA-256 digest of a raw message body, used as a deduplication key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageFingerprint([u8; 32]);

impl MessageFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageFingerprint({})", self)
    }
}

/// Compute the fingerprint of a message payload.
pub fn fingerprint(payload: &[u8]) -> MessageFingerprint {
    let digest = Sha256::digest(payload);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    MessageFingerprint(bytes)
}
