//! Content digests used for cache keys and output filenames.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContentHasher {
    algorithm: HashAlgorithm,
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Full lowercase hex digest of `bytes`.
    pub fn digest(&self, bytes: &[u8]) -> String {
        let mut state = self.start();
        state.update(bytes);
        state.finish()
    }

    /// Digest truncated to `len` hex characters, as used in filenames.
    pub fn short(&self, bytes: &[u8], len: usize) -> String {
        let mut digest = self.digest(bytes);
        digest.truncate(len);
        digest
    }

    pub fn start(&self) -> HashState {
        match self.algorithm {
            HashAlgorithm::Blake3 => HashState::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Sha256 => HashState::Sha256(Sha256::new()),
        }
    }
}

/// Incremental digest over several parts.
pub enum HashState {
    Blake3(Box<blake3::Hasher>),
    Sha256(Sha256),
}

impl HashState {
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        match self {
            HashState::Blake3(hasher) => {
                hasher.update(bytes);
            }
            HashState::Sha256(hasher) => hasher.update(bytes),
        }
        self
    }

    /// Feed a length-prefixed part so adjacent parts cannot alias.
    pub fn part(&mut self, bytes: &[u8]) -> &mut Self {
        self.update(&(bytes.len() as u64).to_le_bytes());
        self.update(bytes)
    }

    pub fn finish(self) -> String {
        match self {
            HashState::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
            HashState::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_per_algorithm() {
        let blake = ContentHasher::new(HashAlgorithm::Blake3);
        let sha = ContentHasher::new(HashAlgorithm::Sha256);

        assert_eq!(blake.digest(b"abc"), blake.digest(b"abc"));
        assert_ne!(blake.digest(b"abc"), sha.digest(b"abc"));
        assert_eq!(
            sha.digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(blake.short(b"abc", 8).len(), 8);
    }

    #[test]
    fn test_parts_do_not_alias() {
        let hasher = ContentHasher::new(HashAlgorithm::Blake3);

        let mut a = hasher.start();
        a.part(b"ab").part(b"c");
        let mut b = hasher.start();
        b.part(b"a").part(b"bc");

        assert_ne!(a.finish(), b.finish());
    }
}
