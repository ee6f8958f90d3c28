//! Node identity: an ed25519 key pair and the address derived from it.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub struct Identity {
    key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }

    /// Address this identity gets from a rendezvous server.
    pub fn address(&self) -> String {
        address_from_key(&self.public_key())
    }
}

/// Derive the stable network address of a public key.
pub fn address_from_key(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    bs58::encode(&digest[..20]).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_deterministic() {
        let secret = [7u8; 32];
        let a = Identity::from_secret(&secret);
        let b = Identity::from_secret(&secret);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.address(), b.address());
        assert_eq!(a.address(), address_from_key(&a.public_key()));

        let c = Identity::generate();
        assert_ne!(a.address(), c.address());
    }
}
