//! Curve25519 keypairs for the local end of the tunnel
//!
//! A fresh pair is generated for every key registration; only the public half
//! ever leaves the host.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret};

#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(DalekPublicKey::from(&self.0))
    }

    /// Encoded the way WireGuard config files expect
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(DalekPublicKey);

impl PublicKey {
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let private = PrivateKey::generate();
        let public = private.public_key();
        Self { private, public }
    }
}

pub fn generate_keypair() -> KeyPair {
    KeyPair::generate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_distinct() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_ne!(a.public, b.public);
        assert_ne!(a.private.to_base64(), b.private.to_base64());
    }

    #[test]
    fn test_public_key_derivation() {
        let pair = KeyPair::generate();
        assert_eq!(pair.private.public_key(), pair.public);
        assert_eq!(pair.public.to_base64().len(), 44);
        assert_eq!(pair.private.to_base64().len(), 44);
    }

    #[test]
    fn test_known_keypair_encoding() {
        // RFC 7748 section 6.1, Alice
        let secret: [u8; 32] = [
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ];
        let private = PrivateKey(StaticSecret::from(secret));
        assert_eq!(
            private.to_base64(),
            "dwdtCnMYpX08FsFyUbJmRd9ML4frwJkqsXf7pR25LCo="
        );
        assert_eq!(
            private.public_key().to_string(),
            "hSDwCYkwp1R0i33ctD73Wg2/Og0mOBr066SpjqqbTmo="
        );
    }

    #[test]
    fn test_private_key_is_redacted() {
        let pair = KeyPair::generate();
        let debug = format!("{:?}", pair);
        assert!(!debug.contains(&pair.private.to_base64()));
        assert!(debug.contains(&pair.public.to_base64()));
    }
}
