//! Signing-key material
//!
//! The key is generated once by the platform-core graph and kept in a Secret
//! in the system namespace. The operator signs with the private half; the
//! metadata API receives only the public half.

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use weft_common::{Error, Result};

/// Secret data key holding the PKCS#8 private key
pub const SIGNING_KEY_DATA_KEY: &str = "signing-key.pk8";
/// Secret data key holding the base64 uncompressed public key
pub const PUBLIC_KEY_DATA_KEY: &str = "public-key";

/// Generate a fresh P-256 key as a PKCS#8 DER document
pub fn generate_signing_key() -> Result<Vec<u8>> {
    let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &SystemRandom::new())
        .map_err(|_| Error::signing("failed to generate signing key"))?;
    Ok(document.as_ref().to_vec())
}

/// Uncompressed public key of a PKCS#8 private key
pub fn public_key_of(pkcs8: &[u8]) -> Result<Vec<u8>> {
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8)
        .map_err(|e| Error::signing(format!("invalid signing key: {e}")))?;
    Ok(key_pair.public_key().as_ref().to_vec())
}

/// Base64 form of the public key, as published to the metadata API
pub fn encode_public_key(public_key: &[u8]) -> String {
    STANDARD.encode(public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_distinct_p256_keys() {
        let a = generate_signing_key().unwrap();
        let b = generate_signing_key().unwrap();
        assert_ne!(a, b);

        let public = public_key_of(&a).unwrap();
        assert_eq!(public.len(), 65);
        assert_eq!(public[0], 0x04);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(public_key_of(&[1, 2, 3]).is_err());
    }
}
