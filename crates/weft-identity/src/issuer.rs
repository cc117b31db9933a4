//! Token issuance and verification
//!
//! Tokens are compact JWS (`header.payload.signature`, base64url without
//! padding) signed with ECDSA P-256 / SHA-256 through aws-lc-rs. The metadata
//! API verifies them with the public half of the same key.

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use weft_common::kube_utils::short_hash;
use weft_common::{Error, Result};

use crate::claims::Claims;

const ALG_ES256: &str = "ES256";

/// Signs claims into an opaque token
#[cfg_attr(test, automock)]
pub trait Issuer: Send + Sync {
    /// Sign `claims`
    fn issue(&self, claims: &Claims) -> Result<String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

/// ES256 issuer over a PKCS#8 P-256 key
pub struct Es256Issuer {
    key_pair: EcdsaKeyPair,
    key_id: String,
    rng: SystemRandom,
}

impl Es256Issuer {
    /// Load the issuer from a PKCS#8 DER document
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8)
            .map_err(|e| Error::signing(format!("invalid signing key: {e}")))?;
        let key_id = key_id(key_pair.public_key().as_ref());
        Ok(Self {
            key_pair,
            key_id,
            rng: SystemRandom::new(),
        })
    }

    /// Key id placed in the token header
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Verifier for tokens signed by this issuer
    pub fn verifier(&self) -> Es256Verifier {
        Es256Verifier::new(self.key_pair.public_key().as_ref().to_vec())
    }
}

impl Issuer for Es256Issuer {
    fn issue(&self, claims: &Claims) -> Result<String> {
        let header = Header {
            alg: ALG_ES256.to_string(),
            typ: "JWT".to_string(),
            kid: Some(self.key_id.clone()),
        };
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?)
        );
        let signature = self
            .key_pair
            .sign(&self.rng, signing_input.as_bytes())
            .map_err(|_| Error::signing("ECDSA signing failed"))?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.as_ref())
        ))
    }
}

/// Key id for a public key: a short digest of its encoding
pub fn key_id(public_key: &[u8]) -> String {
    short_hash(&URL_SAFE_NO_PAD.encode(public_key))
}

fn split(token: &str) -> Result<(&str, &str, &str)> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) => Ok((h, p, s)),
        _ => Err(Error::validation_for("token", "expected three dot-separated segments")),
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::validation_for("token", format!("invalid base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::validation_for("token", format!("invalid JSON segment: {e}")))
}

/// Decode the claims of a token without checking its signature
pub fn decode_claims_unverified(token: &str) -> Result<Claims> {
    let (_, payload, _) = split(token)?;
    decode_segment(payload)
}

/// Verifies ES256 tokens against one uncompressed P-256 public key
#[derive(Clone, Debug)]
pub struct Es256Verifier {
    public_key: Vec<u8>,
}

impl Es256Verifier {
    /// Verifier for an uncompressed (`0x04 || x || y`) public key
    pub fn new(public_key: Vec<u8>) -> Self {
        Self { public_key }
    }

    /// Check the signature, audience, and time window, returning the claims
    pub fn verify(&self, token: &str, audience: &str, now: i64) -> Result<Claims> {
        let (header_b64, payload_b64, signature_b64) = split(token)?;
        let header: Header = decode_segment(header_b64)?;
        if header.alg != ALG_ES256 {
            return Err(Error::validation_for(
                "token",
                format!("unsupported algorithm {}", header.alg),
            ));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| Error::validation_for("token", format!("invalid signature encoding: {e}")))?;
        let message = &token[..header_b64.len() + 1 + payload_b64.len()];
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, &self.public_key)
            .verify(message.as_bytes(), &signature)
            .map_err(|_| Error::validation_for("token", "signature verification failed"))?;

        let claims: Claims = decode_segment(payload_b64)?;
        if !claims.has_audience(audience) {
            return Err(Error::validation_for("token", format!("audience {audience} not granted")));
        }
        if now < claims.nbf {
            return Err(Error::validation_for("token", "token not yet valid"));
        }
        if claims.exp.is_some_and(|exp| now >= exp) {
            return Err(Error::validation_for("token", "token expired"));
        }
        Ok(claims)
    }
}
