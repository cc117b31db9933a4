//! Workload identity for Weft
//!
//! Builds the claims that bind a workload's cluster identity to its
//! application identity, signs them through an [`Issuer`], and records the
//! result on the workload exactly once.

#![warn(missing_docs)]

pub mod annotate;
pub mod claims;
pub mod issuer;
pub mod signing_key;
pub mod subject;

pub use annotate::{annotate_token, build_claims, has_token, TokenInputs};
pub use claims::{Claims, KubernetesClaims, VaultClaims, WEFT_METADATA_API_AUDIENCE_V1};
pub use issuer::{decode_claims_unverified, Es256Issuer, Es256Verifier, Issuer};
pub use subject::WorkloadIdentity;
