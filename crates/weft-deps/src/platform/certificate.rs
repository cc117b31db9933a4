//! Webhook serving certificate
//!
//! The operator's webhook Service is served with a certificate signed by a
//! self-signed CA. Both live in one `kubernetes.io/tls` Secret (`tls.crt`,
//! `tls.key`, `ca.crt`). The pair is regenerated only when the Secret is
//! missing, unparsable, or its leaf is past 80% of its lifetime; otherwise
//! every reconcile keeps the stored material.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::info;
use x509_parser::prelude::*;

use weft_common::{Error, Result};
use weft_converge::{Handle, Loader, ObjectKey, ObjectStore, Ownable, Owner, Persister};

use crate::access::apply_labels;
use crate::naming;

/// Validity of the CA certificate
pub const CA_VALIDITY_DAYS: i64 = 3650;
/// Validity of the serving certificate
pub const CERT_VALIDITY_DAYS: i64 = 365;
/// Fraction of the leaf's lifetime after which it is reissued
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Secret type of the certificate Secret
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
/// Leaf certificate key
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Leaf private key key
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
/// CA bundle key
pub const CA_CERT_KEY: &str = "ca.crt";

fn pki_error(message: impl std::fmt::Display) -> Error {
    Error::internal_with_context("certificate", message.to_string())
}

/// Validity window of a certificate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Unix seconds
    pub not_before: i64,
    /// Unix seconds
    pub not_after: i64,
}

impl CertificateInfo {
    /// Parse the first certificate of a PEM document
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let block = ::pem::parse(pem_data).map_err(|e| pki_error(format!("invalid PEM: {e}")))?;
        let (_, cert) = X509Certificate::from_der(block.contents())
            .map_err(|e| pki_error(format!("invalid certificate: {e}")))?;
        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }

    /// Whether `now` is past [`ROTATION_THRESHOLD`] of the lifetime
    pub fn needs_rotation(&self, now: i64) -> bool {
        let lifetime = (self.not_after - self.not_before).max(1) as f64;
        let age = (now - self.not_before) as f64;
        age / lifetime >= ROTATION_THRESHOLD
    }
}

/// A freshly issued serving certificate and its CA
#[derive(Clone, Debug)]
pub struct ServingCertificate {
    /// Leaf certificate, PEM
    pub cert_pem: String,
    /// Leaf private key, PEM
    pub key_pem: String,
    /// CA certificate, PEM
    pub ca_pem: String,
}

fn validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String("Weft".to_string()));
    dn
}

/// Issue a CA and a serving certificate for `dns_names`
pub fn issue_serving_certificate(dns_names: &[String]) -> Result<ServingCertificate> {
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name = distinguished_name("weft-webhook-ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    (ca_params.not_before, ca_params.not_after) = validity(CA_VALIDITY_DAYS);

    let ca_key = KeyPair::generate().map_err(|e| pki_error(format!("CA key: {e}")))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| pki_error(format!("CA certificate: {e}")))?;
    let ca_pem = ca_cert.pem();

    let mut params = CertificateParams::default();
    params.distinguished_name =
        distinguished_name(dns_names.first().map(String::as_str).unwrap_or("weft-webhook"));
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    (params.not_before, params.not_after) = validity(CERT_VALIDITY_DAYS);
    params.subject_alt_names = dns_names
        .iter()
        .map(|name| {
            Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|e| pki_error(format!("invalid DNS name '{name}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let key = KeyPair::generate().map_err(|e| pki_error(format!("serving key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(&ca_pem, &ca_key)
        .map_err(|e| pki_error(format!("CA issuer: {e}")))?;
    let cert = params
        .signed_by(&key, &issuer)
        .map_err(|e| pki_error(format!("serving certificate: {e}")))?;

    Ok(ServingCertificate {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        ca_pem,
    })
}

/// In-cluster DNS names of `service` in `namespace`
pub fn service_dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.cluster.local"),
    ]
}

/// The certificate Secret of the operator webhook
pub struct CertificateDeps {
    /// The `kubernetes.io/tls` Secret
    pub secret: Handle<Secret>,
    service: String,
}

impl CertificateDeps {
    /// Certificate for the Service `service` of core `core` in `namespace`
    pub fn new(namespace: &str, core: &str, service: &str) -> Self {
        Self {
            secret: Handle::new(
                ObjectKey::namespaced(namespace, naming::webhook_tls_secret(core)),
                Secret::default(),
            ),
            service: service.to_string(),
        }
    }

    fn stored(&self, key: &str) -> Option<&[u8]> {
        self.secret
            .get()
            .data
            .as_ref()?
            .get(key)
            .map(|b| b.0.as_slice())
    }

    fn is_current(&self, now: i64) -> bool {
        let complete = [TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY, CA_CERT_KEY]
            .iter()
            .all(|k| self.stored(k).is_some_and(|v| !v.is_empty()));
        complete
            && self
                .stored(TLS_CERT_KEY)
                .and_then(|pem| CertificateInfo::from_pem(pem).ok())
                .is_some_and(|info| !info.needs_rotation(now))
    }

    /// Keep the stored certificate or issue a new one.
    ///
    /// Returns whether new material was issued.
    pub fn configure(&mut self, labels: &BTreeMap<String, String>, now: i64) -> Result<bool> {
        apply_labels(self.secret.meta_mut(), labels);
        let secret = self.secret.get_mut();
        secret.type_ = Some(TLS_SECRET_TYPE.to_string());
        if self.is_current(now) {
            return Ok(false);
        }

        let namespace = self.secret.key().namespace.clone().unwrap_or_default();
        let issued = issue_serving_certificate(&service_dns_names(&self.service, &namespace))?;
        let bytes = |s: String| ByteString(s.into_bytes());
        self.secret.get_mut().data = Some(BTreeMap::from([
            (TLS_CERT_KEY.to_string(), bytes(issued.cert_pem)),
            (TLS_PRIVATE_KEY_KEY.to_string(), bytes(issued.key_pem)),
            (CA_CERT_KEY.to_string(), bytes(issued.ca_pem)),
        ]));
        info!(secret = %self.secret.key(), "Issued webhook serving certificate");
        Ok(true)
    }

    /// PEM CA bundle clients of the webhook should trust
    pub fn ca_bundle(&self) -> Option<String> {
        self.stored(CA_CERT_KEY)
            .and_then(|b| String::from_utf8(b.to_vec()).ok())
    }
}

#[async_trait]
impl Loader for CertificateDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.secret.load(store).await
    }
}

#[async_trait]
impl Persister for CertificateDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.secret.persist(store).await
    }
}

impl Ownable for CertificateDeps {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.secret.owned(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> i64 {
        ::time::OffsetDateTime::now_utc().unix_timestamp()
    }

    #[test]
    fn issued_certificate_is_fresh() {
        let issued = issue_serving_certificate(&service_dns_names("core-operator", "weft-system")).unwrap();
        let info = CertificateInfo::from_pem(issued.cert_pem.as_bytes()).unwrap();
        assert!(!info.needs_rotation(now()));
        assert!(info.not_after - info.not_before >= (CERT_VALIDITY_DAYS - 1) * 86_400);
        assert!(issued.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn rotation_threshold_is_eighty_percent() {
        let info = CertificateInfo { not_before: 0, not_after: 1_000 };
        assert!(!info.needs_rotation(799));
        assert!(info.needs_rotation(800));
    }

    #[test]
    fn configure_keeps_current_material() {
        let mut deps = CertificateDeps::new("weft-system", "core", "core-operator");
        assert!(deps.configure(&BTreeMap::new(), now()).unwrap());
        let first = deps.ca_bundle().unwrap();

        assert!(!deps.configure(&BTreeMap::new(), now()).unwrap());
        assert_eq!(deps.ca_bundle().unwrap(), first);
    }

    #[test]
    fn configure_reissues_past_threshold_or_when_garbled() {
        let mut deps = CertificateDeps::new("weft-system", "core", "core-operator");
        deps.configure(&BTreeMap::new(), now()).unwrap();
        let first = deps.ca_bundle().unwrap();

        let later = now() + CERT_VALIDITY_DAYS * 86_400;
        assert!(deps.configure(&BTreeMap::new(), later).unwrap());
        assert_ne!(deps.ca_bundle().unwrap(), first);

        deps.secret
            .get_mut()
            .data
            .as_mut()
            .unwrap()
            .insert(TLS_CERT_KEY.to_string(), ByteString(b"garbage".to_vec()));
        assert!(deps.configure(&BTreeMap::new(), now()).unwrap());
    }

    #[test]
    fn dns_names_cover_service_forms() {
        let names = service_dns_names("svc", "ns");
        assert!(names.contains(&"svc.ns.svc.cluster.local".to_string()));
        assert_eq!(names.len(), 4);
    }
}
