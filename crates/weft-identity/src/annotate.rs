//! Exactly-once token annotation
//!
//! [`annotate_token`] writes the signed token and its subject onto a workload
//! object (a Job's or Deployment's pod template). Once either annotation is
//! present, later reconciles leave the object alone; there is no renewal.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use weft_common::{
    Error, Result, ANNOTATION_DOMAIN_ID, ANNOTATION_TENANT_ID, ANNOTATION_TOKEN,
    ANNOTATION_TOKEN_SUBJECT,
};
use weft_converge::ownership::annotate;

use crate::claims::{Claims, KubernetesClaims, VaultClaims};
use crate::issuer::Issuer;
use crate::subject::WorkloadIdentity;

/// Everything a token binds, resolved before issuance
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenInputs {
    /// `iss` claim
    pub issuer: String,
    /// `aud` claim; the metadata API rejects tokens without it
    pub audience: String,
    /// Working namespace
    pub namespace_name: String,
    /// Uid of the working namespace
    pub namespace_uid: String,
    /// Delegated bearer token of the metadata-API service account
    pub service_account_token: String,
    /// Immutable ConfigMap name
    pub immutable_config_map: String,
    /// Mutable ConfigMap name
    pub mutable_config_map: String,
    /// Secret storage locations
    pub vault: VaultClaims,
    /// Domain identifier from the owning object
    pub domain_id: Option<String>,
    /// Tenant identifier from the owning object
    pub tenant_id: Option<String>,
    /// Lifetime of tokens for identities that expire
    pub ttl: Option<Duration>,
}

impl TokenInputs {
    /// Copy domain and tenant ids from the owning object's annotations
    pub fn with_owner_ids(mut self, owner: &ObjectMeta) -> Self {
        let get = |key: &str| owner.annotations.as_ref().and_then(|a| a.get(key)).cloned();
        self.domain_id = get(ANNOTATION_DOMAIN_ID);
        self.tenant_id = get(ANNOTATION_TENANT_ID);
        self
    }
}

/// Build the claim set for `identity`
pub fn build_claims(
    inputs: &TokenInputs,
    identity: &WorkloadIdentity,
    now: DateTime<Utc>,
) -> Result<Claims> {
    if inputs.service_account_token.is_empty() {
        return Err(Error::validation_for(
            identity.subject(),
            "delegated service account token is empty",
        ));
    }
    let iat = now.timestamp();
    let exp = match (identity.expires(), inputs.ttl) {
        (true, Some(ttl)) => Some((now + ttl).timestamp()),
        _ => None,
    };
    Ok(Claims {
        iss: inputs.issuer.clone(),
        aud: vec![inputs.audience.clone()],
        sub: identity.subject(),
        iat,
        nbf: iat,
        exp,
        kubernetes: KubernetesClaims {
            namespace_name: inputs.namespace_name.clone(),
            namespace_uid: inputs.namespace_uid.clone(),
            service_account_token: inputs.service_account_token.clone(),
            immutable_config_map_name: inputs.immutable_config_map.clone(),
            mutable_config_map_name: inputs.mutable_config_map.clone(),
        },
        vault: inputs.vault.clone(),
        domain_id: inputs.domain_id.clone(),
        tenant_id: inputs.tenant_id.clone(),
        run_id: identity.run().map(str::to_string),
        name: identity.name().to_string(),
    })
}

/// Whether `target` already carries a token or subject annotation
pub fn has_token(target: &ObjectMeta) -> bool {
    target
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_TOKEN) || a.contains_key(ANNOTATION_TOKEN_SUBJECT))
}

/// Issue a token for `identity` and annotate `target` with it, once.
///
/// Returns `Ok(false)` without doing anything if `target` already carries a
/// token or subject annotation. On any failure `target` is left unchanged.
pub fn annotate_token(
    target: &mut ObjectMeta,
    inputs: &TokenInputs,
    identity: &WorkloadIdentity,
    issuer: &dyn Issuer,
    now: DateTime<Utc>,
) -> Result<bool> {
    if has_token(target) {
        return Ok(false);
    }

    let claims = build_claims(inputs, identity, now)?;
    let token = issuer.issue(&claims)?;

    annotate(target, ANNOTATION_TOKEN, &token);
    annotate(target, ANNOTATION_TOKEN_SUBJECT, &claims.sub);
    debug!(subject = %claims.sub, "Issued workload token");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::WEFT_METADATA_API_AUDIENCE_V1;
    use crate::issuer::{decode_claims_unverified, Es256Issuer, MockIssuer};
    use crate::signing_key::generate_signing_key;

    fn inputs() -> TokenInputs {
        TokenInputs {
            issuer: "weft-operator".to_string(),
            audience: WEFT_METADATA_API_AUDIENCE_V1.to_string(),
            namespace_name: "tenant-a".to_string(),
            namespace_uid: "ns-uid".to_string(),
            service_account_token: "delegated-token".to_string(),
            immutable_config_map: "run-42-immutable".to_string(),
            mutable_config_map: "run-42-mutable".to_string(),
            vault: VaultClaims {
                engine_path: "customers".to_string(),
                secret_path: "tenant-a/secrets".to_string(),
                connection_path: "tenant-a/connections".to_string(),
            },
            domain_id: None,
            tenant_id: None,
            ttl: Some(Duration::hours(24)),
        }
    }

    fn build_step() -> WorkloadIdentity {
        WorkloadIdentity::Step {
            namespace: "tenant-a".to_string(),
            run: "run-42".to_string(),
            step: "build".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    /// Story: issuing twice annotates once and the second call is a no-op
    #[test]
    fn story_issuance_is_idempotent() {
        let mut issuer = MockIssuer::new();
        issuer
            .expect_issue()
            .times(1)
            .returning(|_| Ok("signed".to_string()));

        let mut meta = ObjectMeta::default();
        assert!(annotate_token(&mut meta, &inputs(), &build_step(), &issuer, now()).unwrap());
        assert!(!annotate_token(&mut meta, &inputs(), &build_step(), &issuer, now()).unwrap());

        let annotations = meta.annotations.unwrap();
        assert_eq!(annotations[ANNOTATION_TOKEN], "signed");
        assert_eq!(annotations[ANNOTATION_TOKEN_SUBJECT], build_step().subject());
    }

    /// Story: decoded claims for step "build" of "run-42"
    #[test]
    fn story_claims_content() {
        let issuer = Es256Issuer::from_pkcs8(&generate_signing_key().unwrap()).unwrap();
        let mut meta = ObjectMeta::default();
        annotate_token(&mut meta, &inputs(), &build_step(), &issuer, now()).unwrap();

        let token = &meta.annotations.unwrap()[ANNOTATION_TOKEN];
        let claims = decode_claims_unverified(token).unwrap();
        assert_eq!(claims.run_id.as_deref(), Some("run-42"));
        assert_eq!(claims.name, "build");
        assert!(claims.has_audience(WEFT_METADATA_API_AUDIENCE_V1));
        assert!(!claims.kubernetes.service_account_token.is_empty());
        assert_eq!(claims.exp, Some(now().timestamp() + 24 * 3600));
        assert_eq!(claims.iat, claims.nbf);
    }

    #[test]
    fn signing_failure_writes_nothing() {
        let mut issuer = MockIssuer::new();
        issuer
            .expect_issue()
            .returning(|_| Err(Error::signing("hsm unavailable")));

        let mut meta = ObjectMeta::default();
        let err = annotate_token(&mut meta, &inputs(), &build_step(), &issuer, now()).unwrap_err();
        assert!(matches!(err, Error::Signing { .. }));
        assert!(meta.annotations.is_none());
    }

    #[test]
    fn missing_delegated_token_writes_nothing() {
        let mut issuer = MockIssuer::new();
        issuer.expect_issue().never();

        let mut meta = ObjectMeta::default();
        let unresolved = TokenInputs {
            service_account_token: String::new(),
            ..inputs()
        };
        assert!(annotate_token(&mut meta, &unresolved, &build_step(), &issuer, now()).is_err());
        assert!(meta.annotations.is_none());
    }

    #[test]
    fn subject_annotation_alone_guards_issuance() {
        let mut issuer = MockIssuer::new();
        issuer.expect_issue().never();

        let mut meta = ObjectMeta::default();
        annotate(&mut meta, ANNOTATION_TOKEN_SUBJECT, "steps/old");
        assert!(!annotate_token(&mut meta, &inputs(), &build_step(), &issuer, now()).unwrap());
    }

    #[test]
    fn triggers_never_expire() {
        let trigger = WorkloadIdentity::Trigger {
            namespace: "tenant-a".to_string(),
            trigger: "github".to_string(),
        };
        let claims = build_claims(&inputs(), &trigger, now()).unwrap();
        assert_eq!(claims.exp, None);
        assert_eq!(claims.run_id, None);
        assert!(claims.sub.starts_with("triggers/"));
    }

    #[test]
    fn owner_ids_are_copied() {
        let mut owner = ObjectMeta::default();
        annotate(&mut owner, ANNOTATION_DOMAIN_ID, "dom-1");
        annotate(&mut owner, ANNOTATION_TENANT_ID, "ten-1");
        let resolved = inputs().with_owner_ids(&owner);
        let claims = build_claims(&resolved, &build_step(), now()).unwrap();
        assert_eq!(claims.domain_id.as_deref(), Some("dom-1"));
        assert_eq!(claims.tenant_id.as_deref(), Some("ten-1"));
    }
}
