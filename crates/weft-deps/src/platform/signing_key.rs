//! Signing-key Secret of the platform core
//!
//! Generated once and retained: a key that parses is never replaced, since
//! every token already issued was signed with it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use tracing::info;

use weft_common::{Error, Result};
use weft_converge::{ops, Handle, Loader, ObjectKey, ObjectStore, Ownable, Owner, Persister};
use weft_identity::signing_key::{
    encode_public_key, generate_signing_key, public_key_of, PUBLIC_KEY_DATA_KEY,
    SIGNING_KEY_DATA_KEY,
};
use weft_identity::Es256Issuer;

use crate::access::apply_labels;

/// The signing-key Secret
pub struct SigningKeyDeps {
    /// Secret holding the PKCS#8 key and its public half
    pub secret: Handle<Secret>,
}

fn stored_key(secret: &Secret) -> Option<&[u8]> {
    secret
        .data
        .as_ref()?
        .get(SIGNING_KEY_DATA_KEY)
        .map(|b| b.0.as_slice())
}

impl SigningKeyDeps {
    /// Signing-key Secret at `key`
    pub fn new(key: ObjectKey) -> Self {
        Self {
            secret: Handle::new(key, Secret::default()),
        }
    }

    /// Keep a valid stored key or generate one. Returns whether one was generated.
    pub fn configure(&mut self, labels: &BTreeMap<String, String>) -> Result<bool> {
        apply_labels(self.secret.meta_mut(), labels);
        let secret = self.secret.get_mut();
        secret.type_ = Some("Opaque".to_string());

        let existing = stored_key(secret).and_then(|pkcs8| {
            public_key_of(pkcs8).ok().map(|public| (pkcs8.to_vec(), public))
        });
        let (pkcs8, public, generated) = match existing {
            Some((pkcs8, public)) => (pkcs8, public, false),
            None => {
                let pkcs8 = generate_signing_key()?;
                let public = public_key_of(&pkcs8)?;
                (pkcs8, public, true)
            }
        };

        secret.data = Some(BTreeMap::from([
            (SIGNING_KEY_DATA_KEY.to_string(), ByteString(pkcs8)),
            (
                PUBLIC_KEY_DATA_KEY.to_string(),
                ByteString(encode_public_key(&public).into_bytes()),
            ),
        ]));
        if generated {
            info!(secret = %self.secret.key(), "Generated workload signing key");
        }
        Ok(generated)
    }

    /// Base64 public key, once configured
    pub fn public_key(&self) -> Option<String> {
        let bytes = &self.secret.get().data.as_ref()?.get(PUBLIC_KEY_DATA_KEY)?.0;
        String::from_utf8(bytes.clone()).ok()
    }
}

#[async_trait]
impl Loader for SigningKeyDeps {
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.secret.load(store).await
    }
}

#[async_trait]
impl Persister for SigningKeyDeps {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.secret.persist(store).await
    }
}

impl Ownable for SigningKeyDeps {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.secret.owned(owner)
    }
}

/// Load the issuer from the signing-key Secret at `key`.
///
/// A missing Secret or key is [`Error::RequiredSecretMissing`]: the platform
/// core has not converged yet and the caller should retry.
pub async fn load_issuer(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Es256Issuer> {
    let missing = || Error::RequiredSecretMissing {
        namespace: key.namespace.clone().unwrap_or_default(),
        name: key.name.clone(),
    };
    let mut secret = Secret::default();
    if !ops::get_ignore_not_found(store, key, &mut secret).await? {
        return Err(missing());
    }
    let pkcs8 = stored_key(&secret).ok_or_else(missing)?;
    Es256Issuer::from_pkcs8(pkcs8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_converge::memory::MemoryStore;

    fn key() -> ObjectKey {
        ObjectKey::namespaced("weft-system", "core-signing-key")
    }

    #[tokio::test]
    async fn key_is_generated_once_and_retained() {
        let store = MemoryStore::new();
        let mut first = SigningKeyDeps::new(key());
        first.load(&store).await.unwrap();
        assert!(first.configure(&BTreeMap::new()).unwrap());
        first.persist(&store).await.unwrap();

        let mut second = SigningKeyDeps::new(key());
        assert!(second.load(&store).await.unwrap());
        assert!(!second.configure(&BTreeMap::new()).unwrap());
        assert_eq!(second.public_key(), first.public_key());
    }

    #[tokio::test]
    async fn issuer_loads_from_the_secret() {
        let store = MemoryStore::new();
        assert!(matches!(
            load_issuer(&store, &key()).await.err().unwrap(),
            Error::RequiredSecretMissing { .. }
        ));

        let mut deps = SigningKeyDeps::new(key());
        deps.configure(&BTreeMap::new()).unwrap();
        deps.persist(&store).await.unwrap();
        let issuer = load_issuer(&store, &key()).await.unwrap();
        assert!(!issuer.key_id().is_empty());
    }
}
