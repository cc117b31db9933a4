//! Waiting on service-account token secrets
//!
//! The token controller fills service-account token secrets asynchronously.
//! Before Kubernetes 1.24 it also created the secret and listed it under the
//! service account's `secrets`; newer clusters only populate secrets that
//! were created explicitly. [`ServiceAccountTokenHandle`] covers both: it
//! persists an explicit token secret next to the service account, and its
//! waiter resolves the first `secrets[]` entry, falling back to that secret.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use tracing::debug;

use weft_common::{Error, Result};

use crate::handle::{Handle, Loader, Ownable, Persister};
use crate::key::ObjectKey;
use crate::ops;
use crate::ownership::{annotate, label, Owner};
use crate::store::ObjectStore;

/// Secret type the token controller populates
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
/// Annotation binding a token secret to its service account
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
/// Data key holding the bearer token
pub const TOKEN_KEY: &str = "token";

/// Poll settings for the token waiter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaiterConfig {
    /// Delay between polls
    pub interval: Duration,
    /// Bound on the whole wait
    pub timeout: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            timeout: Duration::from_secs(120),
        }
    }
}

/// A service account, its explicit token secret, and the resolved token
pub struct ServiceAccountTokenHandle {
    /// The service account
    pub service_account: Handle<ServiceAccount>,
    /// Explicit token secret `<sa>-token`
    pub token_secret: Handle<Secret>,
    config: WaiterConfig,
    resolved: Option<Secret>,
}

/// Outcome of one poll
enum Poll {
    Ready(Secret),
    Missing,
    Unpopulated,
}

impl ServiceAccountTokenHandle {
    /// Handle for the service account at `key`
    pub fn new(key: ObjectKey, config: WaiterConfig) -> Self {
        let secret_key = key.sibling(format!("{}-token", key.name));
        let mut token_secret = Secret {
            type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
            ..Default::default()
        };
        annotate(
            &mut token_secret.metadata,
            SERVICE_ACCOUNT_NAME_ANNOTATION,
            &key.name,
        );
        Self {
            service_account: Handle::new(key, ServiceAccount::default()),
            // The token controller owns `data`; replacing it would wipe the token
            token_secret: Handle::new(secret_key, token_secret).create_only(),
            config,
            resolved: None,
        }
    }

    /// Label both the service account and its token secret
    pub fn label(&mut self, key: &str, value: &str) {
        label(self.service_account.meta_mut(), key, value);
        label(self.token_secret.meta_mut(), key, value);
    }

    /// Service account key
    pub fn key(&self) -> &ObjectKey {
        self.service_account.key()
    }

    /// The resolved token secret, once [`Self::wait_for_token`] succeeded
    pub fn resolved_secret(&self) -> Option<&Secret> {
        self.resolved.as_ref()
    }

    /// The resolved bearer token
    pub fn token(&self) -> Option<String> {
        self.resolved.as_ref().and_then(token_of)
    }

    /// Block until the service account's token secret is populated.
    ///
    /// Polls every `interval` for at most `timeout`. A missing service
    /// account, missing secret, or empty token is retried; a secret of the
    /// wrong type fails immediately. Once resolved the secret is cached and
    /// later calls return without touching the store.
    pub async fn wait_for_token(&mut self, store: &dyn ObjectStore) -> Result<String> {
        if let Some(token) = self.token() {
            return Ok(token);
        }

        let sa_key = self.key().clone();
        let fallback = self.token_secret.key().clone();
        let interval = self.config.interval;
        let mut saw_unpopulated = false;

        let polled = tokio::time::timeout(self.config.timeout, async {
            loop {
                match poll_once(store, &sa_key, &fallback).await {
                    Ok(Poll::Ready(secret)) => return Ok::<Secret, Error>(secret),
                    Ok(Poll::Unpopulated) => saw_unpopulated = true,
                    Ok(Poll::Missing) => {}
                    Err(e) => return Err(e),
                }
                debug!(service_account = %sa_key, "Token secret not ready, retrying");
                tokio::time::sleep(interval).await;
            }
        })
        .await;

        let secret = match polled {
            Ok(result) => result?,
            Err(_elapsed) if saw_unpopulated => {
                return Err(Error::InvalidTokenSecret {
                    namespace: fallback.namespace.clone().unwrap_or_default(),
                    name: fallback.name.clone(),
                    message: "token data was never populated".to_string(),
                })
            }
            Err(_elapsed) => {
                return Err(Error::ServiceAccountMissingDefaultTokenSecret {
                    namespace: sa_key.namespace.clone().unwrap_or_default(),
                    name: sa_key.name.clone(),
                })
            }
        };

        let token = token_of(&secret).unwrap_or_default();
        self.resolved = Some(secret);
        Ok(token)
    }
}

fn token_of(secret: &Secret) -> Option<String> {
    let bytes = &secret.data.as_ref()?.get(TOKEN_KEY)?.0;
    if bytes.is_empty() {
        return None;
    }
    String::from_utf8(bytes.clone()).ok()
}

async fn poll_once(
    store: &dyn ObjectStore,
    sa_key: &ObjectKey,
    fallback: &ObjectKey,
) -> Result<Poll> {
    let mut sa = ServiceAccount::default();
    if !ops::get_ignore_not_found(store, sa_key, &mut sa).await? {
        return Ok(Poll::Missing);
    }

    let secret_key = sa
        .secrets
        .as_ref()
        .and_then(|refs| refs.first())
        .and_then(|r| r.name.clone())
        .map(|name| sa_key.sibling(name))
        .unwrap_or_else(|| fallback.clone());

    let mut secret = Secret::default();
    if !ops::get_ignore_not_found(store, &secret_key, &mut secret).await? {
        return Ok(Poll::Missing);
    }

    if secret.type_.as_deref() != Some(SERVICE_ACCOUNT_TOKEN_TYPE) {
        return Err(Error::InvalidTokenSecret {
            namespace: secret_key.namespace.clone().unwrap_or_default(),
            name: secret_key.name.clone(),
            message: format!("unexpected type {:?}", secret.type_),
        });
    }
    if token_of(&secret).is_none() {
        return Ok(Poll::Unpopulated);
    }
    Ok(Poll::Ready(secret))
}

#[async_trait]
impl Loader for ServiceAccountTokenHandle {
    /// Plain load of the service account and its explicit secret; never waits
    async fn load(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        let sa = self.service_account.load(store).await?;
        let secret = self.token_secret.load(store).await?;
        Ok(sa && secret)
    }
}

#[async_trait]
impl Persister for ServiceAccountTokenHandle {
    async fn persist(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.service_account.persist(store).await?;
        self.token_secret.persist(store).await
    }
}

impl Ownable for ServiceAccountTokenHandle {
    fn owned(&mut self, owner: &Owner) -> Result<()> {
        self.service_account.owned(owner)?;
        self.token_secret.owned(owner)
    }
}
