//! CRD installation
//!
//! The operator installs its own CRDs on startup with server-side apply, so
//! the served schema always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::info;

use weft_common::crd::all_crds;
use weft_common::retry::{retry_with_backoff, RetryConfig};
use weft_common::{Error, FIELD_MANAGER};

/// Attempts per CRD before start-up gives up
const INSTALL_ATTEMPTS: u32 = 10;

/// Apply every Weft CRD, retrying while the API server is unavailable
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let retry = RetryConfig::with_max_attempts(INSTALL_ATTEMPTS);

    for crd in all_crds() {
        let name = crd.name_any();
        info!(crd = %name, "Installing CRD");
        retry_with_backoff(&retry, &format!("install {name}"), || {
            let (crds, params, crd, name) = (crds.clone(), params.clone(), crd.clone(), name.clone());
            async move {
                crds.patch(&name, &params, &Patch::Apply(&crd))
                    .await
                    .map_err(Error::from)
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {name} CRD: {e}"))?;
    }
    info!("CRDs installed/updated");
    Ok(())
}

/// Every CRD as a multi-document YAML stream
pub fn crds_yaml() -> anyhow::Result<String> {
    let mut out = String::new();
    for crd in all_crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_stream_holds_every_crd() {
        let yaml = crds_yaml().unwrap();
        assert_eq!(yaml.matches("---\n").count(), 4);
        for name in [
            "weftcores.weft.dev",
            "tenants.weft.dev",
            "workflowruns.weft.dev",
            "webhooktriggers.weft.dev",
        ] {
            assert!(yaml.contains(name), "{name} missing");
        }
    }
}
