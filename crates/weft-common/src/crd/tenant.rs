//! Tenant CRD: an isolated namespace for one customer

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SecretRef};

/// A tenant owns one working namespace where its runs and triggers execute.
///
/// The namespace may already exist; a pre-existing namespace is shared and is
/// never deleted along with the tenant.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "weft.dev",
    version = "v1alpha1",
    kind = "Tenant",
    namespaced,
    status = "TenantStatus",
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".status.namespace"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// Template for the tenant's working namespace
    #[serde(default)]
    pub namespace_template: NamespaceTemplate,

    /// Secret holding the event sink credentials; must exist before reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_sink_secret_ref: Option<SecretRef>,
}

/// Template applied to the tenant's working namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceTemplate {
    /// Namespace name (default `<tenant-namespace>-<tenant-name>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Labels copied onto the namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations copied onto the namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Tenant {
    /// Working namespace name for this tenant
    pub fn working_namespace(&self) -> String {
        if let Some(name) = &self.spec.namespace_template.name {
            return name.clone();
        }
        let own = self.metadata.namespace.as_deref().unwrap_or("default");
        let name = self.metadata.name.as_deref().unwrap_or_default();
        format!("{own}-{name}")
    }
}

/// Tenant status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    /// Generation observed by the last successful reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// The tenant's working namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_namespace_defaults_to_prefixed_name() {
        let mut tenant = Tenant::new("acme", TenantSpec::default());
        tenant.metadata.namespace = Some("customers".to_string());
        assert_eq!(tenant.working_namespace(), "customers-acme");
    }

    #[test]
    fn working_namespace_honors_template() {
        let spec = TenantSpec {
            namespace_template: NamespaceTemplate {
                name: Some("acme-prod".to_string()),
                ..Default::default()
            },
            event_sink_secret_ref: None,
        };
        let tenant = Tenant::new("acme", spec);
        assert_eq!(tenant.working_namespace(), "acme-prod");
    }
}
