//! Pod-template pieces shared by step Jobs and webhook Deployments

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, ObjectFieldSelector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use weft_common::{ANNOTATION_TOKEN, ANNOTATION_TOKEN_SUBJECT};

use crate::context::DepsContext;

/// Environment variable carrying the workload token
pub const TOKEN_ENV: &str = "WEFT_TOKEN";
/// Environment variable carrying the metadata-API URL
pub const METADATA_API_URL_ENV: &str = "WEFT_METADATA_API_URL";

/// What a workload container runs
pub struct WorkloadContainer<'a> {
    /// Container name
    pub name: &'a str,
    /// Image reference
    pub image: &'a str,
    /// Shell lines, run with `sh -ec`; exclusive with `command`
    pub input: &'a [String],
    /// Entrypoint override
    pub command: &'a [String],
    /// Arguments
    pub args: &'a [String],
    /// Literal environment
    pub env: &'a BTreeMap<String, String>,
}

fn annotation_env(name: &str, annotation: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: format!("metadata.annotations['{annotation}']"),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl WorkloadContainer<'_> {
    /// The container, reading its token from the pod's own annotation
    pub fn build(&self, ctx: &DepsContext) -> Container {
        let mut env: Vec<EnvVar> = self
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();
        env.push(annotation_env(TOKEN_ENV, ANNOTATION_TOKEN));
        if let Some(url) = &ctx.metadata_api_url {
            env.push(EnvVar {
                name: METADATA_API_URL_ENV.to_string(),
                value: Some(url.clone()),
                ..Default::default()
            });
        }

        let (command, args) = if self.input.is_empty() {
            (self.command.to_vec(), self.args.to_vec())
        } else {
            (
                vec!["/bin/sh".to_string(), "-ec".to_string()],
                vec![self.input.join("\n")],
            )
        };

        Container {
            name: self.name.to_string(),
            image: Some(self.image.to_string()),
            command: (!command.is_empty()).then_some(command),
            args: (!args.is_empty()).then_some(args),
            env: Some(env),
            ..Default::default()
        }
    }
}

/// The token and subject annotations of `meta`, if any
pub fn token_annotations(meta: Option<&ObjectMeta>) -> BTreeMap<String, String> {
    meta.and_then(|m| m.annotations.as_ref())
        .map(|annotations| {
            annotations
                .iter()
                .filter(|(k, _)| *k == ANNOTATION_TOKEN || *k == ANNOTATION_TOKEN_SUBJECT)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Subject recorded on `meta`
pub fn token_subject(meta: Option<&ObjectMeta>) -> Option<String> {
    meta?.annotations.as_ref()?.get(ANNOTATION_TOKEN_SUBJECT).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::manager::DependencyManager;

    #[test]
    fn input_runs_through_the_shell() {
        let input = vec!["make".to_string(), "make test".to_string()];
        let env = BTreeMap::new();
        let container = WorkloadContainer {
            name: "build",
            image: "alpine:3",
            input: &input,
            command: &[],
            args: &[],
            env: &env,
        }
        .build(&DepsContext::new(Arc::new(DependencyManager::new())));

        assert_eq!(container.command.unwrap(), vec!["/bin/sh", "-ec"]);
        assert_eq!(container.args.unwrap(), vec!["make\nmake test"]);
        let token = container.env.unwrap().into_iter().find(|e| e.name == TOKEN_ENV).unwrap();
        assert_eq!(
            token.value_from.unwrap().field_ref.unwrap().field_path,
            "metadata.annotations['weft.dev/token']"
        );
    }

    #[test]
    fn only_token_annotations_are_carried() {
        let meta = ObjectMeta {
            annotations: Some(BTreeMap::from([
                (ANNOTATION_TOKEN.to_string(), "jwt".to_string()),
                (ANNOTATION_TOKEN_SUBJECT.to_string(), "triggers/abc".to_string()),
                ("other".to_string(), "x".to_string()),
            ])),
            ..Default::default()
        };
        let carried = token_annotations(Some(&meta));
        assert_eq!(carried.len(), 2);
        assert_eq!(token_subject(Some(&meta)).as_deref(), Some("triggers/abc"));
        assert!(token_annotations(None).is_empty());
    }
}
