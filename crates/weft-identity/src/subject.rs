//! Workload identities and their stable token subjects

use weft_common::kube_utils::sha256_hex;

/// The application identity a token is issued to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadIdentity {
    /// One step of a workflow run
    Step {
        /// Namespace of the run
        namespace: String,
        /// Run name
        run: String,
        /// Step name
        step: String,
    },
    /// A webhook trigger's receiver
    Trigger {
        /// Namespace of the trigger
        namespace: String,
        /// Trigger name
        trigger: String,
    },
}

impl WorkloadIdentity {
    /// Subject type prefix
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Step { .. } => "steps",
            Self::Trigger { .. } => "triggers",
        }
    }

    /// Name claim (step or trigger name)
    pub fn name(&self) -> &str {
        match self {
            Self::Step { step, .. } => step,
            Self::Trigger { trigger, .. } => trigger,
        }
    }

    /// Run claim, for steps only
    pub fn run(&self) -> Option<&str> {
        match self {
            Self::Step { run, .. } => Some(run),
            Self::Trigger { .. } => None,
        }
    }

    /// Whether tokens for this identity carry an expiry
    pub fn expires(&self) -> bool {
        matches!(self, Self::Step { .. })
    }

    fn canonical(&self) -> String {
        match self {
            Self::Step { namespace, run, step } => {
                format!("WorkflowRun/{namespace}/{run}/{step}")
            }
            Self::Trigger { namespace, trigger } => format!("WebhookTrigger/{namespace}/{trigger}"),
        }
    }

    /// Stable subject, `<plural>/<hex sha256 of the canonical identity>`
    pub fn subject(&self) -> String {
        format!("{}/{}", self.plural(), sha256_hex(self.canonical().as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(run: &str, step: &str) -> WorkloadIdentity {
        WorkloadIdentity::Step {
            namespace: "tenant-a".to_string(),
            run: run.to_string(),
            step: step.to_string(),
        }
    }

    #[test]
    fn subject_is_stable_and_prefixed() {
        let subject = step("run-42", "build").subject();
        assert!(subject.starts_with("steps/"));
        assert_eq!(subject.len(), "steps/".len() + 64);
        assert_eq!(subject, step("run-42", "build").subject());
    }

    #[test]
    fn subject_distinguishes_identities() {
        assert_ne!(step("run-42", "build").subject(), step("run-42", "test").subject());
        assert_ne!(step("run-42", "build").subject(), step("run-43", "build").subject());

        let trigger = WorkloadIdentity::Trigger {
            namespace: "tenant-a".to_string(),
            trigger: "github".to_string(),
        };
        assert!(trigger.subject().starts_with("triggers/"));
        assert!(!trigger.expires());
        assert_eq!(trigger.run(), None);
    }
}
