//! Cloud IAM backend (ACK)
//!
//! Aws calls name a resource ARN and the IAM actions the client needs on it.
//! They compile to one ACK `Policy` holding every statement and one ACK
//! `Role` the client's service account assumes through IRSA, with the policy
//! attached. Both live in the client namespace.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{converge_backend, release_backend, Backend, BackendReport, Owner, PolicyManager, ReconcilePass};
use crate::artifact::{Artifact, SyncReport};
use crate::crd::{CallType, ClientIntents};
use crate::kube_utils::{bounded_name, ObjectMeta};
use crate::policy::{
    IamPolicy, IamPolicySpec, IamRole, IamRoleSpec, PolicyDocument, PolicyRef, PolicyResource,
};
use crate::resolver::{ResolvedCall, Workload};
use crate::Error;

/// IAM role names are limited to 64 characters
const MAX_ROLE_NAME_LEN: usize = 64;

/// Compiles aws calls into ACK IAM resources
#[derive(Debug)]
pub struct CloudIamManager {
    oidc_provider_arn: String,
}

impl CloudIamManager {
    /// Create a manager trusting the cluster's OIDC provider
    pub fn new(oidc_provider_arn: &str) -> Self {
        Self {
            oidc_provider_arn: oidc_provider_arn.to_string(),
        }
    }
}

#[async_trait]
impl PolicyManager for CloudIamManager {
    fn backend(&self) -> Backend {
        Backend::CloudIam
    }

    fn compute_desired(
        &self,
        intents: &ClientIntents,
        client: &Workload,
        _targets: &[ResolvedCall],
    ) -> Result<Vec<Artifact>, Error> {
        let statements: Vec<_> = intents
            .calls_of(&[CallType::Aws])
            .map(|call| {
                let actions: BTreeSet<&String> = call.aws_actions.iter().collect();
                PolicyDocument::allow(actions.into_iter().cloned().collect(), &call.name)
            })
            .collect();
        if statements.is_empty() {
            return Ok(vec![]);
        }

        let client_identity = intents.client_identity();
        let namespace = intents.namespace_or_default();
        let policy_name = bounded_name(&format!("iam-policy-for-{client_identity}"), MAX_ROLE_NAME_LEN);
        let role_name = bounded_name(&format!("iam-role-for-{client_identity}"), MAX_ROLE_NAME_LEN);

        let policy = IamPolicy::new(
            ObjectMeta::new(&policy_name, &namespace),
            IamPolicySpec {
                name: policy_name.clone(),
                description: Some(format!(
                    "Permissions declared by ClientIntents of {} in {}",
                    intents.service_name(),
                    namespace
                )),
                policy_document: PolicyDocument::new(statements).render()?,
            },
        );

        let trust = PolicyDocument::web_identity_trust(
            &self.oidc_provider_arn,
            &client.namespace,
            &client.service_account,
        );
        let role = IamRole::new(
            ObjectMeta::new(&role_name, &namespace),
            IamRoleSpec {
                name: role_name.clone(),
                description: Some(format!(
                    "Assumed by service account {} in {}",
                    client.service_account, client.namespace
                )),
                assume_role_policy_document: trust.render()?,
                policy_refs: vec![PolicyRef::named(policy_name)],
            },
        );

        Ok(vec![policy.into_artifact()?, role.into_artifact()?])
    }

    async fn reconcile(
        &self,
        pass: &ReconcilePass,
        intents: &ClientIntents,
        client: &Workload,
    ) -> Result<BackendReport, Error> {
        converge_backend(self, pass, intents, client).await
    }

    async fn delete_all(&self, pass: &ReconcilePass, owner: &Owner) -> Result<SyncReport, Error> {
        release_backend(self.backend(), pass, owner).await
    }
}
