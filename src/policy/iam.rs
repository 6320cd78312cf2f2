//! AWS Controllers for Kubernetes (ACK) IAM types
//!
//! The IAM backend expresses AWS permissions as ACK `Policy` and `Role`
//! resources; the ACK controller reconciles them against the AWS API. Policy
//! documents are embedded as JSON strings, as IAM expects.

use serde::{Deserialize, Serialize};

use super::policy_resource;
use crate::artifact::ArtifactKind;
use crate::kube_utils::ObjectMeta;
use crate::Error;

/// IAM policy language version
pub const POLICY_VERSION: &str = "2012-10-17";

/// ACK IAM Policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IamPolicy {
    /// API version
    #[serde(default = "IamPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "IamPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: IamPolicySpec,
}

policy_resource!(IamPolicy, IamPolicySpec, ArtifactKind::IamPolicy);

/// IAM Policy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IamPolicySpec {
    /// Policy name in AWS
    pub name: String,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Rendered policy document
    pub policy_document: String,
}

/// ACK IAM Role
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IamRole {
    /// API version
    #[serde(default = "IamRole::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "IamRole::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: IamRoleSpec,
}

policy_resource!(IamRole, IamRoleSpec, ArtifactKind::IamRole);

/// IAM Role spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IamRoleSpec {
    /// Role name in AWS
    pub name: String,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Rendered trust policy
    pub assume_role_policy_document: String,
    /// Policies attached to the role
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_refs: Vec<PolicyRef>,
}

/// ACK cross-resource reference
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyRef {
    /// Referenced resource
    pub from: PolicyRefSource,
}

/// Name of a referenced ACK resource in the same namespace
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyRefSource {
    /// Resource name
    pub name: String,
}

impl PolicyRef {
    /// Reference an IAM Policy by resource name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            from: PolicyRefSource { name: name.into() },
        }
    }
}

// =============================================================================
// Policy documents
// =============================================================================

/// IAM policy document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    /// Policy language version
    pub version: String,
    /// Statements
    pub statement: Vec<Statement>,
}

/// IAM policy statement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    /// Allow or Deny
    pub effect: String,
    /// Trusted principal (trust policies only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<serde_json::Value>,
    /// Actions
    pub action: Vec<String>,
    /// Resources (permission policies only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<String>,
    /// Conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<serde_json::Value>,
}

impl PolicyDocument {
    /// Document from statements
    pub fn new(statement: Vec<Statement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement,
        }
    }

    /// Allow `actions` on one resource
    pub fn allow(actions: Vec<String>, resource: impl Into<String>) -> Statement {
        Statement {
            effect: "Allow".to_string(),
            principal: None,
            action: actions,
            resource: vec![resource.into()],
            condition: None,
        }
    }

    /// Trust policy letting a Kubernetes service account assume the role
    /// through the cluster's OIDC provider (IRSA)
    pub fn web_identity_trust(oidc_provider_arn: &str, namespace: &str, service_account: &str) -> Self {
        let issuer = oidc_issuer(oidc_provider_arn);
        let statement = Statement {
            effect: "Allow".to_string(),
            principal: Some(serde_json::json!({ "Federated": oidc_provider_arn })),
            action: vec!["sts:AssumeRoleWithWebIdentity".to_string()],
            resource: vec![],
            condition: Some(serde_json::json!({
                "StringEquals": {
                    (format!("{issuer}:sub")): format!("system:serviceaccount:{namespace}:{service_account}"),
                    (format!("{issuer}:aud")): "sts.amazonaws.com",
                }
            })),
        };
        Self::new(vec![statement])
    }

    /// Render to the JSON string ACK expects
    pub fn render(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization_for_kind("PolicyDocument", e.to_string()))
    }
}

/// Issuer host/path from an OIDC provider ARN
/// (`arn:aws:iam::<account>:oidc-provider/<issuer>`)
fn oidc_issuer(arn: &str) -> &str {
    arn.split_once(":oidc-provider/")
        .map(|(_, issuer)| issuer)
        .unwrap_or(arn)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARN: &str =
        "arn:aws:iam::123456789012:oidc-provider/oidc.eks.us-east-1.amazonaws.com/id/ABCDEF";

    #[test]
    fn trust_policy_scopes_to_service_account() {
        let doc = PolicyDocument::web_identity_trust(ARN, "shop", "checkout");
        let json: serde_json::Value = serde_json::from_str(&doc.render().unwrap()).unwrap();
        let stmt = &json["Statement"][0];
        assert_eq!(stmt["Principal"]["Federated"], ARN);
        assert_eq!(stmt["Action"][0], "sts:AssumeRoleWithWebIdentity");
        assert_eq!(
            stmt["Condition"]["StringEquals"]
                ["oidc.eks.us-east-1.amazonaws.com/id/ABCDEF:sub"],
            "system:serviceaccount:shop:checkout"
        );
        assert!(stmt.get("Resource").is_none());
    }

    #[test]
    fn permission_policy_lists_actions_per_resource() {
        let doc = PolicyDocument::new(vec![PolicyDocument::allow(
            vec!["s3:GetObject".to_string()],
            "arn:aws:s3:::receipts/*",
        )]);
        let json: serde_json::Value = serde_json::from_str(&doc.render().unwrap()).unwrap();
        assert_eq!(json["Version"], POLICY_VERSION);
        assert_eq!(json["Statement"][0]["Effect"], "Allow");
        assert_eq!(json["Statement"][0]["Resource"][0], "arn:aws:s3:::receipts/*");
    }

    #[test]
    fn issuer_falls_back_to_input() {
        assert_eq!(oidc_issuer("not-an-arn"), "not-an-arn");
    }
}
