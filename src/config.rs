//! Operator configuration
//!
//! Every flag can also be set through an environment variable so the
//! Deployment can be configured without touching its args.

use std::time::Duration;

use clap::{ArgAction, Args};

use crate::backend::Backend;
use crate::Error;

/// Default Linkerd trust domain
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// Which backends enforce intents, and how
#[derive(Args, Debug, Clone, PartialEq)]
pub struct EnforcementConfig {
    /// Global enforcement switch; when false no backend writes anything
    #[arg(
        long,
        env = "LATTICE_INTENTS_ENFORCEMENT_DEFAULT_STATE",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub enforcement_default_state: bool,

    /// Enforce intents with Cilium network policies
    #[arg(
        long,
        env = "LATTICE_INTENTS_ENABLE_NETWORK_POLICY",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub enable_network_policy: bool,

    /// Enforce intents with Linkerd authorization policies
    #[arg(
        long,
        env = "LATTICE_INTENTS_ENABLE_LINKERD_POLICY",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub enable_linkerd_policy: bool,

    /// Enforce kafka calls with Strimzi KafkaUser ACLs
    #[arg(
        long,
        env = "LATTICE_INTENTS_ENABLE_KAFKA_ACL",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub enable_kafka_acl: bool,

    /// Enforce aws calls with ACK IAM roles and policies
    #[arg(
        long,
        env = "LATTICE_INTENTS_ENABLE_AWS_POLICY",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub enable_aws_policy: bool,

    /// Namespace to watch; repeat for several. Empty watches all namespaces
    #[arg(
        long = "watched-namespace",
        env = "LATTICE_INTENTS_WATCHED_NAMESPACES",
        value_delimiter = ','
    )]
    pub watched_namespaces: Vec<String>,

    /// ARN of the cluster's IAM OIDC provider, required for aws policies
    #[arg(long, env = "LATTICE_INTENTS_AWS_OIDC_PROVIDER_ARN")]
    pub aws_oidc_provider_arn: Option<String>,

    /// Linkerd identity trust domain
    #[arg(
        long,
        env = "LATTICE_INTENTS_LINKERD_TRUST_DOMAIN",
        default_value = DEFAULT_TRUST_DOMAIN
    )]
    pub linkerd_trust_domain: String,

    /// Seconds before a failed reconcile is retried
    #[arg(long, env = "LATTICE_INTENTS_REQUEUE_AFTER_ERROR_SECS", default_value_t = 5)]
    pub requeue_after_error_secs: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            enforcement_default_state: true,
            enable_network_policy: true,
            enable_linkerd_policy: true,
            enable_kafka_acl: true,
            enable_aws_policy: false,
            watched_namespaces: vec![],
            aws_oidc_provider_arn: None,
            linkerd_trust_domain: DEFAULT_TRUST_DOMAIN.to_string(),
            requeue_after_error_secs: 5,
        }
    }
}

impl EnforcementConfig {
    /// Enabled backends in their fixed reconcile order
    pub fn enabled_backends(&self) -> Vec<Backend> {
        if !self.enforcement_default_state {
            return vec![];
        }
        Backend::ALL
            .into_iter()
            .filter(|backend| match backend {
                Backend::Segmentation => self.enable_network_policy,
                Backend::Mesh => self.enable_linkerd_policy,
                Backend::Broker => self.enable_kafka_acl,
                Backend::CloudIam => self.enable_aws_policy,
            })
            .collect()
    }

    /// Reject combinations the backends cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.enforcement_default_state
            && self.enable_aws_policy
            && self
                .aws_oidc_provider_arn
                .as_deref()
                .map_or(true, |arn| arn.trim().is_empty())
        {
            return Err(Error::config(
                "--enable-aws-policy requires --aws-oidc-provider-arn",
            ));
        }
        if self.linkerd_trust_domain.trim().is_empty() {
            return Err(Error::config("--linkerd-trust-domain cannot be empty"));
        }
        Ok(())
    }

    /// Delay before retrying a failed reconcile
    pub fn requeue_after_error(&self) -> Duration {
        Duration::from_secs(self.requeue_after_error_secs)
    }
}
