//! Service mesh backend (Linkerd)
//!
//! Generates mTLS identity-based authorization for meshed clients:
//! - one `MeshTLSAuthentication` per target namespace naming the client's
//!   proxy identity
//! - one `Server` per target port, shared by every client of that port
//! - generic calls authorize the whole Server
//! - http calls attach an `HTTPRoute` per path and authorize only the route
//!
//! Route names carry a suffix derived from the route's content, so clients
//! asking for the same path on the same Server converge on one route while
//! their authorizations stay separate.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, warn};

use super::{converge_backend, release_backend, Backend, BackendReport, Owner, PolicyManager, ReconcilePass};
use crate::artifact::{Artifact, ArtifactKind, SyncReport};
use crate::crd::{Call, CallType, ClientIntents, HttpResource};
use crate::events::{actions, reasons};
use crate::kube_utils::{bounded_name, deterministic_hash, ObjectMeta, MAX_NAME_LEN};
use crate::policy::{
    AuthorizationPolicy, AuthorizationPolicySpec, HttpRoute, HttpRouteMatch, HttpRouteRule,
    HttpRouteSpec, LabelSelector, MeshTlsAuthentication, MeshTlsAuthenticationSpec, PathMatch,
    PolicyResource, PolicyTargetRef, Server, ServerSpec,
};
use crate::resolver::{ResolvedCall, Workload, WorkloadPort};
use crate::{Error, SERVER_IDENTITY_LABEL};

/// Source of the short disambiguators appended to generated names.
///
/// Must be deterministic: the same rule always yields the same suffix, or
/// every pass would churn the artifacts it names.
pub trait SuffixSource: Send + Sync {
    /// Suffix for the rule described by `rule`
    fn suffix(&self, rule: &str) -> String;
}

/// Default suffix: first 6 hex chars of the SHA-256 of the rule
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHashSuffix;

impl SuffixSource for ContentHashSuffix {
    fn suffix(&self, rule: &str) -> String {
        deterministic_hash(rule)[..6].to_string()
    }
}

/// Compiles intents into Linkerd authorization resources
pub struct MeshManager {
    trust_domain: String,
    suffix: Arc<dyn SuffixSource>,
}

impl MeshManager {
    /// Create a manager for a Linkerd trust domain
    pub fn new(trust_domain: &str, suffix: Arc<dyn SuffixSource>) -> Self {
        Self {
            trust_domain: trust_domain.to_string(),
            suffix,
        }
    }

    /// Linkerd proxy identity of a workload's service account
    fn proxy_identity(&self, workload: &Workload) -> String {
        format!(
            "{}.{}.serviceaccount.identity.linkerd.{}",
            workload.service_account, workload.namespace, self.trust_domain
        )
    }

    fn server(call: &Call, target: &Workload, port: &WorkloadPort) -> Server {
        Server::new(
            ObjectMeta::new(server_name(call, port), &target.namespace),
            ServerSpec {
                pod_selector: LabelSelector::single(SERVER_IDENTITY_LABEL, &target.server_identity),
                port: port.port,
            },
        )
    }

    fn authorization(
        &self,
        name: String,
        namespace: &str,
        target_ref: PolicyTargetRef,
        meshtls_name: &str,
    ) -> AuthorizationPolicy {
        AuthorizationPolicy::new(
            ObjectMeta::new(name, namespace),
            AuthorizationPolicySpec {
                target_ref,
                required_authentication_refs: vec![PolicyTargetRef::to(
                    ArtifactKind::MeshTlsAuthentication,
                    meshtls_name,
                )],
            },
        )
    }

    fn route(&self, call: &Call, target: &Workload, port: &WorkloadPort, resource: &HttpResource) -> HttpRoute {
        let server = server_name(call, port);
        let methods: Vec<&str> = resource.methods.iter().map(|m| m.as_str()).collect();
        let suffix = self
            .suffix
            .suffix(&format!("{server}|{}|{}", resource.path, methods.join(",")));

        let matches = if methods.is_empty() {
            vec![HttpRouteMatch {
                path: PathMatch::prefix(&resource.path),
                method: None,
            }]
        } else {
            methods
                .iter()
                .map(|method| HttpRouteMatch {
                    path: PathMatch::prefix(&resource.path),
                    method: Some(method.to_string()),
                })
                .collect()
        };

        HttpRoute::new(
            ObjectMeta::new(
                bounded_name(
                    &format!("route-for-{}-port-{}-{suffix}", call.name, port.port),
                    MAX_NAME_LEN,
                ),
                &target.namespace,
            ),
            HttpRouteSpec {
                parent_refs: vec![PolicyTargetRef::to(ArtifactKind::Server, server)],
                rules: vec![HttpRouteRule { matches }],
            },
        )
    }

    fn authz_name(&self, call: &Call, port: &WorkloadPort, client_identity: &str, target: &str) -> String {
        let suffix = self.suffix.suffix(&format!("{client_identity}|{target}"));
        bounded_name(
            &format!("authz-for-{}-port-{}-{suffix}", call.name, port.port),
            MAX_NAME_LEN,
        )
    }
}

fn server_name(call: &Call, port: &WorkloadPort) -> String {
    bounded_name(
        &format!("server-for-{}-port-{}", call.name, port.port),
        MAX_NAME_LEN,
    )
}

/// HTTP resources of a call; none means the whole path space
fn http_resources(call: &Call) -> Vec<HttpResource> {
    if call.http_resources.is_empty() {
        vec![HttpResource {
            path: "/".to_string(),
            methods: vec![],
        }]
    } else {
        call.http_resources.clone()
    }
}

#[async_trait]
impl PolicyManager for MeshManager {
    fn backend(&self) -> Backend {
        Backend::Mesh
    }

    fn compute_desired(
        &self,
        intents: &ClientIntents,
        client: &Workload,
        targets: &[ResolvedCall],
    ) -> Result<Vec<Artifact>, Error> {
        let client_identity = intents.client_identity();
        let meshtls_name = bounded_name(
            &format!("meshtls-for-client-{client_identity}"),
            MAX_NAME_LEN,
        );

        let mut desired = Vec::new();
        let mut namespaces = BTreeSet::new();
        for ResolvedCall { call, workload: target } in targets {
            // Linkerd Servers describe TCP ports only
            let ports: Vec<&WorkloadPort> = target
                .ports
                .iter()
                .filter(|p| p.protocol.eq_ignore_ascii_case("TCP"))
                .collect();
            if ports.is_empty() {
                debug!(
                    target = %call.name,
                    namespace = %target.namespace,
                    "target exposes no TCP ports, nothing to authorize"
                );
                continue;
            }
            namespaces.insert(target.namespace.clone());

            for port in ports {
                let server = Self::server(call, target, port);
                let server_ref = PolicyTargetRef::to(ArtifactKind::Server, &server.metadata.name);
                desired.push(server.into_artifact()?);

                match call.call_type {
                    CallType::Http => {
                        for resource in http_resources(call) {
                            let route = self.route(call, target, port, &resource);
                            let route_ref =
                                PolicyTargetRef::to(ArtifactKind::HttpRoute, &route.metadata.name);
                            let authz = self.authorization(
                                self.authz_name(call, port, &client_identity, &route.metadata.name),
                                &target.namespace,
                                route_ref,
                                &meshtls_name,
                            );
                            desired.push(route.into_artifact()?);
                            desired.push(authz.into_artifact()?);
                        }
                    }
                    _ => {
                        let authz = self.authorization(
                            self.authz_name(call, port, &client_identity, &server_ref.name),
                            &target.namespace,
                            server_ref,
                            &meshtls_name,
                        );
                        desired.push(authz.into_artifact()?);
                    }
                }
            }
        }

        let identities = vec![self.proxy_identity(client)];
        for namespace in namespaces {
            let meshtls = MeshTlsAuthentication::new(
                ObjectMeta::new(&meshtls_name, namespace),
                MeshTlsAuthenticationSpec {
                    identities: identities.clone(),
                },
            );
            desired.push(meshtls.into_artifact()?);
        }

        Ok(desired)
    }

    async fn reconcile(
        &self,
        pass: &ReconcilePass,
        intents: &ClientIntents,
        client: &Workload,
    ) -> Result<BackendReport, Error> {
        if client.sidecar_present {
            return converge_backend(self, pass, intents, client).await;
        }

        let backend = self.backend();
        if !pass.is_installed(backend.technology()).await? {
            return Ok(BackendReport::skipped(backend, super::SKIPPED_NOT_INSTALLED));
        }

        warn!(
            service = %client.name,
            namespace = %client.namespace,
            "client pod has no mesh sidecar, mesh policies not created"
        );
        pass.publish(
            EventType::Warning,
            reasons::MISSING_SIDECAR,
            actions::RECONCILE,
            format!(
                "Pods of service {} in namespace {} are not meshed (annotation linkerd.io/inject=enabled missing). \
                 Mesh authorization policies were not created.",
                client.name, client.namespace
            ),
        )
        .await;

        // Whatever the client held while it was meshed goes away
        let sync = pass
            .engine()
            .converge(Owner::of(intents).identity(), backend.kinds(), vec![])
            .await?;
        Ok(BackendReport {
            missing_sidecar: true,
            ..BackendReport::applied(backend, sync)
        })
    }

    async fn delete_all(&self, pass: &ReconcilePass, owner: &Owner) -> Result<SyncReport, Error> {
        release_backend(self.backend(), pass, owner).await
    }
}
