//! Controller wiring
//!
//! One `kube::runtime::Controller` per watched scope. Besides ClientIntents
//! themselves, pods are watched: a pod appearing or changing can make a
//! client resolvable, a target reachable or a sidecar present, so each pod
//! event is mapped back to the intents it may affect. Call targets may live
//! in any namespace, so pods are always watched cluster-wide, even when the
//! intents are scoped to one namespace.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info};

use super::{error_policy, reconcile, Context};
use crate::config::EnforcementConfig;
use crate::crd::ClientIntents;
use crate::resolver::pod_implements_service;
use crate::Error;

/// Watch timeout for the ClientIntents watcher, in seconds
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build one controller future per watched scope.
///
/// With no watched namespaces configured a single cluster-wide controller is
/// returned. The futures run until a shutdown signal arrives.
pub fn build_controllers(
    client: Client,
    config: &EnforcementConfig,
) -> Result<Vec<BoxFuture<'static, ()>>, Error> {
    let ctx = Arc::new(Context::builder(client.clone(), config.clone()).build()?);
    info!(
        backends = ?ctx.managers.iter().map(|m| m.backend().as_str()).collect::<Vec<_>>(),
        "enforcement backends enabled"
    );

    Ok(watch_scopes(config)
        .into_iter()
        .map(|scope| controller_for(client.clone(), scope, ctx.clone()))
        .collect())
}

/// What one controller watches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchScope {
    /// Namespace of the watched ClientIntents, `None` for all
    pub intents_namespace: Option<String>,
    /// Namespace of the watched pods, `None` for all
    pub pods_namespace: Option<String>,
}

/// One scope per watched namespace, or a single cluster-wide scope
pub fn watch_scopes(config: &EnforcementConfig) -> Vec<WatchScope> {
    if config.watched_namespaces.is_empty() {
        return vec![WatchScope {
            intents_namespace: None,
            pods_namespace: None,
        }];
    }
    config
        .watched_namespaces
        .iter()
        .map(|ns| WatchScope {
            intents_namespace: Some(ns.clone()),
            pods_namespace: None,
        })
        .collect()
}

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn controller_for(client: Client, scope: WatchScope, ctx: Arc<Context>) -> BoxFuture<'static, ()> {
    let intents: Api<ClientIntents> = scoped(client.clone(), scope.intents_namespace.as_deref());
    let pods: Api<Pod> = scoped(client, scope.pods_namespace.as_deref());
    let scope = scope.intents_namespace.unwrap_or_else(|| "*".to_string());
    info!(namespace = %scope, "starting ClientIntents controller");

    let controller = Controller::new(intents, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS));
    let store = controller.store();

    controller
        .watches(pods, WatcherConfig::default(), move |pod| {
            intents_for_pod(&store.state(), &pod)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let scope = scope.clone();
            async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(intents = %obj.name, namespace = %scope, ?action, "reconciliation completed");
                    }
                    Err(e) => {
                        error!(error = ?e, namespace = %scope, "reconciliation error");
                    }
                }
            }
        })
        .boxed()
}

/// Intents affected by a pod: those whose client service the pod may
/// implement, and those calling a service the pod may implement.
pub fn intents_for_pod(
    intents: &[Arc<ClientIntents>],
    pod: &Pod,
) -> Vec<ObjectRef<ClientIntents>> {
    let Some(pod_namespace) = pod.namespace() else {
        return vec![];
    };

    intents
        .iter()
        .filter(|intents| {
            let namespace = intents.namespace_or_default();
            let is_client = namespace == pod_namespace
                && pod_implements_service(pod, intents.service_name(), &pod_namespace);
            is_client
                || intents.spec.calls.iter().any(|call| {
                    call.call_type.targets_workload()
                        && call.target_namespace(&namespace) == pod_namespace
                        && pod_implements_service(pod, &call.name, &pod_namespace)
                })
        })
        .map(|intents| ObjectRef::from_obj(intents.as_ref()))
        .collect()
}
