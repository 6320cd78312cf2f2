//! Integration tests for policy enforcement
//!
//! These tests drive `reconcile_key` directly against a live API server, so
//! they observe exactly what one reconcile pass writes without racing a
//! running controller.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::runtime::reflector::ObjectRef;
use kube::Client;

use lattice_intents::artifact::ArtifactKind;
use lattice_intents::config::EnforcementConfig;
use lattice_intents::controller::{reconcile_key, Context, ReconcileOutcome};
use lattice_intents::crd::{Call, CallType, ClientIntents};
use lattice_intents::identity::format_identity;
use lattice_intents::{OWNER_IDENTITY_LABEL, SERVER_IDENTITY_LABEL};

use super::helpers::{cleanup_intents, ensure_namespace, ensure_test_cluster, sample_intents};

const CLIENT_NS: &str = "intents-e2e-shop";
const TARGET_NS: &str = "intents-e2e-billing";

fn sample_pod(service: &str, namespace: &str, port: i32) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                SERVER_IDENTITY_LABEL.to_string(),
                format_identity(service, namespace),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("registry.k8s.io/pause:3.9".to_string()),
                ports: Some(vec![ContainerPort {
                    container_port: port,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn ensure_pod(client: &Client, pod: &Pod) {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let _ = api.create(&PostParams::default(), pod).await;
}

async fn reconcile_until_settled(ctx: &Context, key: &ObjectRef<ClientIntents>) {
    for _ in 0..5 {
        let outcome = reconcile_key(ctx, key).await.expect("reconcile failed");
        if outcome == ReconcileOutcome::DONE {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("reconcile of {key} did not settle");
}

async fn owned_network_policies(client: &Client, owner: &str) -> Vec<DynamicObject> {
    let api: Api<DynamicObject> = Api::namespaced_with(
        client.clone(),
        TARGET_NS,
        &ArtifactKind::CiliumNetworkPolicy.api_resource(),
    );
    api.list(&ListParams::default().labels(&format!("{OWNER_IDENTITY_LABEL}={owner}")))
        .await
        .expect("failed to list network policies")
        .items
}

/// Story: checkout is allowed to call payments, then stops calling it
///
/// Expected behavior:
/// - A network policy owned by checkout appears in payments' namespace
/// - Deleting the intents releases the policy and drops the finalizer
#[tokio::test]
#[ignore = "requires kind cluster with Cilium - run with: cargo test --test kind -- --ignored"]
async fn story_network_policy_follows_intents_lifecycle() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, CLIENT_NS).await;
    ensure_namespace(&client, TARGET_NS).await;
    ensure_pod(&client, &sample_pod("checkout", CLIENT_NS, 8080)).await;
    ensure_pod(&client, &sample_pod("payments", TARGET_NS, 8443)).await;

    let config = EnforcementConfig {
        enable_linkerd_policy: false,
        enable_kafka_acl: false,
        ..EnforcementConfig::default()
    };
    let ctx = Context::builder(client.clone(), config)
        .build()
        .expect("failed to build context");

    let name = "checkout";
    cleanup_intents(&client, CLIENT_NS, name).await;
    let intents = sample_intents(
        name,
        CLIENT_NS,
        vec![Call {
            name: "payments".to_string(),
            namespace: Some(TARGET_NS.to_string()),
            call_type: CallType::Generic,
            ..Default::default()
        }],
    );
    let api: Api<ClientIntents> = Api::namespaced(client.clone(), CLIENT_NS);
    api.create(&PostParams::default(), &intents)
        .await
        .expect("failed to create intents");
    let key = ObjectRef::new(name).within(CLIENT_NS);

    // Act: the operator reconciles the new intents
    reconcile_until_settled(&ctx, &key).await;

    // Assert: one policy owned by checkout guards payments
    let owner = format_identity("checkout", CLIENT_NS);
    assert_eq!(owned_network_policies(&client, &owner).await.len(), 1);
    let status = api
        .get(name)
        .await
        .expect("failed to get intents")
        .status
        .expect("status written");
    assert!(status.up_to_date);

    // Act: the owner deletes the intents
    api.delete(name, &DeleteParams::default())
        .await
        .expect("failed to delete intents");
    reconcile_until_settled(&ctx, &key).await;

    // Assert: the policy is gone and so is the object
    assert!(owned_network_policies(&client, &owner).await.is_empty());
    assert!(api.get_opt(name).await.expect("get").is_none());
}
