//! Integration tests for CRD operations
//!
//! These tests tell the story of how service owners declare intents through
//! the Kubernetes API.

use kube::api::{Api, PostParams};

use lattice_intents::crd::{Call, CallType, ClientIntents, HttpMethod, HttpResource};

use super::helpers::{cleanup_intents, ensure_namespace, ensure_test_cluster, sample_intents};

const NAMESPACE: &str = "intents-crd-test";

/// Story: a service owner declares that checkout calls payments
///
/// Expected behavior:
/// - The ClientIntents is accepted by the API server
/// - Call type and HTTP resources survive the round trip in camelCase
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_owner_declares_http_intents() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE).await;
    let api: Api<ClientIntents> = Api::namespaced(client.clone(), NAMESPACE);
    let name = "checkout";

    cleanup_intents(&client, NAMESPACE, name).await;

    let intents = sample_intents(
        name,
        NAMESPACE,
        vec![Call {
            name: "payments".to_string(),
            call_type: CallType::Http,
            http_resources: vec![HttpResource {
                path: "/charge".to_string(),
                methods: vec![HttpMethod::Post],
            }],
            ..Default::default()
        }],
    );
    api.create(&PostParams::default(), &intents)
        .await
        .expect("failed to create intents");

    let fetched = api.get(name).await.expect("failed to get intents");
    assert_eq!(fetched.spec.service.name, "checkout");
    assert_eq!(fetched.spec.calls[0].call_type, CallType::Http);
    assert_eq!(fetched.spec.calls[0].http_resources[0].methods, vec![HttpMethod::Post]);

    cleanup_intents(&client, NAMESPACE, name).await;
}

/// Story: a call without a type is treated as generic connectivity
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_untyped_call_defaults_to_generic() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, NAMESPACE).await;
    let api: Api<ClientIntents> = Api::namespaced(client.clone(), NAMESPACE);
    let name = "ledger";

    cleanup_intents(&client, NAMESPACE, name).await;

    let intents = sample_intents(
        name,
        NAMESPACE,
        vec![Call {
            name: "postgres".to_string(),
            ..Default::default()
        }],
    );
    api.create(&PostParams::default(), &intents)
        .await
        .expect("failed to create intents");

    let fetched = api.get(name).await.expect("failed to get intents");
    assert_eq!(fetched.spec.calls[0].call_type, CallType::Generic);
    assert!(fetched.status.is_none());

    cleanup_intents(&client, NAMESPACE, name).await;
}
