//! Shared setup for cluster-backed tests

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, CustomResourceExt};

use lattice_intents::crd::{ClientIntents, ClientIntentsSpec, ServiceRef};
use lattice_intents::FIELD_MANAGER;

/// Connect to the current cluster and make sure the ClientIntents CRD exists
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let client = Client::try_default()
        .await
        .map_err(|e| format!("failed to create client: {e}"))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    crds.patch(
        "clientintents.lattice.dev",
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&ClientIntents::crd()),
    )
    .await
    .map_err(|e| format!("failed to install CRD: {e}"))?;

    // Give the API server a moment to serve the new resource
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(client)
}

/// Create a namespace, ignoring AlreadyExists
pub async fn ensure_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let _ = api.create(&PostParams::default(), &ns).await;
}

/// A ClientIntents with the given calls
pub fn sample_intents(
    service: &str,
    namespace: &str,
    calls: Vec<lattice_intents::crd::Call>,
) -> ClientIntents {
    let mut intents = ClientIntents::new(
        service,
        ClientIntentsSpec {
            service: ServiceRef {
                name: service.to_string(),
            },
            calls,
        },
    );
    intents.metadata.namespace = Some(namespace.to_string());
    intents
}

/// Delete a ClientIntents, ignoring errors
pub async fn cleanup_intents(client: &Client, namespace: &str, name: &str) {
    let api: Api<ClientIntents> = Api::namespaced(client.clone(), namespace);
    let _ = api.delete(name, &DeleteParams::default()).await;
}
