//! Lattice intents operator - enforces ClientIntents with network, mesh,
//! broker and cloud IAM policy

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use lattice_intents::config::EnforcementConfig;
use lattice_intents::controller::build_controllers;
use lattice_intents::crd::ClientIntents;
use lattice_intents::telemetry::{init_telemetry, TelemetryConfig};
use lattice_intents::FIELD_MANAGER;

/// Lattice intents - compiles declared service intents into enforcement policy
#[derive(Parser, Debug)]
#[command(name = "lattice-intents", version, about, long_about = None)]
struct Cli {
    /// Generate the ClientIntents CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches ClientIntents and pods, and keeps the policies of every
    /// enabled backend converged with the declared intents.
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug, Default)]
struct ControllerArgs {
    #[command(flatten)]
    enforcement: EnforcementConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             The application cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ClientIntents::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::from_env())?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args.enforcement).await,
        None => run_controller(EnforcementConfig::default()).await,
    }
}

/// Ensure the ClientIntents CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply.
/// This ensures the CRD version always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing ClientIntents CRD...");
    crds.patch(
        "clientintents.lattice.dev",
        &params,
        &Patch::Apply(&ClientIntents::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ClientIntents CRD: {}", e))?;

    tracing::info!("ClientIntents CRD installed/updated");
    Ok(())
}

/// Run in controller mode
async fn run_controller(config: EnforcementConfig) -> anyhow::Result<()> {
    tracing::info!(?config, "Lattice intents controller starting...");
    config.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let controllers = build_controllers(client, &config)?;
    tracing::info!(count = controllers.len(), "Starting ClientIntents controllers");

    futures::future::join_all(controllers).await;

    tracing::info!("Lattice intents controller shutting down");
    Ok(())
}
