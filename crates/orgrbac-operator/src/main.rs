//! orgrbac - keeps organization RBAC bindings in sync

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use orgrbac_common::crd::RoleBindingTemplate;
use orgrbac_common::telemetry::{init_telemetry, TelemetryConfig};
use orgrbac_common::{KindRegistry, KubeStore, OperatorConfig, FIELD_MANAGER};
use orgrbac_operator::controller_runner::{build_organization_controller, build_template_controller};
use orgrbac_operator::Context;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// orgrbac - materializes RoleBindingTemplates and propagates organization access
#[derive(Parser, Debug)]
#[command(name = "orgrbac", version, about, long_about = None)]
struct Cli {
    /// Print the RoleBindingTemplate CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig; in-cluster or default config when absent
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", serde_yaml::to_string(&RoleBindingTemplate::crd())?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.kubeconfig.as_deref()).await,
    }
}

async fn run_controller(kubeconfig: Option<&Path>) -> anyhow::Result<()> {
    let config = OperatorConfig::from_env().context("invalid operator configuration")?;
    tracing::info!(
        automation_namespace = %config.automation_namespace,
        platform_namespace = %config.platform_namespace,
        "starting orgrbac controllers"
    );

    let client = create_client(kubeconfig).await?;
    ensure_crd_installed(&client).await?;

    let registry = Arc::new(KindRegistry::discover(&client).await);
    let store = KubeStore::new(client.clone(), registry);

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(Context::new(store, config, shutdown.clone()));
    tokio::spawn(cancel_on_signal(shutdown));

    let template_controller = build_template_controller(client.clone(), ctx.clone());
    let organization_controller = build_organization_controller(client, ctx);

    tokio::join!(template_controller, organization_controller);
    tracing::info!("controllers stopped");
    Ok(())
}

async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("failed to load kubeconfig")?
        }
        None => Config::infer().await.context("failed to infer kube config")?,
    };
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Client::try_from(config).context("failed to create kube client")
}

/// Install the RoleBindingTemplate CRD with server-side apply
///
/// The Organization CRD belongs to another component and is only discovered.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = RoleBindingTemplate::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    tracing::info!(crd = %name, "installing CRD");
    crds.patch(&name, &params, &Patch::Apply(&crd))
        .await
        .with_context(|| format!("failed to install CRD {}", name))?;
    Ok(())
}

/// Cancel in-flight passes on SIGINT or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    tracing::info!("shutdown signal received, cancelling in-flight passes");
    shutdown.cancel();
}
