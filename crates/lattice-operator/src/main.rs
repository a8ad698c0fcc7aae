//! Lattice local model cache - cache controllers and per-node download agent

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;

use lattice_common::config::LOCAL_MODEL_CONFIG_MAP;
use lattice_common::telemetry::{init_telemetry, TelemetryConfig};
use lattice_common::{LocalModelConfig, LATTICE_SYSTEM_NAMESPACE};
use lattice_model_agent::{LocalFilesystem, ModelFilesystem};
use lattice_operator::controller_runner::{
    build_agent_controller, build_cache_controllers, build_node_group_controller,
    ControllerFuture,
};
use lattice_operator::startup::{crds_yaml, ensure_crds};

/// Lattice local model cache - keeps model weights on the nodes that serve them
#[derive(Parser, Debug)]
#[command(name = "lattice-model-cache", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace the operator and its agents run in
    #[arg(long, global = true, env = "POD_NAMESPACE", default_value = LATTICE_SYSTEM_NAMESPACE)]
    namespace: String,

    /// ConfigMap holding the local model configuration
    #[arg(long, global = true, default_value = LOCAL_MODEL_CONFIG_MAP)]
    config_map: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the cache controllers (default mode)
    ///
    /// - Installs the local model CRDs
    /// - Reconciles LocalModelCache and LocalModelNamespaceCache objects
    /// - Deploys a node agent onto every LocalModelNodeGroup
    Controller,

    /// Run the download agent for one node
    Agent {
        /// Name of the node this agent runs on
        #[arg(long, env = "NODE_NAME")]
        node_name: String,

        /// Directory holding one folder per cached model
        #[arg(long, default_value = "/mnt/models/models")]
        model_root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crds_yaml()?);
        return Ok(());
    }

    let telemetry = match &cli.command {
        Some(Commands::Agent { node_name, .. }) => TelemetryConfig::agent(node_name.clone()),
        _ => TelemetryConfig::controller(),
    };
    init_telemetry(telemetry)?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;
    let config = LocalModelConfig::load(&client, &cli.namespace, &cli.config_map).await?;
    tracing::info!(
        namespace = %cli.namespace,
        job_namespace = %config.job_namespace,
        volume_management = !config.disable_volume_management,
        "Loaded local model configuration"
    );

    match cli.command {
        Some(Commands::Controller) | None => run_controller(client, config, cli.namespace).await,
        Some(Commands::Agent {
            node_name,
            model_root,
        }) => run_agent(client, config, node_name, model_root).await,
    }
}

async fn run_controller(
    client: Client,
    config: LocalModelConfig,
    namespace: String,
) -> anyhow::Result<()> {
    ensure_crds(&client).await?;

    tracing::info!("Starting local model cache controllers:");
    let mut controllers = build_cache_controllers(client.clone(), config.clone());
    controllers.extend(build_node_group_controller(client, config, namespace));

    run_until_first_exit(controllers).await;
    tracing::info!("Local model cache controllers shutting down");
    Ok(())
}

async fn run_agent(
    client: Client,
    config: LocalModelConfig,
    node_name: String,
    model_root: PathBuf,
) -> anyhow::Result<()> {
    let fs = LocalFilesystem::new(model_root.clone());
    fs.ensure_root_folder().await?;
    tracing::info!(node = %node_name, model_root = %model_root.display(), "Starting node agent");

    let controllers = build_agent_controller(client, node_name, Arc::new(fs), config);
    run_until_first_exit(controllers).await;
    tracing::info!("Node agent shutting down");
    Ok(())
}

/// Drive every controller until one of them stops (shutdown signal)
async fn run_until_first_exit(controllers: Vec<ControllerFuture>) {
    if controllers.is_empty() {
        return;
    }
    let ((), index, _) = futures::future::select_all(controllers).await;
    tracing::debug!(controller = index, "Controller completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn agent_mode_parses_identity() {
        let cli = Cli::try_parse_from([
            "lattice-model-cache",
            "agent",
            "--node-name",
            "worker",
            "--namespace",
            "models-system",
        ])
        .unwrap();
        assert_eq!(cli.namespace, "models-system");
        assert_eq!(cli.config_map, LOCAL_MODEL_CONFIG_MAP);
        match cli.command {
            Some(Commands::Agent {
                node_name,
                model_root,
            }) => {
                assert_eq!(node_name, "worker");
                assert_eq!(model_root, PathBuf::from("/mnt/models/models"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn controller_is_the_default_mode() {
        let cli = Cli::try_parse_from(["lattice-model-cache", "--crd"]).unwrap();
        assert!(cli.crd);
        assert!(cli.command.is_none());
    }
}
