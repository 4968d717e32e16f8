//! kubedeploy - Kubernetes deployment plugin.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use kubedeploy_config::{DeploySettings, load_settings};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "kubedeploy")]
#[command(about = "Deploy manifests to a Kubernetes cluster", long_about = None)]
struct Cli {
    /// Deployment file; flags and environment variables override its values
    #[arg(long, env = "PLUGIN_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, env = "KUBEDEPLOY_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deployment (default)
    Run,
    /// Print the operations a run would execute
    Plan,
    /// Validate a deployment file
    Validate {
        /// Path to the deployment file
        #[arg(default_value = "deploy.kdl")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct SettingsArgs {
    /// Actions to run, comma separated (apply, delete, diff)
    #[arg(long, env = "PLUGIN_ACTIONS", value_delimiter = ',')]
    actions: Option<Vec<String>>,

    /// Cluster type (EKS or Baremetal)
    #[arg(long = "type", env = "PLUGIN_TYPE")]
    cluster_type: Option<String>,

    /// PEM encoded CA certificate of a bare-metal cluster
    #[arg(long = "k8s-ca", env = "PLUGIN_CA", hide_env_values = true)]
    ca: Option<String>,

    /// Bearer token of a bare-metal cluster
    #[arg(long = "k8s-token", env = "PLUGIN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// User name for the bare-metal credentials
    #[arg(long = "k8s-user", env = "PLUGIN_K8S_USER")]
    user: Option<String>,

    /// API server address of a bare-metal cluster
    #[arg(long = "k8s-server", env = "PLUGIN_K8S_SERVER")]
    server: Option<String>,

    /// Role to assume before fetching the kubeconfig
    #[arg(long, env = "PLUGIN_ASSUME_ROLE")]
    assume_role: Option<String>,

    /// Exact kubectl version to install
    #[arg(long, env = "PLUGIN_KUBECTL_VERSION")]
    kubectl_version: Option<String>,

    /// Expected SHA-256 of the downloaded kubectl
    #[arg(long, env = "PLUGIN_KUBECTL_SHA256")]
    kubectl_sha256: Option<String>,

    /// Base URL of the kubectl release bucket
    #[arg(long, env = "PLUGIN_KUBECTL_BASE_URL")]
    kubectl_base_url: Option<String>,

    /// Platform of the kubectl binary, such as linux/arm64
    #[arg(long, env = "PLUGIN_KUBECTL_ARCH")]
    kubectl_arch: Option<String>,

    /// Where to install kubectl
    #[arg(long, env = "PLUGIN_KUBECTL_PATH")]
    kubectl_path: Option<String>,

    /// Name of the managed cluster
    #[arg(long, env = "PLUGIN_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Manifest directory, or kustomize root when templating
    #[arg(long, env = "PLUGIN_MANIFEST_DIR")]
    manifest_dir: Option<String>,

    /// Namespace for every resource operation
    #[arg(long = "kubernetes-namespace", env = "PLUGIN_NAMESPACE")]
    namespace: Option<String>,

    /// Cloud region of the managed cluster
    #[arg(long = "aws-region", env = "AWS_REGION")]
    region: Option<String>,

    /// Render manifests with kustomize build
    #[arg(long, env = "PLUGIN_KUSTOMIZE")]
    kustomize: Option<bool>,

    /// Image name to override in the kustomization
    #[arg(long = "image-name", env = "PLUGIN_IMAGE")]
    image: Option<String>,

    /// Image version to set
    #[arg(long, env = "PLUGIN_IMAGE_VERSION")]
    image_version: Option<String>,

    /// Wait for rollouts after apply
    #[arg(long, env = "PLUGIN_ROLLOUT")]
    rollout: Option<bool>,

    /// Rollout timeout, such as 5m or 300
    #[arg(long, env = "PLUGIN_ROLLOUT_TIMEOUT")]
    rollout_timeout: Option<String>,

    /// Workloads to wait on, comma separated (deployment/api)
    #[arg(long, env = "PLUGIN_ROLLOUT_WORKLOADS", value_delimiter = ',')]
    rollout_workloads: Option<Vec<String>>,

    /// Do not print command lines
    #[arg(long, env = "PLUGIN_SENSITIVE")]
    sensitive: Option<bool>,
}

impl From<SettingsArgs> for DeploySettings {
    fn from(args: SettingsArgs) -> Self {
        DeploySettings {
            cluster_type: args.cluster_type,
            actions: args.actions,
            manifest_dir: args.manifest_dir,
            namespace: args.namespace,
            kustomize: args.kustomize,
            image: args.image,
            image_version: args.image_version,
            rollout: args.rollout,
            rollout_timeout: args.rollout_timeout,
            rollout_workloads: args.rollout_workloads,
            sensitive: args.sensitive,
            kubectl_version: args.kubectl_version,
            kubectl_sha256: args.kubectl_sha256,
            kubectl_base_url: args.kubectl_base_url,
            kubectl_arch: args.kubectl_arch,
            kubectl_path: args.kubectl_path,
            token: args.token,
            ca: args.ca,
            server: args.server,
            user: args.user,
            assume_role: args.assume_role,
            cluster_name: args.cluster_name,
            region: args.region,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn settings(cli: Cli) -> anyhow::Result<DeploySettings> {
    let flags = DeploySettings::from(cli.settings);
    match cli.config {
        Some(path) => {
            let file = load_settings(&path)
                .with_context(|| format!("Failed to load deployment file: {}", path.display()))?;
            Ok(file.merge(flags))
        }
        None => Ok(flags),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command.take().unwrap_or(Commands::Run) {
        Commands::Run => {
            commands::run(settings(cli)?).await?;
        }
        Commands::Plan => {
            commands::plan(settings(cli)?)?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_become_settings() {
        let cli = Cli::try_parse_from([
            "kubedeploy",
            "--actions",
            "apply,diff",
            "--kubernetes-namespace",
            "prod",
            "--kustomize",
            "true",
            "plan",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Plan)));

        let settings = DeploySettings::from(cli.settings);
        assert_eq!(
            settings.actions,
            Some(vec!["apply".to_string(), "diff".to_string()])
        );
        assert_eq!(settings.namespace.as_deref(), Some("prod"));
        assert_eq!(settings.kustomize, Some(true));
    }
}
