//! CLI command implementations.

use anyhow::{Context, Result};
use kubedeploy_config::{DeploySettings, load_settings};
use kubedeploy_core::{Plan, Step};
use kubedeploy_deployer::{AwsCliRoleAssumer, CredentialProvisioner, Deployment, Toolchain};
use kubedeploy_executor::OperationState;
use std::path::Path;
use std::sync::Arc;

fn deployment(settings: &DeploySettings) -> Result<Deployment> {
    let descriptor = settings
        .to_descriptor()
        .context("Invalid deployment settings")?;
    let install = settings
        .install_options()
        .context("Invalid kubectl install settings")?;
    let toolchain = Toolchain::from_env();

    let working_dir = std::env::current_dir().context("Failed to resolve working directory")?;
    let provisioner = CredentialProvisioner::new(
        Arc::new(AwsCliRoleAssumer::new(toolchain.aws.clone())),
        working_dir,
    );

    Ok(Deployment::new(descriptor, provisioner)
        .with_install(install)
        .with_toolchain(toolchain))
}

/// Execute the deployment, exiting nonzero on the first fatal failure.
pub async fn run(settings: DeploySettings) -> Result<()> {
    let deployment = deployment(&settings)?;
    let report = deployment.run().await?;

    let succeeded = report
        .states
        .iter()
        .filter(|s| matches!(s, OperationState::Succeeded))
        .count();
    let tolerated = report
        .states
        .iter()
        .filter(|s| matches!(s, OperationState::Tolerated { .. }))
        .count();
    println!(
        "Run {}: {} of {} operations succeeded, {} tolerated",
        deployment.run_id(),
        succeeded,
        report.states.len(),
        tolerated
    );

    report.into_result()?;
    Ok(())
}

/// Print the plan without touching the cluster.
pub fn plan(settings: DeploySettings) -> Result<()> {
    let deployment = deployment(&settings)?;
    let plan = deployment.preview()?;

    if let Some(version) = &deployment.descriptor().cluster_version {
        let install = deployment.install_options();
        println!(
            "install kubectl {} from {}",
            version,
            install.download_url(version)
        );
    }
    for (n, step) in plan.steps()?.into_iter().enumerate() {
        println!("{:>2}. {}", n + 1, describe(&plan, step));
    }
    Ok(())
}

fn describe(plan: &Plan, step: Step) -> String {
    let op = &plan.operations[step.primary()];
    if plan.sensitive {
        format!("{:?} ({})", op.kind, op.program)
    } else {
        plan.render_step(step)
    }
}

/// Check a deployment file on its own. Credentials usually arrive through the
/// environment, so only the values that must be right in the file are checked.
pub fn validate(path: &Path) -> Result<()> {
    let settings = load_settings(path)
        .with_context(|| format!("Failed to parse deployment file: {}", path.display()))?;
    settings.cluster_type()?;
    settings.actions()?;
    settings.rollout_timeout()?;
    settings.kubectl_version()?;
    settings.install_options()?;
    println!("Configuration is valid");
    Ok(())
}
