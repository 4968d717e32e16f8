//! Command builder - turns a descriptor into an ordered plan.
//!
//! Building is pure: no process is started and nothing is written. The only inputs are
//! the descriptor and whatever the credential provisioner already produced.

use kubedeploy_core::{
    BareMetalAuth, ClusterCredentials, DeploymentDescriptor, Error, ManagedCloudAuth,
    OperationDescriptor, OperationKind, Plan, Result, RolloutCheck,
};
use std::time::Duration;

use crate::credentials::ProvisionedCredentials;

/// Program names of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub kubectl: String,
    pub kustomize: String,
    pub aws: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            kustomize: "kustomize".to_string(),
            aws: "aws".to_string(),
        }
    }
}

impl Toolchain {
    /// Defaults, overridden by `KUBEDEPLOY_KUBECTL`, `KUBEDEPLOY_KUSTOMIZE` and `KUBEDEPLOY_AWS`.
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            kubectl: var("KUBEDEPLOY_KUBECTL", "kubectl"),
            kustomize: var("KUBEDEPLOY_KUSTOMIZE", "kustomize"),
            aws: var("KUBEDEPLOY_AWS", "aws"),
        }
    }

    pub fn with_kubectl(mut self, kubectl: impl Into<String>) -> Self {
        self.kubectl = kubectl.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    toolchain: Toolchain,
}

impl CommandBuilder {
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn build(
        &self,
        descriptor: &DeploymentDescriptor,
        provisioned: &ProvisionedCredentials,
    ) -> Result<Plan> {
        descriptor.validate()?;

        let mut plan = Plan::new(descriptor.sensitive);
        plan.push(self.kubectl(
            descriptor,
            OperationKind::VersionProbe,
            ["version".to_string(), "--client=true".to_string()],
        ));

        match &descriptor.credentials {
            ClusterCredentials::ManagedCloud(auth) => {
                self.managed_cloud_operations(&mut plan, auth, provisioned)
            }
            ClusterCredentials::BareMetal(auth) => {
                self.bare_metal_operations(&mut plan, descriptor, auth, provisioned)?
            }
        }

        if let Some(image) = &descriptor.image_override {
            plan.push(
                OperationDescriptor::new(
                    OperationKind::ImageEdit,
                    &self.toolchain.kustomize,
                    ["edit", "set", "image", image.reference().as_str()],
                )
                .in_directory(&descriptor.manifest_source),
            );
        }

        for action in &descriptor.actions {
            self.push_against_manifests(
                &mut plan,
                descriptor,
                provisioned,
                OperationKind::Action(*action),
                vec![action.as_str().to_string()],
                Vec::new(),
            );
        }

        if let Some(rollout) = &descriptor.rollout {
            if descriptor.applies() {
                self.rollout_operations(&mut plan, descriptor, provisioned, rollout);
            }
        }

        Ok(plan)
    }

    fn managed_cloud_operations(
        &self,
        plan: &mut Plan,
        auth: &ManagedCloudAuth,
        provisioned: &ProvisionedCredentials,
    ) {
        plan.push(OperationDescriptor::new(
            OperationKind::VersionProbe,
            &self.toolchain.aws,
            ["--version"],
        ));
        plan.push(
            OperationDescriptor::new(
                OperationKind::KubeconfigFetch,
                &self.toolchain.aws,
                [
                    "eks",
                    "--region",
                    auth.region.as_str(),
                    "update-kubeconfig",
                    "--name",
                    auth.cluster_name.as_str(),
                ],
            )
            .with_env(&provisioned.env),
        );
    }

    fn bare_metal_operations(
        &self,
        plan: &mut Plan,
        descriptor: &DeploymentDescriptor,
        auth: &BareMetalAuth,
        provisioned: &ProvisionedCredentials,
    ) -> Result<()> {
        let trust = match (&auth.certificate_pem, &provisioned.certificate_path) {
            (Some(_), Some(path)) => format!("--certificate-authority={}", path.display()),
            (None, _) => "--insecure-skip-tls-verify=true".to_string(),
            (Some(_), None) => {
                return Err(Error::Validation(
                    "a CA certificate was configured but never written".to_string(),
                ));
            }
        };

        let config = |args: Vec<String>| {
            self.kubectl(
                descriptor,
                OperationKind::ClusterConfig,
                std::iter::once("config".to_string()).chain(args),
            )
            .with_env(&provisioned.env)
        };

        plan.push(config(vec![
            "set-credentials".to_string(),
            auth.user.clone(),
            format!("--token={}", auth.token),
        ]));
        plan.push(config(vec![
            "set-cluster".to_string(),
            "default".to_string(),
            format!("--server={}", auth.server_address),
            trust,
        ]));
        plan.push(config(vec![
            "set-context".to_string(),
            "default".to_string(),
            "--cluster=default".to_string(),
            format!("--user={}", auth.user),
        ]));
        plan.push(config(vec!["use-context".to_string(), "default".to_string()]));
        Ok(())
    }

    fn rollout_operations(
        &self,
        plan: &mut Plan,
        descriptor: &DeploymentDescriptor,
        provisioned: &ProvisionedCredentials,
        rollout: &RolloutCheck,
    ) {
        let timeout = timeout_arg(rollout.timeout);

        if rollout.workloads.is_empty() {
            self.push_against_manifests(
                plan,
                descriptor,
                provisioned,
                OperationKind::RolloutStatus {
                    workload: format!("resources in {}", descriptor.manifest_source.display()),
                    timeout: rollout.timeout,
                },
                vec!["rollout".to_string(), "status".to_string()],
                vec![timeout],
            );
            return;
        }

        for workload in &rollout.workloads {
            plan.push(
                self.kubectl(
                    descriptor,
                    OperationKind::RolloutStatus {
                        workload: workload.clone(),
                        timeout: rollout.timeout,
                    },
                    [
                        "rollout".to_string(),
                        "status".to_string(),
                        workload.clone(),
                        timeout.clone(),
                    ],
                )
                .with_env(&provisioned.env),
            );
        }
    }

    /// Push `kubectl [--namespace NS] <verb...> -f <source> <trailing...>`, reading the
    /// kustomize build output from a pipe when templating.
    fn push_against_manifests(
        &self,
        plan: &mut Plan,
        descriptor: &DeploymentDescriptor,
        provisioned: &ProvisionedCredentials,
        kind: OperationKind,
        verb: Vec<String>,
        trailing: Vec<String>,
    ) {
        let ignore = matches!(kind, OperationKind::Action(action) if action.tolerates_non_zero_exit());
        let source = if descriptor.use_templating {
            "-".to_string()
        } else {
            descriptor.manifest_source.display().to_string()
        };

        let args = verb
            .into_iter()
            .chain(["-f".to_string(), source])
            .chain(trailing);

        let mut op = self
            .kubectl(descriptor, kind, args)
            .ignoring_non_zero_exit(ignore)
            .with_env(&provisioned.env);

        if descriptor.use_templating {
            let producer = plan.push(OperationDescriptor::new(
                OperationKind::TemplateBuild,
                &self.toolchain.kustomize,
                ["build".to_string(), descriptor.manifest_source.display().to_string()],
            ));
            op = op.piped_from(producer);
        }
        plan.push(op);
    }

    /// `kubectl [--namespace NS] <args...>`. Every kubectl call is scoped, since the
    /// namespace flag is global.
    fn kubectl(
        &self,
        descriptor: &DeploymentDescriptor,
        kind: OperationKind,
        args: impl IntoIterator<Item = String>,
    ) -> OperationDescriptor {
        let scope = descriptor
            .namespace
            .iter()
            .flat_map(|ns| ["--namespace".to_string(), ns.clone()]);
        OperationDescriptor::new(kind, &self.toolchain.kubectl, scope.chain(args))
    }
}

/// kubectl takes whole seconds; round up so a sub-second timeout never becomes zero.
fn timeout_arg(timeout: Duration) -> String {
    let mut secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        secs += 1;
    }
    format!("--timeout={}s", secs)
}
