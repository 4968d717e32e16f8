//! One orchestration run, from descriptor to report.

use kubedeploy_config::InstallOptions;
use kubedeploy_core::{ClusterCredentials, DeploymentDescriptor, Plan, Result, RunId};
use kubedeploy_executor::{PipelineExecutor, RunReport};
use tracing::{Instrument, info, info_span};

use crate::builder::{CommandBuilder, Toolchain};
use crate::credentials::{CredentialProvisioner, ProvisionedCredentials};
use crate::install::KubectlInstaller;

pub struct Deployment {
    run_id: RunId,
    descriptor: DeploymentDescriptor,
    install: InstallOptions,
    toolchain: Toolchain,
    provisioner: CredentialProvisioner,
    executor: PipelineExecutor,
}

impl Deployment {
    pub fn new(descriptor: DeploymentDescriptor, provisioner: CredentialProvisioner) -> Self {
        Self {
            run_id: RunId::new(),
            descriptor,
            install: InstallOptions::default(),
            toolchain: Toolchain::default(),
            provisioner,
            executor: PipelineExecutor::new(),
        }
    }

    /// Where kubectl is fetched from when the descriptor asks for a version.
    pub fn with_install(mut self, install: InstallOptions) -> Self {
        self.install = install;
        self
    }

    pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn with_executor(mut self, executor: PipelineExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn descriptor(&self) -> &DeploymentDescriptor {
        &self.descriptor
    }

    pub fn install_options(&self) -> &InstallOptions {
        &self.install
    }

    /// Build the plan a run would execute, without installing, provisioning or running
    /// anything. Credentials that only exist after provisioning are left out.
    pub fn preview(&self) -> Result<Plan> {
        let mut provisioned = ProvisionedCredentials::default();
        if let ClusterCredentials::BareMetal(auth) = &self.descriptor.credentials {
            if auth.certificate_pem.is_some() {
                provisioned.certificate_path = Some(self.provisioner.certificate_path());
            }
        }

        let mut toolchain = self.toolchain.clone();
        if self.descriptor.cluster_version.is_some() {
            toolchain = toolchain.with_kubectl(self.install.destination.display().to_string());
        }
        CommandBuilder::new(toolchain).build(&self.descriptor, &provisioned)
    }

    /// Install, provision, build and execute.
    ///
    /// Errors raised before execution starts are returned directly; an execution failure
    /// is carried in the report together with the state of every operation.
    pub async fn run(&self) -> Result<RunReport> {
        let span = info_span!(
            "deploy",
            run_id = %self.run_id,
            cluster_type = %self.descriptor.cluster_type()
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<RunReport> {
        self.descriptor.validate()?;
        info!(
            actions = ?self.descriptor.actions,
            manifests = %self.descriptor.manifest_source.display(),
            templating = self.descriptor.use_templating,
            "Starting deployment"
        );

        let mut toolchain = self.toolchain.clone();
        if let Some(version) = &self.descriptor.cluster_version {
            let path = KubectlInstaller::new(version.clone(), self.install.clone())
                .install()
                .await?;
            toolchain = toolchain.with_kubectl(path.display().to_string());
        }

        let provisioned = self.provisioner.provision(&self.descriptor.credentials).await?;
        let plan = CommandBuilder::new(toolchain).build(&self.descriptor, &provisioned)?;
        info!(operations = plan.len(), "Plan built");

        let report = self.executor.execute(&plan).await;
        if report.success() {
            info!("Deployment finished");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{RoleAssumer, TemporaryCredentials};
    use async_trait::async_trait;
    use kubedeploy_core::{Action, BareMetalAuth, Error, OperationKind};
    use kubedeploy_executor::OperationState;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    struct NoRoles;

    #[async_trait]
    impl RoleAssumer for NoRoles {
        async fn assume_role(
            &self,
            _role_arn: &str,
            _region: &str,
            _session_name: &str,
            _duration: Duration,
        ) -> Result<TemporaryCredentials> {
            Err(Error::Auth("no roles in tests".to_string()))
        }
    }

    fn descriptor(certificate_pem: Option<&str>) -> DeploymentDescriptor {
        DeploymentDescriptor::new(
            ClusterCredentials::BareMetal(BareMetalAuth {
                token: "t0ken".to_string(),
                certificate_pem: certificate_pem.map(String::from),
                server_address: "https://10.0.0.1:6443".to_string(),
                user: "default".to_string(),
            }),
            "/m",
        )
        .with_actions(vec![Action::Apply, Action::Diff])
    }

    fn deployment(descriptor: DeploymentDescriptor, workdir: &Path, kubectl: &str) -> Deployment {
        let provisioner = CredentialProvisioner::new(Arc::new(NoRoles), workdir);
        Deployment::new(descriptor, provisioner)
            .with_toolchain(Toolchain::default().with_kubectl(kubectl))
    }

    #[tokio::test]
    async fn test_full_run_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let report = deployment(descriptor(Some("pem")), dir.path(), "true")
            .run()
            .await
            .unwrap();

        assert!(report.success());
        assert!(report
            .states
            .iter()
            .all(|s| *s == OperationState::Succeeded));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("ca.crt")).unwrap(),
            "pem"
        );
    }

    #[tokio::test]
    async fn test_failing_cluster_config_halts_run() {
        let dir = tempfile::tempdir().unwrap();
        let report = deployment(descriptor(None), dir.path(), "false")
            .run()
            .await
            .unwrap();

        assert!(matches!(report.states[0], OperationState::Tolerated { .. }));
        assert!(matches!(report.states[1], OperationState::Failed { .. }));
        assert!(report.states[2..]
            .iter()
            .all(|s| *s == OperationState::Pending));
        assert!(matches!(
            report.into_result(),
            Err(Error::Execution { code: Some(1), .. })
        ));
    }

    #[tokio::test]
    async fn test_install_failure_stops_before_any_operation() {
        let dir = tempfile::tempdir().unwrap();
        let install = InstallOptions {
            base_url: "http://127.0.0.1:9/release".to_string(),
            destination: dir.path().join("kubectl"),
            ..InstallOptions::default()
        };

        let err = deployment(
            descriptor(Some("pem")).with_cluster_version("v1.29.0"),
            dir.path(),
            "true",
        )
        .with_install(install)
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Install(_)));
        assert!(!dir.path().join("ca.crt").exists());
    }

    #[tokio::test]
    async fn test_cluster_version_installs_kubectl_used_by_the_run() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/release/v1.29.0/bin/linux/amd64/kubectl"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"#!/bin/sh\nexit 0\n".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let kubectl = dir.path().join("kubectl");
        let install = InstallOptions {
            base_url: format!("{}/release", server.uri()),
            destination: kubectl.clone(),
            ..InstallOptions::default()
        };

        // The toolchain's kubectl would fail every operation; only the installed one passes.
        let report = deployment(
            descriptor(Some("pem")).with_cluster_version("v1.29.0"),
            dir.path(),
            "false",
        )
        .with_install(install)
        .run()
        .await
        .unwrap();

        assert!(kubectl.exists());
        assert!(report.success());
        assert!(report
            .states
            .iter()
            .all(|s| *s == OperationState::Succeeded));
    }

    #[tokio::test]
    async fn test_no_cluster_version_skips_install() {
        let dir = tempfile::tempdir().unwrap();
        let install = InstallOptions {
            base_url: "http://127.0.0.1:9/release".to_string(),
            destination: dir.path().join("kubectl"),
            ..InstallOptions::default()
        };

        let report = deployment(descriptor(Some("pem")), dir.path(), "true")
            .with_install(install)
            .run()
            .await
            .unwrap();

        assert!(report.success());
        assert!(!dir.path().join("kubectl").exists());
    }

    #[test]
    fn test_preview_uses_installed_kubectl_only_with_cluster_version() {
        let dir = tempfile::tempdir().unwrap();
        let install = InstallOptions {
            destination: dir.path().join("kubectl"),
            ..InstallOptions::default()
        };
        let installed = dir.path().join("kubectl").display().to_string();

        let plan = deployment(
            descriptor(None).with_cluster_version("v1.29.0"),
            dir.path(),
            "kubectl",
        )
        .with_install(install.clone())
        .preview()
        .unwrap();
        assert!(plan.iter().all(|op| op.program == installed));

        let plan = deployment(descriptor(None), dir.path(), "kubectl")
            .with_install(install)
            .preview()
            .unwrap();
        assert!(plan.iter().all(|op| op.program == "kubectl"));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_rejected_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut invalid = descriptor(Some("pem"));
        invalid.manifest_source = PathBuf::new();

        let err = deployment(invalid, dir.path(), "true")
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(!dir.path().join("ca.crt").exists());
    }

    #[test]
    fn test_preview_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let plan = deployment(descriptor(Some("pem")), dir.path(), "kubectl")
            .preview()
            .unwrap();

        let expected = format!(
            "--certificate-authority={}",
            dir.path().join("ca.crt").display()
        );
        assert!(plan.iter().any(|op| op.args.contains(&expected)));
        assert!(!dir.path().join("ca.crt").exists());
        assert_eq!(
            plan.iter()
                .filter(|op| matches!(op.kind, OperationKind::Action(_)))
                .count(),
            2
        );
    }
}
