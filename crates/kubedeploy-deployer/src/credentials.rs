//! Credential provisioning.
//!
//! Turns the credentials of a descriptor into concrete side effects: a temporary
//! session for managed clusters, handed back as an [`EnvironmentPatch`], or a CA
//! certificate file for bare-metal clusters. Nothing here touches the process
//! environment of the orchestrator itself.

use async_trait::async_trait;
use kubedeploy_core::{
    BareMetalAuth, ClusterCredentials, EnvironmentPatch, Error, ManagedCloudAuth, Result,
};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Session name used for every assumed role.
pub const ROLE_SESSION_NAME: &str = "kubedeploy";

/// Lifetime requested for assumed-role sessions.
pub const ROLE_SESSION_DURATION: Duration = Duration::from_secs(3600);

/// File name of the written CA certificate, relative to the working directory.
pub const CERTIFICATE_FILE: &str = "ca.crt";

/// Short-lived credentials returned by a role assumption.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    #[serde(default)]
    pub expiration: Option<String>,
}

impl fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl TemporaryCredentials {
    pub fn to_env(&self) -> EnvironmentPatch {
        EnvironmentPatch::new()
            .with("AWS_ACCESS_KEY_ID", &self.access_key_id)
            .with("AWS_SECRET_ACCESS_KEY", &self.secret_access_key)
            .with("AWS_SESSION_TOKEN", &self.session_token)
    }
}

/// Exchanges a role ARN for temporary credentials.
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    async fn assume_role(
        &self,
        role_arn: &str,
        region: &str,
        session_name: &str,
        duration: Duration,
    ) -> Result<TemporaryCredentials>;
}

/// Assumes roles through `aws sts assume-role`.
#[derive(Debug, Clone)]
pub struct AwsCliRoleAssumer {
    program: String,
}

impl AwsCliRoleAssumer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl RoleAssumer for AwsCliRoleAssumer {
    async fn assume_role(
        &self,
        role_arn: &str,
        region: &str,
        session_name: &str,
        duration: Duration,
    ) -> Result<TemporaryCredentials> {
        let output = Command::new(&self.program)
            .args(["sts", "assume-role", "--role-arn", role_arn])
            .args(["--role-session-name", session_name])
            .args(["--duration-seconds", &duration.as_secs().to_string()])
            .args(["--region", region, "--output", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Auth(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Auth(format!(
                "assume-role for {} failed: {}",
                role_arn,
                stderr.trim()
            )));
        }

        parse_assume_role_output(&output.stdout)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleOutput {
    credentials: TemporaryCredentials,
}

/// Extract the credentials block from `aws sts assume-role --output json`.
pub fn parse_assume_role_output(stdout: &[u8]) -> Result<TemporaryCredentials> {
    let parsed: AssumeRoleOutput = serde_json::from_slice(stdout)
        .map_err(|e| Error::Auth(format!("unexpected assume-role output: {}", e)))?;
    Ok(parsed.credentials)
}

/// Side effects of provisioning that later operations depend on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionedCredentials {
    /// Attached to every operation that talks to the cloud or the cluster.
    pub env: EnvironmentPatch,
    /// Set when a CA certificate was written for a bare-metal cluster.
    pub certificate_path: Option<PathBuf>,
}

pub struct CredentialProvisioner {
    assumer: Arc<dyn RoleAssumer>,
    working_dir: PathBuf,
}

impl CredentialProvisioner {
    pub fn new(assumer: Arc<dyn RoleAssumer>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            assumer,
            working_dir: working_dir.into(),
        }
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.working_dir.join(CERTIFICATE_FILE)
    }

    pub async fn provision(&self, credentials: &ClusterCredentials) -> Result<ProvisionedCredentials> {
        match credentials {
            ClusterCredentials::ManagedCloud(auth) => self.provision_managed(auth).await,
            ClusterCredentials::BareMetal(auth) => self.provision_bare_metal(auth).await,
        }
    }

    async fn provision_managed(&self, auth: &ManagedCloudAuth) -> Result<ProvisionedCredentials> {
        let Some(role_arn) = auth.role_arn.as_deref() else {
            debug!("No role to assume, using ambient cloud credentials");
            return Ok(ProvisionedCredentials::default());
        };

        info!(role_arn = %role_arn, "Assuming role");
        let creds = self
            .assumer
            .assume_role(role_arn, &auth.region, ROLE_SESSION_NAME, ROLE_SESSION_DURATION)
            .await?;
        info!(
            access_key_id = %creds.access_key_id,
            expiration = ?creds.expiration,
            "Role assumed"
        );

        Ok(ProvisionedCredentials {
            env: creds.to_env(),
            certificate_path: None,
        })
    }

    async fn provision_bare_metal(&self, auth: &BareMetalAuth) -> Result<ProvisionedCredentials> {
        let Some(pem) = auth.certificate_pem.as_deref() else {
            info!("No CA certificate given, TLS verification will be skipped");
            return Ok(ProvisionedCredentials::default());
        };

        let path = self.certificate_path();
        write_certificate(&path, pem)
            .await
            .map_err(|e| Error::Auth(format!("could not write {}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Wrote CA certificate");

        Ok(ProvisionedCredentials {
            env: EnvironmentPatch::new(),
            certificate_path: Some(path),
        })
    }
}

async fn write_certificate(path: &Path, pem: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(pem.as_bytes()).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAssumer {
        calls: Mutex<Vec<(String, String, String, Duration)>>,
        fail: bool,
    }

    #[async_trait]
    impl RoleAssumer for RecordingAssumer {
        async fn assume_role(
            &self,
            role_arn: &str,
            region: &str,
            session_name: &str,
            duration: Duration,
        ) -> Result<TemporaryCredentials> {
            self.calls.lock().unwrap().push((
                role_arn.to_string(),
                region.to_string(),
                session_name.to_string(),
                duration,
            ));
            if self.fail {
                return Err(Error::Auth("access denied".to_string()));
            }
            Ok(TemporaryCredentials {
                access_key_id: "AKIATEST".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: "token".to_string(),
                expiration: None,
            })
        }
    }

    fn managed(role_arn: Option<&str>) -> ClusterCredentials {
        ClusterCredentials::ManagedCloud(ManagedCloudAuth {
            role_arn: role_arn.map(String::from),
            region: "eu-west-1".to_string(),
            cluster_name: "EKS-Cluster".to_string(),
        })
    }

    fn bare_metal(certificate_pem: Option<&str>) -> ClusterCredentials {
        ClusterCredentials::BareMetal(BareMetalAuth {
            token: "token".to_string(),
            certificate_pem: certificate_pem.map(String::from),
            server_address: "https://10.0.0.1:6443".to_string(),
            user: "default".to_string(),
        })
    }

    #[tokio::test]
    async fn test_assumed_role_becomes_env_patch() {
        let assumer = Arc::new(RecordingAssumer::default());
        let provisioner = CredentialProvisioner::new(assumer.clone(), ".");

        let provisioned = provisioner
            .provision(&managed(Some("arn:aws:iam::123:role/deploy")))
            .await
            .unwrap();

        assert_eq!(provisioned.env.get("AWS_ACCESS_KEY_ID"), Some("AKIATEST"));
        assert_eq!(provisioned.env.get("AWS_SECRET_ACCESS_KEY"), Some("secret"));
        assert_eq!(provisioned.env.get("AWS_SESSION_TOKEN"), Some("token"));
        assert!(provisioned.certificate_path.is_none());

        let calls = assumer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "arn:aws:iam::123:role/deploy");
        assert_eq!(calls[0].1, "eu-west-1");
        assert_eq!(calls[0].2, ROLE_SESSION_NAME);
        assert_eq!(calls[0].3, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_no_role_means_no_assumption() {
        let assumer = Arc::new(RecordingAssumer::default());
        let provisioner = CredentialProvisioner::new(assumer.clone(), ".");

        let provisioned = provisioner.provision(&managed(None)).await.unwrap();

        assert!(provisioned.env.is_empty());
        assert!(assumer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_assumption_failure_is_auth_error() {
        let assumer = Arc::new(RecordingAssumer {
            fail: true,
            ..Default::default()
        });
        let provisioner = CredentialProvisioner::new(assumer.clone(), ".");

        let err = provisioner
            .provision(&managed(Some("arn:aws:iam::123:role/deploy")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(assumer.calls.lock().unwrap().len(), 1, "no retry");
    }

    #[tokio::test]
    async fn test_certificate_written_and_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CERTIFICATE_FILE), "stale").unwrap();
        let provisioner = CredentialProvisioner::new(Arc::new(RecordingAssumer::default()), dir.path());

        let provisioned = provisioner
            .provision(&bare_metal(Some("-----BEGIN CERTIFICATE-----\n")))
            .await
            .unwrap();

        let path = provisioned.certificate_path.unwrap();
        assert_eq!(path, dir.path().join("ca.crt"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "-----BEGIN CERTIFICATE-----\n"
        );
        assert!(provisioned.env.is_empty());
    }

    #[tokio::test]
    async fn test_no_certificate_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = CredentialProvisioner::new(Arc::new(RecordingAssumer::default()), dir.path());

        let provisioned = provisioner.provision(&bare_metal(None)).await.unwrap();

        assert!(provisioned.certificate_path.is_none());
        assert!(!dir.path().join(CERTIFICATE_FILE).exists());
    }

    #[tokio::test]
    async fn test_certificate_write_failure_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = CredentialProvisioner::new(
            Arc::new(RecordingAssumer::default()),
            dir.path().join("missing"),
        );

        let err = provisioner
            .provision(&bare_metal(Some("pem")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_parse_assume_role_output() {
        let json = br#"{
            "Credentials": {
                "AccessKeyId": "ASIAEXAMPLE",
                "SecretAccessKey": "wJalr",
                "SessionToken": "FwoG",
                "Expiration": "2026-10-17T12:00:00+00:00"
            },
            "AssumedRoleUser": {
                "AssumedRoleId": "AROA:kubedeploy",
                "Arn": "arn:aws:sts::123:assumed-role/deploy/kubedeploy"
            }
        }"#;

        let creds = parse_assume_role_output(json).unwrap();
        assert_eq!(creds.access_key_id, "ASIAEXAMPLE");
        assert_eq!(creds.session_token, "FwoG");
        assert!(!format!("{:?}", creds).contains("wJalr"));

        assert!(matches!(
            parse_assume_role_output(b"not json"),
            Err(Error::Auth(_))
        ));
    }
}
