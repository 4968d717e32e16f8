//! Deployment descriptor and the closed types it is built from.
//!
//! A descriptor is constructed once per run from external configuration and is
//! immutable afterwards. Everything that arrives as a string (cluster type, action
//! tokens) is parsed into an enum here so later stages never compare strings.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Kind of Kubernetes cluster being targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ClusterType {
    /// Managed cloud cluster (EKS); kubeconfig comes from the cloud CLI.
    #[display("EKS")]
    ManagedCloud,
    /// Self-hosted cluster configured from a token, server and optional CA.
    #[display("Baremetal")]
    BareMetal,
}

impl FromStr for ClusterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eks" | "managed" | "managed-cloud" | "managedcloud" => Ok(ClusterType::ManagedCloud),
            "baremetal" | "bare-metal" | "bare_metal" => Ok(ClusterType::BareMetal),
            other => Err(Error::Validation(format!(
                "unknown cluster type '{}', expected EKS or Baremetal",
                other
            ))),
        }
    }
}

/// A kubectl verb the deployment may run against the manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[display("apply")]
    Apply,
    #[display("delete")]
    Delete,
    #[display("diff")]
    Diff,
}

impl Action {
    /// The allow-list, in the order it is reported to users.
    pub const ALLOWED: [Action; 3] = [Action::Apply, Action::Delete, Action::Diff];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Apply => "apply",
            Action::Delete => "delete",
            Action::Diff => "diff",
        }
    }

    /// `kubectl diff` exits 1 when differences exist, which is not a failure.
    pub fn tolerates_non_zero_exit(&self) -> bool {
        matches!(self, Action::Diff)
    }

    /// Parse every token, failing on the first one outside the allow-list.
    pub fn parse_all<I, S>(tokens: I) -> Result<Vec<Action>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tokens.into_iter().map(|t| t.as_ref().parse()).collect()
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALLOWED
            .into_iter()
            .find(|a| a.as_str() == s.trim())
            .ok_or_else(|| {
                let allowed: Vec<_> = Action::ALLOWED.iter().map(|a| a.as_str()).collect();
                Error::Validation(format!(
                    "valid actions are: {}. You provided '{}'",
                    allowed.join(", "),
                    s
                ))
            })
    }
}

/// Credentials for a managed cloud cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedCloudAuth {
    /// Role to assume before talking to the cloud CLI.
    pub role_arn: Option<String>,
    pub region: String,
    pub cluster_name: String,
}

/// Static credentials for a self-hosted cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BareMetalAuth {
    pub token: String,
    /// PEM encoded CA certificate. Without it TLS verification is disabled.
    pub certificate_pem: Option<String>,
    pub server_address: String,
    pub user: String,
}

impl fmt::Debug for BareMetalAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BareMetalAuth")
            .field("token", &"<redacted>")
            .field("certificate_pem", &self.certificate_pem.as_ref().map(|_| "<pem>"))
            .field("server_address", &self.server_address)
            .field("user", &self.user)
            .finish()
    }
}

/// Authentication material, one variant per cluster type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterCredentials {
    ManagedCloud(ManagedCloudAuth),
    BareMetal(BareMetalAuth),
}

impl ClusterCredentials {
    pub fn cluster_type(&self) -> ClusterType {
        match self {
            ClusterCredentials::ManagedCloud(_) => ClusterType::ManagedCloud,
            ClusterCredentials::BareMetal(_) => ClusterType::BareMetal,
        }
    }
}

/// Image tag injected into the kustomization before deploying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOverride {
    pub name: String,
    pub version: String,
}

impl ImageOverride {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// `name:version`, as kustomize expects it.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

/// Rollout verification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutCheck {
    pub timeout: Duration,
    /// Workloads such as `deployment/api`. Empty means one blanket check over the
    /// manifests that were applied.
    pub workloads: Vec<String>,
}

impl RolloutCheck {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            workloads: Vec::new(),
        }
    }
}

/// Everything a single orchestration run needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    /// Exact kubectl version to install before anything else runs.
    pub cluster_version: Option<String>,
    pub actions: Vec<Action>,
    pub manifest_source: PathBuf,
    pub namespace: Option<String>,
    pub use_templating: bool,
    pub image_override: Option<ImageOverride>,
    pub rollout: Option<RolloutCheck>,
    pub credentials: ClusterCredentials,
    /// Suppresses command-line tracing.
    pub sensitive: bool,
}

impl DeploymentDescriptor {
    /// A descriptor that applies the manifests in `manifest_source` and nothing else.
    pub fn new(credentials: ClusterCredentials, manifest_source: impl Into<PathBuf>) -> Self {
        Self {
            cluster_version: None,
            actions: vec![Action::Apply],
            manifest_source: manifest_source.into(),
            namespace: None,
            use_templating: false,
            image_override: None,
            rollout: None,
            credentials,
            sensitive: false,
        }
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.credentials.cluster_type()
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_templating(mut self, enabled: bool) -> Self {
        self.use_templating = enabled;
        self
    }

    pub fn with_image_override(mut self, image: ImageOverride) -> Self {
        self.image_override = Some(image);
        self
    }

    pub fn with_rollout(mut self, rollout: RolloutCheck) -> Self {
        self.rollout = Some(rollout);
        self
    }

    pub fn with_cluster_version(mut self, version: impl Into<String>) -> Self {
        self.cluster_version = Some(version.into());
        self
    }

    pub fn with_sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }

    /// Whether any action mutates cluster state through `apply`.
    pub fn applies(&self) -> bool {
        self.actions.contains(&Action::Apply)
    }

    /// Check the cross-field rules that the individual types cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.manifest_source.as_os_str().is_empty() {
            return Err(Error::Validation("manifest source is empty".to_string()));
        }

        if let Some(image) = &self.image_override {
            if image.name.trim().is_empty() || image.version.trim().is_empty() {
                return Err(Error::Validation(
                    "image override needs both a name and a version".to_string(),
                ));
            }
        }

        if let Some(rollout) = &self.rollout {
            if rollout.timeout.is_zero() {
                return Err(Error::Validation(
                    "rollout timeout must be greater than zero".to_string(),
                ));
            }
        }

        match &self.credentials {
            ClusterCredentials::ManagedCloud(auth) => {
                if auth.cluster_name.trim().is_empty() {
                    return Err(Error::Validation("cluster name is empty".to_string()));
                }
                if auth.region.trim().is_empty() {
                    return Err(Error::Validation("cloud region is empty".to_string()));
                }
            }
            ClusterCredentials::BareMetal(auth) => {
                if auth.server_address.trim().is_empty() {
                    return Err(Error::Validation(
                        "bare-metal clusters need a server address".to_string(),
                    ));
                }
                if auth.token.is_empty() {
                    return Err(Error::Validation(
                        "bare-metal clusters need a bearer token".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
