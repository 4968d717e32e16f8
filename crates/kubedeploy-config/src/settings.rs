//! Raw deployment settings and their validation into a descriptor.

use crate::{ConfigError, ConfigResult};
use kubedeploy_core::{
    Action, BareMetalAuth, ClusterCredentials, ClusterType, DeploymentDescriptor, ImageOverride,
    ManagedCloudAuth, RolloutCheck,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

pub const DEFAULT_USER: &str = "default";
pub const DEFAULT_CLUSTER_NAME: &str = "EKS-Cluster";
pub const DEFAULT_MANIFEST_DIR: &str = "./";
pub const DEFAULT_REGION: &str = "eu-west-1";
pub const DEFAULT_ROLLOUT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_KUBECTL_BASE_URL: &str =
    "https://storage.googleapis.com/kubernetes-release/release";
pub const DEFAULT_KUBECTL_ARCH: &str = "linux/amd64";
pub const DEFAULT_KUBECTL_PATH: &str = "/bin/kubectl";

static KUBECTL_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(\d+)\.(\d+)\.(\d+)(-[0-9A-Za-z.]+)?$").expect("valid kubectl version regex")
});

static SHA256_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").expect("valid digest regex"));

/// Settings as they arrive from flags, environment variables or a deployment file.
///
/// Every field is optional so that sources can be layered with [`DeploySettings::merge`].
/// Empty strings count as unset, matching how CI systems pass absent plugin parameters.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySettings {
    pub cluster_type: Option<String>,
    pub actions: Option<Vec<String>>,
    pub manifest_dir: Option<String>,
    pub namespace: Option<String>,
    pub kustomize: Option<bool>,
    pub image: Option<String>,
    pub image_version: Option<String>,
    pub rollout: Option<bool>,
    pub rollout_timeout: Option<String>,
    pub rollout_workloads: Option<Vec<String>>,
    pub sensitive: Option<bool>,

    pub kubectl_version: Option<String>,
    pub kubectl_sha256: Option<String>,
    pub kubectl_base_url: Option<String>,
    pub kubectl_arch: Option<String>,
    pub kubectl_path: Option<String>,

    pub token: Option<String>,
    pub ca: Option<String>,
    pub server: Option<String>,
    pub user: Option<String>,

    pub assume_role: Option<String>,
    pub cluster_name: Option<String>,
    pub region: Option<String>,
}

impl fmt::Debug for DeploySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("DeploySettings")
            .field("cluster_type", &self.cluster_type)
            .field("actions", &self.actions)
            .field("manifest_dir", &self.manifest_dir)
            .field("namespace", &self.namespace)
            .field("kustomize", &self.kustomize)
            .field("image", &self.image)
            .field("image_version", &self.image_version)
            .field("rollout", &self.rollout)
            .field("rollout_timeout", &self.rollout_timeout)
            .field("rollout_workloads", &self.rollout_workloads)
            .field("sensitive", &self.sensitive)
            .field("kubectl_version", &self.kubectl_version)
            .field("kubectl_sha256", &self.kubectl_sha256)
            .field("kubectl_base_url", &self.kubectl_base_url)
            .field("kubectl_arch", &self.kubectl_arch)
            .field("kubectl_path", &self.kubectl_path)
            .field("token", &redact(&self.token))
            .field("ca", &redact(&self.ca))
            .field("server", &self.server)
            .field("user", &self.user)
            .field("assume_role", &self.assume_role)
            .field("cluster_name", &self.cluster_name)
            .field("region", &self.region)
            .finish()
    }
}

/// Where and how to fetch the kubectl binary.
///
/// The release itself is the descriptor's `cluster_version`; these options only say where
/// it comes from and where it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub base_url: String,
    pub arch: String,
    pub destination: PathBuf,
    /// Lowercase hex SHA-256 of the binary.
    pub sha256: Option<String>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_KUBECTL_BASE_URL.to_string(),
            arch: DEFAULT_KUBECTL_ARCH.to_string(),
            destination: PathBuf::from(DEFAULT_KUBECTL_PATH),
            sha256: None,
        }
    }
}

impl InstallOptions {
    /// `<base>/<version>/bin/<arch>/kubectl`
    pub fn download_url(&self, version: &str) -> String {
        format!(
            "{}/{}/bin/{}/kubectl",
            self.base_url.trim_end_matches('/'),
            version,
            self.arch.trim_matches('/')
        )
    }
}

impl DeploySettings {
    /// Layer `overrides` on top of `self`. Set values in `overrides` win.
    pub fn merge(self, overrides: DeploySettings) -> DeploySettings {
        DeploySettings {
            cluster_type: overrides.cluster_type.or(self.cluster_type),
            actions: overrides.actions.or(self.actions),
            manifest_dir: overrides.manifest_dir.or(self.manifest_dir),
            namespace: overrides.namespace.or(self.namespace),
            kustomize: overrides.kustomize.or(self.kustomize),
            image: overrides.image.or(self.image),
            image_version: overrides.image_version.or(self.image_version),
            rollout: overrides.rollout.or(self.rollout),
            rollout_timeout: overrides.rollout_timeout.or(self.rollout_timeout),
            rollout_workloads: overrides.rollout_workloads.or(self.rollout_workloads),
            sensitive: overrides.sensitive.or(self.sensitive),
            kubectl_version: overrides.kubectl_version.or(self.kubectl_version),
            kubectl_sha256: overrides.kubectl_sha256.or(self.kubectl_sha256),
            kubectl_base_url: overrides.kubectl_base_url.or(self.kubectl_base_url),
            kubectl_arch: overrides.kubectl_arch.or(self.kubectl_arch),
            kubectl_path: overrides.kubectl_path.or(self.kubectl_path),
            token: overrides.token.or(self.token),
            ca: overrides.ca.or(self.ca),
            server: overrides.server.or(self.server),
            user: overrides.user.or(self.user),
            assume_role: overrides.assume_role.or(self.assume_role),
            cluster_name: overrides.cluster_name.or(self.cluster_name),
            region: overrides.region.or(self.region),
        }
    }

    pub fn cluster_type(&self) -> ConfigResult<ClusterType> {
        match text(&self.cluster_type) {
            None => Ok(ClusterType::BareMetal),
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::invalid("type", core_message(e))),
        }
    }

    pub fn actions(&self) -> ConfigResult<Vec<Action>> {
        let tokens: Vec<&str> = self
            .actions
            .iter()
            .flatten()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Ok(vec![Action::Apply]);
        }
        Action::parse_all(tokens).map_err(|e| ConfigError::invalid("actions", core_message(e)))
    }

    pub fn rollout_timeout(&self) -> ConfigResult<Duration> {
        match text(&self.rollout_timeout) {
            None => Ok(DEFAULT_ROLLOUT_TIMEOUT),
            Some(raw) => parse_duration(raw),
        }
    }

    /// Validate everything needed for a run and build the descriptor.
    pub fn to_descriptor(&self) -> ConfigResult<DeploymentDescriptor> {
        let actions = self.actions()?;
        let credentials = self.credentials()?;
        let manifest_dir = text(&self.manifest_dir).unwrap_or(DEFAULT_MANIFEST_DIR);

        let mut descriptor = DeploymentDescriptor::new(credentials, manifest_dir)
            .with_actions(actions)
            .with_templating(self.kustomize.unwrap_or(false))
            .with_sensitive(self.sensitive.unwrap_or(false));

        if let Some(namespace) = text(&self.namespace) {
            descriptor = descriptor.with_namespace(namespace);
        }

        match (text(&self.image), text(&self.image_version)) {
            (Some(name), Some(version)) => {
                descriptor = descriptor.with_image_override(ImageOverride::new(name, version));
            }
            (Some(_), None) => {
                return Err(ConfigError::invalid(
                    "image_version",
                    "an image name was given without a version",
                ));
            }
            (None, Some(_)) => {
                return Err(ConfigError::invalid(
                    "image",
                    "an image version was given without a name",
                ));
            }
            (None, None) => {}
        }

        if let Some(version) = self.kubectl_version()? {
            descriptor = descriptor.with_cluster_version(version);
        }

        let workloads: Vec<String> = self
            .rollout_workloads
            .iter()
            .flatten()
            .map(|w| w.trim())
            .filter(|w| !w.is_empty())
            .map(String::from)
            .collect();
        if self.rollout.unwrap_or(false) || !workloads.is_empty() {
            let mut check = RolloutCheck::new(self.rollout_timeout()?);
            check.workloads = workloads;
            descriptor = descriptor.with_rollout(check);
        }

        descriptor
            .validate()
            .map_err(|e| ConfigError::invalid("deployment", core_message(e)))?;
        Ok(descriptor)
    }

    /// The requested kubectl release in `v`-prefixed form, if any.
    pub fn kubectl_version(&self) -> ConfigResult<Option<String>> {
        text(&self.kubectl_version)
            .map(normalize_kubectl_version)
            .transpose()
    }

    /// Download settings. They are used only when the descriptor carries a kubectl version.
    pub fn install_options(&self) -> ConfigResult<InstallOptions> {
        let base_url = text(&self.kubectl_base_url).unwrap_or(DEFAULT_KUBECTL_BASE_URL);
        let parsed = Url::parse(base_url)
            .map_err(|e| ConfigError::invalid("kubectl_base_url", e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "kubectl_base_url",
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }

        let sha256 = match text(&self.kubectl_sha256) {
            Some(digest) if SHA256_HEX.is_match(digest) => Some(digest.to_ascii_lowercase()),
            Some(_) => {
                return Err(ConfigError::invalid(
                    "kubectl_sha256",
                    "expected 64 hexadecimal characters",
                ));
            }
            None => None,
        };

        Ok(InstallOptions {
            base_url: base_url.to_string(),
            arch: text(&self.kubectl_arch)
                .unwrap_or(DEFAULT_KUBECTL_ARCH)
                .to_string(),
            destination: PathBuf::from(text(&self.kubectl_path).unwrap_or(DEFAULT_KUBECTL_PATH)),
            sha256,
        })
    }

    fn credentials(&self) -> ConfigResult<ClusterCredentials> {
        match self.cluster_type()? {
            ClusterType::ManagedCloud => Ok(ClusterCredentials::ManagedCloud(ManagedCloudAuth {
                role_arn: text(&self.assume_role).map(String::from),
                region: text(&self.region).unwrap_or(DEFAULT_REGION).to_string(),
                cluster_name: text(&self.cluster_name)
                    .unwrap_or(DEFAULT_CLUSTER_NAME)
                    .to_string(),
            })),
            ClusterType::BareMetal => {
                let server = text(&self.server)
                    .ok_or_else(|| ConfigError::MissingField("k8s_server".to_string()))?;
                let url = Url::parse(server)
                    .map_err(|e| ConfigError::invalid("k8s_server", e.to_string()))?;
                if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
                    return Err(ConfigError::invalid(
                        "k8s_server",
                        format!("'{}' is not an http(s) address", server),
                    ));
                }
                let token = text(&self.token)
                    .ok_or_else(|| ConfigError::MissingField("k8s_token".to_string()))?;

                Ok(ClusterCredentials::BareMetal(BareMetalAuth {
                    token: token.to_string(),
                    certificate_pem: text(&self.ca).map(String::from),
                    server_address: server.to_string(),
                    user: text(&self.user).unwrap_or(DEFAULT_USER).to_string(),
                }))
            }
        }
    }
}

/// Accepts `1.29.0` or `v1.29.0` and returns the `v`-prefixed form used in download URLs.
pub fn normalize_kubectl_version(raw: &str) -> ConfigResult<String> {
    let raw = raw.trim();
    if !KUBECTL_VERSION.is_match(raw) {
        return Err(ConfigError::invalid(
            "kubectl_version",
            format!("'{}' is not a release version such as v1.29.0", raw),
        ));
    }
    Ok(if raw.starts_with('v') {
        raw.to_string()
    } else {
        format!("v{}", raw)
    })
}

fn parse_duration(raw: &str) -> ConfigResult<Duration> {
    // Bare numbers are seconds, as kubectl's own --timeout accepts.
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).map_err(|e| ConfigError::invalid("rollout_timeout", e.to_string()))
}

fn text(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn core_message(err: kubedeploy_core::Error) -> String {
    match err {
        kubedeploy_core::Error::Validation(message) => message,
        other => other.to_string(),
    }
}
