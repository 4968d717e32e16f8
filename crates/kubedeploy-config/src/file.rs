//! Deployment file parsing.
//!
//! ```kdl
//! type "EKS"
//! actions "apply" "diff"
//! manifest-dir "./k8s"
//! namespace "prod"
//! kustomize #true
//! image "app" version="1.2.3"
//! kubectl version="1.29.0"
//! rollout timeout="5m" {
//!     workload "deployment/api"
//! }
//! cluster name="prod-cluster" region="eu-west-1" assume-role="arn:aws:iam::123:role/deploy"
//! ```

use crate::{ConfigError, ConfigResult, DeploySettings};
use kdl::{KdlDocument, KdlNode};
use std::path::Path;

/// Read and parse a deployment file.
pub fn load_settings(path: &Path) -> ConfigResult<DeploySettings> {
    let contents = std::fs::read_to_string(path)?;
    parse_settings(&contents)
}

/// Parse deployment settings from KDL text.
pub fn parse_settings(kdl: &str) -> ConfigResult<DeploySettings> {
    let doc: KdlDocument = kdl.parse()?;
    let mut settings = DeploySettings::default();

    for node in doc.nodes() {
        match node.name().value() {
            "type" => settings.cluster_type = Some(required_arg(node)?),
            "actions" => settings.actions = Some(get_all_string_args(node)),
            "manifest-dir" => settings.manifest_dir = Some(required_arg(node)?),
            "namespace" => settings.namespace = Some(required_arg(node)?),
            "kustomize" => settings.kustomize = Some(get_first_bool_arg(node).unwrap_or(true)),
            "sensitive" => settings.sensitive = Some(get_first_bool_arg(node).unwrap_or(true)),
            "image" => {
                settings.image = Some(required_arg(node)?);
                settings.image_version = get_string_prop(node, "version");
            }
            "kubectl" => {
                settings.kubectl_version = get_string_prop(node, "version")
                    .or_else(|| get_first_string_arg(node));
                settings.kubectl_sha256 = get_string_prop(node, "sha256");
                settings.kubectl_base_url = get_string_prop(node, "base-url");
                settings.kubectl_arch = get_string_prop(node, "arch");
                settings.kubectl_path = get_string_prop(node, "path");
            }
            "rollout" => parse_rollout(node, &mut settings),
            "cluster" => {
                settings.cluster_name = get_string_prop(node, "name");
                settings.region = get_string_prop(node, "region");
                settings.assume_role = get_string_prop(node, "assume-role");
            }
            "baremetal" => parse_bare_metal(node, &mut settings),
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(settings)
}

fn parse_rollout(node: &KdlNode, settings: &mut DeploySettings) {
    settings.rollout = Some(get_first_bool_arg(node).unwrap_or(true));
    settings.rollout_timeout = get_string_prop(node, "timeout");

    let workloads: Vec<String> = node
        .children()
        .map(|children| {
            children
                .nodes()
                .iter()
                .filter(|child| child.name().value() == "workload")
                .filter_map(get_first_string_arg)
                .collect()
        })
        .unwrap_or_default();
    if !workloads.is_empty() {
        settings.rollout_workloads = Some(workloads);
    }
}

fn parse_bare_metal(node: &KdlNode, settings: &mut DeploySettings) {
    settings.server = get_string_prop(node, "server");
    settings.user = get_string_prop(node, "user");
    settings.token = get_string_prop(node, "token");
    settings.ca = get_string_prop(node, "ca");

    // Certificates are multi-line, so they may also be given as a child node.
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "ca" {
                settings.ca = get_first_string_arg(child);
            }
        }
    }
}

fn required_arg(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubedeploy_core::{Action, ClusterCredentials, ClusterType};
    use std::time::Duration;

    #[test]
    fn test_parse_managed_cloud_file() {
        let kdl = r#"
            type "EKS"
            actions "apply" "diff"
            manifest-dir "./k8s"
            namespace "prod"
            kustomize #true
            image "app" version="1.2.3"
            rollout timeout="2m" {
                workload "deployment/api"
                workload "statefulset/db"
            }
            cluster name="prod-cluster" region="us-east-1" assume-role="arn:aws:iam::123:role/deploy"
        "#;

        let settings = parse_settings(kdl).unwrap();
        assert_eq!(settings.cluster_type.as_deref(), Some("EKS"));
        assert_eq!(
            settings.actions,
            Some(vec!["apply".to_string(), "diff".to_string()])
        );
        assert_eq!(settings.kustomize, Some(true));

        let descriptor = settings.to_descriptor().unwrap();
        assert_eq!(descriptor.cluster_type(), ClusterType::ManagedCloud);
        assert_eq!(descriptor.actions, vec![Action::Apply, Action::Diff]);
        assert_eq!(descriptor.namespace.as_deref(), Some("prod"));
        assert!(descriptor.use_templating);
        assert_eq!(
            descriptor.image_override.as_ref().map(|i| i.reference()),
            Some("app:1.2.3".to_string())
        );

        let rollout = descriptor.rollout.unwrap();
        assert_eq!(rollout.timeout, Duration::from_secs(120));
        assert_eq!(rollout.workloads, vec!["deployment/api", "statefulset/db"]);

        match descriptor.credentials {
            ClusterCredentials::ManagedCloud(auth) => {
                assert_eq!(auth.cluster_name, "prod-cluster");
                assert_eq!(auth.region, "us-east-1");
                assert_eq!(
                    auth.role_arn.as_deref(),
                    Some("arn:aws:iam::123:role/deploy")
                );
            }
            other => panic!("Expected managed credentials, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bare_metal_file() {
        let kdl = r#"
            baremetal server="https://10.0.0.1:6443" user="deployer" token="t0ken" {
                ca "-----BEGIN CERTIFICATE-----"
            }
            kubectl version="1.29.0" sha256="e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        "#;

        let settings = parse_settings(kdl).unwrap();
        let options = settings.install_options().unwrap();
        assert!(options.sha256.is_some());

        let descriptor = settings.to_descriptor().unwrap();
        assert_eq!(descriptor.cluster_version.as_deref(), Some("v1.29.0"));
        match descriptor.credentials {
            ClusterCredentials::BareMetal(auth) => {
                assert_eq!(auth.user, "deployer");
                assert_eq!(auth.token, "t0ken");
                assert_eq!(
                    auth.certificate_pem.as_deref(),
                    Some("-----BEGIN CERTIFICATE-----")
                );
            }
            other => panic!("Expected bare-metal credentials, got {:?}", other),
        }
    }

    #[test]
    fn test_rollout_can_be_disabled() {
        let settings = parse_settings("rollout #false").unwrap();
        assert_eq!(settings.rollout, Some(false));
    }

    #[test]
    fn test_missing_argument() {
        let err = parse_settings("namespace").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ref f) if f == "namespace"));
    }

    #[test]
    fn test_invalid_kdl() {
        assert!(matches!(
            parse_settings("type \"EKS"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_settings_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.kdl");
        std::fs::write(&path, "namespace \"prod\"\n").unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.namespace.as_deref(), Some("prod"));

        assert!(matches!(
            load_settings(&dir.path().join("missing.kdl")),
            Err(ConfigError::Io(_))
        ));
    }
}
