//! Configuration for kubedeploy.
//!
//! This crate handles:
//! - Deployment files (deploy.kdl)
//! - Merging file values with command-line and environment values
//! - Validating the merged settings into a deployment descriptor

pub mod error;
pub mod file;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use file::{load_settings, parse_settings};
pub use settings::{DeploySettings, InstallOptions, normalize_kubectl_version};
