//! Deployment orchestration for kubedeploy.
//!
//! - [`credentials`]: role assumption and CA certificate provisioning
//! - [`builder`]: descriptor to ordered plan
//! - [`install`]: one-off kubectl download
//! - [`deployment`]: the run sequence tying them to the executor

pub mod builder;
pub mod credentials;
pub mod deployment;
pub mod install;

pub use builder::{CommandBuilder, Toolchain};
pub use credentials::{
    AwsCliRoleAssumer, CredentialProvisioner, ProvisionedCredentials, RoleAssumer,
    TemporaryCredentials,
};
pub use deployment::Deployment;
pub use install::{InstallError, KubectlInstaller};
