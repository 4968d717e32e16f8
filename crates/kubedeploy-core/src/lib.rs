//! Core domain types for kubedeploy.
//!
//! This crate contains:
//! - The deployment descriptor and its closed enums (cluster type, actions)
//! - Operation descriptors and the ordered plan handed to the executor
//! - The environment patch used to pass credentials to child processes
//! - The error taxonomy shared by every other crate

pub mod descriptor;
pub mod env;
pub mod error;
pub mod id;
pub mod operation;

pub use descriptor::{
    Action, BareMetalAuth, ClusterCredentials, ClusterType, DeploymentDescriptor, ImageOverride,
    ManagedCloudAuth, RolloutCheck,
};
pub use env::EnvironmentPatch;
pub use error::{Error, Result};
pub use id::RunId;
pub use operation::{OperationDescriptor, OperationKind, Plan, StdinSource, Step};
