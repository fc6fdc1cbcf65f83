//! # Launchpad Core
//!
//! Provisioning model and trigger for an on-demand container job launcher:
//! one network, one serverless cluster, one immutable job template, and a
//! stateless endpoint that starts one run of that template per invocation.

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod image;
pub mod network;
pub mod stack;
pub mod synth;
pub mod template;
pub mod trigger;

pub use cluster::{FargatePool, TaskRunner};
pub use config::LaunchConfig;
pub use error::{ConfigError, ProvisionError, TaskError, TriggerError};
pub use stack::{DeploymentScope, ProvisionedStack, Provisioner, StackDefinition};
pub use trigger::{InvocationRequest, RunAccepted, TriggerEndpoint};
