//! Error types for provisioning and invocation.
//!
//! Provisioning errors are fatal and never retried. Invocation errors are
//! returned to the caller unchanged; retrying is the caller's decision.

use std::time::Duration;
use thiserror::Error;

/// Startup configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required license variable is not set at all.
    #[error("required variable {var} is not set")]
    MissingLicenseField { var: &'static str },

    /// A required license variable is set but blank.
    #[error("required variable {var} is empty")]
    EmptyLicenseField { var: &'static str },

    #[error("invalid setting `{field}`: {message}")]
    InvalidSetting { field: &'static str, message: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field,
            message: message.into(),
        }
    }
}

/// Provisioning-time errors. All of them abort provisioning with nothing created.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("address range {cidr} overlaps {existing} already used by stack {holder}")]
    AddressRangeInUse {
        cidr: String,
        existing: String,
        holder: String,
    },

    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    #[error("invalid job template {family}: {message}")]
    InvalidTemplate { family: String, message: String },

    #[error("stack {0} already exists in this deployment scope")]
    DuplicateStack(String),

    #[error("stack {0} does not exist in this deployment scope")]
    UnknownStack(String),

    #[error("cluster {cluster} is already used by stack {holder}")]
    ClusterNameInUse { cluster: String, holder: String },

    #[error("name {0:?} does not yield a template resource id")]
    InvalidResourceName(String),

    #[error("template resource id {0} is used twice")]
    DuplicateResourceId(String),

    #[error(transparent)]
    Iam(#[from] launchpad_iam::InvalidArn),
}

/// Errors returned by the compute cluster for a run request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("cluster {cluster} has no capacity left ({capacity} tasks running)")]
    CapacityExceeded { cluster: String, capacity: usize },

    #[error("unknown task definition {0}")]
    UnknownTaskDefinition(String),

    #[error("request targets cluster {requested}, this is {cluster}")]
    ClusterMismatch { requested: String, cluster: String },

    #[error("invalid network configuration: {0}")]
    InvalidNetwork(String),

    #[error("invalid container override: {0}")]
    InvalidOverride(String),

    #[error("task count must be at least 1")]
    InvalidCount,

    #[error("unknown task {0}")]
    UnknownTask(String),

    #[error(transparent)]
    AccessDenied(#[from] launchpad_iam::AccessDenied),
}

/// Errors surfaced to whoever invoked the trigger.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("missing authorization")]
    Unauthorized,

    #[error("run request rejected: {0}")]
    Rejected(#[from] TaskError),

    /// The run request did not complete in time. The cluster may still have
    /// accepted it, so retrying can start a second run.
    #[error("run request did not complete within {0:?}")]
    Timeout(Duration),
}

impl TriggerError {
    pub fn status_code(&self) -> u16 {
        match self {
            TriggerError::BadRequest(_) => 400,
            TriggerError::Unauthorized => 401,
            TriggerError::Rejected(TaskError::CapacityExceeded { .. }) => 503,
            TriggerError::Rejected(TaskError::AccessDenied(_)) => 500,
            TriggerError::Rejected(_) => 502,
            TriggerError::Timeout(_) => 504,
        }
    }
}
