//! Trigger endpoint: one invocation, one run request.
//!
//! The endpoint is stateless. Everything it needs (cluster, template, subnets,
//! security group) is fixed at provisioning time in a [`TriggerBinding`]; it
//! keeps no record of the runs it starts.
//!
//! Delivery is at-least-once: if the run request outlives the invocation
//! timeout the caller sees [`TriggerError::Timeout`], but the cluster may
//! already have accepted the run. A retry can therefore start a second run.

use crate::cluster::{ContainerOverride, LaunchType, NetworkBinding, RunTaskRequest, TaskRunner};
use crate::error::{TaskError, TriggerError};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use launchpad_iam::{Arn, ExecutionIdentity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Anyone with the URL may invoke.
    #[default]
    None,
    /// Callers must sign requests; the URL front door verifies the signature.
    AwsIam,
}

impl AuthMode {
    /// Function URL `AuthType` value.
    pub fn auth_type(&self) -> &'static str {
        match self {
            AuthMode::None => "NONE",
            AuthMode::AwsIam => "AWS_IAM",
        }
    }
}

/// Optional invocation body. An empty body means "run the template as is".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvocationRequest {
    /// Workload configuration, handed to the container base64-encoded.
    pub config: Option<serde_json::Map<String, serde_json::Value>>,
    pub sample: Option<u64>,
}

impl InvocationRequest {
    pub fn from_body(body: &[u8]) -> Result<Self, TriggerError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| TriggerError::BadRequest(e.to_string()))
    }

    fn command(&self, default_sample: u64) -> Option<Vec<String>> {
        let config = self.config.as_ref()?;
        let encoded = STANDARD.encode(serde_json::Value::Object(config.clone()).to_string());
        Some(vec![
            "--config-base64".to_string(),
            encoded,
            "--sample".to_string(),
            self.sample.unwrap_or(default_sample).to_string(),
        ])
    }
}

/// Identifiers the trigger was wired with at provisioning time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerBinding {
    pub function_name: String,
    pub cluster: Arn,
    pub task_definition: Arn,
    pub container_name: String,
    pub network: NetworkBinding,
    pub auth_mode: AuthMode,
    pub timeout: Duration,
    pub default_sample: u64,
}

/// Response to a successful invocation: the run was accepted, not finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub run_id: String,
    pub task_arn: Arn,
    pub cluster: Arn,
    pub task_definition: Arn,
    pub requested_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TriggerEndpoint {
    binding: Arc<TriggerBinding>,
    identity: Arc<ExecutionIdentity>,
    runner: Arc<dyn TaskRunner>,
}

impl TriggerEndpoint {
    pub fn new(
        binding: TriggerBinding,
        identity: ExecutionIdentity,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            binding: Arc::new(binding),
            identity: Arc::new(identity),
            runner,
        }
    }

    pub fn binding(&self) -> &TriggerBinding {
        &self.binding
    }

    pub fn identity(&self) -> &ExecutionIdentity {
        &self.identity
    }

    /// Requests exactly one run of the bound template and returns once the
    /// cluster has accepted it.
    #[tracing::instrument(skip(self, request), fields(function = %self.binding.function_name))]
    pub async fn invoke(&self, request: InvocationRequest) -> Result<RunAccepted, TriggerError> {
        let overrides = request
            .command(self.binding.default_sample)
            .map(|command| {
                vec![ContainerOverride {
                    name: self.binding.container_name.clone(),
                    command,
                }]
            })
            .unwrap_or_default();

        let run_request = RunTaskRequest {
            cluster: self.binding.cluster.clone(),
            task_definition: self.binding.task_definition.clone(),
            launch_type: LaunchType::Fargate,
            count: 1,
            network: self.binding.network.clone(),
            overrides,
            started_by: Some(self.binding.function_name.clone()),
        };

        let requested_at = Utc::now();
        let handles = match tokio::time::timeout(
            self.binding.timeout,
            self.runner.run_task(&self.identity, run_request),
        )
        .await
        {
            Ok(result) => result.map_err(|e| {
                tracing::error!(error = %e, "Run request rejected");
                TriggerError::Rejected(e)
            })?,
            Err(_) => {
                tracing::error!(timeout = ?self.binding.timeout, "Run request timed out; the run may still start");
                return Err(TriggerError::Timeout(self.binding.timeout));
            }
        };

        let handle = handles
            .into_iter()
            .next()
            .ok_or(TriggerError::Rejected(TaskError::InvalidCount))?;
        tracing::info!(task = %handle.task_arn, "Run accepted");

        Ok(RunAccepted {
            run_id: handle.task_id,
            task_arn: handle.task_arn,
            cluster: handle.cluster,
            task_definition: handle.task_definition,
            requested_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_means_no_override() {
        let req = InvocationRequest::from_body(b"").unwrap();
        assert_eq!(req, InvocationRequest::default());
        assert!(InvocationRequest::from_body(b"  \n").unwrap().command(10).is_none());
    }

    #[test]
    fn test_config_becomes_base64_command() {
        let req = InvocationRequest::from_body(br#"{"config": {"generators": []}, "sample": 5}"#).unwrap();
        let command = req.command(10_000).unwrap();
        assert_eq!(command[0], "--config-base64");
        let decoded = STANDARD.decode(&command[1]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value, serde_json::json!({"generators": []}));
        assert_eq!(command[2..], ["--sample".to_string(), "5".to_string()]);
    }

    #[test]
    fn test_sample_defaults() {
        let req = InvocationRequest::from_body(br#"{"config": {}}"#).unwrap();
        assert_eq!(req.command(10_000).unwrap()[3], "10000");
    }

    #[test]
    fn test_bad_bodies() {
        for body in [&b"not json"[..], br#"{"config": 3}"#, br#"{"extra": true}"#] {
            let err = InvocationRequest::from_body(body).unwrap_err();
            assert_eq!(err.status_code(), 400);
        }
    }

    #[test]
    fn test_auth_type() {
        assert_eq!(AuthMode::None.auth_type(), "NONE");
        assert_eq!(AuthMode::AwsIam.auth_type(), "AWS_IAM");
    }
}
