//! Compute cluster contract and a pooled, serverless in-memory implementation.
//!
//! The cluster, not the trigger, owns run state and capacity. Every call is
//! checked against the caller's [`ExecutionIdentity`] the way the control plane
//! would check it.

use crate::error::TaskError;
use crate::template::JobTemplate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use launchpad_iam::{Action, Arn, ExecutionIdentity};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeCluster {
    pub name: String,
    pub arn: Arn,
    pub vpc_id: String,
    pub region: String,
    pub account: String,
}

impl ComputeCluster {
    pub fn new(name: &str, region: &str, account: &str, vpc_id: &str) -> Self {
        Self {
            name: name.to_string(),
            arn: Arn::ecs_cluster(region, account, name),
            vpc_id: vpc_id.to_string(),
            region: region.to_string(),
            account: account.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchType {
    Fargate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignPublicIp {
    Enabled,
    Disabled,
}

/// `awsvpc` placement of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkBinding {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub assign_public_ip: AssignPublicIp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    pub cluster: Arn,
    pub task_definition: Arn,
    pub launch_type: LaunchType,
    pub count: u32,
    pub network: NetworkBinding,
    pub overrides: Vec<ContainerOverride>,
    pub started_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHandle {
    pub task_arn: Arn,
    pub task_id: String,
    pub cluster: Arn,
    pub task_definition: Arn,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Stopped,
}

/// One execution of a template, as the cluster tracks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub handle: RunHandle,
    pub status: RunStatus,
    pub template_fingerprint: String,
    pub network: NetworkBinding,
    pub overrides: Vec<ContainerOverride>,
    pub started_by: Option<String>,
    pub log_stream: String,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub exit_code: Option<i32>,
}

/// The only surface the trigger uses to talk to a cluster.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Schedules `request.count` containers from `request.task_definition`.
    async fn run_task(
        &self,
        identity: &ExecutionIdentity,
        request: RunTaskRequest,
    ) -> Result<Vec<RunHandle>, TaskError>;

    async fn list_tasks(
        &self,
        identity: &ExecutionIdentity,
        cluster: &Arn,
        status: RunStatus,
    ) -> Result<Vec<Arn>, TaskError>;

    async fn describe_task(
        &self,
        identity: &ExecutionIdentity,
        cluster: &Arn,
        task: &Arn,
    ) -> Result<Run, TaskError>;

    async fn stop_task(
        &self,
        identity: &ExecutionIdentity,
        cluster: &Arn,
        task: &Arn,
        reason: &str,
    ) -> Result<Run, TaskError>;
}

/// Stopped runs a pool remembers before forgetting the oldest.
pub const DEFAULT_STOPPED_RETENTION: usize = 1024;

const CONTAINER_EXITED: &str = "Essential container in task exited";

type RunTable = Arc<Mutex<HashMap<Arn, Run>>>;

/// Serverless pool: no machines, every run gets a fresh task. `capacity`
/// bounds concurrently running tasks; `None` means unbounded.
///
/// With a run duration set, each container exits on its own that long after
/// it starts. Without one, runs stay up until stopped or marked exited.
pub struct FargatePool {
    cluster: ComputeCluster,
    subnets: HashSet<String>,
    security_groups: HashSet<String>,
    capacity: Option<usize>,
    run_duration: Option<Duration>,
    stopped_retention: usize,
    templates: HashMap<Arn, Arc<JobTemplate>>,
    runs: RunTable,
}

impl FargatePool {
    pub fn new(
        cluster: ComputeCluster,
        subnets: impl IntoIterator<Item = String>,
        security_groups: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            cluster,
            subnets: subnets.into_iter().collect(),
            security_groups: security_groups.into_iter().collect(),
            capacity: None,
            run_duration: None,
            stopped_retention: DEFAULT_STOPPED_RETENTION,
            templates: HashMap::new(),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Containers exit with code 0 this long after they start.
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = Some(duration);
        self
    }

    pub fn with_stopped_retention(mut self, retention: usize) -> Self {
        self.stopped_retention = retention;
        self
    }

    /// Makes a template launchable on this pool.
    pub fn register_template(mut self, template: Arc<JobTemplate>) -> Self {
        let arn = template.arn(&self.cluster.region, &self.cluster.account);
        self.templates.insert(arn, template);
        self
    }

    pub fn cluster(&self) -> &ComputeCluster {
        &self.cluster
    }

    /// Records the essential container exiting, which stops the task.
    pub async fn mark_exited(&self, task: &Arn, exit_code: i32) -> Result<Run, TaskError> {
        let mut runs = self.runs.lock().await;
        let run = stop_run(&mut runs, task, CONTAINER_EXITED, Some(exit_code))?;
        prune_stopped(&mut runs, self.stopped_retention);
        Ok(run)
    }

    fn schedule_exit(&self, task: Arn, after: Duration) {
        let runs = Arc::clone(&self.runs);
        let retention = self.stopped_retention;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let mut runs = runs.lock().await;
            // Stopped or forgotten runs are left alone.
            if runs.get(&task).is_some_and(|r| r.status == RunStatus::Running) {
                if let Err(e) = stop_run(&mut runs, &task, CONTAINER_EXITED, Some(0)) {
                    tracing::warn!(task = %task, error = %e, "Failed to record container exit");
                }
                prune_stopped(&mut runs, retention);
            }
        });
    }

    fn check_cluster(&self, cluster: &Arn) -> Result<(), TaskError> {
        if cluster != &self.cluster.arn {
            return Err(TaskError::ClusterMismatch {
                requested: cluster.to_string(),
                cluster: self.cluster.arn.to_string(),
            });
        }
        Ok(())
    }

    fn check_network(&self, network: &NetworkBinding) -> Result<(), TaskError> {
        if network.subnets.is_empty() {
            return Err(TaskError::InvalidNetwork("no subnets given".to_string()));
        }
        if let Some(subnet) = network.subnets.iter().find(|s| !self.subnets.contains(*s)) {
            return Err(TaskError::InvalidNetwork(format!(
                "subnet {} is not in {}",
                subnet, self.cluster.vpc_id
            )));
        }
        if let Some(sg) = network
            .security_groups
            .iter()
            .find(|s| !self.security_groups.contains(*s))
        {
            return Err(TaskError::InvalidNetwork(format!(
                "security group {} is not in {}",
                sg, self.cluster.vpc_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRunner for FargatePool {
    #[tracing::instrument(skip(self, identity, request), fields(cluster = %self.cluster.name, role = %identity.role))]
    async fn run_task(
        &self,
        identity: &ExecutionIdentity,
        request: RunTaskRequest,
    ) -> Result<Vec<RunHandle>, TaskError> {
        self.check_cluster(&request.cluster)?;
        identity.authorize(Action::RunTask, &request.task_definition, Some(&request.cluster))?;

        let template = self
            .templates
            .get(&request.task_definition)
            .ok_or_else(|| TaskError::UnknownTaskDefinition(request.task_definition.to_string()))?;
        identity.authorize(Action::PassRole, template.execution_role(), None)?;

        if request.count == 0 {
            return Err(TaskError::InvalidCount);
        }
        self.check_network(&request.network)?;

        if let Some(o) = request
            .overrides
            .iter()
            .find(|o| o.name != template.container().name)
        {
            return Err(TaskError::InvalidOverride(format!(
                "{} has no container named {}",
                request.task_definition, o.name
            )));
        }

        let mut runs = self.runs.lock().await;
        if let Some(capacity) = self.capacity {
            let running = runs
                .values()
                .filter(|r| r.status == RunStatus::Running)
                .count();
            if running + request.count as usize > capacity {
                tracing::warn!(running, capacity, "Cluster at capacity");
                return Err(TaskError::CapacityExceeded {
                    cluster: self.cluster.name.clone(),
                    capacity,
                });
            }
        }

        let mut handles = Vec::with_capacity(request.count as usize);
        for _ in 0..request.count {
            let task_id = Uuid::new_v4().simple().to_string();
            let handle = RunHandle {
                task_arn: Arn::ecs_task(
                    &self.cluster.region,
                    &self.cluster.account,
                    &self.cluster.name,
                    &task_id,
                ),
                task_id: task_id.clone(),
                cluster: self.cluster.arn.clone(),
                task_definition: request.task_definition.clone(),
                created_at: Utc::now(),
            };
            let run = Run {
                handle: handle.clone(),
                status: RunStatus::Running,
                template_fingerprint: template.fingerprint().to_string(),
                network: request.network.clone(),
                overrides: request.overrides.clone(),
                started_by: request.started_by.clone(),
                log_stream: template
                    .logging()
                    .stream_name(&template.container().name, &task_id),
                stopped_at: None,
                stop_reason: None,
                exit_code: None,
            };
            tracing::info!(task = %handle.task_arn, log_stream = %run.log_stream, "Task started");
            runs.insert(handle.task_arn.clone(), run);
            handles.push(handle);
        }
        drop(runs);

        if let Some(after) = self.run_duration {
            for handle in &handles {
                self.schedule_exit(handle.task_arn.clone(), after);
            }
        }
        Ok(handles)
    }

    async fn list_tasks(
        &self,
        identity: &ExecutionIdentity,
        cluster: &Arn,
        status: RunStatus,
    ) -> Result<Vec<Arn>, TaskError> {
        self.check_cluster(cluster)?;
        identity.authorize(Action::ListTasks, cluster, Some(cluster))?;

        let runs = self.runs.lock().await;
        let mut tasks: Vec<(&DateTime<Utc>, Arn)> = runs
            .values()
            .filter(|r| r.status == status)
            .map(|r| (&r.handle.created_at, r.handle.task_arn.clone()))
            .collect();
        tasks.sort_by(|a, b| a.0.cmp(b.0));
        Ok(tasks.into_iter().map(|(_, arn)| arn).collect())
    }

    async fn describe_task(
        &self,
        identity: &ExecutionIdentity,
        cluster: &Arn,
        task: &Arn,
    ) -> Result<Run, TaskError> {
        self.check_cluster(cluster)?;
        identity.authorize(Action::DescribeTasks, task, Some(cluster))?;

        let runs = self.runs.lock().await;
        runs.get(task)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask(task.to_string()))
    }

    async fn stop_task(
        &self,
        identity: &ExecutionIdentity,
        cluster: &Arn,
        task: &Arn,
        reason: &str,
    ) -> Result<Run, TaskError> {
        self.check_cluster(cluster)?;
        identity.authorize(Action::StopTask, task, Some(cluster))?;

        let mut runs = self.runs.lock().await;
        let run = stop_run(&mut runs, task, reason, None)?;
        prune_stopped(&mut runs, self.stopped_retention);
        Ok(run)
    }
}

/// Moves a run to `Stopped`. Runs that already stopped keep their first reason.
fn stop_run(
    runs: &mut HashMap<Arn, Run>,
    task: &Arn,
    reason: &str,
    exit_code: Option<i32>,
) -> Result<Run, TaskError> {
    let run = runs
        .get_mut(task)
        .ok_or_else(|| TaskError::UnknownTask(task.to_string()))?;
    if run.status != RunStatus::Stopped {
        run.status = RunStatus::Stopped;
        run.stopped_at = Some(Utc::now());
        run.stop_reason = Some(reason.to_string());
        run.exit_code = exit_code;
        tracing::info!(task = %task, reason, ?exit_code, "Task stopped");
    }
    Ok(run.clone())
}

/// Forgets the oldest stopped runs beyond `retention`. Running tasks are never dropped.
fn prune_stopped(runs: &mut HashMap<Arn, Run>, retention: usize) {
    let mut stopped: Vec<(DateTime<Utc>, Arn)> = runs
        .values()
        .filter(|r| r.status == RunStatus::Stopped)
        .map(|r| (r.stopped_at.unwrap_or(r.handle.created_at), r.handle.task_arn.clone()))
        .collect();
    if stopped.len() <= retention {
        return;
    }
    stopped.sort_by(|a, b| a.0.cmp(&b.0));
    let excess = stopped.len() - retention;
    for (_, task) in stopped.into_iter().take(excess) {
        runs.remove(&task);
    }
    tracing::debug!(evicted = excess, retention, "Pruned stopped runs");
}
