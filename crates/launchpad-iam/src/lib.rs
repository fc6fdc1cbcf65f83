//! # Launchpad IAM
//!
//! Execution identities and the permission grants bound to them.
//!
//! A grant is an explicit list of [`PolicyStatement`]s. There are no managed
//! "full access" policies here: every statement names the actions it allows
//! and the exact resources (plus an optional cluster condition) it applies to.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleName(pub String);

impl std::fmt::Display for RoleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RoleName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoleName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoleName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Amazon resource name. Only the shape `arn:<partition>:<service>:<region>:<account>:<resource>`
/// is checked; the resource part is free-form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Arn(String);

impl Arn {
    pub fn parse(raw: &str) -> Result<Self, InvalidArn> {
        let parts: Vec<&str> = raw.splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" || parts[1].is_empty() || parts[2].is_empty() {
            return Err(InvalidArn(raw.to_string()));
        }
        if parts[5].is_empty() {
            return Err(InvalidArn(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn ecs_cluster(region: &str, account: &str, cluster: &str) -> Self {
        Self(format!("arn:aws:ecs:{region}:{account}:cluster/{cluster}"))
    }

    pub fn ecs_task_definition(region: &str, account: &str, family: &str, revision: u32) -> Self {
        Self(format!(
            "arn:aws:ecs:{region}:{account}:task-definition/{family}:{revision}"
        ))
    }

    pub fn ecs_task(region: &str, account: &str, cluster: &str, task_id: &str) -> Self {
        Self(format!("arn:aws:ecs:{region}:{account}:task/{cluster}/{task_id}"))
    }

    pub fn iam_role(account: &str, role: &RoleName) -> Self {
        Self(format!("arn:aws:iam::{account}:role/{role}"))
    }

    pub fn log_group(region: &str, account: &str, group: &str) -> Self {
        Self(format!("arn:aws:logs:{region}:{account}:log-group:{group}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trailing resource component (`cluster/Name`, `role/Name`, ...).
    pub fn resource(&self) -> &str {
        self.0.splitn(6, ':').nth(5).unwrap_or_default()
    }
}

impl std::fmt::Display for Arn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid ARN: {0}")]
pub struct InvalidArn(pub String);

/// The individual capabilities a grant can hand out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "ecs:RunTask")]
    RunTask,
    #[serde(rename = "ecs:ListTasks")]
    ListTasks,
    #[serde(rename = "ecs:DescribeTasks")]
    DescribeTasks,
    #[serde(rename = "ecs:StopTask")]
    StopTask,
    #[serde(rename = "iam:PassRole")]
    PassRole,
    #[serde(rename = "logs:CreateLogStream")]
    CreateLogStream,
    #[serde(rename = "logs:PutLogEvents")]
    PutLogEvents,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::RunTask => "ecs:RunTask",
            Action::ListTasks => "ecs:ListTasks",
            Action::DescribeTasks => "ecs:DescribeTasks",
            Action::StopTask => "ecs:StopTask",
            Action::PassRole => "iam:PassRole",
            Action::CreateLogStream => "logs:CreateLogStream",
            Action::PutLogEvents => "logs:PutLogEvents",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource selector inside a statement.
///
/// `Prefix` is written with a trailing `*` in policy documents and matches any
/// ARN starting with the given text. A bare `*` is deliberately not expressible.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourcePattern {
    Exact(Arn),
    Prefix(String),
}

impl ResourcePattern {
    pub fn matches(&self, arn: &Arn) -> bool {
        match self {
            ResourcePattern::Exact(a) => a == arn,
            ResourcePattern::Prefix(p) => arn.as_str().starts_with(p.as_str()),
        }
    }

    fn render(&self) -> String {
        match self {
            ResourcePattern::Exact(a) => a.to_string(),
            ResourcePattern::Prefix(p) => format!("{p}*"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub sid: String,
    pub actions: Vec<Action>,
    pub resources: Vec<ResourcePattern>,
    /// `ArnEquals ecs:cluster` condition.
    pub cluster: Option<Arn>,
}

impl PolicyStatement {
    fn allows(&self, action: Action, resource: &Arn, cluster: Option<&Arn>) -> bool {
        if !self.actions.contains(&action) {
            return false;
        }
        if !self.resources.iter().any(|r| r.matches(resource)) {
            return false;
        }
        match (&self.cluster, cluster) {
            (None, _) => true,
            (Some(required), Some(given)) => required == given,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{role} is not allowed to perform {action} on {resource}")]
pub struct AccessDenied {
    pub role: RoleName,
    pub action: Action,
    pub resource: String,
}

/// Identity plus its attached statements. Bound once at provisioning time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionIdentity {
    pub role: RoleName,
    pub arn: Arn,
    pub statements: Vec<PolicyStatement>,
}

impl ExecutionIdentity {
    pub fn new(account: &str, role: RoleName) -> Self {
        let arn = Arn::iam_role(account, &role);
        Self {
            role,
            arn,
            statements: Vec::new(),
        }
    }

    pub fn with_statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }

    /// Checks `action` on `resource`, optionally inside `cluster`.
    pub fn authorize(
        &self,
        action: Action,
        resource: &Arn,
        cluster: Option<&Arn>,
    ) -> Result<(), AccessDenied> {
        if self
            .statements
            .iter()
            .any(|s| s.allows(action, resource, cluster))
        {
            Ok(())
        } else {
            tracing::warn!(role = %self.role, %action, %resource, "Access denied");
            Err(AccessDenied {
                role: self.role.clone(),
                action,
                resource: resource.to_string(),
            })
        }
    }

    /// All actions granted by any statement, de-duplicated, in first-seen order.
    pub fn capabilities(&self) -> Vec<Action> {
        let mut out = Vec::new();
        for action in self.statements.iter().flat_map(|s| s.actions.iter()) {
            if !out.contains(action) {
                out.push(*action);
            }
        }
        out
    }

    /// IAM policy document (`Version` 2012-10-17) for the attached statements.
    pub fn policy_document(&self) -> serde_json::Value {
        let statements: Vec<serde_json::Value> = self
            .statements
            .iter()
            .map(|s| {
                let mut stmt = serde_json::json!({
                    "Sid": s.sid,
                    "Effect": "Allow",
                    "Action": s.actions.iter().map(Action::as_str).collect::<Vec<_>>(),
                    "Resource": s.resources.iter().map(ResourcePattern::render).collect::<Vec<_>>(),
                });
                if let Some(cluster) = &s.cluster {
                    stmt["Condition"] = serde_json::json!({
                        "ArnEquals": { "ecs:cluster": cluster.as_str() }
                    });
                }
                stmt
            })
            .collect();

        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": statements,
        })
    }
}

/// Resources a trigger identity needs to know to be scoped to one cluster/template pair.
#[derive(Clone, Debug)]
pub struct TriggerScope<'a> {
    pub region: &'a str,
    pub account: &'a str,
    pub cluster_name: &'a str,
    pub cluster: &'a Arn,
    pub task_definition: &'a Arn,
    pub task_execution_role: &'a Arn,
}

/// Builds the trigger identity: start tasks from one template on one cluster,
/// see and stop the tasks of that cluster, and hand the task execution role to ECS.
pub fn least_privilege_trigger(role: RoleName, scope: &TriggerScope<'_>) -> ExecutionIdentity {
    let task_prefix = format!(
        "arn:aws:ecs:{}:{}:task/{}/",
        scope.region, scope.account, scope.cluster_name
    );
    let container_instance_prefix = format!(
        "arn:aws:ecs:{}:{}:container-instance/{}/",
        scope.region, scope.account, scope.cluster_name
    );

    ExecutionIdentity::new(scope.account, role)
        .with_statement(PolicyStatement {
            sid: "StartTemplateOnCluster".to_string(),
            actions: vec![Action::RunTask],
            resources: vec![ResourcePattern::Exact(scope.task_definition.clone())],
            cluster: Some(scope.cluster.clone()),
        })
        .with_statement(PolicyStatement {
            sid: "ListClusterTasks".to_string(),
            actions: vec![Action::ListTasks],
            resources: vec![
                ResourcePattern::Exact(scope.cluster.clone()),
                ResourcePattern::Prefix(container_instance_prefix),
            ],
            cluster: Some(scope.cluster.clone()),
        })
        .with_statement(PolicyStatement {
            sid: "ManageClusterTasks".to_string(),
            actions: vec![Action::DescribeTasks, Action::StopTask],
            resources: vec![ResourcePattern::Prefix(task_prefix)],
            cluster: Some(scope.cluster.clone()),
        })
        .with_statement(PolicyStatement {
            sid: "PassTaskExecutionRole".to_string(),
            actions: vec![Action::PassRole],
            resources: vec![ResourcePattern::Exact(scope.task_execution_role.clone())],
            cluster: None,
        })
}

/// Identity the container runtime uses to ship logs into `log_group`.
pub fn task_execution_role(account: &str, role: RoleName, log_group: &Arn) -> ExecutionIdentity {
    ExecutionIdentity::new(account, role).with_statement(PolicyStatement {
        sid: "WriteRunLogs".to_string(),
        actions: vec![Action::CreateLogStream, Action::PutLogEvents],
        resources: vec![ResourcePattern::Prefix(format!("{}:", log_group))],
        cluster: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arn_parse() {
        let arn = Arn::parse("arn:aws:ecs:us-east-1:123456789012:cluster/Jobs").unwrap();
        assert_eq!(arn.resource(), "cluster/Jobs");

        assert!(Arn::parse("not-an-arn").is_err());
        assert!(Arn::parse("arn:aws:ecs:us-east-1:123456789012:").is_err());
        // IAM ARNs have an empty region.
        assert!(Arn::parse("arn:aws:iam::123456789012:role/Runner").is_ok());
    }

    #[test]
    fn test_prefix_pattern() {
        let pattern = ResourcePattern::Prefix("arn:aws:ecs:us-east-1:1:task/A/".to_string());
        assert!(pattern.matches(&Arn::ecs_task("us-east-1", "1", "A", "abc")));
        assert!(!pattern.matches(&Arn::ecs_task("us-east-1", "1", "B", "abc")));
        assert_eq!(pattern.render(), "arn:aws:ecs:us-east-1:1:task/A/*");
    }

    #[test]
    fn test_condition_requires_cluster() {
        let cluster = Arn::ecs_cluster("us-east-1", "1", "A");
        let td = Arn::ecs_task_definition("us-east-1", "1", "Fam", 1);
        let id = ExecutionIdentity::new("1", "Runner".into()).with_statement(PolicyStatement {
            sid: "s".into(),
            actions: vec![Action::RunTask],
            resources: vec![ResourcePattern::Exact(td.clone())],
            cluster: Some(cluster.clone()),
        });

        assert!(id.authorize(Action::RunTask, &td, Some(&cluster)).is_ok());
        assert!(id.authorize(Action::RunTask, &td, None).is_err());
    }
}
