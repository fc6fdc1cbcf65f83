//! Provisioning.
//!
//! A [`StackDefinition`] is derived once from the validated configuration.
//! [`Provisioner::provision`] checks everything up front (address ranges,
//! subnets, template, identities) and only then records the stack in the
//! [`DeploymentScope`], so a failure never leaves a partial stack behind.
//!
//! Resource order: network → access policy → cluster → log group → task
//! execution role → job template → trigger identity → trigger → outputs.

use crate::cluster::{AssignPublicIp, ComputeCluster, FargatePool, NetworkBinding, TaskRunner};
use crate::config::{LaunchConfig, StackSettings};
use crate::error::{ConfigError, ProvisionError};
use crate::network::{AccessPolicy, NetworkTopology, PortScope, SubnetPlan, any_ipv4};
use crate::template::{JobTemplate, LogRouting};
use crate::trigger::{TriggerBinding, TriggerEndpoint};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use launchpad_iam::{
    Arn, ExecutionIdentity, RoleName, TriggerScope, least_privilege_trigger, task_execution_role,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use url::Url;
use uuid::Uuid;

pub const LAMBDA_URL_OUTPUT: &str = "LambdaUrl";

/// Everything needed to provision one stack, derived from configuration.
#[derive(Debug, Clone)]
pub struct StackDefinition {
    config: LaunchConfig,
    topology: NetworkTopology,
    access_policy: AccessPolicy,
}

impl StackDefinition {
    pub fn from_config(config: LaunchConfig) -> Self {
        let topology = NetworkTopology::from_settings(&config.settings.network);
        let mut access_policy = AccessPolicy::new(&config.settings.network.security_group_name);
        access_policy.authorize_egress(
            any_ipv4(),
            PortScope::all_traffic(),
            "Allow all outbound traffic",
        );
        Self {
            config,
            topology,
            access_policy,
        }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn settings(&self) -> &StackSettings {
        &self.config.settings
    }

    pub fn topology(&self) -> &NetworkTopology {
        &self.topology
    }

    pub fn access_policy(&self) -> &AccessPolicy {
        &self.access_policy
    }

    /// Extra egress rule, only possible before provisioning.
    pub fn authorize_egress(&mut self, destination: Ipv4Net, ports: PortScope, description: &str) -> bool {
        self.access_policy.authorize_egress(destination, ports, description)
    }

    pub fn log_group_name(&self) -> String {
        format!("/launchpad/{}", self.settings().stack_name.to_lowercase())
    }

    pub fn trigger_role_name(&self) -> RoleName {
        RoleName(format!("{}ServiceRole", self.settings().trigger.function_name))
    }

    pub fn task_execution_role_name(&self) -> RoleName {
        RoleName(format!("{}ExecutionRole", self.settings().task.family))
    }

    /// The job template this stack registers, with the given execution role.
    pub fn job_template(&self, execution_role: Arn) -> Result<JobTemplate, ProvisionError> {
        let s = self.settings();
        JobTemplate::from_config(&self.config)
            .logging(LogRouting::awslogs(
                self.log_group_name(),
                &s.region,
                &s.task.log_stream_prefix,
            ))
            .execution_role(execution_role)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedSubnet {
    pub id: String,
    pub cidr: Ipv4Net,
    pub availability_zone: String,
    pub map_public_ip_on_launch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedNetwork {
    pub vpc_id: String,
    pub name: String,
    pub cidr: Ipv4Net,
    pub internet_gateway_id: String,
    pub route_table_id: String,
    pub subnets: Vec<ProvisionedSubnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedSecurityGroup {
    pub id: String,
    pub vpc_id: String,
    pub policy: AccessPolicy,
}

/// A provisioned stack. Nothing in it changes after provisioning.
#[derive(Debug, Clone)]
pub struct ProvisionedStack {
    pub name: String,
    pub region: String,
    pub account: String,
    pub network: ProvisionedNetwork,
    pub security_group: ProvisionedSecurityGroup,
    pub cluster: ComputeCluster,
    pub log_group: Arn,
    pub template: Arc<JobTemplate>,
    pub task_definition: Arn,
    pub task_execution_identity: ExecutionIdentity,
    pub trigger_identity: ExecutionIdentity,
    pub trigger: TriggerBinding,
    pub function_url: Url,
    pub created_at: DateTime<Utc>,
}

impl ProvisionedStack {
    /// Values surfaced to the operator.
    pub fn outputs(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([(LAMBDA_URL_OUTPUT, self.function_url.to_string())])
    }

    /// In-memory cluster wired to this stack's network and template.
    pub fn pool(&self) -> FargatePool {
        FargatePool::new(
            self.cluster.clone(),
            self.network.subnets.iter().map(|s| s.id.clone()),
            [self.security_group.id.clone()],
        )
        .register_template(self.template.clone())
    }

    pub fn trigger_endpoint(&self, runner: Arc<dyn TaskRunner>) -> TriggerEndpoint {
        TriggerEndpoint::new(self.trigger.clone(), self.trigger_identity.clone(), runner)
    }

    /// Number of resources the stack owns, for reporting.
    pub fn resource_count(&self) -> usize {
        // vpc, igw, route table, default route, then a subnet and its
        // route association per AZ
        let network = 4 + self.network.subnets.len() * 2;
        // sg, cluster, log group, task definition, two roles, function, url
        network + 8
    }
}

#[derive(Default)]
struct ScopeState {
    stacks: BTreeMap<String, Arc<ProvisionedStack>>,
}

/// The account/region a set of stacks is deployed into. Address ranges must
/// be unique within it.
#[derive(Clone, Default)]
pub struct DeploymentScope {
    inner: Arc<Mutex<ScopeState>>,
}

impl DeploymentScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeState> {
        // A panic while holding the lock cannot leave a half-written stack:
        // stacks are inserted whole.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stack(&self, name: &str) -> Option<Arc<ProvisionedStack>> {
        self.lock().stacks.get(name).cloned()
    }

    pub fn stack_names(&self) -> Vec<String> {
        self.lock().stacks.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().stacks.is_empty()
    }
}

pub struct Provisioner {
    scope: DeploymentScope,
}

impl Provisioner {
    pub fn new(scope: DeploymentScope) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &DeploymentScope {
        &self.scope
    }

    #[tracing::instrument(skip(self, definition), fields(stack = %definition.settings().stack_name))]
    pub fn provision(&self, definition: &StackDefinition) -> Result<Arc<ProvisionedStack>, ProvisionError> {
        let config = definition.config();
        config.settings.validate()?;
        config.license.validate()?;

        let s = &config.settings;
        let mut state = self.scope.lock();

        if state.stacks.contains_key(&s.stack_name) {
            return Err(ProvisionError::DuplicateStack(s.stack_name.clone()));
        }
        // Cluster names are unique per account and region.
        if let Some((holder, _)) = state
            .stacks
            .iter()
            .find(|(_, stack)| stack.cluster.name == s.cluster_name)
        {
            tracing::error!(cluster = %s.cluster_name, %holder, "Cluster name in use");
            return Err(ProvisionError::ClusterNameInUse {
                cluster: s.cluster_name.clone(),
                holder: holder.clone(),
            });
        }
        for (holder, stack) in &state.stacks {
            if definition.topology().overlaps(&stack.network.cidr) {
                tracing::error!(cidr = %s.network.cidr, existing = %stack.network.cidr, %holder, "Address range in use");
                return Err(ProvisionError::AddressRangeInUse {
                    cidr: s.network.cidr.to_string(),
                    existing: stack.network.cidr.to_string(),
                    holder: holder.clone(),
                });
            }
        }

        // Network
        let plans = definition.topology().plan_subnets(&s.region)?;
        let network = build_network(definition.topology(), plans);

        // Access policy
        if definition.access_policy().egress_rules().next().is_none() {
            return Err(ProvisionError::InvalidNetwork(format!(
                "{} has no egress rule; runs could not pull their image",
                definition.access_policy().name
            )));
        }
        let security_group = ProvisionedSecurityGroup {
            id: resource_id("sg"),
            vpc_id: network.vpc_id.clone(),
            policy: definition.access_policy().clone(),
        };

        // Cluster
        let cluster = ComputeCluster::new(&s.cluster_name, &s.region, &s.account_id, &network.vpc_id);

        // Logs + task execution role
        let log_group = Arn::log_group(&s.region, &s.account_id, &definition.log_group_name());
        let task_execution_identity = task_execution_role(
            &s.account_id,
            definition.task_execution_role_name(),
            &log_group,
        );

        // Job template
        let template = Arc::new(definition.job_template(task_execution_identity.arn.clone())?);
        let task_definition = template.arn(&s.region, &s.account_id);

        // Trigger identity + binding
        let trigger_identity = least_privilege_trigger(
            definition.trigger_role_name(),
            &TriggerScope {
                region: &s.region,
                account: &s.account_id,
                cluster_name: &cluster.name,
                cluster: &cluster.arn,
                task_definition: &task_definition,
                task_execution_role: &task_execution_identity.arn,
            },
        );
        let trigger = TriggerBinding {
            function_name: s.trigger.function_name.clone(),
            cluster: cluster.arn.clone(),
            task_definition: task_definition.clone(),
            container_name: template.container().name.clone(),
            network: NetworkBinding {
                subnets: network.subnets.iter().map(|n| n.id.clone()).collect(),
                security_groups: vec![security_group.id.clone()],
                assign_public_ip: AssignPublicIp::Enabled,
            },
            auth_mode: s.trigger.auth_mode,
            timeout: s.trigger.timeout(),
            default_sample: s.trigger.default_sample,
        };
        let function_url = function_url(&s.region)?;

        let stack = Arc::new(ProvisionedStack {
            name: s.stack_name.clone(),
            region: s.region.clone(),
            account: s.account_id.clone(),
            network,
            security_group,
            cluster,
            log_group,
            template,
            task_definition,
            task_execution_identity,
            trigger_identity,
            trigger,
            function_url,
            created_at: Utc::now(),
        });

        state.stacks.insert(stack.name.clone(), stack.clone());
        tracing::info!(
            vpc = %stack.network.vpc_id,
            cluster = %stack.cluster.arn,
            task_definition = %stack.task_definition,
            url = %stack.function_url,
            resources = stack.resource_count(),
            "Stack provisioned"
        );
        Ok(stack)
    }

    /// Removes a stack and frees its address range.
    #[tracing::instrument(skip(self))]
    pub fn teardown(&self, name: &str) -> Result<Arc<ProvisionedStack>, ProvisionError> {
        let removed = self
            .scope
            .lock()
            .stacks
            .remove(name)
            .ok_or_else(|| ProvisionError::UnknownStack(name.to_string()))?;
        tracing::info!(cidr = %removed.network.cidr, "Stack removed");
        Ok(removed)
    }
}

fn resource_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &hex[..17])
}

fn build_network(topology: &NetworkTopology, plans: Vec<SubnetPlan>) -> ProvisionedNetwork {
    ProvisionedNetwork {
        vpc_id: resource_id("vpc"),
        name: topology.name.clone(),
        cidr: topology.cidr,
        internet_gateway_id: resource_id("igw"),
        route_table_id: resource_id("rtb"),
        subnets: plans
            .into_iter()
            .map(|p| ProvisionedSubnet {
                id: resource_id("subnet"),
                cidr: p.cidr,
                availability_zone: p.availability_zone,
                map_public_ip_on_launch: p.map_public_ip_on_launch,
            })
            .collect(),
    }
}

fn function_url(region: &str) -> Result<Url, ProvisionError> {
    let id = Uuid::new_v4().simple().to_string();
    Url::parse(&format!("https://{id}.lambda-url.{region}.on.aws/"))
        .map_err(|e| ConfigError::invalid("region", e.to_string()).into())
}
