//! CloudFormation synthesis.
//!
//! Renders a [`StackDefinition`] as a CloudFormation JSON document. The trigger
//! function's code is not part of this repository; its location is a template
//! parameter and everything it needs is passed as environment variables.

use crate::config::SECRET_LICENSE_VARS;
use crate::error::ProvisionError;
use crate::network::{AccessRule, Protocol};
use crate::stack::{LAMBDA_URL_OUTPUT, StackDefinition};
use crate::trigger::AuthMode;
use launchpad_iam::{Arn, TriggerScope, least_privilege_trigger, task_execution_role};
use serde_json::{Map, Value, json};

pub const REDACTED: &str = "<redacted>";

const TEMPLATE_DESCRIPTION: &str = "On-demand container job launcher";
const LAMBDA_BASIC_EXECUTION: &str =
    "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";

#[derive(Debug, Clone, Copy, Default)]
pub struct SynthOptions {
    /// Emit license values verbatim instead of masking the secret ones.
    pub show_secrets: bool,
}

/// CloudFormation logical id: alphanumerics of `name`, first letter upper-cased.
pub fn logical_id(name: &str) -> String {
    let mut out: String = name.chars().filter(char::is_ascii_alphanumeric).collect();
    if let Some(first) = out.get(0..1) {
        let upper = first.to_ascii_uppercase();
        out.replace_range(0..1, &upper);
    }
    out
}

/// `logical_id(name)` followed by the resource type, so that resources of
/// different types never share an id even when their names are equal.
fn resource_id(name: &str, kind: &str) -> Result<String, ProvisionError> {
    let base = logical_id(name);
    if base.is_empty() {
        return Err(ProvisionError::InvalidResourceName(name.to_string()));
    }
    Ok(format!("{base}{kind}"))
}

fn add_resource(resources: &mut Map<String, Value>, id: String, resource: Value) -> Result<(), ProvisionError> {
    if resources.contains_key(&id) {
        return Err(ProvisionError::DuplicateResourceId(id));
    }
    resources.insert(id, resource);
    Ok(())
}

fn reference(id: &str) -> Value {
    json!({ "Ref": id })
}

fn get_att(id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [id, attribute] })
}

fn egress_rule(rule: &AccessRule) -> Value {
    let mut out = json!({
        "CidrIp": rule.peer.to_string(),
        "IpProtocol": rule.ports.protocol.ip_protocol(),
        "Description": rule.description,
    });
    if rule.ports.protocol != Protocol::All {
        if let (Some(from), Some(to)) = (rule.ports.from_port, rule.ports.to_port) {
            out["FromPort"] = json!(from);
            out["ToPort"] = json!(to);
        }
    }
    out
}

#[tracing::instrument(skip(definition, options), fields(stack = %definition.settings().stack_name))]
pub fn synthesize(definition: &StackDefinition, options: SynthOptions) -> Result<Value, ProvisionError> {
    let s = definition.settings();
    s.validate()?;
    definition.config().license.validate()?;

    let mut resources = Map::new();

    // Network
    let vpc_id = resource_id(&s.network.name, "Vpc")?;
    let igw_id = format!("{vpc_id}Igw");
    let attachment_id = format!("{vpc_id}IgwAttachment");
    add_resource(
        &mut resources,
        vpc_id.clone(),
        json!({
            "Type": "AWS::EC2::VPC",
            "Properties": {
                "CidrBlock": s.network.cidr.to_string(),
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "Tags": [{ "Key": "Name", "Value": s.network.name }],
            }
        }),
    )?;
    add_resource(&mut resources, igw_id.clone(), json!({ "Type": "AWS::EC2::InternetGateway" }))?;
    add_resource(
        &mut resources,
        attachment_id.clone(),
        json!({
            "Type": "AWS::EC2::VPCGatewayAttachment",
            "Properties": {
                "VpcId": reference(&vpc_id),
                "InternetGatewayId": reference(&igw_id),
            }
        }),
    )?;

    let mut subnet_ids = Vec::new();
    for (i, plan) in definition.topology().plan_subnets(&s.region)?.iter().enumerate() {
        let subnet_id = format!("{vpc_id}{}Subnet{}", logical_id(&plan.tier), i + 1);
        let table_id = format!("{subnet_id}RouteTable");
        add_resource(
            &mut resources,
            subnet_id.clone(),
            json!({
                "Type": "AWS::EC2::Subnet",
                "Properties": {
                    "VpcId": reference(&vpc_id),
                    "CidrBlock": plan.cidr.to_string(),
                    "AvailabilityZone": plan.availability_zone,
                    "MapPublicIpOnLaunch": plan.map_public_ip_on_launch,
                    "Tags": [{ "Key": "Name", "Value": format!("{}/{}", s.network.name, plan.tier) }],
                }
            }),
        )?;
        add_resource(
            &mut resources,
            table_id.clone(),
            json!({
                "Type": "AWS::EC2::RouteTable",
                "Properties": { "VpcId": reference(&vpc_id) }
            }),
        )?;
        add_resource(
            &mut resources,
            format!("{subnet_id}RouteTableAssociation"),
            json!({
                "Type": "AWS::EC2::SubnetRouteTableAssociation",
                "Properties": {
                    "RouteTableId": reference(&table_id),
                    "SubnetId": reference(&subnet_id),
                }
            }),
        )?;
        add_resource(
            &mut resources,
            format!("{subnet_id}DefaultRoute"),
            json!({
                "Type": "AWS::EC2::Route",
                "DependsOn": [attachment_id],
                "Properties": {
                    "RouteTableId": reference(&table_id),
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": reference(&igw_id),
                }
            }),
        )?;
        subnet_ids.push(subnet_id);
    }

    // Access policy
    let policy = definition.access_policy();
    let sg_id = resource_id(&policy.name, "SecurityGroup")?;
    add_resource(
        &mut resources,
        sg_id.clone(),
        json!({
            "Type": "AWS::EC2::SecurityGroup",
            "Properties": {
                "GroupName": policy.name,
                "GroupDescription": format!("{}/{}", s.stack_name, policy.name),
                "VpcId": reference(&vpc_id),
                "SecurityGroupEgress": policy.egress_rules().map(egress_rule).collect::<Vec<_>>(),
            }
        }),
    )?;

    // Cluster
    let cluster_id = resource_id(&s.cluster_name, "Cluster")?;
    add_resource(
        &mut resources,
        cluster_id.clone(),
        json!({
            "Type": "AWS::ECS::Cluster",
            "Properties": { "ClusterName": s.cluster_name }
        }),
    )?;

    // Logs + execution role
    let log_group_name = definition.log_group_name();
    let log_group_id = resource_id(&s.task.family, "LogGroup")?;
    add_resource(
        &mut resources,
        log_group_id.clone(),
        json!({
            "Type": "AWS::Logs::LogGroup",
            "Properties": { "LogGroupName": log_group_name }
        }),
    )?;

    let log_group_arn = Arn::log_group(&s.region, &s.account_id, &log_group_name);
    let execution = task_execution_role(
        &s.account_id,
        definition.task_execution_role_name(),
        &log_group_arn,
    );
    let execution_id = resource_id(execution.role.as_ref(), "")?;
    add_resource(
        &mut resources,
        execution_id.clone(),
        json!({
            "Type": "AWS::IAM::Role",
            "Properties": {
                "RoleName": execution.role.as_ref(),
                "AssumeRolePolicyDocument": assume_role("ecs-tasks.amazonaws.com"),
                "Policies": [{
                    "PolicyName": format!("{}Policy", execution.role),
                    "PolicyDocument": execution.policy_document(),
                }],
            }
        }),
    )?;

    // Job template
    let template = definition.job_template(execution.arn.clone())?;
    let environment: Vec<Value> = template
        .container()
        .environment
        .iter()
        .map(|(name, value)| {
            let shown = if !options.show_secrets && SECRET_LICENSE_VARS.contains(&name.as_str()) {
                REDACTED
            } else {
                value.as_str()
            };
            json!({ "Name": name, "Value": shown })
        })
        .collect();
    let logging = template.logging();
    let task_def_id = resource_id(template.family(), "TaskDefinition")?;
    add_resource(
        &mut resources,
        task_def_id.clone(),
        json!({
            "Type": "AWS::ECS::TaskDefinition",
            "Properties": {
                "Family": template.family(),
                "Cpu": template.cpu().to_string(),
                "Memory": template.memory_mib().to_string(),
                "NetworkMode": "awsvpc",
                "RequiresCompatibilities": ["FARGATE"],
                "ExecutionRoleArn": get_att(&execution_id, "Arn"),
                "ContainerDefinitions": [{
                    "Name": template.container().name,
                    "Image": template.container().image.to_string(),
                    "Essential": template.container().essential,
                    "Environment": environment,
                    "LogConfiguration": {
                        "LogDriver": logging.driver,
                        "Options": {
                            "awslogs-group": reference(&log_group_id),
                            "awslogs-region": logging.region,
                            "awslogs-stream-prefix": logging.stream_prefix,
                        }
                    }
                }],
            }
        }),
    )?;

    // Trigger identity
    let cluster_arn = Arn::ecs_cluster(&s.region, &s.account_id, &s.cluster_name);
    let task_definition_arn = template.arn(&s.region, &s.account_id);
    let trigger_identity = least_privilege_trigger(
        definition.trigger_role_name(),
        &TriggerScope {
            region: &s.region,
            account: &s.account_id,
            cluster_name: &s.cluster_name,
            cluster: &cluster_arn,
            task_definition: &task_definition_arn,
            task_execution_role: &execution.arn,
        },
    );
    let trigger_role_id = resource_id(trigger_identity.role.as_ref(), "")?;
    add_resource(
        &mut resources,
        trigger_role_id.clone(),
        json!({
            "Type": "AWS::IAM::Role",
            "Properties": {
                "RoleName": trigger_identity.role.as_ref(),
                "AssumeRolePolicyDocument": assume_role("lambda.amazonaws.com"),
                "ManagedPolicyArns": [LAMBDA_BASIC_EXECUTION],
                "Policies": [{
                    "PolicyName": format!("{}Policy", trigger_identity.role),
                    "PolicyDocument": trigger_identity.policy_document(),
                }],
            }
        }),
    )?;

    // Trigger
    let function_id = resource_id(&s.trigger.function_name, "Function")?;
    let url_id = format!("{function_id}Url");
    let subnet_refs: Vec<Value> = subnet_ids.iter().map(|id| reference(id)).collect();
    add_resource(
        &mut resources,
        function_id.clone(),
        json!({
            "Type": "AWS::Lambda::Function",
            "DependsOn": [trigger_role_id],
            "Properties": {
                "FunctionName": s.trigger.function_name,
                "Role": get_att(&trigger_role_id, "Arn"),
                "Runtime": "provided.al2023",
                "Handler": "bootstrap",
                "Timeout": s.trigger.timeout_secs,
                "Code": {
                    "S3Bucket": reference("TriggerCodeBucket"),
                    "S3Key": reference("TriggerCodeKey"),
                },
                "Environment": {
                    "Variables": {
                        "CLUSTER_ARN": get_att(&cluster_id, "Arn"),
                        "TASK_DEFINITION_ARN": reference(&task_def_id),
                        "CONTAINER_NAME": template.container().name,
                        "SUBNETS": { "Fn::Join": [",", subnet_refs] },
                        "SECURITY_GROUP": get_att(&sg_id, "GroupId"),
                        "DEFAULT_SAMPLE": s.trigger.default_sample.to_string(),
                    }
                },
            }
        }),
    )?;
    add_resource(
        &mut resources,
        url_id.clone(),
        json!({
            "Type": "AWS::Lambda::Url",
            "Properties": {
                "TargetFunctionArn": get_att(&function_id, "Arn"),
                "AuthType": s.trigger.auth_mode.auth_type(),
            }
        }),
    )?;
    if s.trigger.auth_mode == AuthMode::None {
        add_resource(
            &mut resources,
            format!("{function_id}PublicInvoke"),
            json!({
                "Type": "AWS::Lambda::Permission",
                "Properties": {
                    "Action": "lambda:InvokeFunctionUrl",
                    "FunctionName": reference(&function_id),
                    "Principal": "*",
                    "FunctionUrlAuthType": "NONE",
                }
            }),
        )?;
    }

    tracing::info!(resources = resources.len(), "Template synthesized");

    Ok(json!({
        "AWSTemplateFormatVersion": "2010-09-09",
        "Description": format!("{} ({})", TEMPLATE_DESCRIPTION, s.stack_name),
        "Parameters": {
            "TriggerCodeBucket": { "Type": "String", "Description": "S3 bucket holding the trigger handler bundle" },
            "TriggerCodeKey": { "Type": "String", "Description": "S3 key of the trigger handler bundle" },
        },
        "Resources": resources,
        "Outputs": {
            LAMBDA_URL_OUTPUT: { "Value": get_att(&url_id, "FunctionUrl") }
        },
    }))
}

fn assume_role(service: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_id() {
        assert_eq!(logical_id("ShadowTraffic VPC"), "ShadowTrafficVPC");
        assert_eq!(logical_id("jobs-cluster"), "Jobscluster");
        assert_eq!(logical_id(""), "");
    }

    #[test]
    fn test_resource_id_needs_alphanumerics() {
        assert_eq!(resource_id("jobs", "Cluster").unwrap(), "JobsCluster");
        assert!(matches!(
            resource_id("---", "Cluster"),
            Err(ProvisionError::InvalidResourceName(_))
        ));
    }

    #[test]
    fn test_duplicate_resource_id_is_an_error() {
        let mut resources = Map::new();
        add_resource(&mut resources, "A".to_string(), json!({ "Type": "X" })).unwrap();
        let err = add_resource(&mut resources, "A".to_string(), json!({ "Type": "Y" })).unwrap_err();
        assert!(matches!(err, ProvisionError::DuplicateResourceId(ref id) if id == "A"));
        assert_eq!(resources["A"]["Type"], "X");
    }
}
