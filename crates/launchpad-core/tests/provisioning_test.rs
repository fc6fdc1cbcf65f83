use launchpad_core::config::{LICENSE_ID, LaunchConfig, LicenseConfig, StackSettings};
use launchpad_core::error::{ConfigError, ProvisionError};
use launchpad_core::stack::{DeploymentScope, LAMBDA_URL_OUTPUT, Provisioner, StackDefinition};
use launchpad_core::trigger::AuthMode;
use std::collections::HashMap;
use std::path::PathBuf;

fn license_env() -> HashMap<String, String> {
    launchpad_core::config::LICENSE_VARS
        .iter()
        .map(|k| (k.to_string(), format!("{k}-test")))
        .collect()
}

fn write_settings(yaml: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("launchpad-{}.yaml", uuid::Uuid::new_v4()));
    std::fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_unset_license_variable_stops_before_provisioning() {
    let mut env = license_env();
    env.remove(LICENSE_ID);

    let err = LicenseConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
    assert!(matches!(err, ConfigError::MissingLicenseField { var } if var == LICENSE_ID));
    assert!(err.to_string().contains("LICENSE_ID"));
}

#[test]
fn test_blank_license_variable_is_rejected() {
    let mut env = license_env();
    env.insert("LICENSE_ORGANIZATION".to_string(), "   ".to_string());

    let err = LicenseConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::EmptyLicenseField { var: "LICENSE_ORGANIZATION" }
    ));
}

#[test]
fn test_settings_file_overrides_defaults() {
    let path = write_settings(
        r#"
stack_name: JobsStack
cluster_name: JobsCluster
network:
  cidr: 10.20.0.0/16
  max_azs: 2
task:
  cpu: 512
  memory_mib: 1024
trigger:
  auth_mode: aws_iam
  timeout_secs: 10
"#,
    );
    let settings = StackSettings::from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(settings.stack_name, "JobsStack");
    assert_eq!(settings.network.cidr.to_string(), "10.20.0.0/16");
    assert_eq!(settings.network.max_azs, 2);
    assert_eq!(settings.network.subnet_mask, 24);
    assert_eq!(settings.task.family, "ShadowTrafficTaskDefinition");
    assert_eq!(settings.trigger.auth_mode, AuthMode::AwsIam);
    settings.validate().unwrap();
}

#[test]
fn test_unparseable_settings_file() {
    let path = write_settings("network: 42\n");
    let err = StackSettings::from_file(&path).unwrap_err();
    std::fs::remove_file(&path).ok();
    assert!(matches!(err, ConfigError::Parse { .. }));

    let missing = std::env::temp_dir().join("launchpad-does-not-exist.yaml");
    assert!(matches!(
        StackSettings::from_file(&missing),
        Err(ConfigError::Io { .. })
    ));
}

#[test]
fn test_invalid_settings_are_rejected_up_front() {
    let license = LicenseConfig::from_lookup(|k| Some(format!("{k}-test"))).unwrap();

    let mut settings = StackSettings::default();
    settings.task.memory_mib = 300;
    let err = LaunchConfig::new(settings, license.clone()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidSetting { field: "task.memory_mib", .. }));

    let mut settings = StackSettings::default();
    settings.network.subnet_mask = 8;
    assert!(LaunchConfig::new(settings, license).is_err());
}

#[test]
fn test_full_provisioning_scenario() {
    let license = LicenseConfig::from_lookup(|k| Some(format!("{k}-test"))).unwrap();
    let config = LaunchConfig::new(StackSettings::default(), license).unwrap();
    let definition = StackDefinition::from_config(config);
    let provisioner = Provisioner::new(DeploymentScope::new());

    let stack = provisioner.provision(&definition).unwrap();

    let url = &stack.outputs()[LAMBDA_URL_OUTPUT];
    assert!(!url.is_empty());
    assert_eq!(stack.function_url.scheme(), "https");

    // Every id the trigger was wired with points at this stack.
    assert_eq!(stack.trigger.cluster, stack.cluster.arn);
    assert_eq!(stack.trigger.task_definition, stack.task_definition);
    assert_eq!(stack.trigger.network.security_groups, vec![stack.security_group.id.clone()]);
    assert_eq!(
        stack.trigger.network.subnets,
        stack.network.subnets.iter().map(|s| s.id.clone()).collect::<Vec<_>>()
    );
    assert_eq!(stack.cluster.vpc_id, stack.network.vpc_id);
    assert_eq!(stack.security_group.vpc_id, stack.network.vpc_id);

    assert_eq!(stack.template.execution_role(), &stack.task_execution_identity.arn);
    assert!(stack.log_group.as_str().ends_with("/launchpad/shadowtrafficserverlessstack"));
    assert_eq!(stack.resource_count(), 14);
}

#[test]
fn test_second_stack_needs_its_own_range() {
    let license = LicenseConfig::from_lookup(|k| Some(format!("{k}-test"))).unwrap();
    let provisioner = Provisioner::new(DeploymentScope::new());

    let first = StackDefinition::from_config(
        LaunchConfig::new(StackSettings::default(), license.clone()).unwrap(),
    );
    provisioner.provision(&first).unwrap();

    let mut settings = StackSettings::default();
    settings.stack_name = "Second".to_string();
    let second = StackDefinition::from_config(LaunchConfig::new(settings.clone(), license.clone()).unwrap());
    assert!(matches!(
        provisioner.provision(&second),
        Err(ProvisionError::AddressRangeInUse { .. })
    ));
    assert_eq!(provisioner.scope().stack_names().len(), 1);

    settings.network.cidr = "10.1.0.0/16".parse().unwrap();
    let clash = StackDefinition::from_config(LaunchConfig::new(settings.clone(), license.clone()).unwrap());
    assert!(matches!(
        provisioner.provision(&clash),
        Err(ProvisionError::ClusterNameInUse { .. })
    ));

    settings.cluster_name = "SecondCluster".to_string();
    let third = StackDefinition::from_config(LaunchConfig::new(settings, license).unwrap());
    provisioner.provision(&third).unwrap();
    assert_eq!(provisioner.scope().stack_names().len(), 2);
}
