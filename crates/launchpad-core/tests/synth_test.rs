use launchpad_core::config::{LaunchConfig, LicenseConfig, StackSettings};
use launchpad_core::error::{ConfigError, ProvisionError};
use launchpad_core::stack::{LAMBDA_URL_OUTPUT, StackDefinition};
use launchpad_core::synth::{REDACTED, SynthOptions, synthesize};
use launchpad_core::trigger::AuthMode;
use serde_json::Value;

fn definition(settings: StackSettings) -> StackDefinition {
    let license = LicenseConfig::from_lookup(|k| Some(format!("{k}-test"))).unwrap();
    StackDefinition::from_config(LaunchConfig::new(settings, license).unwrap())
}

fn resources_of_type<'a>(template: &'a Value, kind: &str) -> Vec<&'a Value> {
    template["Resources"]
        .as_object()
        .unwrap()
        .values()
        .filter(|r| r["Type"] == kind)
        .collect()
}

#[test]
fn test_template_contains_every_component() {
    let template = synthesize(&definition(StackSettings::default()), SynthOptions::default()).unwrap();

    for kind in [
        "AWS::EC2::VPC",
        "AWS::EC2::InternetGateway",
        "AWS::EC2::Subnet",
        "AWS::EC2::SecurityGroup",
        "AWS::ECS::Cluster",
        "AWS::Logs::LogGroup",
        "AWS::ECS::TaskDefinition",
        "AWS::Lambda::Function",
        "AWS::Lambda::Url",
    ] {
        assert_eq!(resources_of_type(&template, kind).len(), 1, "{kind}");
    }
    assert_eq!(resources_of_type(&template, "AWS::IAM::Role").len(), 2);

    let subnet = resources_of_type(&template, "AWS::EC2::Subnet")[0];
    assert_eq!(subnet["Properties"]["CidrBlock"], "10.0.0.0/24");
    assert_eq!(subnet["Properties"]["MapPublicIpOnLaunch"], true);
    assert_eq!(subnet["Properties"]["AvailabilityZone"], "us-east-1a");
}

#[test]
fn test_security_group_allows_all_egress() {
    let template = synthesize(&definition(StackSettings::default()), SynthOptions::default()).unwrap();
    let sg = resources_of_type(&template, "AWS::EC2::SecurityGroup")[0];

    let egress = sg["Properties"]["SecurityGroupEgress"].as_array().unwrap();
    assert_eq!(egress.len(), 1);
    assert_eq!(egress[0]["CidrIp"], "0.0.0.0/0");
    assert_eq!(egress[0]["IpProtocol"], "-1");
    assert_eq!(egress[0]["Description"], "Allow all outbound traffic");
    assert!(sg["Properties"].get("SecurityGroupIngress").is_none());
}

#[test]
fn test_url_is_the_only_output() {
    let template = synthesize(&definition(StackSettings::default()), SynthOptions::default()).unwrap();

    let outputs = template["Outputs"].as_object().unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(
        outputs[LAMBDA_URL_OUTPUT]["Value"]["Fn::GetAtt"][1],
        "FunctionUrl"
    );
}

#[test]
fn test_task_definition_shape() {
    let template = synthesize(&definition(StackSettings::default()), SynthOptions::default()).unwrap();
    let task = &resources_of_type(&template, "AWS::ECS::TaskDefinition")[0]["Properties"];

    assert_eq!(task["Family"], "ShadowTrafficTaskDefinition");
    assert_eq!(task["NetworkMode"], "awsvpc");
    assert_eq!(task["RequiresCompatibilities"][0], "FARGATE");
    assert_eq!(task["Cpu"], "256");
    assert_eq!(task["Memory"], "512");

    let container = &task["ContainerDefinitions"][0];
    assert_eq!(container["Name"], "ShadowTraffic");
    assert_eq!(container["Image"], "shadowtraffic/shadowtraffic:latest");
    assert_eq!(container["LogConfiguration"]["LogDriver"], "awslogs");
    assert_eq!(
        container["LogConfiguration"]["Options"]["awslogs-stream-prefix"],
        "ShadowTraffic"
    );
    assert_eq!(container["Environment"].as_array().unwrap().len(), 6);
}

#[test]
fn test_secret_license_values_are_masked() {
    let def = definition(StackSettings::default());

    let masked = synthesize(&def, SynthOptions::default()).unwrap().to_string();
    assert!(masked.contains(REDACTED));
    assert!(!masked.contains("LICENSE_EMAIL-test"));
    assert!(!masked.contains("LICENSE_SIGNATURE-test"));
    assert!(masked.contains("LICENSE_ID-test"));

    let shown = synthesize(&def, SynthOptions { show_secrets: true })
        .unwrap()
        .to_string();
    assert!(!shown.contains(REDACTED));
    assert!(shown.contains("LICENSE_SIGNATURE-test"));
}

#[test]
fn test_role_policies_have_no_wildcards() {
    let template = synthesize(&definition(StackSettings::default()), SynthOptions::default()).unwrap();

    for role in resources_of_type(&template, "AWS::IAM::Role") {
        let policies = role["Properties"]["Policies"].to_string();
        assert!(!policies.contains("\"*\""), "{policies}");
        assert!(!policies.contains("FullAccess"), "{policies}");
    }
}

#[test]
fn test_public_invoke_permission_follows_auth_mode() {
    let open = synthesize(&definition(StackSettings::default()), SynthOptions::default()).unwrap();
    assert_eq!(resources_of_type(&open, "AWS::Lambda::Permission").len(), 1);
    assert_eq!(
        resources_of_type(&open, "AWS::Lambda::Url")[0]["Properties"]["AuthType"],
        "NONE"
    );

    let mut settings = StackSettings::default();
    settings.trigger.auth_mode = AuthMode::AwsIam;
    let signed = synthesize(&definition(settings), SynthOptions::default()).unwrap();
    assert!(resources_of_type(&signed, "AWS::Lambda::Permission").is_empty());
    assert_eq!(
        resources_of_type(&signed, "AWS::Lambda::Url")[0]["Properties"]["AuthType"],
        "AWS_IAM"
    );
}

#[test]
fn test_subnets_follow_max_azs() {
    let mut settings = StackSettings::default();
    settings.network.max_azs = 2;
    let template = synthesize(&definition(settings), SynthOptions::default()).unwrap();

    let mut zones: Vec<String> = resources_of_type(&template, "AWS::EC2::Subnet")
        .iter()
        .map(|s| s["Properties"]["AvailabilityZone"].as_str().unwrap().to_string())
        .collect();
    zones.sort();
    assert_eq!(zones, vec!["us-east-1a", "us-east-1b"]);
}

#[test]
fn test_cluster_named_like_the_function_keeps_both() {
    let mut settings = StackSettings::default();
    settings.cluster_name = settings.trigger.function_name.clone();
    let template = synthesize(&definition(settings), SynthOptions::default()).unwrap();

    assert_eq!(resources_of_type(&template, "AWS::ECS::Cluster").len(), 1);
    assert_eq!(resources_of_type(&template, "AWS::Lambda::Function").len(), 1);

    let function = resources_of_type(&template, "AWS::Lambda::Function")[0];
    let cluster_id = function["Properties"]["Environment"]["Variables"]["CLUSTER_ARN"]["Fn::GetAtt"][0]
        .as_str()
        .unwrap();
    assert_eq!(template["Resources"][cluster_id]["Type"], "AWS::ECS::Cluster");
}

#[test]
fn test_symbol_only_names_are_rejected() {
    let license = LicenseConfig::from_lookup(|k| Some(format!("{k}-test"))).unwrap();
    let mut settings = StackSettings::default();
    settings.cluster_name = "---".to_string();
    assert!(LaunchConfig::new(settings.clone(), license.clone()).is_err());

    // Settings that skipped validation still never produce an empty resource id.
    let definition = StackDefinition::from_config(LaunchConfig {
        settings,
        license,
    });
    let err = synthesize(&definition, SynthOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::Config(ConfigError::InvalidSetting { field: "cluster_name", .. })
    ));
}

#[test]
fn test_resource_ids_are_never_empty() {
    let template = synthesize(&definition(StackSettings::default()), SynthOptions::default()).unwrap();
    for id in template["Resources"].as_object().unwrap().keys() {
        assert!(!id.is_empty());
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()), "{id}");
    }
}
