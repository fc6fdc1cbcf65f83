//! Startup configuration.
//!
//! Two halves, validated once before anything is provisioned:
//! - [`StackSettings`]: non-secret layout, from an optional YAML file, every field defaulted.
//! - [`LicenseConfig`]: the six `LICENSE_*` values, from the environment (`.env` honoured).

use crate::error::ConfigError;
use crate::network::MAX_AZS;
use crate::trigger::AuthMode;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const LICENSE_ID: &str = "LICENSE_ID";
pub const LICENSE_EDITION: &str = "LICENSE_EDITION";
pub const LICENSE_EMAIL: &str = "LICENSE_EMAIL";
pub const LICENSE_EXPIRATION: &str = "LICENSE_EXPIRATION";
pub const LICENSE_ORGANIZATION: &str = "LICENSE_ORGANIZATION";
pub const LICENSE_SIGNATURE: &str = "LICENSE_SIGNATURE";

/// Container environment contract, in the order it is rendered.
pub const LICENSE_VARS: [&str; 6] = [
    LICENSE_ID,
    LICENSE_EDITION,
    LICENSE_EMAIL,
    LICENSE_EXPIRATION,
    LICENSE_ORGANIZATION,
    LICENSE_SIGNATURE,
];

/// License variables that are masked whenever configuration is printed.
pub const SECRET_LICENSE_VARS: [&str; 2] = [LICENSE_EMAIL, LICENSE_SIGNATURE];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub name: String,
    pub cidr: Ipv4Net,
    pub subnet_name: String,
    pub subnet_mask: u8,
    pub max_azs: u8,
    pub map_public_ip: bool,
    pub security_group_name: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            name: "ShadowTrafficVPC".to_string(),
            cidr: Ipv4Net::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 16)
                .unwrap_or_default(),
            subnet_name: "ShadowTraffic Subnet".to_string(),
            subnet_mask: 24,
            max_azs: 1,
            map_public_ip: true,
            security_group_name: "ShadowTrafficSecurityGroup".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub family: String,
    pub container_name: String,
    pub image: String,
    pub log_stream_prefix: String,
    pub cpu: u32,
    pub memory_mib: u32,
    /// Refuse images referenced by tag instead of digest.
    pub require_digest: bool,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            family: "ShadowTrafficTaskDefinition".to_string(),
            container_name: "ShadowTraffic".to_string(),
            image: "shadowtraffic/shadowtraffic:latest".to_string(),
            log_stream_prefix: "ShadowTraffic".to_string(),
            cpu: 256,
            memory_mib: 512,
            require_digest: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    pub function_name: String,
    pub auth_mode: AuthMode,
    pub timeout_secs: u64,
    /// `--sample` value used when a run override omits it.
    pub default_sample: u64,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            function_name: "ShadowTrafficRunner".to_string(),
            auth_mode: AuthMode::None,
            timeout_secs: 3,
            default_sample: 10_000,
        }
    }
}

impl TriggerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSettings {
    pub stack_name: String,
    pub region: String,
    pub account_id: String,
    pub cluster_name: String,
    pub network: NetworkSettings,
    pub task: TaskSettings,
    pub trigger: TriggerSettings,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            stack_name: "ShadowtrafficServerlessStack".to_string(),
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
            cluster_name: "ShadowTrafficCluster".to_string(),
            network: NetworkSettings::default(),
            task: TaskSettings::default(),
            trigger: TriggerSettings::default(),
        }
    }
}

impl StackSettings {
    /// Reads settings from a YAML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("stack_name", &self.stack_name),
            ("region", &self.region),
            ("cluster_name", &self.cluster_name),
            ("network.name", &self.network.name),
            ("network.security_group_name", &self.network.security_group_name),
            ("task.family", &self.task.family),
            ("task.container_name", &self.task.container_name),
            ("task.image", &self.task.image),
            ("task.log_stream_prefix", &self.task.log_stream_prefix),
            ("trigger.function_name", &self.trigger.function_name),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
        }

        // These names become template resource ids, which keep only ASCII alphanumerics.
        for (field, value) in [
            ("cluster_name", &self.cluster_name),
            ("network.name", &self.network.name),
            ("network.subnet_name", &self.network.subnet_name),
            ("network.security_group_name", &self.network.security_group_name),
            ("task.family", &self.task.family),
            ("trigger.function_name", &self.trigger.function_name),
        ] {
            if !value.chars().any(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::invalid(
                    field,
                    format!("{value:?} needs at least one ASCII letter or digit"),
                ));
            }
        }

        if !self
            .region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ConfigError::invalid(
                "region",
                format!("{:?} is not a region name", self.region),
            ));
        }

        if self.account_id.len() != 12 || !self.account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::invalid(
                "account_id",
                format!("expected 12 digits, got {:?}", self.account_id),
            ));
        }

        let net = &self.network;
        if net.max_azs == 0 || net.max_azs > MAX_AZS {
            return Err(ConfigError::invalid(
                "network.max_azs",
                format!("must be between 1 and {MAX_AZS}"),
            ));
        }
        if net.subnet_mask > 28 || net.subnet_mask < net.cidr.prefix_len() {
            return Err(ConfigError::invalid(
                "network.subnet_mask",
                format!(
                    "/{} does not fit inside {} (AWS subnets are /16 to /28)",
                    net.subnet_mask, net.cidr
                ),
            ));
        }
        let available = 1u64 << (net.subnet_mask - net.cidr.prefix_len());
        if available < u64::from(net.max_azs) {
            return Err(ConfigError::invalid(
                "network.max_azs",
                format!("{} has room for only {} /{} subnets", net.cidr, available, net.subnet_mask),
            ));
        }

        if !fargate_size_supported(self.task.cpu, self.task.memory_mib) {
            return Err(ConfigError::invalid(
                "task.memory_mib",
                format!(
                    "{} MiB is not a valid Fargate size for {} cpu units",
                    self.task.memory_mib, self.task.cpu
                ),
            ));
        }

        if self.trigger.timeout_secs == 0 || self.trigger.timeout_secs > 900 {
            return Err(ConfigError::invalid(
                "trigger.timeout_secs",
                "must be between 1 and 900 seconds",
            ));
        }

        Ok(())
    }
}

fn fargate_size_supported(cpu: u32, memory: u32) -> bool {
    match cpu {
        256 => matches!(memory, 512 | 1024 | 2048),
        512 => (1024..=4096).contains(&memory) && memory % 1024 == 0,
        1024 => (2048..=8192).contains(&memory) && memory % 1024 == 0,
        2048 => (4096..=16384).contains(&memory) && memory % 1024 == 0,
        4096 => (8192..=30720).contains(&memory) && memory % 1024 == 0,
        _ => false,
    }
}

/// License identity passed to the container. Every field is required and non-blank.
#[derive(Clone, PartialEq, Eq)]
pub struct LicenseConfig {
    pub id: String,
    pub edition: String,
    pub email: String,
    pub expiration: String,
    pub organization: String,
    pub signature: String,
}

impl std::fmt::Debug for LicenseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseConfig")
            .field("id", &self.id)
            .field("edition", &self.edition)
            .field("organization", &self.organization)
            .field("email", &"<redacted>")
            .field("signature", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl LicenseConfig {
    /// Reads the license from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the license through `lookup`; the first missing or blank variable
    /// (in [`LICENSE_VARS`] order) is reported.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |var: &'static str| -> Result<String, ConfigError> {
            match lookup(var) {
                None => Err(ConfigError::MissingLicenseField { var }),
                Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyLicenseField { var }),
                Some(v) => Ok(v),
            }
        };

        Ok(Self {
            id: require(LICENSE_ID)?,
            edition: require(LICENSE_EDITION)?,
            email: require(LICENSE_EMAIL)?,
            expiration: require(LICENSE_EXPIRATION)?,
            organization: require(LICENSE_ORGANIZATION)?,
            signature: require(LICENSE_SIGNATURE)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (var, value) in self.env_pairs() {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyLicenseField { var });
            }
        }
        Ok(())
    }

    /// `(name, value)` pairs in [`LICENSE_VARS`] order.
    pub fn env_pairs(&self) -> [(&'static str, &str); 6] {
        [
            (LICENSE_ID, &self.id),
            (LICENSE_EDITION, &self.edition),
            (LICENSE_EMAIL, &self.email),
            (LICENSE_EXPIRATION, &self.expiration),
            (LICENSE_ORGANIZATION, &self.organization),
            (LICENSE_SIGNATURE, &self.signature),
        ]
    }
}

/// Validated startup configuration.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub settings: StackSettings,
    pub license: LicenseConfig,
}

impl LaunchConfig {
    pub fn new(settings: StackSettings, license: LicenseConfig) -> Result<Self, ConfigError> {
        settings.validate()?;
        license.validate()?;
        Ok(Self { settings, license })
    }

    /// Loads `.env`, the optional settings file and the license variables, failing
    /// on the first problem.
    #[tracing::instrument]
    pub fn load(settings_path: Option<&Path>) -> Result<Self, ConfigError> {
        if dotenv::dotenv().is_ok() {
            tracing::debug!("Loaded variables from .env");
        }

        let settings = match settings_path {
            Some(path) => StackSettings::from_file(path)?,
            None => StackSettings::default(),
        };
        let license = LicenseConfig::from_env()?;

        let config = Self::new(settings, license)?;
        tracing::info!(stack = %config.settings.stack_name, "Configuration loaded");
        Ok(config)
    }
}
