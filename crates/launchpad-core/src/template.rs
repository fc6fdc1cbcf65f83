//! Job template: the immutable description of the one container a run starts.
//!
//! There are no setters. A changed template is a new template with the next
//! revision ([`JobTemplate::revise`]), which matches the "replace, not update"
//! behaviour of task definitions.

use crate::config::{LICENSE_VARS, LaunchConfig};
use crate::error::ProvisionError;
use crate::image::ImageRef;
use launchpad_iam::Arn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const AWSLOGS_DRIVER: &str = "awslogs";

/// Where container stdout/stderr ends up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRouting {
    pub driver: String,
    pub group: String,
    pub region: String,
    pub stream_prefix: String,
}

impl LogRouting {
    pub fn awslogs(group: impl Into<String>, region: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            driver: AWSLOGS_DRIVER.to_string(),
            group: group.into(),
            region: region.into(),
            stream_prefix: prefix.into(),
        }
    }

    /// `<prefix>/<container>/<task id>`, the stream name awslogs uses.
    pub fn stream_name(&self, container: &str, task_id: &str) -> String {
        format!("{}/{}/{}", self.stream_prefix, container, task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageRef,
    pub environment: BTreeMap<String, String>,
    pub essential: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    family: String,
    revision: u32,
    cpu: u32,
    memory_mib: u32,
    container: ContainerSpec,
    logging: LogRouting,
    execution_role: Arn,
    fingerprint: String,
}

impl JobTemplate {
    pub fn builder(family: impl Into<String>) -> JobTemplateBuilder {
        JobTemplateBuilder {
            family: family.into(),
            revision: 1,
            cpu: 256,
            memory_mib: 512,
            container_name: String::new(),
            image: String::new(),
            environment: BTreeMap::new(),
            logging: None,
            execution_role: None,
            require_digest: false,
        }
    }

    /// Builder seeded from the validated configuration; only the stack-assigned
    /// pieces (execution role, log group) are left to the caller.
    pub fn from_config(config: &LaunchConfig) -> JobTemplateBuilder {
        let task = &config.settings.task;
        let mut builder = Self::builder(&task.family)
            .size(task.cpu, task.memory_mib)
            .container(&task.container_name, &task.image)
            .require_digest(task.require_digest);
        for (name, value) in config.license.env_pairs() {
            builder = builder.env(name, value);
        }
        builder
    }

    /// Starts a replacement: same content, next revision.
    pub fn revise(&self) -> JobTemplateBuilder {
        JobTemplateBuilder {
            family: self.family.clone(),
            revision: self.revision + 1,
            cpu: self.cpu,
            memory_mib: self.memory_mib,
            container_name: self.container.name.clone(),
            image: self.container.image.to_string(),
            environment: self.container.environment.clone(),
            logging: Some(self.logging.clone()),
            execution_role: Some(self.execution_role.clone()),
            require_digest: self.container.image.is_pinned(),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    pub fn container(&self) -> &ContainerSpec {
        &self.container
    }

    pub fn logging(&self) -> &LogRouting {
        &self.logging
    }

    pub fn execution_role(&self) -> &Arn {
        &self.execution_role
    }

    /// blake3 over the canonical JSON content. Two templates with equal
    /// fingerprints launch identical containers.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn arn(&self, region: &str, account: &str) -> Arn {
        Arn::ecs_task_definition(region, account, &self.family, self.revision)
    }
}

#[derive(Serialize)]
struct CanonicalTemplate<'a> {
    family: &'a str,
    revision: u32,
    cpu: u32,
    memory_mib: u32,
    container: &'a ContainerSpec,
    logging: &'a LogRouting,
    execution_role: &'a Arn,
}

#[derive(Debug, Clone)]
pub struct JobTemplateBuilder {
    family: String,
    revision: u32,
    cpu: u32,
    memory_mib: u32,
    container_name: String,
    image: String,
    environment: BTreeMap<String, String>,
    logging: Option<LogRouting>,
    execution_role: Option<Arn>,
    require_digest: bool,
}

impl JobTemplateBuilder {
    pub fn size(mut self, cpu: u32, memory_mib: u32) -> Self {
        self.cpu = cpu;
        self.memory_mib = memory_mib;
        self
    }

    pub fn container(mut self, name: impl Into<String>, image: impl Into<String>) -> Self {
        self.container_name = name.into();
        self.image = image.into();
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    pub fn logging(mut self, logging: LogRouting) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn execution_role(mut self, role: Arn) -> Self {
        self.execution_role = Some(role);
        self
    }

    pub fn require_digest(mut self, require: bool) -> Self {
        self.require_digest = require;
        self
    }

    pub fn build(self) -> Result<JobTemplate, ProvisionError> {
        let invalid = |message: String| ProvisionError::InvalidTemplate {
            family: self.family.clone(),
            message,
        };

        if self.family.trim().is_empty() {
            return Err(invalid("family is empty".to_string()));
        }
        if self.container_name.trim().is_empty() {
            return Err(invalid("container name is empty".to_string()));
        }

        let image = ImageRef::parse(&self.image).map_err(&invalid)?;
        if !image.is_pinned() {
            if self.require_digest {
                return Err(invalid(format!("image {image} is not pinned by digest")));
            }
            tracing::warn!(family = %self.family, %image, "Image referenced by mutable tag; runs are not reproducible");
        }

        for var in LICENSE_VARS {
            match self.environment.get(var) {
                None => return Err(invalid(format!("environment variable {var} is missing"))),
                Some(v) if v.trim().is_empty() => {
                    return Err(invalid(format!("environment variable {var} is empty")));
                }
                Some(_) => {}
            }
        }

        let logging = self
            .logging
            .clone()
            .ok_or_else(|| invalid("log routing is not set".to_string()))?;
        if logging.stream_prefix.trim().is_empty() || logging.group.trim().is_empty() {
            return Err(invalid("log group and stream prefix are required".to_string()));
        }
        let execution_role = self
            .execution_role
            .clone()
            .ok_or_else(|| invalid("execution role is not set".to_string()))?;

        let container = ContainerSpec {
            name: self.container_name.clone(),
            image,
            environment: self.environment.clone(),
            essential: true,
        };

        let canonical = serde_json::to_vec(&CanonicalTemplate {
            family: &self.family,
            revision: self.revision,
            cpu: self.cpu,
            memory_mib: self.memory_mib,
            container: &container,
            logging: &logging,
            execution_role: &execution_role,
        })
        .map_err(|e| invalid(e.to_string()))?;
        let fingerprint = blake3::hash(&canonical).to_hex().to_string();

        Ok(JobTemplate {
            family: self.family,
            revision: self.revision,
            cpu: self.cpu,
            memory_mib: self.memory_mib,
            container,
            logging,
            execution_role,
            fingerprint,
        })
    }
}
