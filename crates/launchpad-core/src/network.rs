//! Network topology and access policy.
//!
//! One address range, one public subnet tier carved into per-AZ blocks, and a
//! firewall rule set that only ever grows permissive egress rules.

use crate::config::NetworkSettings;
use crate::error::ProvisionError;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Availability zones are lettered `a` to `z`.
pub const MAX_AZS: u8 = 26;

/// `0.0.0.0/0`
pub fn any_ipv4() -> Ipv4Net {
    Ipv4Net::default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetKind {
    /// Routed through an internet gateway.
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetTier {
    pub name: String,
    pub kind: SubnetKind,
    pub cidr_mask: u8,
    pub map_public_ip_on_launch: bool,
}

/// A subnet block assigned to one availability zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetPlan {
    pub tier: String,
    pub cidr: Ipv4Net,
    pub availability_zone: String,
    pub map_public_ip_on_launch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    pub name: String,
    pub cidr: Ipv4Net,
    pub max_azs: u8,
    pub tiers: Vec<SubnetTier>,
}

impl NetworkTopology {
    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self {
            name: settings.name.clone(),
            cidr: settings.cidr,
            max_azs: settings.max_azs,
            tiers: vec![SubnetTier {
                name: settings.subnet_name.clone(),
                kind: SubnetKind::Public,
                cidr_mask: settings.subnet_mask,
                map_public_ip_on_launch: settings.map_public_ip,
            }],
        }
    }

    pub fn overlaps(&self, other: &Ipv4Net) -> bool {
        self.cidr.contains(&other.network()) || other.contains(&self.cidr.network())
    }

    /// Assigns consecutive blocks of the range to each tier and AZ
    /// (`<region>a`, `<region>b`, ...).
    pub fn plan_subnets(&self, region: &str) -> Result<Vec<SubnetPlan>, ProvisionError> {
        if !self.tiers.iter().any(|t| t.kind == SubnetKind::Public) {
            return Err(ProvisionError::InvalidNetwork(format!(
                "{} has no public subnet tier",
                self.name
            )));
        }

        if self.max_azs == 0 || self.max_azs > MAX_AZS {
            return Err(ProvisionError::InvalidNetwork(format!(
                "{} availability zones requested, between 1 and {} are supported",
                self.max_azs, MAX_AZS
            )));
        }

        let mut plans = Vec::new();
        let mut used: Vec<Ipv4Net> = Vec::new();
        for tier in &self.tiers {
            let blocks = self.cidr.subnets(tier.cidr_mask).map_err(|_| {
                ProvisionError::InvalidNetwork(format!(
                    "/{} subnets do not fit in {}",
                    tier.cidr_mask, self.cidr
                ))
            })?;
            let free: Vec<Ipv4Net> = blocks
                .filter(|b| {
                    !used
                        .iter()
                        .any(|u| u.contains(&b.network()) || b.contains(&u.network()))
                })
                .take(usize::from(self.max_azs))
                .collect();
            if free.len() < usize::from(self.max_azs) {
                return Err(ProvisionError::InvalidNetwork(format!(
                    "{} is exhausted while placing tier {}",
                    self.cidr, tier.name
                )));
            }

            for (az, cidr) in (0u8..).zip(free) {
                let letter = b'a'
                    .checked_add(az)
                    .filter(u8::is_ascii_lowercase)
                    .ok_or_else(|| {
                        ProvisionError::InvalidNetwork(format!("no zone letter for AZ #{}", az + 1))
                    })?;
                used.push(cidr);
                plans.push(SubnetPlan {
                    tier: tier.name.clone(),
                    cidr,
                    availability_zone: format!("{}{}", region, letter as char),
                    map_public_ip_on_launch: tier.map_public_ip_on_launch,
                });
            }
        }
        Ok(plans)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    /// EC2 `IpProtocol` value.
    pub fn ip_protocol(&self) -> &'static str {
        match self {
            Protocol::All => "-1",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortScope {
    pub protocol: Protocol,
    pub from_port: Option<u16>,
    pub to_port: Option<u16>,
}

impl PortScope {
    pub fn all_traffic() -> Self {
        Self {
            protocol: Protocol::All,
            from_port: None,
            to_port: None,
        }
    }

    pub fn tcp(port: u16) -> Self {
        Self::tcp_range(port, port)
    }

    pub fn tcp_range(from: u16, to: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from_port: Some(from),
            to_port: Some(to),
        }
    }

    fn covers(&self, protocol: Protocol, port: Option<u16>) -> bool {
        if self.protocol == Protocol::All {
            return true;
        }
        if self.protocol != protocol {
            return false;
        }
        match (self.from_port, self.to_port, port) {
            (Some(from), Some(to), Some(p)) => (from..=to).contains(&p),
            (None, None, _) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Egress,
    Ingress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub direction: Direction,
    pub peer: Ipv4Net,
    pub ports: PortScope,
    pub description: String,
}

/// Security group attached to every run. Only allow rules exist.
///
/// Ingress for the container runtime's own control traffic is handled by the
/// platform and is not modelled here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub name: String,
    pub rules: Vec<AccessRule>,
}

impl AccessPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    /// Adds a permissive egress rule. Returns `false` when an identical rule
    /// (same peer and ports) already exists.
    pub fn authorize_egress(
        &mut self,
        destination: Ipv4Net,
        ports: PortScope,
        description: impl Into<String>,
    ) -> bool {
        let exists = self.rules.iter().any(|r| {
            r.direction == Direction::Egress && r.peer == destination && r.ports == ports
        });
        if exists {
            return false;
        }
        self.rules.push(AccessRule {
            direction: Direction::Egress,
            peer: destination,
            ports,
            description: description.into(),
        });
        true
    }

    pub fn egress_rules(&self) -> impl Iterator<Item = &AccessRule> {
        self.rules.iter().filter(|r| r.direction == Direction::Egress)
    }

    pub fn permits_egress(&self, destination: Ipv4Addr, protocol: Protocol, port: Option<u16>) -> bool {
        self.egress_rules()
            .any(|r| r.peer.contains(&destination) && r.ports.covers(protocol, port))
    }
}
