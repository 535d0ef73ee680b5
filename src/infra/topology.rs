//! Network topology configuration and CIDR arithmetic

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An IPv4 network in prefix notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            anyhow::bail!("Invalid prefix length /{prefix}");
        }
        Ok(Self { addr, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// Network address with host bits cleared
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask()) == (u32::from(self.addr) & self.mask())
    }

    /// True when `other` lies entirely inside this network
    pub fn contains_cidr(&self, other: &Cidr) -> bool {
        other.prefix >= self.prefix && self.contains(other.network())
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other.network()) || other.contains(self.network())
    }

    /// The nth host address inside the network
    pub fn host(&self, n: u32) -> Ipv4Addr {
        Ipv4Addr::from((u32::from(self.addr) & self.mask()) + n)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .with_context(|| format!("'{s}' is not in address/prefix form"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("Invalid IPv4 address '{addr}'"))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("Invalid prefix length '{prefix}'"))?;
        Self::new(addr, prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A route that must exist in the VPC route table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Destination network
    pub destination: Cidr,
    /// Resource key of the instance whose ENI carries the traffic
    pub via: &'static str,
}

/// Instance market choice. Interruptible instances are cheaper but may
/// disappear; the provisioner knows how to replace them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Market {
    OnDemand,
    Spot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_type: String,
    pub market: Market,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardConfig {
    /// UDP port the gateway listens on
    #[serde(default = "default_wg_port")]
    pub listen_port: u16,
}

fn default_wg_port() -> u16 {
    51820
}

/// Cloud topology: one VPC, one subnet, a VPN gateway, and a
/// simulation host carrying extra lab networks behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub region: String,

    pub vpc_cidr: Cidr,
    pub subnet_cidr: Cidr,

    /// Network WireGuard clients live in (not part of the VPC)
    pub vpn_client_cidr: Cidr,

    /// Lab networks hosted on the simulation host (not part of the VPC)
    pub sim_cidr: Cidr,

    /// Reserved private address of the simulation host; survives
    /// instance replacement
    pub sim_host_ip: Ipv4Addr,

    pub ami: String,
    pub key_name: String,
    pub ssh_key_path: PathBuf,
    pub ssh_user: String,

    pub gateway: InstanceConfig,
    pub sim_host: InstanceConfig,

    pub wireguard: WireguardConfig,
}

impl TopologyConfig {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!("Failed to read topology config {}", path.as_ref().display())
        })?;
        let config: TopologyConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.vpc_cidr.contains_cidr(&self.subnet_cidr) {
            anyhow::bail!(
                "Subnet {} is not inside VPC {}",
                self.subnet_cidr,
                self.vpc_cidr
            );
        }

        // The three top-level networks must not overlap, otherwise
        // routing between them is ambiguous
        let networks = [
            ("vpc_cidr", self.vpc_cidr),
            ("vpn_client_cidr", self.vpn_client_cidr),
            ("sim_cidr", self.sim_cidr),
        ];
        for (i, (name_a, a)) in networks.iter().enumerate() {
            for (name_b, b) in &networks[i + 1..] {
                if a.overlaps(b) {
                    anyhow::bail!("{name_a} {a} overlaps {name_b} {b}");
                }
            }
        }

        if !self.subnet_cidr.contains(self.sim_host_ip) {
            anyhow::bail!(
                "sim_host_ip {} is not inside subnet {}",
                self.sim_host_ip,
                self.subnet_cidr
            );
        }

        if self.wireguard.listen_port == 0 {
            anyhow::bail!("WireGuard listen port must be non-zero");
        }

        Ok(())
    }

    /// Routes the VPC route table needs so VPN clients and lab networks
    /// reach each other
    pub fn required_routes(&self) -> Vec<RouteSpec> {
        vec![
            RouteSpec {
                destination: self.sim_cidr,
                via: "sim-host",
            },
            RouteSpec {
                destination: self.vpn_client_cidr,
                via: "gateway",
            },
        ]
    }

    /// Gateway-side WireGuard interface address (first host in the
    /// client network)
    pub fn wg_server_ip(&self) -> Ipv4Addr {
        self.vpn_client_cidr.host(1)
    }

    /// Address handed to the operator's client (second host)
    pub fn wg_client_ip(&self) -> Ipv4Addr {
        self.vpn_client_cidr.host(2)
    }
}
