//! Client-side namespace descriptors for the bind-interposing loader.
//!
//! The daemon never interprets these. They travel to the spawned process as
//! `RUNNS_NETNS_<i>` / `RUNNS_NETNS_IPV6_<i>` environment variables, where
//! the preloaded library picks them up to retarget `bind` calls per
//! namespace.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Error, Result};

pub const ENV_PREFIX: &str = "RUNNS_NETNS";
pub const ENV_PREFIX_IPV6: &str = "RUNNS_NETNS_IPV6";
const FIELD_SEPARATOR: char = ';';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Protocol {
    Unknown,
    Tcp,
    Udp,
}

impl fmt::Display for L4Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            L4Protocol::Unknown => write!(f, "unknown"),
            L4Protocol::Tcp => write!(f, "tcp"),
            L4Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One `--forward-port` entry: which listening address, in which namespace,
/// for which transport.
#[derive(Debug, Clone, PartialEq)]
pub struct NetnsSpec {
    pub ip: IpAddr,
    pub port: u16,
    pub netns_path: PathBuf,
    pub proto: L4Protocol,
}

impl FromStr for NetnsSpec {
    type Err = Error;

    /// `<ip>;<port>;<netns_path>[;<proto><family>]` with `proto` in
    /// {tcp, udp} and `family` in {4, 6}.
    fn from_str(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split(FIELD_SEPARATOR).collect();
        if fields.len() < 3 || fields.len() > 4 {
            bail!("expected <ip>;<port>;<netns_path>[;<proto><family>], got {:?}", raw);
        }

        let ip: IpAddr = fields[0]
            .parse()
            .with_context(|| format!("bad forward address {:?}", fields[0]))?;
        let port: u16 = fields[1]
            .parse()
            .with_context(|| format!("bad forward port {:?}", fields[1]))?;
        let netns_path = PathBuf::from(fields[2]);
        if fields[2].is_empty() {
            bail!("the namespace path of a forward entry cannot be empty");
        }

        let proto = match fields.get(3) {
            None => L4Protocol::Unknown,
            Some(tag) => parse_proto_tag(tag, &ip)?,
        };

        Ok(NetnsSpec {
            ip,
            port,
            netns_path,
            proto,
        })
    }
}

impl NetnsSpec {
    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    /// Environment variable for index `i` within this spec's address family.
    pub fn to_env(&self, index: usize) -> (String, String) {
        let prefix = if self.is_ipv6() {
            ENV_PREFIX_IPV6
        } else {
            ENV_PREFIX
        };
        let name = format!("{}_{}", prefix, index);
        let value = match self.proto {
            L4Protocol::Unknown => format!(
                "{};{};{}",
                self.ip,
                self.port,
                self.netns_path.display()
            ),
            proto => format!(
                "{};{};{};{}{}",
                self.ip,
                self.port,
                self.netns_path.display(),
                proto,
                if self.is_ipv6() { 6 } else { 4 }
            ),
        };
        (name, value)
    }
}

/// Renders the whole forward set; IPv4 and IPv6 entries are indexed
/// independently, matching what the loader scans for.
pub fn to_environment(specs: &[NetnsSpec]) -> Vec<(String, String)> {
    let mut v4 = 0;
    let mut v6 = 0;
    specs
        .iter()
        .map(|spec| {
            let index = if spec.is_ipv6() {
                let i = v6;
                v6 += 1;
                i
            } else {
                let i = v4;
                v4 += 1;
                i
            };
            spec.to_env(index)
        })
        .collect()
}

fn parse_proto_tag(tag: &str, ip: &IpAddr) -> Result<L4Protocol> {
    if tag.len() != 4 {
        bail!("protocol tag {:?} is not of the form <proto><family>", tag);
    }
    let (proto, family) = tag.split_at(3);
    let proto = match proto.to_ascii_lowercase().as_str() {
        "tcp" => L4Protocol::Tcp,
        "udp" => L4Protocol::Udp,
        other => bail!("unknown transport protocol {:?}", other),
    };
    match (family, ip.is_ipv6()) {
        ("4", false) | ("6", true) => Ok(proto),
        ("4", true) | ("6", false) => {
            bail!("address family of tag {:?} does not match address {}", tag, ip)
        }
        _ => bail!("unknown address family in tag {:?}", tag),
    }
}
