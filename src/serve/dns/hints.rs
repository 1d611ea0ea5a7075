//! Root hints: the bootstrap set of public root name servers.
//!
//! Hints resolve in order: the inline config string, the configured file,
//! then the bundled IANA root file.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::rngs::OsRng;
use rand::seq::SliceRandom;

use crate::config::DnsConfig;
use crate::prelude::Error;
use crate::store::Record;

const EMBEDDED_ROOT_HINTS: &str = include_str!("named.root");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootServer {
    pub name: String,
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
}

#[derive(Debug, Clone, Default)]
pub struct RootHints {
    pub servers: Vec<RootServer>,
}

impl RootHints {
    pub fn load(config: &DnsConfig) -> Result<Self, Error> {
        if let Some(inline) = &config.root_hints {
            return Self::parse(inline);
        }

        if let Some(path) = &config.root_hints_file {
            let text = std::fs::read_to_string(path)?;
            return Self::parse(&text);
        }

        Self::parse(EMBEDDED_ROOT_HINTS)
    }

    /// Parse zone-file-style hints: `owner ttl [class] type value` lines,
    /// `;` comments. NS lines name the servers, A/AAAA lines attach their
    /// addresses.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut names: Vec<String> = Vec::new();
        let mut servers: BTreeMap<String, RootServer> = BTreeMap::new();

        for line in text.lines() {
            let line = line.split(';').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                continue;
            }

            // an optional IN class shifts type and value right by one
            let (rtype, value) = if fields[2].eq_ignore_ascii_case("IN") {
                if fields.len() < 5 {
                    continue;
                }
                (fields[3], fields[4])
            } else {
                (fields[2], fields[3])
            };

            match rtype.to_ascii_uppercase().as_str() {
                "NS" => {
                    let name = value.to_ascii_uppercase();
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
                "A" => {
                    let address = value
                        .parse()
                        .map_err(|_| Error::parse(format!("bad A in root hints: {value}")))?;
                    entry(&mut servers, fields[0]).v4.push(address);
                }
                "AAAA" => {
                    let address = value
                        .parse()
                        .map_err(|_| Error::parse(format!("bad AAAA in root hints: {value}")))?;
                    entry(&mut servers, fields[0]).v6.push(address);
                }
                _ => {}
            }
        }

        // keep NS declaration order where we have one
        let mut ordered = Vec::new();
        for name in names {
            if let Some(server) = servers.remove(&name) {
                ordered.push(server);
            }
        }
        ordered.extend(servers.into_values());

        if ordered.is_empty() {
            return Err(Error::parse("root hints contain no servers"));
        }

        Ok(Self { servers: ordered })
    }

    /// The hint set as a root-zone NS delegation.
    pub fn as_ns_records(&self) -> Vec<Record> {
        self.servers
            .iter()
            .map(|server| Record::new(".", "NS", server.name.to_lowercase()))
            .collect()
    }

    /// Addresses of one root server by name, case-insensitive.
    pub fn addresses_for(&self, name: &str) -> Vec<IpAddr> {
        self.servers
            .iter()
            .filter(|server| server.name.eq_ignore_ascii_case(name))
            .flat_map(|server| {
                server
                    .v4
                    .iter()
                    .copied()
                    .map(IpAddr::V4)
                    .chain(server.v6.iter().copied().map(IpAddr::V6))
            })
            .collect()
    }

    /// A random root server address, IPv4 preferred.
    pub fn random_address(&self) -> Option<IpAddr> {
        let v4: Vec<IpAddr> = self
            .servers
            .iter()
            .flat_map(|s| s.v4.iter().copied().map(IpAddr::V4))
            .collect();

        if let Some(address) = v4.choose(&mut OsRng) {
            return Some(*address);
        }

        let v6: Vec<IpAddr> = self
            .servers
            .iter()
            .flat_map(|s| s.v6.iter().copied().map(IpAddr::V6))
            .collect();

        v6.choose(&mut OsRng).copied()
    }
}

fn entry<'a>(
    servers: &'a mut BTreeMap<String, RootServer>,
    owner: &str,
) -> &'a mut RootServer {
    let key = owner.to_ascii_uppercase();

    servers.entry(key.clone()).or_insert_with(|| RootServer {
        name: key,
        v4: Vec::new(),
        v6: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_hints_cover_all_thirteen_roots() {
        let hints = RootHints::parse(EMBEDDED_ROOT_HINTS).unwrap();

        assert_eq!(hints.servers.len(), 13);
        assert_eq!(hints.servers[0].name, "A.ROOT-SERVERS.NET.");
        assert_eq!(
            hints.servers[0].v4,
            vec![Ipv4Addr::new(198, 41, 0, 4)]
        );
        assert_eq!(hints.servers[0].v6.len(), 1);
    }

    #[test]
    fn random_address_prefers_ipv4() {
        let hints = RootHints::parse(EMBEDDED_ROOT_HINTS).unwrap();

        for _ in 0..8 {
            assert!(matches!(hints.random_address(), Some(IpAddr::V4(_))));
        }
    }

    #[test]
    fn v6_only_hints_still_resolve() {
        let hints = RootHints::parse(
            ".              3600000 NS X.EXAMPLE.\n\
             X.EXAMPLE.     3600000 AAAA 2001:db8::1\n",
        )
        .unwrap();

        assert!(matches!(hints.random_address(), Some(IpAddr::V6(_))));
    }

    #[test]
    fn class_field_is_tolerated() {
        let hints = RootHints::parse(
            ".          3600000 IN NS X.EXAMPLE.\n\
             X.EXAMPLE. 3600000 IN A 192.0.2.1\n",
        )
        .unwrap();

        assert_eq!(hints.servers.len(), 1);
        assert_eq!(hints.servers[0].v4, vec![Ipv4Addr::new(192, 0, 2, 1)]);
    }

    #[test]
    fn empty_hints_are_an_error() {
        assert!(RootHints::parse("; nothing here\n").is_err());
    }
}
