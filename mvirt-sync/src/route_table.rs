//! Route tables as synced from a cloud VPC.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::resource::ResourceKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTableKind {
    #[default]
    System,
    Custom,
}

/// A single route entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub kind: String,
    /// Destination network, or a bare IPv4 host address.
    pub cidr: String,
    #[serde(default)]
    pub next_hop_kind: String,
    #[serde(default)]
    pub next_hop_id: String,
}

impl Route {
    pub fn new(cidr: impl Into<String>, next_hop_kind: &str, next_hop_id: &str) -> Self {
        Self {
            kind: String::new(),
            cidr: cidr.into(),
            next_hop_kind: next_hop_kind.to_string(),
            next_hop_id: next_hop_id.to_string(),
        }
    }

    /// Aligns a network destination to its base address. Destinations that
    /// do not parse are left as they are.
    pub fn canonicalize(&mut self) {
        if let Some(net) = self.network() {
            self.cidr = net.trunc().to_string();
        }
    }

    /// Checks that the destination is a network or a bare IPv4 address.
    pub fn validate(&self) -> Result<(), String> {
        if self.is_network() {
            self.network()
                .map(|_| ())
                .ok_or_else(|| format!("invalid cidr {}", self.cidr))
        } else if self.cidr.parse::<Ipv4Addr>().is_err() {
            Err(format!("invalid addr {}", self.cidr))
        } else {
            Ok(())
        }
    }

    fn is_network(&self) -> bool {
        self.cidr.find('/').is_some_and(|pos| pos > 0)
    }

    fn network(&self) -> Option<IpNet> {
        if !self.is_network() {
            return None;
        }
        self.cidr.parse().ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    #[serde(default)]
    pub kind: RouteTableKind,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(kind: RouteTableKind, routes: Vec<Route>) -> Self {
        Self { kind, routes }
    }
}

impl ResourceKind for RouteTable {
    const KIND: &'static str = "route_table";
    const NAME_PREFIX: &'static str = "rtbl";

    fn canonicalize(&mut self) {
        for route in &mut self.routes {
            route.canonicalize();
        }
        // Providers list routes in no particular order
        self.routes.sort_by(|a, b| a.cidr.cmp(&b.cidr));
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for route in &self.routes {
            route.validate()?;
            let mut canonical = route.clone();
            canonical.canonicalize();
            if !seen.insert(canonical.cidr) {
                return Err(format!("duplicate route cidr {}", route.cidr));
            }
        }
        Ok(())
    }
}
