//! Verdict of a rule set for a single packet.

use std::net::IpAddr;

use super::capabilities::PriorityOrder;
use super::rule::{Action, Direction, Peer, Protocol, Rule};

/// A packet as seen by a security group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub direction: Direction,
    pub protocol: Protocol,
    pub port: Option<u16>,
    /// Remote address of the flow.
    pub addr: IpAddr,
    /// Security group of the remote end, if any.
    pub group: Option<String>,
}

impl Packet {
    pub fn new(direction: Direction, protocol: Protocol, port: Option<u16>, addr: IpAddr) -> Self {
        Self {
            direction,
            protocol,
            port,
            addr,
            group: None,
        }
    }

    pub fn from_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl Rule {
    pub fn matches(&self, packet: &Packet) -> bool {
        if self.direction != packet.direction {
            return false;
        }
        if self.protocol != Protocol::Any && self.protocol != packet.protocol {
            return false;
        }
        if let Some(range) = self.ports
            && self.protocol.has_ports()
            && !packet.port.is_some_and(|p| range.contains_port(p))
        {
            return false;
        }
        match &self.peer {
            Peer::Any => true,
            Peer::Cidr(net) => net.contains(&packet.addr),
            Peer::Group(id) => packet.group.as_deref() == Some(id.as_str()),
        }
    }
}

/// Decides `packet` with the first matching rule in `order`. Deny wins ties on
/// priority; no match falls through to `default`.
pub fn evaluate(rules: &[Rule], order: PriorityOrder, default: &Rule, packet: &Packet) -> Action {
    rules
        .iter()
        .filter(|r| r.matches(packet))
        .min_by(|a, b| {
            order
                .compare(a.priority, b.priority)
                .then(a.action.cmp(&b.action))
        })
        .map_or(default.action, |r| r.action)
}
