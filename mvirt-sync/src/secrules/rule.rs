//! Security rule model and its compact text form.
//!
//! A rule is written as `<direction>:<action> [peer] [protocol] [ports]`, for
//! example `in:allow tcp 22`, `in:deny 10.0.0.0/8 udp 53` or
//! `out:allow sg:web tcp 8000-8080`. Omitted peer means any address, omitted
//! protocol means any protocol.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing the rule text form.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("missing direction in rule: {0}")]
    MissingDirection(String),

    #[error("invalid direction: {0}")]
    InvalidDirection(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("invalid port range: {0}")]
    InvalidPorts(String),

    #[error("invalid peer: {0}")]
    InvalidPeer(String),

    #[error("ports are only valid for tcp and udp: {0}")]
    UnexpectedPorts(String),

    #[error("unexpected token in rule: {0}")]
    UnexpectedToken(String),
}

/// Traffic direction of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::In, Direction::Out];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

impl FromStr for Direction {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(RuleParseError::InvalidDirection(other.to_string())),
        }
    }
}

/// Rule verdict. `Deny` sorts before `Allow` so that deny wins ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Deny,
    Allow,
}

impl Action {
    pub fn opposite(self) -> Self {
        match self {
            Action::Allow => Action::Deny,
            Action::Deny => Action::Allow,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Deny => write!(f, "deny"),
        }
    }
}

impl FromStr for Action {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            other => Err(RuleParseError::InvalidAction(other.to_string())),
        }
    }
}

/// IP protocol matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    /// Whether rules for this protocol carry a port range.
    pub fn has_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    pub fn covers(self, other: Protocol) -> bool {
        self == Protocol::Any || self == other
    }

    pub fn overlaps(self, other: Protocol) -> bool {
        self == Protocol::Any || other == Protocol::Any || self == other
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Any => write!(f, "any"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Protocol::Any),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(RuleParseError::InvalidProtocol(other.to_string())),
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const MIN_PORT: u16 = 1;
    pub const MAX_PORT: u16 = 65535;

    pub fn new(start: u16, end: u16) -> Result<Self, RuleParseError> {
        if start > end {
            return Err(RuleParseError::InvalidPorts(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Whether the range spans every usable port.
    pub fn is_full(&self) -> bool {
        self.start <= Self::MIN_PORT && self.end == Self::MAX_PORT
    }

    pub fn contains(&self, other: &PortRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Ranges that remain of `self` once `other` is removed.
    pub fn subtract(&self, other: &PortRange) -> Vec<PortRange> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut rest = Vec::with_capacity(2);
        if other.start > self.start {
            rest.push(PortRange {
                start: self.start,
                end: other.start - 1,
            });
        }
        if other.end < self.end {
            rest.push(PortRange {
                start: other.end + 1,
                end: self.end,
            });
        }
        rest
    }

    fn full() -> Self {
        Self {
            start: Self::MIN_PORT,
            end: Self::MAX_PORT,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.parse::<u16>()
                .map_err(|_| RuleParseError::InvalidPorts(s.to_string()))
        };
        match s.split_once('-') {
            Some((start, end)) => PortRange::new(parse(start)?, parse(end)?),
            None => Ok(PortRange::single(parse(s)?)),
        }
    }
}

/// Remote side of a rule: any address, a CIDR, or another security group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Peer {
    Any,
    Cidr(IpNet),
    Group(String),
}

impl Peer {
    /// Prefix length used to order rules, most specific first.
    pub fn specificity(&self) -> u8 {
        match self {
            Peer::Cidr(net) => net.prefix_len(),
            Peer::Any | Peer::Group(_) => 0,
        }
    }

    pub fn covers(&self, other: &Peer) -> bool {
        match (self, other) {
            (Peer::Any, _) => true,
            (Peer::Cidr(a), Peer::Cidr(b)) => a.contains(b),
            (Peer::Group(a), Peer::Group(b)) => a == b,
            _ => false,
        }
    }

    /// Group membership is unknown here, so a group overlaps every CIDR.
    pub fn overlaps(&self, other: &Peer) -> bool {
        match (self, other) {
            (Peer::Any, _) | (_, Peer::Any) => true,
            (Peer::Cidr(a), Peer::Cidr(b)) => a.contains(b) || b.contains(a),
            (Peer::Group(a), Peer::Group(b)) => a == b,
            _ => true,
        }
    }

    /// Drops host bits from CIDR peers.
    pub fn normalized(&self) -> Peer {
        match self {
            Peer::Cidr(net) => Peer::Cidr(net.trunc()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Any => write!(f, "any"),
            Peer::Cidr(net) => write!(f, "{}", net),
            Peer::Group(id) => write!(f, "sg:{}", id),
        }
    }
}

impl FromStr for Peer {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "any" {
            return Ok(Peer::Any);
        }
        if let Some(group) = s.strip_prefix("sg:") {
            if group.is_empty() {
                return Err(RuleParseError::InvalidPeer(s.to_string()));
            }
            return Ok(Peer::Group(group.to_string()));
        }
        if s.contains('/') {
            return s
                .parse::<IpNet>()
                .map(Peer::Cidr)
                .map_err(|_| RuleParseError::InvalidPeer(s.to_string()));
        }
        s.parse::<IpAddr>()
            .map(|addr| Peer::Cidr(IpNet::from(addr)))
            .map_err(|_| RuleParseError::InvalidPeer(s.to_string()))
    }
}

impl TryFrom<String> for Peer {
    type Error = RuleParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Peer> for String {
    fn from(peer: Peer) -> Self {
        peer.to_string()
    }
}

/// Where a rule came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOrigin {
    #[default]
    User,
    Default,
}

/// Everything that decides what a rule matches and does. Priority is not
/// part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub direction: Direction,
    pub action: Action,
    pub protocol: Protocol,
    pub ports: Option<PortRange>,
    pub peer: Peer,
}

/// A single security group rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub direction: Direction,
    pub action: Action,
    pub protocol: Protocol,
    /// `None` matches every port (and is the only value for non tcp/udp).
    #[serde(default)]
    pub ports: Option<PortRange>,
    #[serde(default = "any_peer")]
    pub peer: Peer,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub origin: RuleOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn any_peer() -> Peer {
    Peer::Any
}

impl Rule {
    /// A rule matching all traffic in one direction.
    pub fn new(direction: Direction, action: Action) -> Self {
        Self {
            direction,
            action,
            protocol: Protocol::Any,
            ports: None,
            peer: Peer::Any,
            priority: 0,
            origin: RuleOrigin::User,
            external_id: None,
            description: None,
        }
    }

    /// A provider default rule (never added or removed by a sync).
    pub fn default_rule(direction: Direction, action: Action) -> Self {
        Self {
            origin: RuleOrigin::Default,
            ..Self::new(direction, action)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_peer(mut self, peer: Peer) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol, ports: Option<PortRange>) -> Self {
        self.protocol = protocol;
        self.ports = ports;
        self
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            direction: self.direction,
            action: self.action,
            protocol: self.protocol,
            ports: self.ports,
            peer: self.peer.clone(),
        }
    }

    /// Canonical copy: network-aligned CIDR, and full or meaningless port
    /// ranges collapsed to `None`.
    pub fn normalized(&self) -> Rule {
        let ports = match self.ports {
            Some(range) if self.protocol.has_ports() && !range.is_full() => Some(range),
            _ => None,
        };
        Rule {
            ports,
            peer: self.peer.normalized(),
            ..self.clone()
        }
    }

    /// Effective port range, treating `None` as every port.
    pub(crate) fn port_range(&self) -> PortRange {
        self.ports.unwrap_or_else(PortRange::full)
    }

    /// Whether every packet matched by `other` is also matched by `self`.
    pub fn covers(&self, other: &Rule) -> bool {
        if self.direction != other.direction || !self.protocol.covers(other.protocol) {
            return false;
        }
        let ports = match (self.ports, other.ports) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a.contains(&b),
        };
        ports && self.peer.covers(&other.peer)
    }

    /// Whether some packet is matched by both rules.
    pub fn overlaps(&self, other: &Rule) -> bool {
        if self.direction != other.direction || !self.protocol.overlaps(other.protocol) {
            return false;
        }
        let ports = match (self.ports, other.ports) {
            (Some(a), Some(b)) => a.overlaps(&b),
            _ => true,
        };
        ports && self.peer.overlaps(&other.peer)
    }

    /// Two rules conflict when they overlap but decide differently.
    pub fn conflicts_with(&self, other: &Rule) -> bool {
        self.action != other.action && self.overlaps(other)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.direction, self.action)?;
        if self.peer != Peer::Any {
            write!(f, " {}", self.peer)?;
        }
        write!(f, " {}", self.protocol)?;
        if let Some(ports) = self.ports {
            write!(f, " {}", ports)?;
        }
        Ok(())
    }
}

impl FromStr for Rule {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (direction, rest) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| RuleParseError::MissingDirection(s.to_string()))?;
        let direction: Direction = direction.trim().parse()?;

        let mut tokens = rest.split_whitespace().peekable();
        let action: Action = tokens
            .next()
            .ok_or_else(|| RuleParseError::InvalidAction(String::new()))?
            .parse()?;

        let mut rule = Rule::new(direction, action);

        // Optional peer before the protocol
        if let Some(token) = tokens.peek()
            && token.parse::<Protocol>().is_err()
        {
            rule.peer = token.parse()?;
            tokens.next();
        }

        if let Some(token) = tokens.next() {
            rule.protocol = token.parse()?;
        }

        if let Some(token) = tokens.next() {
            if !rule.protocol.has_ports() {
                return Err(RuleParseError::UnexpectedPorts(s.to_string()));
            }
            rule.ports = Some(token.parse()?);
        }

        if let Some(token) = tokens.next() {
            return Err(RuleParseError::UnexpectedToken(token.to_string()));
        }

        Ok(rule)
    }
}

/// Ordered collection of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet(Vec<Rule>);

impl RuleSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, rule: Rule) {
        self.0.push(rule);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Rule] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Rule> {
        self.0
    }

    /// Rules of one direction, in set order.
    pub fn direction(&self, direction: Direction) -> impl Iterator<Item = &Rule> {
        self.0.iter().filter(move |r| r.direction == direction)
    }

    /// Copy sorted by (key, priority), for order-insensitive comparisons.
    pub fn sorted(&self) -> RuleSet {
        let mut rules = self.0.clone();
        rules.sort_by(|a, b| a.key().cmp(&b.key()).then(a.priority.cmp(&b.priority)));
        RuleSet(rules)
    }
}

impl From<Vec<Rule>> for RuleSet {
    fn from(rules: Vec<Rule>) -> Self {
        Self(rules)
    }
}

impl FromIterator<Rule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for RuleSet {
    type Item = Rule;
    type IntoIter = std::vec::IntoIter<Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Extend<Rule> for RuleSet {
    fn extend<I: IntoIterator<Item = Rule>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}
