//! Reduction of a rule list to its effective canonical form.
//!
//! The canonical form of one direction is an ordered list of rules where:
//! - no rule is covered by a higher-precedence rule,
//! - no rule is a copy of the default rule,
//! - rules inside a run of equal action are merged (port ranges coalesced,
//!   CIDRs aggregated) and sorted deterministically.
//!
//! Inside a run of equal action the order of rules does not change the
//! verdict, so merging and re-sorting there keeps the policy intact.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use ipnet::IpNet;
use serde::Serialize;

use super::capabilities::PriorityOrder;
use super::rule::{Action, Direction, Peer, PortRange, Protocol, Rule};

/// Why part of a policy could not be expressed on an allow-only provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitationReason {
    /// The direction defaults to allow, so a deny has nothing to carve from.
    DenyUnderAllowDefault,
    /// "Every protocol except X" has no allow-rule equivalent.
    ProtocolComplement,
    /// Group membership is unknown, so it cannot be subtracted from a CIDR.
    PeerGroupSubtraction,
}

/// A deny rule that could only be approximated on an allow-only provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Limitation {
    pub direction: Direction,
    pub deny: String,
    pub allow: Option<String>,
    pub reason: LimitationReason,
}

/// One rule of the canonical form and the input rules it stands for.
#[derive(Debug, Clone)]
pub(crate) struct Canonical {
    pub rule: Rule,
    /// Indices into the caller's rule slice.
    pub sources: Vec<usize>,
    /// Index of the run of equal action this rule belongs to.
    pub tier: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Normalized {
    pub rules: Vec<Canonical>,
    pub limitations: Vec<Limitation>,
}

/// Precedence order of two rules; `Less` means `a` is evaluated first.
///
/// Ties on priority go to deny, then the more specific peer, then protocol
/// and ports ascending. Callers break remaining ties by input order.
pub(crate) fn precedence(order: PriorityOrder, a: &Rule, b: &Rule) -> Ordering {
    order
        .compare(a.priority, b.priority)
        .then(a.action.cmp(&b.action))
        .then(b.peer.specificity().cmp(&a.peer.specificity()))
        .then(a.protocol.cmp(&b.protocol))
        .then(a.ports.cmp(&b.ports))
        .then(a.peer.cmp(&b.peer))
}

/// Normalizes the rules of one direction.
///
/// `rules` pairs each rule with its index in the caller's slice. Rules equal
/// to `default` are dropped here; the caller decides what that means.
pub(crate) fn normalize(
    rules: &[(usize, &Rule)],
    order: PriorityOrder,
    default: &Rule,
    allow_only: bool,
) -> Normalized {
    let default_key = default.normalized().key();

    let mut list: Vec<Canonical> = rules
        .iter()
        .map(|(idx, rule)| Canonical {
            rule: rule.normalized(),
            sources: vec![*idx],
            tier: 0,
        })
        .collect();

    list.sort_by(|a, b| {
        precedence(order, &a.rule, &b.rule).then(a.sources[0].cmp(&b.sources[0]))
    });

    // A high-priority copy of the default still shadows what follows it
    let mut list = drop_shadowed(list);
    list.retain(|c| c.rule.key() != default_key);

    let mut limitations = Vec::new();
    let list = if allow_only {
        emulate_denies(list, default, &mut limitations)
    } else {
        list
    };

    // Merged rules can shadow later rules
    let mut list = merge_runs(list);
    loop {
        let before = list.len();
        list = drop_shadowed(list);
        list.retain(|c| c.rule.key() != default_key);
        list = merge_runs(list);
        if list.len() == before {
            break;
        }
    }

    Normalized {
        rules: list,
        limitations,
    }
}

/// Removes rules fully covered by an earlier rule. Equal rules fold their
/// sources into the first one.
fn drop_shadowed(list: Vec<Canonical>) -> Vec<Canonical> {
    let mut kept: Vec<Canonical> = Vec::with_capacity(list.len());
    for candidate in list {
        match kept.iter_mut().find(|k| k.rule.covers(&candidate.rule)) {
            Some(k) if k.rule.key() == candidate.rule.key() => {
                k.sources.extend(candidate.sources);
            }
            Some(_) => {}
            None => kept.push(candidate),
        }
    }
    kept
}

/// Rewrites a list containing deny rules into allow rules only, by carving
/// every deny out of the lower-precedence allows it overlaps.
fn emulate_denies(
    list: Vec<Canonical>,
    default: &Rule,
    limitations: &mut Vec<Limitation>,
) -> Vec<Canonical> {
    let mut out = Vec::with_capacity(list.len());
    for (pos, entry) in list.iter().enumerate() {
        if entry.rule.action == Action::Deny {
            if default.action == Action::Allow {
                limitations.push(Limitation {
                    direction: entry.rule.direction,
                    deny: entry.rule.to_string(),
                    allow: None,
                    reason: LimitationReason::DenyUnderAllowDefault,
                });
            }
            continue;
        }

        let mut pieces = vec![entry.rule.clone()];
        for deny in list[..pos].iter().filter(|c| c.rule.action == Action::Deny) {
            let mut next = Vec::with_capacity(pieces.len());
            for piece in pieces {
                if !piece.overlaps(&deny.rule) {
                    next.push(piece);
                    continue;
                }
                let (rest, reason) = subtract(&piece, &deny.rule);
                if let Some(reason) = reason {
                    limitations.push(Limitation {
                        direction: piece.direction,
                        deny: deny.rule.to_string(),
                        allow: Some(piece.to_string()),
                        reason,
                    });
                }
                next.extend(rest);
            }
            pieces = next;
        }

        out.extend(pieces.into_iter().map(|rule| Canonical {
            rule,
            sources: entry.sources.clone(),
            tier: 0,
        }));
    }
    out
}

/// `allow` minus `deny`. Returns the expressible remainder and, when part of
/// it could not be expressed, the reason.
fn subtract(allow: &Rule, deny: &Rule) -> (Vec<Rule>, Option<LimitationReason>) {
    if deny.covers(allow) {
        return (Vec::new(), None);
    }

    let mut rest = Vec::new();
    let mut reason = None;

    // Addresses outside the deny's peer keep the allow untouched
    match peer_difference(&allow.peer, &deny.peer) {
        Some(peers) => rest.extend(peers.into_iter().map(|peer| allow.clone().with_peer(peer))),
        None => reason = Some(LimitationReason::PeerGroupSubtraction),
    }
    let Some(shared_peer) = peer_intersection(&allow.peer, &deny.peer) else {
        return (rest, reason);
    };

    // Inside the shared peer, protocols the deny does not touch
    let shared_protocol = match (allow.protocol, deny.protocol) {
        (_, Protocol::Any) => allow.protocol,
        (a, d) if a == d => a,
        (Protocol::Any, d) => {
            reason.get_or_insert(LimitationReason::ProtocolComplement);
            d
        }
        _ => return (rest, reason),
    };

    // Inside shared peer and protocol, ports the deny does not touch
    if shared_protocol.has_ports() {
        let allow_ports = allow.port_range();
        let deny_ports = deny.port_range();
        for range in allow_ports.subtract(&deny_ports) {
            rest.push(
                allow
                    .clone()
                    .with_peer(shared_peer.clone())
                    .with_protocol(shared_protocol, Some(range)),
            );
        }
    }

    (rest.into_iter().map(|r| r.normalized()).collect(), reason)
}

/// `allow` peer minus `deny` peer, `None` when not expressible.
fn peer_difference(allow: &Peer, deny: &Peer) -> Option<Vec<Peer>> {
    match (allow, deny) {
        (_, Peer::Any) => Some(Vec::new()),
        (Peer::Any, Peer::Cidr(d)) => {
            let mut peers: Vec<Peer> = cidr_difference(family_root(d), *d)
                .into_iter()
                .map(Peer::Cidr)
                .collect();
            peers.push(Peer::Cidr(other_family_root(d)));
            Some(peers)
        }
        (Peer::Cidr(a), Peer::Cidr(d)) => {
            if d.contains(a) {
                Some(Vec::new())
            } else if a.contains(d) {
                Some(cidr_difference(*a, *d).into_iter().map(Peer::Cidr).collect())
            } else {
                Some(vec![allow.clone()])
            }
        }
        (Peer::Group(a), Peer::Group(d)) if a == d => Some(Vec::new()),
        (Peer::Group(_), Peer::Group(_)) => Some(vec![allow.clone()]),
        _ => None,
    }
}

fn peer_intersection(a: &Peer, b: &Peer) -> Option<Peer> {
    match (a, b) {
        (Peer::Any, other) | (other, Peer::Any) => Some(other.clone()),
        (Peer::Cidr(x), Peer::Cidr(y)) if x.contains(y) => Some(b.clone()),
        (Peer::Cidr(x), Peer::Cidr(y)) if y.contains(x) => Some(a.clone()),
        (Peer::Group(x), Peer::Group(y)) if x == y => Some(a.clone()),
        _ => None,
    }
}

fn family_root(net: &IpNet) -> IpNet {
    match net {
        IpNet::V4(_) => IpNet::V4(Default::default()),
        IpNet::V6(_) => IpNet::V6(Default::default()),
    }
}

fn other_family_root(net: &IpNet) -> IpNet {
    match net {
        IpNet::V4(_) => IpNet::V6(Default::default()),
        IpNet::V6(_) => IpNet::V4(Default::default()),
    }
}

/// Networks covering `outer` minus `inner`, where `inner` lies in `outer`.
pub(crate) fn cidr_difference(outer: IpNet, inner: IpNet) -> Vec<IpNet> {
    let mut out = Vec::new();
    let mut current = outer.trunc();
    while current.prefix_len() < inner.prefix_len() {
        let Ok(halves) = current.subnets(current.prefix_len() + 1) else {
            break;
        };
        let mut next = None;
        for half in halves {
            if half.contains(&inner) {
                next = Some(half);
            } else {
                out.push(half);
            }
        }
        match next {
            Some(half) => current = half,
            None => break,
        }
    }
    out
}

/// Splits the list into runs of equal action, merges inside each run, and
/// assigns tiers.
fn merge_runs(list: Vec<Canonical>) -> Vec<Canonical> {
    let mut out: Vec<Canonical> = Vec::with_capacity(list.len());
    let mut run: Vec<Canonical> = Vec::new();
    let mut tier = 0;

    for entry in list {
        if let Some(last) = run.last()
            && last.rule.action != entry.rule.action
        {
            out.extend(finish_run(std::mem::take(&mut run), tier));
            tier += 1;
        }
        run.push(entry);
    }
    if !run.is_empty() {
        out.extend(finish_run(run, tier));
    }
    out
}

fn finish_run(mut run: Vec<Canonical>, tier: usize) -> Vec<Canonical> {
    loop {
        let before = run.len();
        run = absorb_covered(run);
        run = merge_ports(run);
        run = merge_cidrs(run);
        if run.len() == before {
            break;
        }
    }

    for entry in &mut run {
        entry.tier = tier;
        entry.sources.sort_unstable();
        entry.sources.dedup();
    }
    run.sort_by(|a, b| {
        b.rule
            .peer
            .specificity()
            .cmp(&a.rule.peer.specificity())
            .then(a.rule.protocol.cmp(&b.rule.protocol))
            .then(a.rule.ports.cmp(&b.rule.ports))
            .then(a.rule.peer.cmp(&b.rule.peer))
            .then(a.sources[0].cmp(&b.sources[0]))
    });
    run
}

/// Inside a run, drops rules covered by any other rule of the run.
fn absorb_covered(run: Vec<Canonical>) -> Vec<Canonical> {
    let mut kept: Vec<Canonical> = Vec::with_capacity(run.len());
    for candidate in run {
        if let Some(k) = kept.iter_mut().find(|k| k.rule.covers(&candidate.rule)) {
            k.sources.extend(candidate.sources);
            continue;
        }
        let mut sources = candidate.sources.clone();
        kept.retain(|k| {
            if candidate.rule.covers(&k.rule) {
                sources.extend(k.sources.iter().copied());
                false
            } else {
                true
            }
        });
        kept.push(Canonical {
            sources,
            ..candidate
        });
    }
    kept
}

/// Coalesces overlapping or adjacent port ranges of rules that differ only
/// in ports.
fn merge_ports(run: Vec<Canonical>) -> Vec<Canonical> {
    let mut groups: BTreeMap<(Protocol, Peer), Vec<Canonical>> = BTreeMap::new();
    let mut out = Vec::with_capacity(run.len());
    for entry in run {
        if entry.rule.ports.is_some() {
            groups
                .entry((entry.rule.protocol, entry.rule.peer.clone()))
                .or_default()
                .push(entry);
        } else {
            out.push(entry);
        }
    }

    for (_, mut group) in groups {
        group.sort_by_key(|c| c.rule.port_range());
        let mut merged: Vec<Canonical> = Vec::with_capacity(group.len());
        for entry in group {
            let range = entry.rule.port_range();
            if let Some(last) = merged.last_mut() {
                let last_range = last.rule.port_range();
                if range.start <= last_range.end.saturating_add(1) {
                    let end = last_range.end.max(range.end);
                    last.rule.ports = Some(PortRange {
                        start: last_range.start,
                        end,
                    });
                    last.rule = merged_rule(&last.rule);
                    last.sources.extend(entry.sources);
                    continue;
                }
            }
            merged.push(entry);
        }
        out.extend(merged);
    }
    out
}

/// Aggregates CIDR peers of rules that differ only in peer.
fn merge_cidrs(run: Vec<Canonical>) -> Vec<Canonical> {
    type GroupKey = (Protocol, Option<PortRange>);
    let mut groups: BTreeMap<GroupKey, Vec<Canonical>> = BTreeMap::new();
    let mut out = Vec::with_capacity(run.len());
    for entry in run {
        if matches!(entry.rule.peer, Peer::Cidr(_)) {
            groups
                .entry((entry.rule.protocol, entry.rule.ports))
                .or_default()
                .push(entry);
        } else {
            out.push(entry);
        }
    }

    for (_, group) in groups {
        if group.len() == 1 {
            out.extend(group);
            continue;
        }
        let nets: Vec<IpNet> = group
            .iter()
            .filter_map(|c| match c.rule.peer {
                Peer::Cidr(net) => Some(net),
                _ => None,
            })
            .collect();
        let aggregated = IpNet::aggregate(&nets);
        if aggregated.len() == group.len() {
            out.extend(group);
            continue;
        }
        let template = group[0].rule.clone();
        for net in aggregated {
            let sources = group
                .iter()
                .filter(|c| matches!(c.rule.peer, Peer::Cidr(n) if net.contains(&n)))
                .flat_map(|c| c.sources.iter().copied())
                .collect();
            out.push(Canonical {
                rule: merged_rule(&template.clone().with_peer(Peer::Cidr(net))).normalized(),
                sources,
                tier: 0,
            });
        }
    }
    out
}

/// A merged rule no longer corresponds to a single provider rule.
fn merged_rule(rule: &Rule) -> Rule {
    Rule {
        external_id: None,
        description: None,
        ..rule.normalized()
    }
}
