//! Comparison of a desired local rule set with the rules stored in a cloud.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::capabilities::{LOCAL_PRIORITY_ORDER, ProviderCapabilities};
use super::normalize::{Canonical, Limitation, normalize};
use super::rule::{Direction, Rule, RuleKey, RuleOrigin, RuleSet};

/// Errors that make a rule comparison impossible.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid priority bounds: min {min}, max {max}, step {step}")]
    InvalidBounds { min: i32, max: i32, step: i32 },

    #[error(
        "no free priority for {direction} rules: {required} priorities needed, provider offers {available}"
    )]
    PriorityExhausted {
        direction: Direction,
        required: usize,
        available: usize,
    },
}

/// Changes to push to a provider so its rules match the desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleDiff {
    /// Remote rules that already match and stay untouched.
    pub common: RuleSet,
    pub in_adds: RuleSet,
    pub out_adds: RuleSet,
    pub in_dels: RuleSet,
    pub out_dels: RuleSet,
    /// Deny rules an allow-only provider could only approximate.
    pub limitations: Vec<Limitation>,
}

impl RuleDiff {
    /// Whether nothing needs to be pushed.
    pub fn is_empty(&self) -> bool {
        self.in_adds.is_empty()
            && self.out_adds.is_empty()
            && self.in_dels.is_empty()
            && self.out_dels.is_empty()
    }

    pub fn adds(&self, direction: Direction) -> &RuleSet {
        match direction {
            Direction::In => &self.in_adds,
            Direction::Out => &self.out_adds,
        }
    }

    pub fn dels(&self, direction: Direction) -> &RuleSet {
        match direction {
            Direction::In => &self.in_dels,
            Direction::Out => &self.out_dels,
        }
    }

    pub fn add_count(&self) -> usize {
        self.in_adds.len() + self.out_adds.len()
    }

    pub fn del_count(&self) -> usize {
        self.in_dels.len() + self.out_dels.len()
    }

    /// The rule set a provider holds after removing the deletes from
    /// `remote` and appending the adds.
    pub fn apply_to(&self, remote: &RuleSet) -> RuleSet {
        let mut pending: Vec<&Rule> = self.in_dels.iter().chain(self.out_dels.iter()).collect();
        let mut result = RuleSet::new();
        for rule in remote {
            if let Some(pos) = pending.iter().position(|d| *d == rule) {
                pending.swap_remove(pos);
                continue;
            }
            result.push(rule.clone());
        }
        result.extend(self.in_adds.iter().cloned());
        result.extend(self.out_adds.iter().cloned());
        result
    }
}

/// Computes the rule changes that make `remote` behave like `local`.
///
/// `local` uses the local numbering (higher priority first); `remote` uses the
/// provider numbering from `caps`. Directions not included are ignored on
/// both sides. Remote rules equal to the provider default rule are never
/// reported as changes.
pub fn compare_rules(
    caps: &ProviderCapabilities,
    local: &RuleSet,
    remote: &RuleSet,
    include_in: bool,
    include_out: bool,
) -> Result<RuleDiff, RuleError> {
    if caps.priority_step <= 0 || caps.max_priority < caps.min_priority {
        return Err(RuleError::InvalidBounds {
            min: caps.min_priority,
            max: caps.max_priority,
            step: caps.priority_step,
        });
    }

    let mut diff = RuleDiff::default();
    let mut common_idx = BTreeSet::new();

    for direction in Direction::ALL {
        let included = match direction {
            Direction::In => include_in,
            Direction::Out => include_out,
        };
        if !included {
            continue;
        }

        let changes = compare_direction(caps, direction, local, remote)?;
        debug!(
            %direction,
            adds = changes.adds.len(),
            dels = changes.dels.len(),
            common = changes.common.len(),
            "Compared rules"
        );
        common_idx.extend(changes.common);
        let dels = changes.dels.iter().map(|&i| remote.as_slice()[i].clone());
        match direction {
            Direction::In => {
                diff.in_adds.extend(changes.adds);
                diff.in_dels.extend(dels);
            }
            Direction::Out => {
                diff.out_adds.extend(changes.adds);
                diff.out_dels.extend(dels);
            }
        }
        diff.limitations.extend(changes.limitations);
    }

    diff.common = common_idx
        .into_iter()
        .map(|i| remote.as_slice()[i].clone())
        .collect();
    Ok(diff)
}

struct DirectionChanges {
    /// Indices into the remote set.
    common: Vec<usize>,
    adds: Vec<Rule>,
    /// Indices into the remote set.
    dels: Vec<usize>,
    limitations: Vec<Limitation>,
}

fn compare_direction(
    caps: &ProviderCapabilities,
    direction: Direction,
    local: &RuleSet,
    remote: &RuleSet,
) -> Result<DirectionChanges, RuleError> {
    let default = caps.default_for(direction);
    let default_key = default.normalized().key();

    let local_rules: Vec<(usize, &Rule)> = local
        .iter()
        .enumerate()
        .filter(|(_, r)| r.direction == direction)
        .collect();
    let remote_rules: Vec<(usize, &Rule)> = remote
        .iter()
        .enumerate()
        .filter(|(_, r)| r.direction == direction)
        .collect();

    let desired = normalize(&local_rules, LOCAL_PRIORITY_ORDER, default, caps.allow_only);
    let actual = normalize(&remote_rules, caps.order, default, false);

    let ranks: Vec<usize> = desired
        .rules
        .iter()
        .enumerate()
        .map(|(i, c)| if caps.unique_priority { i } else { c.tier })
        .collect();
    let required = ranks.iter().max().map_or(0, |r| r + 1);
    let available = caps.slots();
    if required > available {
        return Err(RuleError::PriorityExhausted {
            direction,
            required,
            available,
        });
    }

    let by_key: BTreeMap<RuleKey, usize> = actual
        .rules
        .iter()
        .enumerate()
        .map(|(i, c)| (c.rule.key(), i))
        .collect();
    let mut matched: Vec<Option<usize>> = desired
        .rules
        .iter()
        .map(|c| by_key.get(&c.rule.key()).copied())
        .collect();

    // Priorities of matched remote rules are kept unless they break the
    // desired order; offending rules are re-added one at a time.
    loop {
        let priorities: Vec<Vec<i32>> = (0..desired.rules.len())
            .map(|i| match matched[i] {
                Some(a) => actual.rules[a]
                    .sources
                    .iter()
                    .map(|&s| remote.as_slice()[s].priority)
                    .collect(),
                None => vec![caps.slot(ranks[i])],
            })
            .collect();
        match find_demotion(caps, &desired.rules, &ranks, &matched, &priorities) {
            Some(i) => matched[i] = None,
            None => break,
        }
    }

    let mut kept: BTreeSet<usize> = BTreeSet::new();
    let mut adds = Vec::new();
    for (i, canonical) in desired.rules.iter().enumerate() {
        match matched[i] {
            Some(a) => kept.extend(actual.rules[a].sources.iter().copied()),
            None => adds.push(Rule {
                priority: caps.slot(ranks[i]),
                origin: RuleOrigin::User,
                external_id: None,
                ..canonical.rule.clone()
            }),
        }
    }

    let dels = remote_rules
        .iter()
        .filter(|(i, r)| !kept.contains(i) && r.normalized().key() != default_key)
        .map(|(i, _)| *i)
        .collect();

    Ok(DirectionChanges {
        common: kept.into_iter().collect(),
        adds,
        dels,
        limitations: desired.limitations,
    })
}

/// Returns a matched rule whose current priority cannot stay.
fn find_demotion(
    caps: &ProviderCapabilities,
    desired: &[Canonical],
    ranks: &[usize],
    matched: &[Option<usize>],
    priorities: &[Vec<i32>],
) -> Option<usize> {
    if caps.contiguous {
        for i in 0..desired.len() {
            if matched[i].is_some() && priorities[i] != [caps.slot(ranks[i])] {
                return Some(i);
            }
        }
    }

    let pick = |i: usize, j: usize| {
        if matched[j].is_some() {
            Some(j)
        } else if matched[i].is_some() {
            Some(i)
        } else {
            None
        }
    };

    for j in 0..desired.len() {
        for i in 0..j {
            if desired[i].rule.conflicts_with(&desired[j].rule) {
                let ordered = priorities[i]
                    .iter()
                    .all(|&p| priorities[j].iter().all(|&q| caps.order.precedes(p, q)));
                if !ordered && let Some(victim) = pick(i, j) {
                    return Some(victim);
                }
            }
            if caps.unique_priority {
                let shared = priorities[i].iter().any(|p| priorities[j].contains(p));
                if shared && let Some(victim) = pick(i, j) {
                    return Some(victim);
                }
            }
        }
    }
    None
}
