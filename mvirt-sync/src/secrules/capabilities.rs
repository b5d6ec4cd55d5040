//! Provider rule semantics: priority numbering, default rules, allow-only.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::rule::{Action, Direction, Rule};

/// Which end of the priority range is evaluated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    /// Priority 1 beats priority 100.
    LowerFirst,
    /// Priority 100 beats priority 1.
    HigherFirst,
}

impl PriorityOrder {
    /// `Less` when priority `a` is evaluated before `b`.
    pub fn compare(self, a: i32, b: i32) -> Ordering {
        match self {
            PriorityOrder::LowerFirst => a.cmp(&b),
            PriorityOrder::HigherFirst => b.cmp(&a),
        }
    }

    /// Whether `a` is evaluated strictly before `b`.
    pub fn precedes(self, a: i32, b: i32) -> bool {
        self.compare(a, b) == Ordering::Less
    }
}

/// Order used for locally stored rules: higher priority wins.
pub const LOCAL_PRIORITY_ORDER: PriorityOrder = PriorityOrder::HigherFirst;

/// Everything the rule comparator needs to know about a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub min_priority: i32,
    pub max_priority: i32,
    /// Distance between two consecutive assigned priorities.
    pub priority_step: i32,
    pub order: PriorityOrder,
    /// The provider cannot store deny rules.
    pub allow_only: bool,
    /// No two rules of one direction may share a priority.
    pub unique_priority: bool,
    /// Priorities must follow the assigned slots exactly (no gaps).
    pub contiguous: bool,
    pub default_in: Rule,
    pub default_out: Rule,
}

impl ProviderCapabilities {
    /// Numbering in `[min, max]` with deny-all in and allow-all out defaults.
    pub fn new(min_priority: i32, max_priority: i32, order: PriorityOrder) -> Self {
        Self {
            min_priority,
            max_priority,
            priority_step: 1,
            order,
            allow_only: false,
            unique_priority: false,
            contiguous: false,
            default_in: Rule::default_rule(Direction::In, Action::Deny),
            default_out: Rule::default_rule(Direction::Out, Action::Allow),
        }
    }

    pub fn allow_only(mut self) -> Self {
        self.allow_only = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique_priority = true;
        self
    }

    pub fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    pub fn default_for(&self, direction: Direction) -> &Rule {
        match direction {
            Direction::In => &self.default_in,
            Direction::Out => &self.default_out,
        }
    }

    /// Number of distinct priorities available.
    pub fn slots(&self) -> usize {
        if self.max_priority < self.min_priority || self.priority_step <= 0 {
            return 0;
        }
        let span = i64::from(self.max_priority) - i64::from(self.min_priority);
        usize::try_from(span / i64::from(self.priority_step) + 1).unwrap_or(usize::MAX)
    }

    /// Priority of the `rank`-th slot counted from the first evaluated one.
    ///
    /// Ranks past the last slot stay at the far end of the range.
    pub fn slot(&self, rank: usize) -> i32 {
        let min = i64::from(self.min_priority);
        let max = i64::from(self.max_priority);
        let offset = i64::try_from(rank)
            .unwrap_or(i64::MAX)
            .saturating_mul(i64::from(self.priority_step));
        let priority = match self.order {
            PriorityOrder::LowerFirst => min.saturating_add(offset).min(max),
            PriorityOrder::HigherFirst => max.saturating_sub(offset).max(min),
        };
        i32::try_from(priority).unwrap_or(self.max_priority)
    }
}

/// Cloud backends with known rule semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OneCloud,
    Aliyun,
    Aws,
    Azure,
    Huawei,
    Qcloud,
    OpenStack,
    Ucloud,
}

impl Provider {
    pub const ALL: [Provider; 8] = [
        Provider::OneCloud,
        Provider::Aliyun,
        Provider::Aws,
        Provider::Azure,
        Provider::Huawei,
        Provider::Qcloud,
        Provider::OpenStack,
        Provider::Ucloud,
    ];

    pub fn capabilities(self) -> ProviderCapabilities {
        match self {
            Provider::OneCloud => ProviderCapabilities::new(1, 100, PriorityOrder::HigherFirst),
            Provider::Aliyun => ProviderCapabilities::new(1, 100, PriorityOrder::LowerFirst),
            // Security groups are stateful allow lists without priorities
            Provider::Aws => ProviderCapabilities::new(1, 1, PriorityOrder::LowerFirst).allow_only(),
            Provider::Azure => {
                ProviderCapabilities::new(100, 4096, PriorityOrder::LowerFirst).unique()
            }
            Provider::Huawei => ProviderCapabilities::new(1, 100, PriorityOrder::LowerFirst),
            // Policies are addressed by their position in the list
            Provider::Qcloud => {
                ProviderCapabilities::new(0, 99, PriorityOrder::LowerFirst).contiguous()
            }
            Provider::OpenStack => {
                ProviderCapabilities::new(1, 1, PriorityOrder::LowerFirst).allow_only()
            }
            // High, medium, low
            Provider::Ucloud => ProviderCapabilities::new(1, 3, PriorityOrder::LowerFirst),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::OneCloud => "onecloud",
            Provider::Aliyun => "aliyun",
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Huawei => "huawei",
            Provider::Qcloud => "qcloud",
            Provider::OpenStack => "openstack",
            Provider::Ucloud => "ucloud",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.to_string() == lower)
            .ok_or_else(|| format!("unknown provider: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_and_slot_numbering() {
        let caps = ProviderCapabilities::new(1, 100, PriorityOrder::LowerFirst);
        assert_eq!(caps.slots(), 100);
        assert_eq!(caps.slot(0), 1);
        assert_eq!(caps.slot(2), 3);

        let caps = ProviderCapabilities::new(1, 100, PriorityOrder::HigherFirst);
        assert_eq!(caps.slot(0), 100);
        assert_eq!(caps.slot(2), 98);

        let mut caps = ProviderCapabilities::new(100, 4096, PriorityOrder::LowerFirst);
        caps.priority_step = 100;
        assert_eq!(caps.slots(), 40);
        assert_eq!(caps.slot(1), 200);
    }

    #[test]
    fn test_full_i32_range() {
        let caps = ProviderCapabilities::new(i32::MIN, i32::MAX, PriorityOrder::LowerFirst);
        assert_eq!(caps.slots() as u64, 1u64 << 32);
        assert_eq!(caps.slot(0), i32::MIN);
        assert_eq!(caps.slot(usize::MAX), i32::MAX);

        let caps = ProviderCapabilities::new(i32::MIN, i32::MAX, PriorityOrder::HigherFirst);
        assert_eq!(caps.slot(0), i32::MAX);
        assert_eq!(caps.slot(1), i32::MAX - 1);
        assert_eq!(caps.slot(usize::MAX), i32::MIN);

        let mut caps = ProviderCapabilities::new(0, 10, PriorityOrder::LowerFirst);
        caps.priority_step = i32::MAX;
        assert_eq!(caps.slots(), 1);
        assert_eq!(caps.slot(3), 10);
    }

    #[test]
    fn test_invalid_bounds_have_no_slots() {
        let caps = ProviderCapabilities::new(10, 1, PriorityOrder::LowerFirst);
        assert_eq!(caps.slots(), 0);
    }

    #[test]
    fn test_precedes() {
        assert!(PriorityOrder::LowerFirst.precedes(1, 2));
        assert!(!PriorityOrder::LowerFirst.precedes(2, 2));
        assert!(PriorityOrder::HigherFirst.precedes(2, 1));
    }

    #[test]
    fn test_provider_names_roundtrip() {
        for provider in Provider::ALL {
            assert_eq!(provider.to_string().parse::<Provider>().unwrap(), provider);
        }
        assert_eq!("OpenStack".parse::<Provider>().unwrap(), Provider::OpenStack);
        assert!("gcp".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_capabilities() {
        assert!(Provider::Aws.capabilities().allow_only);
        assert!(Provider::Azure.capabilities().unique_priority);
        assert_eq!(Provider::Ucloud.capabilities().slots(), 3);
        assert_eq!(
            Provider::Aliyun.capabilities().default_in.key(),
            "in:deny any".parse::<Rule>().unwrap().key()
        );
    }
}
