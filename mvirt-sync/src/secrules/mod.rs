//! Security group rules: parsing, normalization and provider comparison.

mod capabilities;
mod compare;
mod evaluate;
mod normalize;
mod rule;

pub use capabilities::{LOCAL_PRIORITY_ORDER, PriorityOrder, Provider, ProviderCapabilities};
pub use compare::{RuleDiff, RuleError, compare_rules};
pub use evaluate::{Packet, evaluate};
pub use normalize::{Limitation, LimitationReason};
pub use rule::{
    Action, Direction, Peer, PortRange, Protocol, Rule, RuleKey, RuleOrigin, RuleParseError,
    RuleSet,
};
