//! Rule comparison against provider semantics, checked packet by packet.

use std::collections::HashSet;
use std::net::IpAddr;

use mvirt_sync::compare_sets_by;
use mvirt_sync::secrules::{
    Action, Direction, LOCAL_PRIORITY_ORDER, Packet, Peer, PortRange, PriorityOrder, Protocol,
    Provider, ProviderCapabilities, Rule, RuleSet, compare_rules, evaluate,
};
use proptest::prelude::*;
use proptest::sample::select;

fn rule(text: &str, priority: i32) -> Rule {
    text.parse::<Rule>().unwrap().with_priority(priority)
}

fn packets() -> Vec<Packet> {
    let addrs: Vec<IpAddr> = ["10.1.2.3", "10.200.0.1", "192.168.5.5", "8.8.8.8"]
        .iter()
        .map(|a| a.parse().unwrap())
        .collect();
    let mut packets = Vec::new();
    for direction in Direction::ALL {
        for protocol in [Protocol::Tcp, Protocol::Udp] {
            for port in [19, 20, 22, 23, 25, 26, 80, 443] {
                for addr in &addrs {
                    packets.push(Packet::new(direction, protocol, Some(port), *addr));
                }
            }
        }
    }
    packets
}

/// Every packet gets the same verdict from the local rules and the provider
/// rules.
fn assert_same_verdicts(caps: &ProviderCapabilities, local: &RuleSet, remote: &RuleSet) {
    for packet in packets() {
        let default = caps.default_for(packet.direction);
        let want = evaluate(local.as_slice(), LOCAL_PRIORITY_ORDER, default, &packet);
        let got = evaluate(remote.as_slice(), caps.order, default, &packet);
        assert_eq!(want, got, "verdict for {:?} differs", packet);
    }
}

// =============================================================================
// Examples
// =============================================================================

#[test]
fn test_single_rule_on_lower_first_provider() {
    let caps = ProviderCapabilities::new(1, 100, PriorityOrder::LowerFirst);
    let local: RuleSet = vec![rule("in:allow tcp 22", 1)].into();

    let diff = compare_rules(&caps, &local, &RuleSet::new(), true, true).unwrap();
    assert_eq!(diff.in_adds.len(), 1);
    assert_eq!(diff.in_adds.as_slice()[0].priority, 1);
    assert!(diff.out_adds.is_empty());
    assert_eq!(diff.del_count(), 0);
}

#[test]
fn test_local_order_maps_to_provider_order() {
    let local: RuleSet = vec![
        rule("in:deny 10.0.0.0/8 tcp 22", 10),
        rule("in:allow tcp 1-1024", 5),
    ]
    .into();

    for provider in [Provider::OneCloud, Provider::Aliyun] {
        let caps = provider.capabilities();
        let diff = compare_rules(&caps, &local, &RuleSet::new(), true, true).unwrap();
        assert_eq!(diff.in_adds.len(), 2);
        let deny = &diff.in_adds.as_slice()[0];
        let allow = &diff.in_adds.as_slice()[1];
        assert_eq!(deny.action, Action::Deny);
        assert!(caps.order.precedes(deny.priority, allow.priority));
        assert_same_verdicts(&caps, &local, &diff.apply_to(&RuleSet::new()));
    }
}

#[test]
fn test_reordered_remote_is_repaired() {
    let caps = Provider::Huawei.capabilities();
    let local: RuleSet = vec![
        rule("in:deny 10.0.0.0/8 tcp 22", 10),
        rule("in:allow tcp 1-1024", 5),
    ]
    .into();
    // The remote evaluates the allow first, so the deny never matches
    let remote: RuleSet = vec![
        rule("in:allow tcp 1-1024", 1),
        rule("in:deny 10.0.0.0/8 tcp 22", 2),
    ]
    .into();

    let diff = compare_rules(&caps, &local, &remote, true, true).unwrap();
    let converged = diff.apply_to(&remote);
    assert_same_verdicts(&caps, &local, &converged);
    assert!(
        compare_rules(&caps, &local, &converged, true, true)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_outbound_deny_on_allow_default() {
    let caps = Provider::Aliyun.capabilities();
    let local: RuleSet = vec![rule("out:deny tcp 25", 1)].into();

    let diff = compare_rules(&caps, &local, &RuleSet::new(), true, true).unwrap();
    assert_eq!(diff.out_adds.len(), 1);
    assert_eq!(diff.out_adds.as_slice()[0].to_string(), "out:deny tcp 25");
    assert_same_verdicts(&caps, &local, &diff.apply_to(&RuleSet::new()));
}

// =============================================================================
// Properties
// =============================================================================

fn peer_strategy() -> impl Strategy<Value = Peer> {
    select(vec![
        "any",
        "10.0.0.0/8",
        "10.0.0.0/9",
        "10.128.0.0/9",
        "192.168.0.0/16",
    ])
    .prop_map(|p| p.parse::<Peer>().unwrap())
}

fn ports_strategy() -> impl Strategy<Value = Option<PortRange>> {
    prop_oneof![
        Just(None),
        Just(Some(PortRange::single(80))),
        (20u16..26, 0u16..3).prop_map(|(start, len)| Some(PortRange::new(start, start + len).unwrap())),
    ]
}

/// tcp/udp rules only, so no generated rule equals a provider default.
fn rule_strategy() -> impl Strategy<Value = Rule> {
    (
        select(Direction::ALL.to_vec()),
        select(vec![Action::Allow, Action::Deny]),
        select(vec![Protocol::Tcp, Protocol::Udp]),
        ports_strategy(),
        peer_strategy(),
        1i32..=5,
    )
        .prop_map(|(direction, action, protocol, ports, peer, priority)| {
            Rule::new(direction, action)
                .with_protocol(protocol, ports)
                .with_peer(peer)
                .with_priority(priority)
        })
}

fn rule_set_strategy(max: usize) -> impl Strategy<Value = RuleSet> {
    proptest::collection::vec(rule_strategy(), 0..max).prop_map(RuleSet::from)
}

fn provider_strategy() -> impl Strategy<Value = Provider> {
    select(vec![
        Provider::OneCloud,
        Provider::Aliyun,
        Provider::Azure,
        Provider::Huawei,
        Provider::Qcloud,
    ])
}

proptest! {
    #[test]
    fn set_diff_partitions_both_sides(
        local in proptest::collection::hash_set(any::<u8>(), 0..20),
        remote in proptest::collection::hash_set(any::<u8>(), 0..20),
    ) {
        let local: Vec<u8> = local.into_iter().collect();
        let remote: Vec<u8> = remote.into_iter().collect();
        let diff = compare_sets_by(local.clone(), remote.clone(), |k| *k, |k| *k).unwrap();

        prop_assert_eq!(&diff.common_local, &diff.common_remote);
        prop_assert_eq!(diff.removed.len() + diff.common_local.len(), local.len());
        prop_assert_eq!(diff.added.len() + diff.common_remote.len(), remote.len());

        let remote_keys: HashSet<u8> = remote.iter().copied().collect();
        let local_keys: HashSet<u8> = local.iter().copied().collect();
        prop_assert!(diff.removed.iter().all(|k| !remote_keys.contains(k)));
        prop_assert!(diff.added.iter().all(|k| !local_keys.contains(k)));
        prop_assert!(diff.common_local.iter().all(|k| remote_keys.contains(k)));

        // Common pairs follow the local order
        let positions: Vec<usize> = diff
            .common_local
            .iter()
            .filter_map(|k| local.iter().position(|l| l == k))
            .collect();
        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn second_compare_is_empty(
        provider in provider_strategy(),
        local in rule_set_strategy(8),
    ) {
        let caps = provider.capabilities();
        let diff = compare_rules(&caps, &local, &RuleSet::new(), true, true).unwrap();
        let remote = diff.apply_to(&RuleSet::new());

        let again = compare_rules(&caps, &local, &remote, true, true).unwrap();
        prop_assert!(again.is_empty(), "second pass not empty: {:?}", again);
        prop_assert_eq!(again.common.len(), remote.len());
    }

    #[test]
    fn same_inputs_give_same_diff(
        provider in select(Provider::ALL.to_vec()),
        local in rule_set_strategy(8),
        remote in rule_set_strategy(8),
        include_in in any::<bool>(),
        include_out in any::<bool>(),
    ) {
        let caps = provider.capabilities();
        let first = compare_rules(&caps, &local, &remote, include_in, include_out);
        let second = compare_rules(&caps, &local, &remote, include_in, include_out);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn applied_diff_matches_local_verdicts(
        provider in select(vec![Provider::OneCloud, Provider::Aliyun, Provider::Huawei]),
        local in rule_set_strategy(7),
        remote in rule_set_strategy(7),
    ) {
        let caps = provider.capabilities();
        let diff = compare_rules(&caps, &local, &remote, true, true).unwrap();
        let converged = diff.apply_to(&remote);

        for packet in packets() {
            let default = caps.default_for(packet.direction);
            let want = evaluate(local.as_slice(), LOCAL_PRIORITY_ORDER, default, &packet);
            let got = evaluate(converged.as_slice(), caps.order, default, &packet);
            prop_assert_eq!(want, got, "verdict for {:?} differs", packet);
        }
    }

    #[test]
    fn default_rules_are_never_deleted(
        local in rule_set_strategy(6),
        remote in rule_set_strategy(6),
        priority in 1i32..=100,
    ) {
        let caps = Provider::Aliyun.capabilities();
        let mut remote = remote;
        remote.push(Rule::new(Direction::In, Action::Deny).with_priority(priority));
        remote.push(Rule::new(Direction::Out, Action::Allow).with_priority(priority));

        let diff = compare_rules(&caps, &local, &remote, true, true).unwrap();
        for direction in Direction::ALL {
            let default_key = caps.default_for(direction).key();
            prop_assert!(diff.dels(direction).iter().all(|r| r.key() != default_key));
            prop_assert!(diff.adds(direction).iter().all(|r| r.key() != default_key));
        }
    }

    #[test]
    fn assigned_priorities_stay_in_bounds(
        provider in provider_strategy(),
        local in rule_set_strategy(8),
        remote in rule_set_strategy(8),
    ) {
        let caps = provider.capabilities();
        let diff = compare_rules(&caps, &local, &remote, true, true).unwrap();
        for direction in Direction::ALL {
            for rule in diff.adds(direction) {
                prop_assert!(rule.priority >= caps.min_priority);
                prop_assert!(rule.priority <= caps.max_priority);
                prop_assert_eq!(rule.direction, direction);
            }
        }
    }
}
