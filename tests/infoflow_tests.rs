// SPDX-FileCopyrightText: 2025 sepolicy-analyzer contributors
// SPDX-License-Identifier: MIT

use sepolicy_analyzer::{
    infoflow::{
        FLOW_BOTH, FLOW_IN, FLOW_OUT, FlowDirection, FlowGraph, FlowQuery, PathFinder
    },
    permmap::{PermDirection, PermMap},
    policy::{CondToken, Policy}
};

/// `allow u_t f_t:file { read write };` with read mapped R(w=5) and write
/// mapped W(w=3)
fn direct_policy() -> Policy {
    let mut b = Policy::builder();
    let u = b.add_type("u_t");
    let f = b.add_type("f_t");
    let read = b.add_perm("read");
    let write = b.add_perm("write");
    let file = b.add_class("file", &[read, write]);
    b.allow(u, f, file, &[read, write]);
    let mut policy = b.build().unwrap();

    let mut map = PermMap::new();
    map.set(file, read, PermDirection::Read, 5).unwrap();
    map.set(file, write, PermDirection::Write, 3).unwrap();
    policy.set_perm_map(map);
    policy
}

/// Three types with `a -> b` (length 2), `b -> c` (length 3) and a direct
/// `a -> c` (length 10):
///   allow b_t a_t:file read      (read weight 9)
///   allow b_t c_t:file write     (write weight 8)
///   allow c_t a_t:file audit     (read weight 1)
fn chain_policy() -> Policy {
    let mut b = Policy::builder();
    let a = b.add_type("a_t");
    let bb = b.add_type("b_t");
    let c = b.add_type("c_t");
    let read = b.add_perm("read");
    let write = b.add_perm("write");
    let audit = b.add_perm("audit_read");
    let file = b.add_class("file", &[read, write, audit]);
    b.allow(bb, a, file, &[read]);
    b.allow(bb, c, file, &[write]);
    b.allow(c, a, file, &[audit]);
    let mut policy = b.build().unwrap();

    let mut map = PermMap::new();
    map.set(file, read, PermDirection::Read, 9).unwrap();
    map.set(file, write, PermDirection::Write, 8).unwrap();
    map.set(file, audit, PermDirection::Read, 1).unwrap();
    policy.set_perm_map(map);
    policy
}

fn tid(policy: &Policy, name: &str) -> usize {
    policy.type_by_name(name).unwrap()
}

#[test]
fn test_direct_flow_both_directions() {
    let policy = direct_policy();
    let u = tid(&policy, "u_t");
    let f = tid(&policy, "f_t");
    let file = policy.class_by_name("file").unwrap();

    let query = FlowQuery::new(u, FlowDirection::Both);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    let flows = graph.direct_flows(&query);

    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.start_type, u);
    assert_eq!(flow.end_type, f);
    assert_eq!(flow.direction, FLOW_BOTH);
    assert_eq!(flow.obj_classes.len(), 1);
    assert_eq!(flow.obj_classes[0].class, file);
    assert_eq!(flow.obj_classes[0].rules, vec![0]);
}

#[test]
fn test_direct_flow_in_only() {
    let policy = direct_policy();
    let u = tid(&policy, "u_t");

    let query = FlowQuery::new(u, FlowDirection::In);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    let flows = graph.direct_flows(&query);

    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].direction, FLOW_IN);
}

#[test]
fn test_direct_flow_either_with_one_direction() {
    // write-only access flows out of the subject but never in
    let mut b = Policy::builder();
    let u = b.add_type("u_t");
    let f = b.add_type("f_t");
    let write = b.add_perm("write");
    let file = b.add_class("file", &[write]);
    b.allow(u, f, file, &[write]);
    let mut policy = b.build().unwrap();
    let mut map = PermMap::new();
    map.set(file, write, PermDirection::Write, 5).unwrap();
    policy.set_perm_map(map);

    let query = FlowQuery::new(u, FlowDirection::Either);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    let flows = graph.direct_flows(&query);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].direction, FLOW_OUT);

    // `Both` demands flows in both directions between the pair
    let query = FlowQuery::new(u, FlowDirection::Both);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    assert!(graph.direct_flows(&query).is_empty());
}

#[test]
fn test_direct_flow_end_type_filter() {
    let policy = chain_policy();
    let a = tid(&policy, "a_t");
    let bb = tid(&policy, "b_t");

    let mut query = FlowQuery::new(a, FlowDirection::Either);
    query.end_types = vec![bb];
    let graph = FlowGraph::build(&policy, &query).unwrap();
    let flows = graph.direct_flows(&query);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].end_type, bb);
}

#[test]
fn test_transitive_prefers_shorter_multi_hop_path() {
    let policy = chain_policy();
    let a = tid(&policy, "a_t");
    let bb = tid(&policy, "b_t");
    let c = tid(&policy, "c_t");

    let query = FlowQuery::new(a, FlowDirection::Out);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    let answer = graph.transitive_flows(&query).unwrap();

    assert_eq!(answer.start_type, a);
    let paths = answer.paths_for(c);
    assert!(!paths.is_empty());

    // the two-hop path of length 5 beats the direct length-10 edge
    assert_eq!(paths[0].length, 5);
    assert_eq!(paths[0].iflows.len(), 2);
    assert_eq!(paths[0].iflows[0].start_type, a);
    assert_eq!(paths[0].iflows[0].end_type, bb);
    assert_eq!(paths[0].iflows[1].start_type, bb);
    assert_eq!(paths[0].iflows[1].end_type, c);

    // b itself is reachable over the length-2 edge
    let b_paths = answer.paths_for(bb);
    assert_eq!(b_paths[0].length, 2);
}

#[test]
fn test_transitive_paths_sorted_by_length() {
    let policy = chain_policy();
    let a = tid(&policy, "a_t");
    let c = tid(&policy, "c_t");

    let query = FlowQuery::new(a, FlowDirection::Out);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    let answer = graph.transitive_flows(&query).unwrap();

    let paths = answer.paths_for(c);
    for pair in paths.windows(2) {
        assert!(pair[0].length <= pair[1].length);
    }
}

#[test]
fn test_transitive_rejects_both_direction() {
    let policy = direct_policy();
    let query = FlowQuery::new(tid(&policy, "u_t"), FlowDirection::Both);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    assert!(graph.transitive_flows(&query).is_err());
}

#[test]
fn test_missing_permission_map() {
    let mut b = Policy::builder();
    let u = b.add_type("u_t");
    let f = b.add_type("f_t");
    let read = b.add_perm("read");
    let file = b.add_class("file", &[read]);
    b.allow(u, f, file, &[read]);
    let policy = b.build().unwrap();

    let query = FlowQuery::new(u, FlowDirection::Out);
    assert!(FlowGraph::build(&policy, &query).is_err());
}

#[test]
fn test_min_weight_prunes_edges() {
    let policy = direct_policy();
    let u = tid(&policy, "u_t");

    // write has weight 3, so its length-8 edge exceeds max_len 6
    let mut query = FlowQuery::new(u, FlowDirection::Either);
    query.min_weight = 5;
    let graph = FlowGraph::build(&policy, &query).unwrap();
    assert_eq!(graph.num_edges(), 1);

    let flows = graph.direct_flows(&query);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].direction, FLOW_IN);
}

#[test]
fn test_duplicate_edges_keep_shorter_length() {
    // two rules granting write on the same pair with different weights
    let mut b = Policy::builder();
    let u = b.add_type("u_t");
    let f = b.add_type("f_t");
    let w_slow = b.add_perm("append");
    let w_fast = b.add_perm("write");
    let file = b.add_class("file", &[w_slow, w_fast]);
    b.allow(u, f, file, &[w_slow]);
    b.allow(u, f, file, &[w_fast]);
    let mut policy = b.build().unwrap();
    let mut map = PermMap::new();
    map.set(file, w_slow, PermDirection::Write, 3).unwrap();
    map.set(file, w_fast, PermDirection::Write, 9).unwrap();
    policy.set_perm_map(map);

    let f_id = f;
    let query = FlowQuery::new(u, FlowDirection::Out);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    assert_eq!(graph.num_edges(), 1);

    let answer = graph.transitive_flows(&query).unwrap();
    assert_eq!(answer.paths_for(f_id)[0].length, 2);
}

#[test]
fn test_conditional_rule_enablement() {
    let mut b = Policy::builder();
    let s = b.add_type("s_t");
    let t = b.add_type("t_t");
    let read = b.add_perm("read");
    let file = b.add_class("file", &[read]);
    let bool_b = b.add_bool("b", true);
    let cond = b.add_cond(&[CondToken::Bool(bool_b)]);
    b.allow_cond(s, t, file, &[read], cond, true);
    let mut policy = b.build().unwrap();
    let mut map = PermMap::new();
    map.set(file, read, PermDirection::Read, 5).unwrap();
    policy.set_perm_map(map);

    let query = FlowQuery::new(s, FlowDirection::In);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    assert_eq!(graph.num_edges(), 1);
    assert_eq!(graph.direct_flows(&query).len(), 1);

    // disabling the boolean excludes the rule at graph-build time
    policy.set_bool(bool_b, false);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    assert_eq!(graph.num_edges(), 0);
    assert!(graph.direct_flows(&query).is_empty());
}

#[test]
fn test_excluded_types_remove_intermediate() {
    let policy = chain_policy();
    let a = tid(&policy, "a_t");
    let bb = tid(&policy, "b_t");
    let c = tid(&policy, "c_t");

    let mut query = FlowQuery::new(a, FlowDirection::Out);
    query.excluded_types = vec![bb];
    let graph = FlowGraph::build(&policy, &query).unwrap();
    let answer = graph.transitive_flows(&query).unwrap();

    let paths = answer.paths_for(c);
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].length, 10);
}

#[test]
fn test_excluded_class_removes_all_edges() {
    let policy = direct_policy();
    let u = tid(&policy, "u_t");
    let file = policy.class_by_name("file").unwrap();

    let mut query = FlowQuery::new(u, FlowDirection::Either);
    query.excluded_classes = vec![sepolicy_analyzer::infoflow::ClassFilter {
        class: file,
        perms: Vec::new()
    }];
    let graph = FlowGraph::build(&policy, &query).unwrap();
    assert_eq!(graph.num_edges(), 0);
}

#[test]
fn test_path_finder_enumerates_distinct_paths() {
    let policy = chain_policy();
    let a = tid(&policy, "a_t");
    let c = tid(&policy, "c_t");

    let mut query = FlowQuery::new(a, FlowDirection::Out);
    query.end_types = vec![c];
    let mut finder = PathFinder::with_seed(&policy, query, 42).unwrap();

    let mut total = 0;
    for _ in 0..4 {
        total = finder.next_pass().unwrap();
    }
    assert_eq!(total, 2);

    let answer = finder.finish().unwrap();
    let paths = answer.paths_for(c);
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0].length, 5);
    assert_eq!(paths[1].length, 10);
}

#[test]
fn test_path_finder_deterministic_with_seed() {
    let policy = chain_policy();
    let a = tid(&policy, "a_t");
    let c = tid(&policy, "c_t");

    let mut totals = Vec::new();
    for _ in 0..2 {
        let mut query = FlowQuery::new(a, FlowDirection::Out);
        query.end_types = vec![c];
        let mut finder = PathFinder::with_seed(&policy, query, 7).unwrap();
        let mut run = Vec::new();
        for _ in 0..5 {
            run.push(finder.next_pass().unwrap());
        }
        totals.push(run);
    }
    assert_eq!(totals[0], totals[1]);
}

#[test]
fn test_path_finder_requires_exactly_one_end_type() {
    let policy = chain_policy();
    let a = tid(&policy, "a_t");

    let query = FlowQuery::new(a, FlowDirection::Out);
    assert!(PathFinder::with_seed(&policy, query, 1).is_err());

    let mut query = FlowQuery::new(a, FlowDirection::Out);
    query.end_types = vec![tid(&policy, "b_t"), tid(&policy, "c_t")];
    assert!(PathFinder::with_seed(&policy, query, 1).is_err());
}

#[test]
fn test_path_finder_abort() {
    let policy = chain_policy();
    let a = tid(&policy, "a_t");
    let c = tid(&policy, "c_t");

    let mut query = FlowQuery::new(a, FlowDirection::Out);
    query.end_types = vec![c];
    let mut finder = PathFinder::with_seed(&policy, query, 3).unwrap();
    finder.abort();
    assert!(finder.next_pass().is_err());
    assert!(finder.finish().is_err());
}

#[test]
fn test_invalid_query_start_type() {
    let policy = direct_policy();
    let query = FlowQuery::new(0, FlowDirection::Out);
    assert!(FlowGraph::build(&policy, &query).is_err());

    let query = FlowQuery::new(999, FlowDirection::Out);
    assert!(FlowGraph::build(&policy, &query).is_err());
}

#[test]
fn test_invalid_min_weight() {
    let policy = direct_policy();
    let mut query = FlowQuery::new(tid(&policy, "u_t"), FlowDirection::Out);
    query.min_weight = 0;
    assert!(FlowGraph::build(&policy, &query).is_err());
    query.min_weight = 11;
    assert!(FlowGraph::build(&policy, &query).is_err());
}

#[test]
fn test_negated_permission_set_inverts_directions() {
    // `allow u_t f_t:file ~{ write };` grants read, whose direction is
    // then flipped to a write flow
    let mut b = Policy::builder();
    let u = b.add_type("u_t");
    let f = b.add_type("f_t");
    let read = b.add_perm("read");
    let write = b.add_perm("write");
    let file = b.add_class("file", &[read, write]);
    b.av_rule(sepolicy_analyzer::policy::AvRule {
        kind:    sepolicy_analyzer::policy::RuleKind::Allow,
        src:     sepolicy_analyzer::policy::TypeSet::types(&[u]),
        tgt:     sepolicy_analyzer::policy::TypeSet::types(&[f]),
        classes: sepolicy_analyzer::policy::ClassSet::classes(&[file]),
        perms:   sepolicy_analyzer::policy::PermSet {
            perms: vec![write],
            complement: true,
            ..Default::default()
        },
        cond:    None
    });
    let mut policy = b.build().unwrap();
    let mut map = PermMap::new();
    map.set(file, read, PermDirection::Read, 5).unwrap();
    map.set(file, write, PermDirection::Write, 5).unwrap();
    policy.set_perm_map(map);

    let query = FlowQuery::new(u, FlowDirection::Either);
    let graph = FlowGraph::build(&policy, &query).unwrap();
    let flows = graph.direct_flows(&query);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].direction, FLOW_OUT);
}
