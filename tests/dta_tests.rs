// SPDX-FileCopyrightText: 2025 sepolicy-analyzer contributors
// SPDX-License-Identifier: MIT

use sepolicy_analyzer::{
    config::AnalysisConfig,
    dta::{
        Direction, DtaQuery, DtaTable, ObjPermSet, RULE_ENTRYPOINT, RULE_EXEC, RULE_SETEXEC,
        RULE_TYPE_TRANS, Validity
    },
    index::RuleIndex,
    policy::{AvRule, ClassSet, PermSet, Policy, PolicyBuilder, RuleKind, TypeSet}
};

/// Scenario: `allow init_t getty_t:process transition; allow init_t
/// getty_exec_t:file execute; allow getty_t getty_exec_t:file entrypoint;
/// type_transition init_t getty_exec_t:process getty_t;`
fn simple_transition_builder() -> PolicyBuilder {
    let mut b = Policy::builder();
    let init = b.add_type("init_t");
    let getty = b.add_type("getty_t");
    let getty_exec = b.add_type("getty_exec_t");
    let transition = b.add_perm("transition");
    let execute = b.add_perm("execute");
    let entrypoint = b.add_perm("entrypoint");
    let setexec = b.add_perm("setexec");
    let process = b.add_class("process", &[transition, setexec]);
    let file = b.add_class("file", &[execute, entrypoint]);
    b.allow(init, getty, process, &[transition]);
    b.allow(init, getty_exec, file, &[execute]);
    b.allow(getty, getty_exec, file, &[entrypoint]);
    b.type_transition(init, getty_exec, process, getty);
    b
}

fn analyze(policy: &Policy) -> (RuleIndex, DtaTable) {
    let index = RuleIndex::build(policy, &AnalysisConfig::default()).unwrap();
    let table = DtaTable::build(policy, &index).unwrap();
    (index, table)
}

fn type_id(policy: &Policy, name: &str) -> usize {
    policy.type_by_name(name).unwrap()
}

#[test]
fn test_simple_transition_forward() {
    let policy = simple_transition_builder().build().unwrap();
    let (index, mut table) = analyze(&policy);
    let init = type_id(&policy, "init_t");

    let query = DtaQuery::new(init, Direction::Forward);
    let trans = table.query(&policy, &index, &query).unwrap();

    assert_eq!(trans.len(), 1);
    let t = &trans[0];
    assert!(t.valid);
    assert_eq!(t.start_type, Some(init));
    assert_eq!(t.ep_type, Some(type_id(&policy, "getty_exec_t")));
    assert_eq!(t.end_type, type_id(&policy, "getty_t"));
    assert!(t.proc_trans_rule.is_some());
    assert!(t.ep_rule.is_some());
    assert!(t.exec_rule.is_some());
    assert!(t.type_trans_rule.is_some());
    assert!(t.setexec_rule.is_none());
}

#[test]
fn test_verify_valid_transition() {
    let policy = simple_transition_builder().build().unwrap();
    let (_, table) = analyze(&policy);
    let init = type_id(&policy, "init_t");
    let getty = type_id(&policy, "getty_t");
    let getty_exec = type_id(&policy, "getty_exec_t");

    assert_eq!(table.verify(init, getty_exec, getty).unwrap(), 0);
}

#[test]
fn test_missing_entrypoint() {
    // scenario 1 without `allow getty_t getty_exec_t:file entrypoint`
    let mut b = Policy::builder();
    let init = b.add_type("init_t");
    let getty = b.add_type("getty_t");
    let getty_exec = b.add_type("getty_exec_t");
    let transition = b.add_perm("transition");
    let execute = b.add_perm("execute");
    b.add_perm("entrypoint");
    let process = b.add_class("process", &[transition]);
    let file = b.add_class("file", &[execute]);
    b.allow(init, getty, process, &[transition]);
    b.allow(init, getty_exec, file, &[execute]);
    b.type_transition(init, getty_exec, process, getty);
    let policy = b.build().unwrap();
    let (index, mut table) = analyze(&policy);

    assert_eq!(table.verify(init, getty_exec, getty).unwrap(), RULE_ENTRYPOINT);

    let mut query = DtaQuery::new(init, Direction::Forward);
    query.validity = Validity::Invalid;
    let trans = table.query(&policy, &index, &query).unwrap();
    assert_eq!(trans.len(), 1);
    assert!(!trans[0].valid);
    assert!(trans[0].ep_rule.is_none());
    assert!(trans[0].proc_trans_rule.is_some());
}

#[test]
fn test_verify_reports_all_missing_rules() {
    let mut b = Policy::builder();
    let init = b.add_type("init_t");
    let getty = b.add_type("getty_t");
    let getty_exec = b.add_type("getty_exec_t");
    let transition = b.add_perm("transition");
    let process = b.add_class("process", &[transition]);
    b.allow(init, getty, process, &[transition]);
    b.type_transition(init, getty_exec, process, getty);
    let policy = b.build().unwrap();
    let (_, table) = analyze(&policy);

    let missing = table.verify(init, getty_exec, getty).unwrap();
    assert_eq!(missing, RULE_EXEC | RULE_ENTRYPOINT);
}

#[test]
fn test_version_15_requires_setexec_or_type_transition() {
    // the three allow rules alone no longer make a valid transition
    let mut b = Policy::builder();
    let init = b.add_type("init_t");
    let getty = b.add_type("getty_t");
    let getty_exec = b.add_type("getty_exec_t");
    let transition = b.add_perm("transition");
    let execute = b.add_perm("execute");
    let entrypoint = b.add_perm("entrypoint");
    let process = b.add_class("process", &[transition]);
    let file = b.add_class("file", &[execute, entrypoint]);
    b.allow(init, getty, process, &[transition]);
    b.allow(init, getty_exec, file, &[execute]);
    b.allow(getty, getty_exec, file, &[entrypoint]);
    let policy = b.build().unwrap();
    let (index, mut table) = analyze(&policy);

    let missing = table.verify(init, getty_exec, getty).unwrap();
    assert_eq!(missing, RULE_TYPE_TRANS | RULE_SETEXEC);

    let mut query = DtaQuery::new(init, Direction::Forward);
    query.validity = Validity::Both;
    let trans = table.query(&policy, &index, &query).unwrap();
    assert_eq!(trans.len(), 1);
    assert!(!trans[0].valid);
}

#[test]
fn test_pre_15_policy_needs_no_setexec() {
    let mut b = Policy::builder();
    b.version(12);
    let init = b.add_type("init_t");
    let getty = b.add_type("getty_t");
    let getty_exec = b.add_type("getty_exec_t");
    let transition = b.add_perm("transition");
    let execute = b.add_perm("execute");
    let entrypoint = b.add_perm("entrypoint");
    let process = b.add_class("process", &[transition]);
    let file = b.add_class("file", &[execute, entrypoint]);
    b.allow(init, getty, process, &[transition]);
    b.allow(init, getty_exec, file, &[execute]);
    b.allow(getty, getty_exec, file, &[entrypoint]);
    let policy = b.build().unwrap();
    let (_, table) = analyze(&policy);

    assert_eq!(table.verify(init, getty_exec, getty).unwrap(), 0);
}

#[test]
fn test_setexec_satisfies_version_15() {
    let mut b = Policy::builder();
    let init = b.add_type("init_t");
    let getty = b.add_type("getty_t");
    let getty_exec = b.add_type("getty_exec_t");
    let transition = b.add_perm("transition");
    let execute = b.add_perm("execute");
    let entrypoint = b.add_perm("entrypoint");
    let setexec = b.add_perm("setexec");
    let process = b.add_class("process", &[transition, setexec]);
    let file = b.add_class("file", &[execute, entrypoint]);
    b.allow(init, getty, process, &[transition]);
    b.allow(init, getty_exec, file, &[execute]);
    b.allow(getty, getty_exec, file, &[entrypoint]);
    b.allow_self(init, process, &[setexec]);
    let policy = b.build().unwrap();
    let (index, mut table) = analyze(&policy);

    assert_eq!(table.verify(init, getty_exec, getty).unwrap(), 0);

    let query = DtaQuery::new(init, Direction::Forward);
    let trans = table.query(&policy, &index, &query).unwrap();
    assert_eq!(trans.len(), 1);
    assert!(trans[0].valid);
    assert!(trans[0].setexec_rule.is_some());
    assert!(trans[0].type_trans_rule.is_none());
}

#[test]
fn test_reverse_transition() {
    let policy = simple_transition_builder().build().unwrap();
    let (index, mut table) = analyze(&policy);
    let getty = type_id(&policy, "getty_t");

    let query = DtaQuery::new(getty, Direction::Reverse);
    let trans = table.query(&policy, &index, &query).unwrap();

    assert_eq!(trans.len(), 1);
    let t = &trans[0];
    assert!(t.valid);
    assert_eq!(t.start_type, Some(type_id(&policy, "init_t")));
    assert_eq!(t.ep_type, Some(type_id(&policy, "getty_exec_t")));
    assert_eq!(t.end_type, getty);
    assert!(t.type_trans_rule.is_some());
}

#[test]
fn test_reverse_reports_dangling_transition_permission() {
    // a process-transition permission into end with no executable path
    let mut b = Policy::builder();
    let init = b.add_type("init_t");
    let getty = b.add_type("getty_t");
    let transition = b.add_perm("transition");
    let process = b.add_class("process", &[transition]);
    b.allow(init, getty, process, &[transition]);
    let policy = b.build().unwrap();
    let (index, mut table) = analyze(&policy);

    let mut query = DtaQuery::new(getty, Direction::Reverse);
    query.validity = Validity::Invalid;
    let trans = table.query(&policy, &index, &query).unwrap();
    assert_eq!(trans.len(), 1);
    assert_eq!(trans[0].start_type, Some(init));
    assert!(trans[0].proc_trans_rule.is_some());
    assert!(trans[0].ep_rule.is_none());
}

#[test]
fn test_used_bits_compose_until_reset() {
    let policy = simple_transition_builder().build().unwrap();
    let (index, mut table) = analyze(&policy);
    let init = type_id(&policy, "init_t");
    let query = DtaQuery::new(init, Direction::Forward);

    let first = table.query(&policy, &index, &query).unwrap();
    assert_eq!(first.len(), 1);

    // without a reset the same transition is not reported again
    let second = table.query(&policy, &index, &query).unwrap();
    assert!(second.is_empty());

    table.reset();
    let third = table.query(&policy, &index, &query).unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].end_type, first[0].end_type);
}

#[test]
fn test_attribute_sources_are_expanded() {
    let mut b = Policy::builder();
    b.version(12);
    let a = b.add_type("a_t");
    let c = b.add_type("c_t");
    let end = b.add_type("end_t");
    let exec_t = b.add_type("exec_t");
    let domain = b.add_attribute("domain", &[a, c]);
    let transition = b.add_perm("transition");
    let execute = b.add_perm("execute");
    let entrypoint = b.add_perm("entrypoint");
    let process = b.add_class("process", &[transition]);
    let file = b.add_class("file", &[execute, entrypoint]);
    b.av_rule(AvRule {
        kind:    RuleKind::Allow,
        src:     TypeSet::attr(domain),
        tgt:     TypeSet::types(&[end]),
        classes: ClassSet::classes(&[process]),
        perms:   PermSet::perms(&[transition]),
        cond:    None
    });
    b.av_rule(AvRule {
        kind:    RuleKind::Allow,
        src:     TypeSet::attr(domain),
        tgt:     TypeSet::types(&[exec_t]),
        classes: ClassSet::classes(&[file]),
        perms:   PermSet::perms(&[execute]),
        cond:    None
    });
    b.allow(end, exec_t, file, &[entrypoint]);
    let policy = b.build().unwrap();
    let (_, table) = analyze(&policy);

    assert_eq!(table.verify(a, exec_t, end).unwrap(), 0);
    assert_eq!(table.verify(c, exec_t, end).unwrap(), 0);
}

#[test]
fn test_end_type_filter() {
    let policy = simple_transition_builder().build().unwrap();
    let (index, mut table) = analyze(&policy);
    let init = type_id(&policy, "init_t");
    let getty = type_id(&policy, "getty_t");

    let mut query = DtaQuery::new(init, Direction::Forward);
    query.end_types = vec![getty];
    assert_eq!(table.query(&policy, &index, &query).unwrap().len(), 1);

    table.reset();
    query.end_types = vec![type_id(&policy, "getty_exec_t")];
    assert!(table.query(&policy, &index, &query).unwrap().is_empty());
}

#[test]
fn test_access_filter() {
    let mut b = simple_transition_builder();
    let tty = b.add_type("tty_device_t");
    let read = b.add_perm("read");
    let write = b.add_perm("write");
    let chr_file = b.add_class("chr_file", &[read, write]);
    let getty = 2; // second type added by the fixture
    let access_rule = b.allow(getty, tty, chr_file, &[read]);
    let policy = b.build().unwrap();
    let (index, mut table) = analyze(&policy);
    let init = type_id(&policy, "init_t");

    let mut query = DtaQuery::new(init, Direction::Forward);
    query.access_types = vec![tty];
    query.access_classes = vec![ObjPermSet {
        class: chr_file,
        perms: vec![read]
    }];
    let trans = table.query(&policy, &index, &query).unwrap();
    assert_eq!(trans.len(), 1);
    assert_eq!(trans[0].access_rules, vec![access_rule]);

    // requesting a permission the end type does not have filters it out
    table.reset();
    query.access_classes = vec![ObjPermSet {
        class: chr_file,
        perms: vec![write]
    }];
    assert!(table.query(&policy, &index, &query).unwrap().is_empty());
}

#[test]
fn test_access_filter_rejected_for_reverse() {
    let policy = simple_transition_builder().build().unwrap();
    let (index, mut table) = analyze(&policy);
    let getty = type_id(&policy, "getty_t");

    let mut query = DtaQuery::new(getty, Direction::Reverse);
    query.access_types = vec![getty];
    query.access_classes = vec![ObjPermSet {
        class: 0,
        perms: vec![]
    }];
    assert!(table.query(&policy, &index, &query).is_err());
}

#[test]
fn test_result_regex_filter() {
    let policy = simple_transition_builder().build().unwrap();
    let (index, mut table) = analyze(&policy);
    let init = type_id(&policy, "init_t");

    let mut query = DtaQuery::new(init, Direction::Forward);
    query.result_regex = Some("getty.*".to_string());
    assert_eq!(table.query(&policy, &index, &query).unwrap().len(), 1);

    table.reset();
    query.result_regex = Some("^nomatch$".to_string());
    assert!(table.query(&policy, &index, &query).unwrap().is_empty());

    table.reset();
    query.result_regex = Some("[invalid".to_string());
    assert!(table.query(&policy, &index, &query).is_err());
}

#[test]
fn test_invalid_start_type() {
    let policy = simple_transition_builder().build().unwrap();
    let (index, mut table) = analyze(&policy);

    let query = DtaQuery::new(0, Direction::Forward);
    assert!(table.query(&policy, &index, &query).is_err());

    let query = DtaQuery::new(999, Direction::Forward);
    assert!(table.query(&policy, &index, &query).is_err());

    assert!(table.verify(0, 1, 2).is_err());
}

#[test]
fn test_execute_no_trans_tracked() {
    let mut b = Policy::builder();
    let init = b.add_type("init_t");
    let exec_t = b.add_type("exec_t");
    let other = b.add_type("other_t");
    let execute = b.add_perm("execute");
    let execute_no_trans = b.add_perm("execute_no_trans");
    let file = b.add_class("file", &[execute, execute_no_trans]);
    b.allow(init, exec_t, file, &[execute, execute_no_trans]);
    b.allow(other, exec_t, file, &[execute]);
    let policy = b.build().unwrap();
    let (_, table) = analyze(&policy);

    assert!(table.exec_has_no_trans(exec_t, init));
    assert!(!table.exec_has_no_trans(exec_t, other));
}
