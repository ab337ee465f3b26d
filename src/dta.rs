//! Domain-transition analysis.
//!
//! A domain transition `(start, entrypoint, end)` is valid when the policy
//! allows `start` to transition to `end`, allows `end` to be entered through
//! the entrypoint file type, and allows `start` to execute that file. For
//! policies of version 15 or later the transition additionally needs either
//! a `setexec` permission on the starting domain or a `type_transition`
//! rule naming the end domain.
//!
//! The table precomputes, for every domain, the process-transition,
//! entrypoint, setexec and type-transition rules keyed by the other type,
//! and for every executable type the execute and entrypoint rules keyed by
//! the calling or entered domain. Lists are kept sorted by the keying type
//! so queries run on binary searches.
//!
//! Enumeration consumes per-entry `used` bits: successive queries against
//! the same table only report transitions not yet discovered, which lets a
//! caller compose several enumerations into one result set. Call
//! [`DtaTable::reset`] to start an independent session.

use regex::Regex;
use serde::Serialize;

use crate::{
    error::{AppResult, invalid_input_error, invalid_start_error},
    index::RuleIndex,
    policy::{ClassId, PermId, Policy, RuleId, RuleKind, RuleVec, TypeId}
};

/// Missing-rule bit: no `process transition` permission
pub const RULE_PROC_TRANS: u8 = 0x01;
/// Missing-rule bit: no `file execute` permission
pub const RULE_EXEC: u8 = 0x02;
/// Execute entries carrying `execute_no_trans` as well
pub const RULE_EXEC_NO_TRANS: u8 = 0x04;
/// Missing-rule bit: no `file entrypoint` permission
pub const RULE_ENTRYPOINT: u8 = 0x08;
/// Missing-rule bit: no `process type_transition` rule
pub const RULE_TYPE_TRANS: u8 = 0x10;
/// Missing-rule bit: no `process setexec` permission
pub const RULE_SETEXEC: u8 = 0x20;

/// Policy version from which a valid transition additionally requires
/// either a setexec permission or a type_transition rule
const SETEXEC_VERSION: u32 = 15;

/// Direction of a transition query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Forward,
    Reverse
}

/// Validity selector of a transition query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Validity {
    Valid,
    Invalid,
    Both
}

/// Object class with the permissions relevant to an access filter.
///
/// An empty permission list stands for the class's entire vocabulary.
#[derive(Debug, Clone, Serialize)]
pub struct ObjPermSet {
    pub class: ClassId,
    pub perms: Vec<PermId>
}

/// Parameters of a domain-transition query
#[derive(Debug, Clone)]
pub struct DtaQuery {
    pub start_type:     TypeId,
    pub direction:      Direction,
    pub validity:       Validity,
    /// Forward: retain only these end types; reverse: only these start types
    pub end_types:      Vec<TypeId>,
    /// Retain only end types with access to at least one of these types...
    pub access_types:   Vec<TypeId>,
    /// ...through at least one of these class/permission sets (forward only)
    pub access_classes: Vec<ObjPermSet>,
    /// Retain only result types whose name or alias matches
    pub result_regex:   Option<String>
}

impl DtaQuery {
    /// New query searching valid transitions only
    pub fn new(start_type: TypeId, direction: Direction) -> Self {
        Self {
            start_type,
            direction,
            validity: Validity::Valid,
            end_types: Vec::new(),
            access_types: Vec::new(),
            access_classes: Vec::new(),
            result_regex: None
        }
    }
}

/// A single (possibly incomplete) domain transition.
///
/// Invalid transitions leave the slots of their missing rules unset; a
/// forward transition always has a start and end type, while a reverse
/// enumeration may report dead entrypoints with no start.
#[derive(Debug, Clone, Serialize)]
pub struct DtaTransition {
    pub start_type:      Option<TypeId>,
    pub ep_type:         Option<TypeId>,
    pub end_type:        TypeId,
    pub proc_trans_rule: Option<RuleId>,
    pub ep_rule:         Option<RuleId>,
    pub exec_rule:       Option<RuleId>,
    pub setexec_rule:    Option<RuleId>,
    pub type_trans_rule: Option<RuleId>,
    pub valid:           bool,
    pub access_rules:    Vec<RuleId>
}

impl DtaTransition {
    fn new(end_type: TypeId) -> Self {
        Self {
            start_type: None,
            ep_type: None,
            end_type,
            proc_trans_rule: None,
            ep_rule: None,
            exec_rule: None,
            setexec_rule: None,
            type_trans_rule: None,
            valid: false,
            access_rules: Vec::new()
        }
    }

    /// Bitfield of the rules missing from this transition
    pub fn missing_rules(&self, v15: bool) -> u8 {
        let mut missing = 0;
        if self.proc_trans_rule.is_none() {
            missing |= RULE_PROC_TRANS;
        }
        if self.exec_rule.is_none() {
            missing |= RULE_EXEC;
        }
        if self.ep_rule.is_none() {
            missing |= RULE_ENTRYPOINT;
        }
        if v15 && self.type_trans_rule.is_none() && self.setexec_rule.is_none() {
            missing |= RULE_TYPE_TRANS | RULE_SETEXEC;
        }
        missing
    }
}

/// Rule-list entry keyed by the "other" type of the relation
#[derive(Debug, Clone)]
struct DtaRule {
    /// For domain lists the transition target or entrypoint type; for exec
    /// lists the entered or calling domain
    type_idx:     TypeId,
    /// Default type, only for type_transition entries
    dflt:         Option<TypeId>,
    rules:        RuleVec,
    used:         bool,
    has_no_trans: bool
}

#[derive(Debug, Clone, Default)]
struct DomNode {
    proc_trans: Vec<DtaRule>,
    ep:         Vec<DtaRule>,
    setexec:    Vec<DtaRule>,
    type_trans: Vec<DtaRule>
}

#[derive(Debug, Clone, Default)]
struct ExecNode {
    exec: Vec<DtaRule>,
    ep:   Vec<DtaRule>
}

fn find_rule(list: &[DtaRule], t: TypeId) -> Option<usize> {
    list.binary_search_by_key(&t, |r| r.type_idx).ok()
}

fn add_rule(list: &mut Vec<DtaRule>, t: TypeId, dflt: Option<TypeId>, rule: RuleId, no_trans: bool) {
    match list.binary_search_by_key(&t, |r| r.type_idx) {
        Ok(i) => {
            let entry = &mut list[i];
            if !entry.rules.contains(&rule) {
                entry.rules.push(rule);
            }
            if entry.dflt.is_none() {
                entry.dflt = dflt;
            }
            entry.has_no_trans |= no_trans;
        }
        Err(pos) => {
            let mut rules = RuleVec::new();
            rules.push(rule);
            list.insert(
                pos,
                DtaRule {
                    type_idx: t,
                    dflt,
                    rules,
                    used: false,
                    has_no_trans: no_trans
                }
            );
        }
    }
}

/// Precomputed per-type transition table
#[derive(Debug)]
pub struct DtaTable {
    dom:     Vec<DomNode>,
    exec:    Vec<ExecNode>,
    version: u32
}

impl DtaTable {
    /// Build the table in a single pass over the rule index
    pub fn build(policy: &Policy, index: &RuleIndex) -> AppResult<Self> {
        let size = policy.num_types();
        if size < 2 {
            return Err(invalid_input_error("policy view contains no types"));
        }

        let proc_cls = policy.class_by_name("process");
        let file_cls = policy.class_by_name("file");
        let chr_cls = policy.class_by_name("chr_file");
        let trans_p = policy.perm_by_name("transition");
        let exec_p = policy.perm_by_name("execute");
        let exec_nt_p = policy.perm_by_name("execute_no_trans");
        let ep_p = policy.perm_by_name("entrypoint");
        let setexec_p = policy.perm_by_name("setexec");

        let mut table = Self {
            dom:     vec![DomNode::default(); size],
            exec:    vec![ExecNode::default(); size],
            version: policy.policy_version()
        };

        for node in index.nodes() {
            let (src, tgt, class) = (node.key.src, node.key.tgt, node.key.class);
            match node.key.kind {
                RuleKind::Allow if Some(class) == proc_cls => {
                    if let Some(tp) = trans_p
                        && node.datum.perms().contains(&tp)
                    {
                        for origin in &node.origins {
                            let rule = &policy.av_rules()[origin.rule];
                            if policy.av_rule_uses_perm(rule, class, tp) {
                                add_rule(&mut table.dom[src].proc_trans, tgt, None, origin.rule, false);
                            }
                        }
                    }
                    if table.version >= SETEXEC_VERSION
                        && src == tgt
                        && let Some(sp) = setexec_p
                        && node.datum.perms().contains(&sp)
                    {
                        for origin in &node.origins {
                            let rule = &policy.av_rules()[origin.rule];
                            if policy.av_rule_uses_perm(rule, class, sp) {
                                add_rule(&mut table.dom[src].setexec, src, None, origin.rule, false);
                            }
                        }
                    }
                }
                RuleKind::Allow if Some(class) == file_cls || Some(class) == chr_cls => {
                    if let Some(ep) = ep_p
                        && node.datum.perms().contains(&ep)
                    {
                        for origin in &node.origins {
                            let rule = &policy.av_rules()[origin.rule];
                            if policy.av_rule_uses_perm(rule, class, ep) {
                                add_rule(&mut table.dom[src].ep, tgt, None, origin.rule, false);
                                add_rule(&mut table.exec[tgt].ep, src, None, origin.rule, false);
                            }
                        }
                    }
                    if let Some(xp) = exec_p
                        && node.datum.perms().contains(&xp)
                    {
                        let no_trans =
                            exec_nt_p.map(|p| node.datum.perms().contains(&p)).unwrap_or(false);
                        for origin in &node.origins {
                            let rule = &policy.av_rules()[origin.rule];
                            if policy.av_rule_uses_perm(rule, class, xp) {
                                add_rule(&mut table.exec[tgt].exec, src, None, origin.rule, no_trans);
                            }
                        }
                    }
                }
                RuleKind::Transition if Some(class) == proc_cls => {
                    let dflt = node.datum.default_type();
                    for origin in &node.origins {
                        add_rule(&mut table.dom[src].type_trans, tgt, dflt, origin.rule, false);
                    }
                }
                _ => {}
            }
        }

        Ok(table)
    }

    /// Number of type slots in the table
    pub fn size(&self) -> usize {
        self.dom.len()
    }

    /// Whether a domain's execute access on a file type also carries
    /// `execute_no_trans`.
    ///
    /// A domain with `execute_no_trans` does not need to transition but
    /// will if a valid transition exists; callers use this to tell plain
    /// execute access apart from a dangling transition attempt.
    pub fn exec_has_no_trans(&self, exec_type: TypeId, dom: TypeId) -> bool {
        self.exec
            .get(exec_type)
            .and_then(|node| find_rule(&node.exec, dom).map(|i| node.exec[i].has_no_trans))
            .unwrap_or(false)
    }

    /// Clear all `used` bits, starting a fresh enumeration session.
    ///
    /// Setexec entries never take the used bit.
    pub fn reset(&mut self) {
        for node in &mut self.dom {
            for r in &mut node.proc_trans {
                r.used = false;
            }
            for r in &mut node.type_trans {
                r.used = false;
            }
            for r in &mut node.ep {
                r.used = false;
            }
        }
        for node in &mut self.exec {
            for r in &mut node.exec {
                r.used = false;
            }
            for r in &mut node.ep {
                r.used = false;
            }
        }
    }

    /// Verify that a transition through the given triple would be permitted.
    ///
    /// Returns `0` when valid, or the bitwise-or of the missing-rule bits.
    /// For policies of version 15 or later a missing setexec/type_transition
    /// alternative reports both [`RULE_TYPE_TRANS`] and [`RULE_SETEXEC`],
    /// since either rule would complete the transition.
    pub fn verify(&self, start_dom: TypeId, ep_type: TypeId, end_dom: TypeId) -> AppResult<u8> {
        for t in [start_dom, ep_type, end_dom] {
            if t == 0 || t >= self.size() {
                return Err(invalid_input_error(format!("type id {} out of range", t)));
            }
        }

        let mut missing = 0;
        if find_rule(&self.dom[start_dom].proc_trans, end_dom).is_none() {
            missing |= RULE_PROC_TRANS;
        }
        if find_rule(&self.exec[ep_type].exec, start_dom).is_none() {
            missing |= RULE_EXEC;
        }
        if find_rule(&self.exec[ep_type].ep, end_dom).is_none() {
            missing |= RULE_ENTRYPOINT;
        }
        if self.version >= SETEXEC_VERSION {
            let has_tt = find_rule(&self.dom[start_dom].type_trans, ep_type)
                .is_some_and(|i| self.dom[start_dom].type_trans[i].dflt == Some(end_dom));
            let has_setexec = find_rule(&self.dom[start_dom].setexec, start_dom).is_some();
            if !has_tt && !has_setexec {
                missing |= RULE_TYPE_TRANS | RULE_SETEXEC;
            }
        }
        Ok(missing)
    }

    /// Run a transition query with its filters applied in order
    pub fn query(
        &mut self,
        policy: &Policy,
        index: &RuleIndex,
        query: &DtaQuery
    ) -> AppResult<Vec<DtaTransition>> {
        if !policy.is_valid_type(query.start_type) || query.start_type >= self.size() {
            return Err(invalid_start_error(query.start_type));
        }

        let mut trans = match query.direction {
            Direction::Forward => self.all_forward_transitions(query.start_type)?,
            Direction::Reverse => self.all_reverse_transitions(query.start_type)?
        };

        match query.validity {
            Validity::Valid => trans.retain(|t| t.valid),
            Validity::Invalid => trans.retain(|t| !t.valid),
            Validity::Both => {}
        }

        if !query.end_types.is_empty() {
            match query.direction {
                Direction::Forward => trans.retain(|t| query.end_types.contains(&t.end_type)),
                Direction::Reverse => trans.retain(|t| {
                    t.start_type.map(|s| query.end_types.contains(&s)).unwrap_or(false)
                })
            }
        }

        if !query.access_types.is_empty() && !query.access_classes.is_empty() {
            if query.direction == Direction::Reverse {
                return Err(invalid_input_error(
                    "Access filtering is only valid for forward transition analysis"
                ));
            }
            self.filter_access(policy, index, &mut trans, &query.access_types, &query.access_classes);
        }

        if let Some(pattern) = &query.result_regex {
            let re = Regex::new(pattern)
                .map_err(|e| invalid_input_error(format!("Invalid result regex: {}", e)))?;
            let matches = |t: Option<TypeId>| {
                t.and_then(|id| policy.type_(id)).is_some_and(|ty| {
                    re.is_match(&ty.name) || ty.aliases.iter().any(|a| re.is_match(a))
                })
            };
            match query.direction {
                Direction::Forward => trans.retain(|t| matches(Some(t.end_type))),
                Direction::Reverse => trans.retain(|t| matches(t.start_type))
            }
        }

        Ok(trans)
    }

    /// Enumerate all transitions out of `start`, valid or not.
    ///
    /// Entries already consumed by earlier calls (their `used` bits set) are
    /// not reported again.
    pub fn all_forward_transitions(&mut self, start: TypeId) -> AppResult<Vec<DtaTransition>> {
        if start == 0 || start >= self.size() {
            return Err(invalid_start_error(start));
        }

        let v15 = self.version >= SETEXEC_VERSION;
        let mut results = Vec::new();

        // confirm each type_transition rule first
        for i in 0..self.dom[start].type_trans.len() {
            if self.dom[start].type_trans[i].used {
                continue;
            }
            self.dom[start].type_trans[i].used = true;
            let ep = self.dom[start].type_trans[i].type_idx;
            let Some(end) = self.dom[start].type_trans[i].dflt else {
                continue;
            };
            let mut entry = DtaTransition::new(end);
            entry.start_type = Some(start);
            entry.ep_type = Some(ep);
            entry.type_trans_rule = Some(self.dom[start].type_trans[i].rules[0]);

            if let Some(j) = find_rule(&self.dom[start].proc_trans, end) {
                self.dom[start].proc_trans[j].used = true;
                entry.proc_trans_rule = Some(self.dom[start].proc_trans[j].rules[0]);
            }
            if let Some(j) = find_rule(&self.exec[ep].exec, start) {
                self.exec[ep].exec[j].used = true;
                entry.exec_rule = Some(self.exec[ep].exec[j].rules[0]);
            }
            if let Some(j) = find_rule(&self.exec[ep].ep, end) {
                self.exec[ep].ep[j].used = true;
                entry.ep_rule = Some(self.exec[ep].ep[j].rules[0]);
            }
            if let Some(j) = find_rule(&self.dom[start].setexec, start) {
                entry.setexec_rule = Some(self.dom[start].setexec[j].rules[0]);
            }

            entry.valid = entry.missing_rules(v15) == 0;
            results.push(entry);
        }

        // follow remaining process transition rules
        for i in 0..self.dom[start].proc_trans.len() {
            if self.dom[start].proc_trans[i].used {
                continue;
            }
            let end = self.dom[start].proc_trans[i].type_idx;
            if end == start {
                continue; // no transition occurs if start == end
            }
            self.dom[start].proc_trans[i].used = true;
            let pt_rule = self.dom[start].proc_trans[i].rules[0];

            let ep_count = self.dom[end].ep.len();
            for j in 0..ep_count {
                self.dom[end].ep[j].used = true;
                let ep = self.dom[end].ep[j].type_idx;
                let ep_rule = self.dom[end].ep[j].rules[0];
                // the mirrored exec-side entry exists for every entrypoint
                let Some(k) = find_rule(&self.exec[ep].ep, end) else {
                    continue;
                };
                if self.exec[ep].ep[k].used {
                    continue; // already found this transition
                }
                self.exec[ep].ep[k].used = true;

                let mut entry = DtaTransition::new(end);
                entry.start_type = Some(start);
                entry.ep_type = Some(ep);
                entry.proc_trans_rule = Some(pt_rule);
                entry.ep_rule = Some(ep_rule);
                if let Some(k) = find_rule(&self.exec[ep].exec, start) {
                    entry.exec_rule = Some(self.exec[ep].exec[k].rules[0]);
                }
                if let Some(k) = find_rule(&self.dom[start].setexec, start) {
                    entry.setexec_rule = Some(self.dom[start].setexec[k].rules[0]);
                }
                entry.valid = entry.missing_rules(v15) == 0;
                results.push(entry);
            }

            // no entrypoint at all: report the dangling transition permission
            if ep_count == 0 {
                let mut entry = DtaTransition::new(end);
                entry.start_type = Some(start);
                entry.proc_trans_rule = Some(pt_rule);
                results.push(entry);
            }
        }

        Ok(results)
    }

    /// Enumerate all transitions into `end`, valid or not.
    pub fn all_reverse_transitions(&mut self, end: TypeId) -> AppResult<Vec<DtaTransition>> {
        if end == 0 || end >= self.size() {
            return Err(invalid_start_error(end));
        }

        let v15 = self.version >= SETEXEC_VERSION;
        let mut results = Vec::new();

        // follow each entrypoint of end
        for i in 0..self.dom[end].ep.len() {
            let ep_seen = self.dom[end].ep[i].used;
            self.dom[end].ep[i].used = true;
            let ep = self.dom[end].ep[i].type_idx;
            let ep_rule = self.dom[end].ep[i].rules[0];
            let mut dead = self.exec[ep].exec.is_empty();

            for j in 0..self.exec[ep].exec.len() {
                let start = self.exec[ep].exec[j].type_idx;
                if start == end {
                    if self.exec[ep].exec.len() == 1 {
                        dead = true; // only executor is the end domain itself
                    }
                    continue;
                }
                if self.exec[ep].exec[j].used {
                    continue;
                }
                self.exec[ep].exec[j].used = true;

                let mut entry = DtaTransition::new(end);
                entry.start_type = Some(start);
                entry.ep_type = Some(ep);
                entry.ep_rule = Some(ep_rule);
                entry.exec_rule = Some(self.exec[ep].exec[j].rules[0]);

                if let Some(k) = find_rule(&self.dom[start].proc_trans, end) {
                    self.dom[start].proc_trans[k].used = true;
                    entry.proc_trans_rule = Some(self.dom[start].proc_trans[k].rules[0]);
                }
                if let Some(k) = find_rule(&self.dom[start].type_trans, ep)
                    && self.dom[start].type_trans[k].dflt == Some(end)
                {
                    self.dom[start].type_trans[k].used = true;
                    entry.type_trans_rule = Some(self.dom[start].type_trans[k].rules[0]);
                }
                if let Some(k) = find_rule(&self.dom[start].setexec, start) {
                    entry.setexec_rule = Some(self.dom[start].setexec[k].rules[0]);
                }

                entry.valid = entry.missing_rules(v15) == 0;
                results.push(entry);
            }

            if dead && !ep_seen {
                let mut entry = DtaTransition::new(end);
                entry.ep_type = Some(ep);
                entry.ep_rule = Some(ep_rule);
                results.push(entry);
            }
        }

        // report unused process transition and type_transition rules into end
        for start in 1..self.size() {
            if start == end {
                continue;
            }
            let pt = find_rule(&self.dom[start].proc_trans, end)
                .filter(|&j| !self.dom[start].proc_trans[j].used);
            let tt = self.dom[start]
                .type_trans
                .iter()
                .position(|r| r.dflt == Some(end))
                .filter(|&j| !self.dom[start].type_trans[j].used);
            if pt.is_none() && tt.is_none() {
                continue;
            }

            let mut entry = DtaTransition::new(end);
            entry.start_type = Some(start);
            if let Some(j) = pt {
                self.dom[start].proc_trans[j].used = true;
                entry.proc_trans_rule = Some(self.dom[start].proc_trans[j].rules[0]);
            }
            if let Some(j) = tt {
                self.dom[start].type_trans[j].used = true;
                entry.type_trans_rule = Some(self.dom[start].type_trans[j].rules[0]);
                let ep = self.dom[start].type_trans[j].type_idx;
                entry.ep_type = Some(ep);
                // the expected entrypoint type may still be executable
                if let Some(k) = find_rule(&self.exec[ep].exec, start) {
                    self.exec[ep].exec[k].used = true;
                    entry.exec_rule = Some(self.exec[ep].exec[k].rules[0]);
                }
            }
            if let Some(j) = find_rule(&self.dom[start].setexec, start) {
                entry.setexec_rule = Some(self.dom[start].setexec[j].rules[0]);
            }
            results.push(entry);
        }

        Ok(results)
    }

    fn filter_access(
        &self,
        policy: &Policy,
        index: &RuleIndex,
        trans: &mut Vec<DtaTransition>,
        access_types: &[TypeId],
        access_classes: &[ObjPermSet]
    ) {
        for t in trans.iter_mut() {
            let mut access: Vec<RuleId> = Vec::new();
            for node in index.nodes_by_src(t.end_type) {
                if node.key.kind != RuleKind::Allow || !access_types.contains(&node.key.tgt) {
                    continue;
                }
                for set in access_classes.iter().filter(|s| s.class == node.key.class) {
                    let class_perms = policy.class_perms(set.class);
                    let whole_class =
                        set.perms.is_empty() || set.perms.len() == class_perms.len();
                    if !whole_class && !node.datum.perms().iter().any(|p| set.perms.contains(p)) {
                        continue;
                    }
                    for origin in &node.origins {
                        let rule = &policy.av_rules()[origin.rule];
                        let uses = whole_class
                            || set.perms.iter().any(|&p| policy.av_rule_uses_perm(rule, set.class, p));
                        if uses && !access.contains(&origin.rule) {
                            access.push(origin.rule);
                        }
                    }
                    break; // index nodes carry a single class
                }
            }
            t.access_rules = access;
        }
        trans.retain(|t| !t.access_rules.is_empty());
    }
}
