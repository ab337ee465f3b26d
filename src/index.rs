//! Semantic rule index.
//!
//! The index expands every access-vector and type rule of a policy into its
//! canonical `(kind, source, target, class)` keys and merges duplicates, so
//! rule questions become indexed lookups instead of scans over the rule
//! lists. Attributes, wildcards, negations and `self` targets are expanded
//! at build time; `neverallow` rules are excluded since they grant nothing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Policy view │────▶│  RuleIndex   │────▶│ DTA / IF     │
//! │ (av + te)   │     │  (canonical) │     │ engines      │
//! └─────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! Nodes live in an arena; hash buckets hold arena indices ordered by
//! `(src, tgt, class, kind)` so all nodes sharing a key sit adjacent. A key
//! may map to several nodes distinguished only by conditional annotation:
//! an unconditional node, or nodes belonging to conditional expressions.
//! For type rules at most two same-keyed nodes are permitted — one
//! unconditional, or two from the same conditional on opposite branches;
//! other duplicates are dropped with a warning.
//!
//! Boolean state is not baked into the index: a node stores its conditional
//! annotation and [`RuleIndex::enabled`] derives liveness from the policy's
//! current boolean states, so flipping a boolean never requires a rebuild.

use std::sync::OnceLock;

use serde::Serialize;

use crate::{
    config::AnalysisConfig,
    error::{AppResult, inconsistent_policy_error},
    policy::{
        AvRule, ClassId, CondRef, PermId, Policy, RuleId, RuleKind, SELF_TYPE, TeRule, TypeId
    }
};

/// Canonical key of an index node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RuleKey {
    pub kind:  RuleKind,
    pub src:   TypeId,
    pub tgt:   TypeId,
    pub class: ClassId
}

impl RuleKey {
    /// Bucket ordering: source, then target, then class, then kind
    fn order(&self) -> (TypeId, TypeId, ClassId, RuleKind) {
        (self.src, self.tgt, self.class, self.kind)
    }
}

/// Payload of an index node: a permission set for access-vector kinds or a
/// single default type for type-rule kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RuleDatum {
    Perms(Vec<PermId>),
    Default(TypeId)
}

impl RuleDatum {
    /// Permission list of an access-vector node (empty for type nodes)
    pub fn perms(&self) -> &[PermId] {
        match self {
            Self::Perms(p) => p,
            Self::Default(_) => &[]
        }
    }

    /// Default type of a type-rule node
    pub fn default_type(&self) -> Option<TypeId> {
        match self {
            Self::Perms(_) => None,
            Self::Default(t) => Some(*t)
        }
    }
}

/// Originating source rule of an index node.
///
/// The node's rule kind determines which rule table the id refers to.
/// `hint` carries caller-defined bits (e.g. whether the rule contributed
/// read or write flows).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RuleOrigin {
    pub rule: RuleId,
    pub hint: u8
}

/// A canonical rule instance
#[derive(Debug, Clone, Serialize)]
pub struct RuleNode {
    pub key:     RuleKey,
    pub datum:   RuleDatum,
    pub origins: Vec<RuleOrigin>,
    pub cond:    Option<CondRef>
}

/// Non-fatal findings produced while building the index
#[derive(Debug, Clone, Serialize)]
pub enum IndexWarning {
    /// A conditional type rule collided with an incompatible same-key rule
    /// and was dropped (compiler-order semantics keep the earlier rule)
    ConflictingCondTypeRule {
        key:  RuleKey,
        rule: RuleId
    }
}

impl std::fmt::Display for IndexWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConflictingCondTypeRule {
                key,
                rule
            } => {
                write!(
                    f,
                    "conflicting conditional {} rule {} for ({}, {}, {}); skipped",
                    key.kind, rule, key.src, key.tgt, key.class
                )
            }
        }
    }
}

/// Bucket occupancy summary
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IndexStats {
    pub entries:      usize,
    pub buckets:      usize,
    pub used_buckets: usize,
    pub max_chain:    usize
}

/// Canonical, deduplicated index over a policy's av and type rules
#[derive(Debug)]
pub struct RuleIndex {
    nodes:     Vec<RuleNode>,
    buckets:   Vec<Vec<usize>>,
    mask:      usize,
    num_types: usize,
    warnings:  Vec<IndexWarning>,
    by_src:    OnceLock<Vec<Vec<usize>>>,
    by_tgt:    OnceLock<Vec<Vec<usize>>>
}

impl RuleIndex {
    /// Build the index from a policy view
    ///
    /// # Notes
    ///
    /// - `neverallow` rules are skipped; they expand enormously and grant
    ///   no permissions
    /// - Audit rules are indexed alongside access rules under their own
    ///   kinds
    pub fn build(policy: &Policy, config: &AnalysisConfig) -> AppResult<Self> {
        let buckets = 1usize << config.index.hash_bits;
        let mut index = Self {
            nodes:     Vec::new(),
            buckets:   vec![Vec::new(); buckets],
            mask:      buckets - 1,
            num_types: policy.num_types(),
            warnings:  Vec::new(),
            by_src:    OnceLock::new(),
            by_tgt:    OnceLock::new()
        };

        for (id, rule) in policy.av_rules().iter().enumerate() {
            index.load_av_rule(policy, id, rule)?;
        }
        for (id, rule) in policy.av_audit_rules().iter().enumerate() {
            index.load_av_rule(policy, id, rule)?;
        }
        for (id, rule) in policy.te_rules().iter().enumerate() {
            index.load_te_rule(policy, id, rule)?;
        }

        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: usize) -> &RuleNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RuleNode> {
        self.nodes.iter()
    }

    pub fn warnings(&self) -> &[IndexWarning] {
        &self.warnings
    }

    /// First node matching the key, if any.
    ///
    /// Further same-key nodes (conditional variants) are reachable through
    /// [`RuleIndex::lookup`].
    pub fn find_first(&self, key: &RuleKey) -> Option<&RuleNode> {
        self.lookup(*key).next()
    }

    /// All nodes matching the key across conditional variants
    pub fn lookup(&self, key: RuleKey) -> impl Iterator<Item = &RuleNode> {
        self.buckets[self.hash(&key)]
            .iter()
            .map(|&id| &self.nodes[id])
            .filter(move |n| n.key == key)
    }

    /// Whether a node is live under the policy's current boolean states
    pub fn enabled(&self, node: &RuleNode, policy: &Policy) -> bool {
        policy.cond_enabled(node.cond)
    }

    /// Ids of nodes where the type occurs as source (built lazily)
    pub fn by_src_type(&self, t: TypeId) -> &[usize] {
        let table = self.by_src.get_or_init(|| {
            let mut table = vec![Vec::new(); self.num_types];
            for (id, node) in self.nodes.iter().enumerate() {
                if node.key.src < table.len() {
                    table[node.key.src].push(id);
                }
            }
            table
        });
        table.get(t).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Ids of nodes where the type occurs as target (built lazily)
    pub fn by_tgt_type(&self, t: TypeId) -> &[usize] {
        let table = self.by_tgt.get_or_init(|| {
            let mut table = vec![Vec::new(); self.num_types];
            for (id, node) in self.nodes.iter().enumerate() {
                if node.key.tgt < table.len() {
                    table[node.key.tgt].push(id);
                }
            }
            table
        });
        table.get(t).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Nodes where the type occurs as source
    pub fn nodes_by_src(&self, t: TypeId) -> impl Iterator<Item = &RuleNode> {
        self.by_src_type(t).iter().map(|&id| &self.nodes[id])
    }

    /// Nodes where the type occurs as target
    pub fn nodes_by_tgt(&self, t: TypeId) -> impl Iterator<Item = &RuleNode> {
        self.by_tgt_type(t).iter().map(|&id| &self.nodes[id])
    }

    /// Bucket occupancy summary
    pub fn stats(&self) -> IndexStats {
        let mut used = 0;
        let mut max_chain = 0;
        for bucket in &self.buckets {
            if !bucket.is_empty() {
                used += 1;
                max_chain = max_chain.max(bucket.len());
            }
        }
        IndexStats {
            entries:      self.nodes.len(),
            buckets:      self.buckets.len(),
            used_buckets: used,
            max_chain
        }
    }

    fn hash(&self, key: &RuleKey) -> usize {
        (key.class.wrapping_add(key.tgt << 2).wrapping_add(key.src << 9)) & self.mask
    }

    /// Find the node matching key and conditional annotation, or create it.
    ///
    /// Two nodes share a key only when their conditional annotations differ;
    /// an exact `(expression, branch)` match is the same node.
    pub fn insert(&mut self, key: RuleKey, cond: Option<CondRef>) -> usize {
        let hash = self.hash(&key);
        let mut insert_at = self.buckets[hash].len();
        for (pos, &id) in self.buckets[hash].iter().enumerate() {
            let node = &self.nodes[id];
            if node.key == key && node.cond == cond {
                return id;
            }
            if node.key.order() > key.order() {
                insert_at = pos;
                break;
            }
        }

        let datum = if key.kind.is_av() {
            RuleDatum::Perms(Vec::new())
        } else {
            RuleDatum::Default(SELF_TYPE)
        };
        let id = self.nodes.len();
        self.nodes.push(RuleNode {
            key,
            datum,
            origins: Vec::new(),
            cond
        });
        self.buckets[hash].insert(insert_at, id);
        id
    }

    /// Add a permission to an access-vector node or replace a type node's
    /// default type.
    ///
    /// # Notes
    ///
    /// - Permissions are deduplicated
    /// - Type rules carry a single default; the later value wins, matching
    ///   compiler-order semantics for source policies
    pub fn add_datum(&mut self, node: usize, value: usize) {
        match &mut self.nodes[node].datum {
            RuleDatum::Perms(perms) => {
                if !perms.contains(&value) {
                    perms.push(value);
                }
            }
            RuleDatum::Default(dflt) => {
                *dflt = value;
            }
        }
    }

    /// Record a source rule contributing to a node
    pub fn add_provenance(&mut self, node: usize, rule: RuleId, hint: u8) {
        let origins = &mut self.nodes[node].origins;
        if origins.last().map(|o| o.rule) != Some(rule) {
            origins.push(RuleOrigin {
                rule,
                hint
            });
        }
    }

    /// Target-side expansion for one source type: the expanded target set
    /// plus the source itself when the rule names `self`
    fn tgt_list_for_src(base: &[TypeId], self_ref: bool, src: TypeId) -> Vec<TypeId> {
        let mut tgts = base.to_vec();
        if self_ref && !tgts.contains(&src) {
            tgts.push(src);
        }
        tgts
    }

    fn check_bounds(&self, policy: &Policy, src: TypeId, tgt: TypeId, class: ClassId) -> AppResult<()> {
        if !policy.is_valid_type(src) || !policy.is_valid_type(tgt) {
            return Err(inconsistent_policy_error(format!(
                "rule expansion produced out-of-range type ({}, {})",
                src, tgt
            )));
        }
        if class >= policy.num_classes() {
            return Err(inconsistent_policy_error(format!(
                "rule expansion produced out-of-range class {}",
                class
            )));
        }
        Ok(())
    }

    fn load_av_rule(&mut self, policy: &Policy, rule_id: RuleId, rule: &AvRule) -> AppResult<()> {
        if rule.kind == RuleKind::Neverallow {
            return Ok(());
        }

        let src_list = policy.expand_type_set(&rule.src);
        let tgt_base = policy.expand_type_set(&rule.tgt);
        let classes: Vec<(ClassId, Vec<PermId>)> = policy
            .expand_class_set(&rule.classes)
            .into_iter()
            .map(|c| (c, policy.expand_perm_set(&rule.perms, c)))
            .collect();

        for &src in &src_list {
            let tgts = Self::tgt_list_for_src(&tgt_base, rule.tgt.self_ref, src);
            for &tgt in &tgts {
                for (class, perms) in &classes {
                    self.check_bounds(policy, src, tgt, *class)?;
                    let key = RuleKey {
                        kind: rule.kind,
                        src,
                        tgt,
                        class: *class
                    };
                    let node = self.insert(key, rule.cond);
                    for &perm in perms {
                        if perm >= policy.num_perms() {
                            return Err(inconsistent_policy_error(format!(
                                "rule {} grants unknown permission {}",
                                rule_id, perm
                            )));
                        }
                        self.add_datum(node, perm);
                    }
                    self.add_provenance(node, rule_id, 0);
                }
            }
        }
        Ok(())
    }

    /// Whether a conditional/unconditional type rule may enter the index
    /// for a key given the nodes already present.
    ///
    /// Type rules permit at most two same-keyed nodes: a single
    /// unconditional node, or two nodes of the same conditional expression
    /// on opposite branches.
    fn te_key_admissible(&self, key: &RuleKey, cond: Option<CondRef>) -> bool {
        for node in self.lookup(*key) {
            match (node.cond, cond) {
                // merging with an identical annotation is always allowed
                (a, b) if a == b => return true,
                (None, Some(_)) | (Some(_), None) => return false,
                (Some(existing), Some(new)) => {
                    if existing.expr != new.expr {
                        return false;
                    }
                }
                (None, None) => unreachable!()
            }
        }
        true
    }

    fn load_te_rule(&mut self, policy: &Policy, rule_id: RuleId, rule: &TeRule) -> AppResult<()> {
        let src_list = policy.expand_type_set(&rule.src);
        let tgt_base = policy.expand_type_set(&rule.tgt);
        let classes = policy.expand_class_set(&rule.classes);

        if !policy.is_valid_type(rule.default_type) {
            return Err(inconsistent_policy_error(format!(
                "type rule {} has invalid default type {}",
                rule_id, rule.default_type
            )));
        }

        for &src in &src_list {
            let tgts = Self::tgt_list_for_src(&tgt_base, rule.tgt.self_ref, src);
            for &tgt in &tgts {
                for &class in &classes {
                    self.check_bounds(policy, src, tgt, class)?;
                    let key = RuleKey {
                        kind: rule.kind,
                        src,
                        tgt,
                        class
                    };
                    if !self.te_key_admissible(&key, rule.cond) {
                        self.warnings.push(IndexWarning::ConflictingCondTypeRule {
                            key,
                            rule: rule_id
                        });
                        continue;
                    }
                    let node = self.insert(key, rule.cond);
                    self.add_datum(node, rule.default_type);
                    self.add_provenance(node, rule_id, 0);
                }
            }
        }
        Ok(())
    }
}
