//! Read-only policy view consumed by the analysis engines.
//!
//! A [`Policy`] holds the entity tables produced by an external loader:
//! types, attributes, object classes, permissions, booleans, conditional
//! expressions and the access-vector/type rule lists. The analysis engines
//! borrow it read-only for the duration of a query; the only permitted
//! mutation of a loaded policy is flipping a boolean's current state.
//!
//! Construction goes through [`PolicyBuilder`], which validates the table
//! cross-references before handing out an immutable view.

mod build;
mod types;

use std::collections::BTreeSet;

pub use build::PolicyBuilder;
pub use types::{
    AttrId, Attribute, AvRule, BoolId, Boolean, ClassId, ClassSet, CommonId, CommonPerms, CondExpr,
    CondId, CondRef, CondToken, ObjClass, PermId, PermSet, RangeTransRule, Role, RoleAllowRule,
    RoleId, RoleTransRule, RuleId, RuleKind, RuleRef, RuleVec, SELF_TYPE, TaItem, TaRef, TeRule,
    Type, TypeId, TypeSet, User
};

use crate::{cond, config::CondConfig, permmap::PermMap};

/// Read-only view over a loaded policy.
///
/// Ids are dense non-negative integers; type ids are 1-based with index 0
/// reserved for the `self` pseudo-type, which is present in the table only
/// as a placeholder and never matched by queries.
#[derive(Debug, Clone)]
pub struct Policy {
    pub(crate) types:       Vec<Type>,
    pub(crate) attrs:       Vec<Attribute>,
    pub(crate) commons:     Vec<CommonPerms>,
    pub(crate) classes:     Vec<ObjClass>,
    pub(crate) perms:       Vec<compact_str::CompactString>,
    pub(crate) roles:       Vec<Role>,
    pub(crate) users:       Vec<User>,
    pub(crate) bools:       Vec<Boolean>,
    pub(crate) cond_exprs:  Vec<CondExpr>,
    pub(crate) av_rules:    Vec<AvRule>,
    pub(crate) av_audit:    Vec<AvRule>,
    pub(crate) te_rules:    Vec<TeRule>,
    pub(crate) role_allow:  Vec<RoleAllowRule>,
    pub(crate) role_trans:  Vec<RoleTransRule>,
    pub(crate) range_trans: Vec<RangeTransRule>,
    pub(crate) version:     u32,
    pub(crate) mls:         bool,
    pub(crate) binary:      bool,
    pub(crate) cond_limits: CondConfig,
    pub(crate) perm_map:    Option<PermMap>
}

impl Policy {
    /// Start building a policy view
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::new()
    }

    /// Number of types including the reserved `self` slot
    pub fn num_types(&self) -> usize {
        self.types.len()
    }

    pub fn num_attribs(&self) -> usize {
        self.attrs.len()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn num_perms(&self) -> usize {
        self.perms.len()
    }

    pub fn num_roles(&self) -> usize {
        self.roles.len()
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn num_bools(&self) -> usize {
        self.bools.len()
    }

    pub fn num_cond_exprs(&self) -> usize {
        self.cond_exprs.len()
    }

    pub fn policy_version(&self) -> u32 {
        self.version
    }

    pub fn is_mls(&self) -> bool {
        self.mls
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Whether `id` names a real type (not `self`, not out of range)
    pub fn is_valid_type(&self, id: TypeId) -> bool {
        id != SELF_TYPE && id < self.types.len()
    }

    pub fn type_(&self, id: TypeId) -> Option<&Type> {
        self.types.get(id)
    }

    /// Name of a type, or `"self"` for the reserved slot
    pub fn type_name(&self, id: TypeId) -> &str {
        self.types.get(id).map(|t| t.name.as_str()).unwrap_or("?")
    }

    /// Look up a type by name or alias; attributes are not matched
    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.types.iter().position(|t| {
            t.name == name || t.aliases.iter().any(|a| a == name)
        })
    }

    pub fn attribute(&self, id: AttrId) -> Option<&Attribute> {
        self.attrs.get(id)
    }

    pub fn attribute_by_name(&self, name: &str) -> Option<AttrId> {
        self.attrs.iter().position(|a| a.name == name)
    }

    pub fn class(&self, id: ClassId) -> Option<&ObjClass> {
        self.classes.get(id)
    }

    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes.iter().position(|c| c.name == name)
    }

    pub fn perm_name(&self, id: PermId) -> &str {
        self.perms.get(id).map(|p| p.as_str()).unwrap_or("?")
    }

    pub fn perm_by_name(&self, name: &str) -> Option<PermId> {
        self.perms.iter().position(|p| p == name)
    }

    pub fn role(&self, id: RoleId) -> Option<&Role> {
        self.roles.get(id)
    }

    pub fn user(&self, id: usize) -> Option<&User> {
        self.users.get(id)
    }

    pub fn boolean(&self, id: BoolId) -> Option<&Boolean> {
        self.bools.get(id)
    }

    pub fn bool_by_name(&self, name: &str) -> Option<BoolId> {
        self.bools.iter().position(|b| b.name == name)
    }

    pub fn cond_expr(&self, id: CondId) -> Option<&CondExpr> {
        self.cond_exprs.get(id)
    }

    pub fn av_rules(&self) -> &[AvRule] {
        &self.av_rules
    }

    pub fn av_audit_rules(&self) -> &[AvRule] {
        &self.av_audit
    }

    pub fn te_rules(&self) -> &[TeRule] {
        &self.te_rules
    }

    pub fn role_allow_rules(&self) -> &[RoleAllowRule] {
        &self.role_allow
    }

    pub fn role_trans_rules(&self) -> &[RoleTransRule] {
        &self.role_trans
    }

    pub fn range_trans_rules(&self) -> &[RangeTransRule] {
        &self.range_trans
    }

    pub fn perm_map(&self) -> Option<&PermMap> {
        self.perm_map.as_ref()
    }

    /// Attach a permission map to the view
    pub fn set_perm_map(&mut self, map: PermMap) {
        self.perm_map = Some(map);
    }

    pub fn cond_limits(&self) -> &CondConfig {
        &self.cond_limits
    }

    /// Set the current state of a boolean.
    ///
    /// State changes are observable through rule enablement without
    /// rebuilding any index; callers must not race queries with mutations.
    pub fn set_bool(&mut self, id: BoolId, state: bool) -> bool {
        match self.bools.get_mut(id) {
            Some(b) => {
                b.state = state;
                true
            }
            None => false
        }
    }

    /// Reset every boolean to its default state
    pub fn reset_bools(&mut self) {
        for b in &mut self.bools {
            b.state = b.default_state;
        }
    }

    /// Evaluate a conditional expression against the current boolean states
    ///
    /// # Notes
    ///
    /// - Malformed expressions and expressions over more than the configured
    ///   boolean limit evaluate to false
    pub fn eval_cond(&self, id: CondId) -> bool {
        let Some(expr) = self.cond_exprs.get(id) else {
            return false;
        };
        cond::evaluate(
            &expr.tokens,
            &|b| self.bools.get(b).map(|x| x.state).unwrap_or(false),
            &self.cond_limits
        )
    }

    /// Whether a conditional annotation is currently live
    pub fn cond_enabled(&self, cond: Option<CondRef>) -> bool {
        match cond {
            None => true,
            Some(c) => self.eval_cond(c.expr) == c.branch
        }
    }

    /// Whether an access-vector rule is currently enabled
    pub fn av_rule_enabled(&self, rule: &AvRule) -> bool {
        self.cond_enabled(rule.cond)
    }

    /// Whether a type rule is currently enabled
    pub fn te_rule_enabled(&self, rule: &TeRule) -> bool {
        self.cond_enabled(rule.cond)
    }

    /// Expand a type-or-attribute set to the sorted list of member types.
    ///
    /// Wildcard and complement sets expand against the type universe minus
    /// the `self` pseudo-type; per-element subtraction is applied after the
    /// union. A `self` reference is not resolved here since it depends on
    /// the enclosing rule's source.
    pub fn expand_type_set(&self, set: &TypeSet) -> Vec<TypeId> {
        if set.all {
            return (1..self.types.len()).collect();
        }

        let mut include: BTreeSet<TypeId> = BTreeSet::new();
        for item in set.items.iter().filter(|i| !i.subtract) {
            match item.which {
                TaRef::Type(id) => {
                    if id != SELF_TYPE {
                        include.insert(id);
                    }
                }
                TaRef::Attr(a) => {
                    if let Some(attr) = self.attrs.get(a) {
                        include.extend(attr.types.iter().copied());
                    }
                }
            }
        }
        for item in set.items.iter().filter(|i| i.subtract) {
            match item.which {
                TaRef::Type(id) => {
                    include.remove(&id);
                }
                TaRef::Attr(a) => {
                    if let Some(attr) = self.attrs.get(a) {
                        for t in &attr.types {
                            include.remove(t);
                        }
                    }
                }
            }
        }

        if set.complement {
            (1..self.types.len()).filter(|t| !include.contains(t)).collect()
        } else {
            include.into_iter().collect()
        }
    }

    /// Expand an object-class set to the list of class ids
    pub fn expand_class_set(&self, set: &ClassSet) -> Vec<ClassId> {
        if set.all {
            (0..self.classes.len()).collect()
        } else {
            set.classes.clone()
        }
    }

    /// Total permission vocabulary of a class (own plus common perms)
    pub fn class_perms(&self, class: ClassId) -> Vec<PermId> {
        let Some(c) = self.classes.get(class) else {
            return Vec::new();
        };
        let mut perms = c.perms.clone();
        if let Some(common) = c.common.and_then(|id| self.commons.get(id)) {
            for p in &common.perms {
                if !perms.contains(p) {
                    perms.push(*p);
                }
            }
        }
        perms
    }

    /// Expand a permission set against a class's total vocabulary
    pub fn expand_perm_set(&self, set: &PermSet, class: ClassId) -> Vec<PermId> {
        if set.all {
            self.class_perms(class)
        } else if set.complement {
            self.class_perms(class)
                .into_iter()
                .filter(|p| !set.perms.contains(p))
                .collect()
        } else {
            set.perms.clone()
        }
    }

    /// Whether an access-vector rule grants a permission on a class.
    ///
    /// Used to attribute per-permission table entries back to the source
    /// rules that actually carry the permission.
    pub fn av_rule_uses_perm(&self, rule: &AvRule, class: ClassId, perm: PermId) -> bool {
        self.expand_perm_set(&rule.perms, class).contains(&perm)
    }
}
