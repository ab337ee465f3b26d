//! Programmatic construction of policy views.
//!
//! External loaders (and the test suite) assemble a [`Policy`] through
//! [`PolicyBuilder`]. The builder assigns dense ids in insertion order,
//! keeps the reserved `self` slot at type index 0 and validates every
//! cross-reference when finishing.

use compact_str::CompactString;

use super::{
    Policy,
    types::{
        AttrId, Attribute, AvRule, BoolId, Boolean, ClassId, ClassSet, CommonId, CommonPerms,
        CondExpr, CondId, CondRef, CondToken, ObjClass, PermId, PermSet, RangeTransRule, Role,
        RoleAllowRule, RoleId, RoleTransRule, RuleId, RuleKind, RuleRef, SELF_TYPE, TaRef, TeRule,
        Type, TypeId, TypeSet, User
    }
};
use crate::{
    config::CondConfig,
    error::{AppResult, inconsistent_policy_error, unsupported_policy_error}
};

/// Policy version that introduced conditional policy extensions
const COND_POLICY_VERSION: u32 = 16;

/// Builder for [`Policy`] views.
///
/// # Example
///
/// ```
/// use sepolicy_analyzer::policy::Policy;
///
/// let mut b = Policy::builder();
/// let user_t = b.add_type("user_t");
/// let file_t = b.add_type("file_t");
/// let read = b.add_perm("read");
/// let file = b.add_class("file", &[read]);
/// b.allow(user_t, file_t, file, &[read]);
/// let policy = b.build().unwrap();
///
/// assert_eq!(policy.num_types(), 3); // includes the reserved `self` slot
/// ```
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    types:       Vec<Type>,
    attrs:       Vec<Attribute>,
    commons:     Vec<CommonPerms>,
    classes:     Vec<ObjClass>,
    perms:       Vec<CompactString>,
    roles:       Vec<Role>,
    users:       Vec<User>,
    bools:       Vec<Boolean>,
    cond_exprs:  Vec<CondExpr>,
    av_rules:    Vec<AvRule>,
    av_audit:    Vec<AvRule>,
    te_rules:    Vec<TeRule>,
    role_allow:  Vec<RoleAllowRule>,
    role_trans:  Vec<RoleTransRule>,
    range_trans: Vec<RangeTransRule>,
    version:     Option<u32>,
    mls:         bool,
    binary:      bool,
    cond_limits: Option<CondConfig>
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self {
            types: vec![Type {
                name:    CompactString::const_new("self"),
                aliases: Vec::new(),
                attrs:   Vec::new()
            }],
            ..Default::default()
        }
    }

    /// Set the policy version (default 19)
    pub fn version(&mut self, version: u32) -> &mut Self {
        self.version = Some(version);
        self
    }

    pub fn mls(&mut self, mls: bool) -> &mut Self {
        self.mls = mls;
        self
    }

    pub fn binary(&mut self, binary: bool) -> &mut Self {
        self.binary = binary;
        self
    }

    /// Override the conditional-expression limits
    pub fn cond_limits(&mut self, limits: CondConfig) -> &mut Self {
        self.cond_limits = Some(limits);
        self
    }

    pub fn add_type(&mut self, name: &str) -> TypeId {
        self.types.push(Type {
            name:    name.into(),
            aliases: Vec::new(),
            attrs:   Vec::new()
        });
        self.types.len() - 1
    }

    pub fn add_type_alias(&mut self, id: TypeId, alias: &str) {
        if let Some(t) = self.types.get_mut(id) {
            t.aliases.push(alias.into());
        }
    }

    /// Add an attribute over the given member types
    pub fn add_attribute(&mut self, name: &str, members: &[TypeId]) -> AttrId {
        let id = self.attrs.len();
        self.attrs.push(Attribute {
            name:  name.into(),
            types: members.to_vec()
        });
        for &t in members {
            if let Some(ty) = self.types.get_mut(t) {
                ty.attrs.push(id);
            }
        }
        id
    }

    pub fn add_perm(&mut self, name: &str) -> PermId {
        if let Some(id) = self.perms.iter().position(|p| p == name) {
            return id;
        }
        self.perms.push(name.into());
        self.perms.len() - 1
    }

    pub fn add_common(&mut self, name: &str, perms: &[PermId]) -> CommonId {
        self.commons.push(CommonPerms {
            name:  name.into(),
            perms: perms.to_vec()
        });
        self.commons.len() - 1
    }

    pub fn add_class(&mut self, name: &str, perms: &[PermId]) -> ClassId {
        self.classes.push(ObjClass {
            name:   name.into(),
            perms:  perms.to_vec(),
            common: None
        });
        self.classes.len() - 1
    }

    pub fn add_class_with_common(&mut self, name: &str, perms: &[PermId], common: CommonId) -> ClassId {
        self.classes.push(ObjClass {
            name:   name.into(),
            perms:  perms.to_vec(),
            common: Some(common)
        });
        self.classes.len() - 1
    }

    pub fn add_role(&mut self, name: &str, types: &[TypeId]) -> RoleId {
        self.roles.push(Role {
            name:  name.into(),
            types: types.to_vec()
        });
        self.roles.len() - 1
    }

    pub fn add_user(&mut self, name: &str, roles: &[RoleId]) -> usize {
        self.users.push(User {
            name:  name.into(),
            roles: roles.to_vec()
        });
        self.users.len() - 1
    }

    pub fn add_bool(&mut self, name: &str, default_state: bool) -> BoolId {
        self.bools.push(Boolean {
            name: name.into(),
            default_state,
            state: default_state
        });
        self.bools.len() - 1
    }

    /// Add a conditional expression in reverse-polish notation
    pub fn add_cond(&mut self, tokens: &[CondToken]) -> CondId {
        self.cond_exprs.push(CondExpr {
            tokens:      tokens.to_vec(),
            true_rules:  Vec::new(),
            false_rules: Vec::new()
        });
        self.cond_exprs.len() - 1
    }

    /// Add an access-vector rule in full generality
    pub fn av_rule(&mut self, rule: AvRule) -> RuleId {
        let id = match rule.kind {
            RuleKind::Allow | RuleKind::Neverallow => {
                self.av_rules.push(rule.clone());
                self.av_rules.len() - 1
            }
            _ => {
                self.av_audit.push(rule.clone());
                self.av_audit.len() - 1
            }
        };
        if let Some(c) = rule.cond {
            self.attach_cond_rule(c, RuleRef::Av(id));
        }
        id
    }

    /// Add `allow src tgt : class { perms };`
    pub fn allow(&mut self, src: TypeId, tgt: TypeId, class: ClassId, perms: &[PermId]) -> RuleId {
        self.av_rule(AvRule {
            kind:    RuleKind::Allow,
            src:     TypeSet::types(&[src]),
            tgt:     TypeSet::types(&[tgt]),
            classes: ClassSet::classes(&[class]),
            perms:   PermSet::perms(perms),
            cond:    None
        })
    }

    /// Add `allow src self : class { perms };`
    pub fn allow_self(&mut self, src: TypeId, class: ClassId, perms: &[PermId]) -> RuleId {
        self.av_rule(AvRule {
            kind:    RuleKind::Allow,
            src:     TypeSet::types(&[src]),
            tgt:     TypeSet::self_only(),
            classes: ClassSet::classes(&[class]),
            perms:   PermSet::perms(perms),
            cond:    None
        })
    }

    /// Add a conditional `allow` gated by `(cond, branch)`
    pub fn allow_cond(
        &mut self,
        src: TypeId,
        tgt: TypeId,
        class: ClassId,
        perms: &[PermId],
        cond: CondId,
        branch: bool
    ) -> RuleId {
        self.av_rule(AvRule {
            kind:    RuleKind::Allow,
            src:     TypeSet::types(&[src]),
            tgt:     TypeSet::types(&[tgt]),
            classes: ClassSet::classes(&[class]),
            perms:   PermSet::perms(perms),
            cond:    Some(CondRef {
                expr: cond,
                branch
            })
        })
    }

    /// Add a type rule in full generality
    pub fn te_rule(&mut self, rule: TeRule) -> RuleId {
        let id = self.te_rules.len();
        if let Some(c) = rule.cond {
            self.attach_cond_rule(c, RuleRef::Te(id));
        }
        self.te_rules.push(rule);
        id
    }

    /// Add `type_transition src tgt : class default;`
    pub fn type_transition(
        &mut self,
        src: TypeId,
        tgt: TypeId,
        class: ClassId,
        default_type: TypeId
    ) -> RuleId {
        self.te_rule(TeRule {
            kind: RuleKind::Transition,
            src: TypeSet::types(&[src]),
            tgt: TypeSet::types(&[tgt]),
            classes: ClassSet::classes(&[class]),
            default_type,
            cond: None
        })
    }

    pub fn role_allow(&mut self, src_roles: &[RoleId], tgt_roles: &[RoleId]) {
        self.role_allow.push(RoleAllowRule {
            src_roles: src_roles.to_vec(),
            tgt_roles: tgt_roles.to_vec()
        });
    }

    pub fn role_transition(&mut self, src_roles: &[RoleId], tgt_types: TypeSet, default_role: RoleId) {
        self.role_trans.push(RoleTransRule {
            src_roles: src_roles.to_vec(),
            tgt_types,
            default_role
        });
    }

    pub fn range_transition(&mut self, src: TypeSet, tgt: TypeSet, range: &str) {
        self.range_trans.push(RangeTransRule {
            src,
            tgt,
            range: range.into()
        });
    }

    fn attach_cond_rule(&mut self, cond: CondRef, rule: RuleRef) {
        if let Some(expr) = self.cond_exprs.get_mut(cond.expr) {
            if cond.branch {
                expr.true_rules.push(rule);
            } else {
                expr.false_rules.push(rule);
            }
        }
    }

    /// Finish the build, validating all cross-references.
    ///
    /// # Errors
    ///
    /// - Structural inconsistencies (dangling type, class, perm or boolean
    ///   references) are fatal
    /// - A policy carrying conditionals with a version below 16 is rejected;
    ///   conditional policy extensions did not exist before then
    pub fn build(&mut self) -> AppResult<Policy> {
        let version = self.version.unwrap_or(19);

        if !self.cond_exprs.is_empty() && version < COND_POLICY_VERSION {
            return Err(unsupported_policy_error(version, COND_POLICY_VERSION));
        }

        self.check_attrs()?;
        self.check_classes()?;
        self.check_rules()?;
        self.check_conds()?;

        Ok(Policy {
            types:       std::mem::take(&mut self.types),
            attrs:       std::mem::take(&mut self.attrs),
            commons:     std::mem::take(&mut self.commons),
            classes:     std::mem::take(&mut self.classes),
            perms:       std::mem::take(&mut self.perms),
            roles:       std::mem::take(&mut self.roles),
            users:       std::mem::take(&mut self.users),
            bools:       std::mem::take(&mut self.bools),
            cond_exprs:  std::mem::take(&mut self.cond_exprs),
            av_rules:    std::mem::take(&mut self.av_rules),
            av_audit:    std::mem::take(&mut self.av_audit),
            te_rules:    std::mem::take(&mut self.te_rules),
            role_allow:  std::mem::take(&mut self.role_allow),
            role_trans:  std::mem::take(&mut self.role_trans),
            range_trans: std::mem::take(&mut self.range_trans),
            version,
            mls:         self.mls,
            binary:      self.binary,
            cond_limits: self.cond_limits.take().unwrap_or_default(),
            perm_map:    None
        })
    }

    fn check_attrs(&self) -> AppResult<()> {
        for attr in &self.attrs {
            for &t in &attr.types {
                if t == SELF_TYPE || t >= self.types.len() {
                    return Err(inconsistent_policy_error(format!(
                        "attribute '{}' references unknown type {}",
                        attr.name, t
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_classes(&self) -> AppResult<()> {
        for class in &self.classes {
            for &p in &class.perms {
                if p >= self.perms.len() {
                    return Err(inconsistent_policy_error(format!(
                        "class '{}' references unknown permission {}",
                        class.name, p
                    )));
                }
            }
            if let Some(c) = class.common
                && c >= self.commons.len()
            {
                return Err(inconsistent_policy_error(format!(
                    "class '{}' references unknown common set {}",
                    class.name, c
                )));
            }
        }
        Ok(())
    }

    fn check_type_set(&self, set: &TypeSet, what: &str) -> AppResult<()> {
        for item in &set.items {
            let ok = match item.which {
                TaRef::Type(t) => t < self.types.len(),
                TaRef::Attr(a) => a < self.attrs.len()
            };
            if !ok {
                return Err(inconsistent_policy_error(format!(
                    "rule {} set references an unknown type or attribute",
                    what
                )));
            }
        }
        Ok(())
    }

    fn check_rules(&self) -> AppResult<()> {
        for rule in self.av_rules.iter().chain(self.av_audit.iter()) {
            self.check_type_set(&rule.src, "source")?;
            self.check_type_set(&rule.tgt, "target")?;
            for &c in &rule.classes.classes {
                if c >= self.classes.len() {
                    return Err(inconsistent_policy_error("rule references an unknown class"));
                }
            }
            for &p in &rule.perms.perms {
                if p >= self.perms.len() {
                    return Err(inconsistent_policy_error("rule references an unknown permission"));
                }
            }
        }
        for rule in &self.te_rules {
            self.check_type_set(&rule.src, "source")?;
            self.check_type_set(&rule.tgt, "target")?;
            for &c in &rule.classes.classes {
                if c >= self.classes.len() {
                    return Err(inconsistent_policy_error("rule references an unknown class"));
                }
            }
            if rule.default_type == SELF_TYPE || rule.default_type >= self.types.len() {
                return Err(inconsistent_policy_error(format!(
                    "type rule references unknown default type {}",
                    rule.default_type
                )));
            }
        }
        Ok(())
    }

    fn check_conds(&self) -> AppResult<()> {
        for (i, expr) in self.cond_exprs.iter().enumerate() {
            for token in &expr.tokens {
                if let CondToken::Bool(b) = token
                    && *b >= self.bools.len()
                {
                    return Err(inconsistent_policy_error(format!(
                        "conditional expression {} references unknown boolean {}",
                        i, b
                    )));
                }
            }
        }
        for rule in self.av_rules.iter().chain(self.av_audit.iter()) {
            if let Some(c) = rule.cond
                && c.expr >= self.cond_exprs.len()
            {
                return Err(inconsistent_policy_error("rule references an unknown conditional"));
            }
        }
        for rule in &self.te_rules {
            if let Some(c) = rule.cond
                && c.expr >= self.cond_exprs.len()
            {
                return Err(inconsistent_policy_error("rule references an unknown conditional"));
            }
        }
        Ok(())
    }
}
