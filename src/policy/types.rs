use compact_str::CompactString;
use serde::Serialize;
use smallvec::SmallVec;

/// Identifier of a type; dense, 1-based (`0` is the `self` pseudo-type)
pub type TypeId = usize;
/// Identifier of an attribute
pub type AttrId = usize;
/// Identifier of an object class
pub type ClassId = usize;
/// Identifier of a permission
pub type PermId = usize;
/// Identifier of a common permission set
pub type CommonId = usize;
/// Identifier of a role
pub type RoleId = usize;
/// Identifier of a policy boolean
pub type BoolId = usize;
/// Identifier of a conditional expression
pub type CondId = usize;
/// Index of a source rule in its per-kind rule table
pub type RuleId = usize;

/// Reserved index of the `self` pseudo-type.
///
/// `self` is never stored as an ordinary type; it expands to the current
/// rule's source when it appears on the target side.
pub const SELF_TYPE: TypeId = 0;

/// Type alias for small rule-id vectors (typically < 4 elements)
pub type RuleVec = SmallVec<[RuleId; 4]>;

/// Security type with its attribute memberships
#[derive(Debug, Clone, Serialize)]
pub struct Type {
    pub name:    CompactString,
    pub aliases: Vec<CompactString>,
    pub attrs:   Vec<AttrId>
}

/// Attribute grouping a set of types
#[derive(Debug, Clone, Serialize)]
pub struct Attribute {
    pub name:  CompactString,
    pub types: Vec<TypeId>
}

/// Named permission set shared between object classes
#[derive(Debug, Clone, Serialize)]
pub struct CommonPerms {
    pub name:  CompactString,
    pub perms: Vec<PermId>
}

/// Object class with its own permissions and an optional common-perm set.
///
/// The class's total permission vocabulary is its own permissions plus the
/// permissions of the referenced common set.
#[derive(Debug, Clone, Serialize)]
pub struct ObjClass {
    pub name:   CompactString,
    pub perms:  Vec<PermId>,
    pub common: Option<CommonId>
}

/// Policy boolean with default and current state
#[derive(Debug, Clone, Serialize)]
pub struct Boolean {
    pub name:          CompactString,
    pub default_state: bool,
    pub state:         bool
}

/// Role with its authorized types
#[derive(Debug, Clone, Serialize)]
pub struct Role {
    pub name:  CompactString,
    pub types: Vec<TypeId>
}

/// User with the roles it may assume
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub name:  CompactString,
    pub roles: Vec<RoleId>
}

/// Kind of an access-vector or type rule.
///
/// Ordered so rule-index buckets can sort same-prefix keys by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RuleKind {
    Allow,
    Neverallow,
    AuditAllow,
    DontAudit,
    Transition,
    Member,
    Change
}

impl RuleKind {
    /// Whether the kind carries a permission set
    pub fn is_av(self) -> bool {
        matches!(self, Self::Allow | Self::Neverallow | Self::AuditAllow | Self::DontAudit)
    }

    /// Whether the kind carries a single default type
    pub fn is_type_rule(self) -> bool {
        matches!(self, Self::Transition | Self::Member | Self::Change)
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Neverallow => write!(f, "neverallow"),
            Self::AuditAllow => write!(f, "auditallow"),
            Self::DontAudit => write!(f, "dontaudit"),
            Self::Transition => write!(f, "type_transition"),
            Self::Member => write!(f, "type_member"),
            Self::Change => write!(f, "type_change")
        }
    }
}

/// Reference to a type or attribute inside a rule's type set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaRef {
    Type(TypeId),
    Attr(AttrId)
}

/// Element of a type set; `subtract` removes the referenced members
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TaItem {
    pub which:    TaRef,
    pub subtract: bool
}

/// Source or target set of a rule.
///
/// `all` corresponds to the `*` wildcard and `complement` to `~`; both
/// expand against the type universe excluding the `self` pseudo-type.
/// `self_ref` records that the target side names `self`, which expands to
/// the current source at lookup time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeSet {
    pub items:      Vec<TaItem>,
    pub all:        bool,
    pub complement: bool,
    pub self_ref:   bool
}

impl TypeSet {
    /// Set holding the listed types
    pub fn types(ids: &[TypeId]) -> Self {
        Self {
            items: ids
                .iter()
                .map(|&id| TaItem {
                    which:    TaRef::Type(id),
                    subtract: false
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Set holding a single attribute
    pub fn attr(id: AttrId) -> Self {
        Self {
            items: vec![TaItem {
                which:    TaRef::Attr(id),
                subtract: false
            }],
            ..Default::default()
        }
    }

    /// The `self` target set
    pub fn self_only() -> Self {
        Self {
            self_ref: true,
            ..Default::default()
        }
    }

    /// The `*` wildcard set
    pub fn star() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }
}

/// Object-class set of a rule
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassSet {
    pub classes: Vec<ClassId>,
    pub all:     bool
}

impl ClassSet {
    pub fn classes(ids: &[ClassId]) -> Self {
        Self {
            classes: ids.to_vec(),
            all:     false
        }
    }
}

/// Permission set of an access-vector rule
#[derive(Debug, Clone, Default, Serialize)]
pub struct PermSet {
    pub perms:      Vec<PermId>,
    pub all:        bool,
    pub complement: bool
}

impl PermSet {
    pub fn perms(ids: &[PermId]) -> Self {
        Self {
            perms: ids.to_vec(),
            ..Default::default()
        }
    }
}

/// Conditional annotation: the owning expression and the branch list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CondRef {
    pub expr:   CondId,
    pub branch: bool
}

/// Access-vector rule (allow, neverallow, auditallow, dontaudit)
#[derive(Debug, Clone, Serialize)]
pub struct AvRule {
    pub kind:    RuleKind,
    pub src:     TypeSet,
    pub tgt:     TypeSet,
    pub classes: ClassSet,
    pub perms:   PermSet,
    pub cond:    Option<CondRef>
}

/// Type rule (type_transition, type_member, type_change)
#[derive(Debug, Clone, Serialize)]
pub struct TeRule {
    pub kind:         RuleKind,
    pub src:          TypeSet,
    pub tgt:          TypeSet,
    pub classes:      ClassSet,
    pub default_type: TypeId,
    pub cond:         Option<CondRef>
}

/// Role allow rule
#[derive(Debug, Clone, Serialize)]
pub struct RoleAllowRule {
    pub src_roles: Vec<RoleId>,
    pub tgt_roles: Vec<RoleId>
}

/// Role transition rule
#[derive(Debug, Clone, Serialize)]
pub struct RoleTransRule {
    pub src_roles:    Vec<RoleId>,
    pub tgt_types:    TypeSet,
    pub default_role: RoleId
}

/// Range transition rule; the MLS range flows through as an opaque value
#[derive(Debug, Clone, Serialize)]
pub struct RangeTransRule {
    pub src:   TypeSet,
    pub tgt:   TypeSet,
    pub range: CompactString
}

/// Token of a conditional expression in reverse-polish notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CondToken {
    Bool(BoolId),
    Not,
    And,
    Or,
    Xor,
    Eq,
    Neq
}

/// Reference to a rule gated by a conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleRef {
    Av(RuleId),
    Te(RuleId)
}

/// Conditional expression with the rules attached to each branch
#[derive(Debug, Clone, Default, Serialize)]
pub struct CondExpr {
    pub tokens:      Vec<CondToken>,
    pub true_rules:  Vec<RuleRef>,
    pub false_rules: Vec<RuleRef>
}
