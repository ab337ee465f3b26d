//! Conditional expression evaluation and semantic comparison.
//!
//! Conditional expressions are stored in reverse-polish notation over the
//! tokens `BOOL`, `NOT`, `AND`, `OR`, `XOR`, `EQ` and `NEQ`. Evaluation uses
//! a fixed-depth boolean stack; malformed expressions (stack overflow or
//! underflow, unknown booleans) and expressions over more than the
//! configured boolean limit evaluate to `false` rather than failing.
//!
//! Semantic comparison maps boolean symbols between two policy views,
//! canonicalizes the variable order by name and compares complete truth
//! tables, so syntactically different but logically identical expressions
//! match. The `2^k` assignment sweep is parallelised with [`rayon`].

use indexmap::IndexSet;
use rayon::prelude::*;

use crate::{
    config::CondConfig,
    policy::{BoolId, CondExpr, CondToken, Policy}
};

/// Result of a semantic comparison between two conditional expressions.
///
/// `inverse` is set when the expressions disagree on every assignment, i.e.
/// one is the logical negation of the other; consumers use it to match a
/// conditional's true list against the other policy's false list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondMatch {
    pub equal:   bool,
    pub inverse: bool
}

impl CondMatch {
    const NONE: Self = Self {
        equal:   false,
        inverse: false
    };
}

/// Evaluate an RPN token stream against the given boolean states.
///
/// # Notes
///
/// - Returns `false` for malformed streams instead of failing: stack
///   overflow past `limits.max_depth`, operand underflow, or a stream that
///   does not reduce to exactly one value
/// - Returns `false` when the stream uses more than `limits.max_bools`
///   distinct booleans
pub fn evaluate<F>(tokens: &[CondToken], state: &F, limits: &CondConfig) -> bool
where
    F: Fn(BoolId) -> bool
{
    if tokens.is_empty() {
        return false;
    }
    if distinct_bools(tokens).len() > limits.max_bools {
        return false;
    }

    let mut stack = vec![false; limits.max_depth];
    let mut sp: usize = 0;

    for token in tokens {
        match token {
            CondToken::Bool(b) => {
                if sp >= limits.max_depth {
                    return false;
                }
                stack[sp] = state(*b);
                sp += 1;
            }
            CondToken::Not => {
                if sp < 1 {
                    return false;
                }
                stack[sp - 1] = !stack[sp - 1];
            }
            op => {
                if sp < 2 {
                    return false;
                }
                let rhs = stack[sp - 1];
                let lhs = stack[sp - 2];
                sp -= 1;
                stack[sp - 1] = match op {
                    CondToken::And => lhs && rhs,
                    CondToken::Or => lhs || rhs,
                    CondToken::Xor => lhs ^ rhs,
                    CondToken::Eq => lhs == rhs,
                    CondToken::Neq => lhs != rhs,
                    CondToken::Bool(_) | CondToken::Not => unreachable!()
                };
            }
        }
    }

    sp == 1 && stack[0]
}

/// Distinct booleans of a token stream, in order of first occurrence
pub fn distinct_bools(tokens: &[CondToken]) -> IndexSet<BoolId> {
    tokens
        .iter()
        .filter_map(|t| match t {
            CondToken::Bool(b) => Some(*b),
            _ => None
        })
        .collect()
}

/// Compare two conditional expressions from two policy views semantically.
///
/// Boolean ids of `a` are mapped into `b`'s view by name before comparison;
/// an `a` boolean with no counterpart in `b`'s view can never match. The
/// variable order is canonicalized by boolean name and both expressions are
/// evaluated over all `2^k` assignments of the combined variable set.
///
/// # Notes
///
/// - Expressions over more than `limits.max_bools` distinct booleans
///   conservatively never match
/// - Passing the same policy for both sides compares two expressions of one
///   view
pub fn exprs_semantic_equal(
    a: &CondExpr,
    pa: &Policy,
    b: &CondExpr,
    pb: &Policy,
    limits: &CondConfig
) -> CondMatch {
    if a.tokens.is_empty() || b.tokens.is_empty() {
        return CondMatch::NONE;
    }

    // map a's booleans into b's id space by name
    let mut vars: Vec<BoolId> = Vec::new();
    for a_bool in distinct_bools(&a.tokens) {
        let Some(name) = pa.boolean(a_bool).map(|x| x.name.clone()) else {
            return CondMatch::NONE;
        };
        let Some(b_bool) = pb.bool_by_name(&name) else {
            return CondMatch::NONE;
        };
        if !vars.contains(&b_bool) {
            vars.push(b_bool);
        }
    }
    for b_bool in distinct_bools(&b.tokens) {
        if !vars.contains(&b_bool) {
            vars.push(b_bool);
        }
    }

    if vars.len() > limits.max_bools {
        return CondMatch::NONE;
    }
    vars.sort_by(|&x, &y| {
        let xn = pb.boolean(x).map(|v| v.name.as_str()).unwrap_or("");
        let yn = pb.boolean(y).map(|v| v.name.as_str()).unwrap_or("");
        xn.cmp(yn)
    });

    let var_pos = |id: BoolId| vars.iter().position(|&v| v == id);
    let a_to_pos: Vec<Option<usize>> = (0..pa.num_bools())
        .map(|a_bool| {
            pa.boolean(a_bool)
                .and_then(|x| pb.bool_by_name(&x.name))
                .and_then(var_pos)
        })
        .collect();
    let b_to_pos: Vec<Option<usize>> = (0..pb.num_bools()).map(var_pos).collect();

    let k = vars.len() as u32;
    let (equal, inverse) = (0u64..(1u64 << k))
        .into_par_iter()
        .map(|assignment| {
            let ea = evaluate(
                &a.tokens,
                &|id: BoolId| {
                    a_to_pos
                        .get(id)
                        .copied()
                        .flatten()
                        .map(|pos| assignment & (1 << pos) != 0)
                        .unwrap_or(false)
                },
                limits
            );
            let eb = evaluate(
                &b.tokens,
                &|id: BoolId| {
                    b_to_pos
                        .get(id)
                        .copied()
                        .flatten()
                        .map(|pos| assignment & (1 << pos) != 0)
                        .unwrap_or(false)
                },
                limits
            );
            (ea == eb, ea != eb)
        })
        .reduce(|| (true, true), |x, y| (x.0 && y.0, x.1 && y.1));

    CondMatch {
        equal,
        inverse
    }
}
