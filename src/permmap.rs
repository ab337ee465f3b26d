//! Permission map: per-class permission directions and weights.
//!
//! Information-flow analysis requires each `(class, permission)` pair to be
//! mapped to a flow direction (read, write, both or none) and a weight
//! between [`PERMMAP_MIN_WEIGHT`] and [`PERMMAP_MAX_WEIGHT`]. Heavier
//! weights produce shorter graph edges: edge length is
//! `PERMMAP_MAX_WEIGHT - weight + 1`.
//!
//! The loader producing the map is external; [`PermMap`] is the table the
//! engines consume.

use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    error::{AppResult, invalid_input_error},
    policy::{ClassId, PermId}
};

/// Minimum permission weight
pub const PERMMAP_MIN_WEIGHT: u32 = 1;

/// Maximum permission weight
pub const PERMMAP_MAX_WEIGHT: u32 = 10;

/// Flow direction of a mapped permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PermDirection {
    None,
    Read,
    Write,
    Both
}

impl PermDirection {
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }

    /// Swap read and write; used when a rule's permission set is negated
    pub fn inverted(self) -> Self {
        match self {
            Self::Read => Self::Write,
            Self::Write => Self::Read,
            other => other
        }
    }
}

/// Mapping of a single permission within a class
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PermMapping {
    pub direction: PermDirection,
    pub weight:    u32
}

impl PermMapping {
    /// Edge length derived from the weight, clamped to the weight range
    pub fn edge_length(&self) -> u32 {
        (PERMMAP_MAX_WEIGHT - self.weight + 1).clamp(PERMMAP_MIN_WEIGHT, PERMMAP_MAX_WEIGHT)
    }
}

/// Permission map over `(class, permission)` pairs
#[derive(Debug, Clone, Default)]
pub struct PermMap {
    maps: IndexMap<(ClassId, PermId), PermMapping>
}

impl PermMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a permission of a class to a direction and weight
    ///
    /// # Errors
    ///
    /// - Weight outside `1..=10`
    pub fn set(
        &mut self,
        class: ClassId,
        perm: PermId,
        direction: PermDirection,
        weight: u32
    ) -> AppResult<()> {
        if !(PERMMAP_MIN_WEIGHT..=PERMMAP_MAX_WEIGHT).contains(&weight) {
            return Err(invalid_input_error(format!(
                "Permission weight {} out of range {}..={}",
                weight, PERMMAP_MIN_WEIGHT, PERMMAP_MAX_WEIGHT
            )));
        }
        self.maps.insert(
            (class, perm),
            PermMapping {
                direction,
                weight
            }
        );
        Ok(())
    }

    /// Mapping for a permission of a class, or `None` when unmapped
    pub fn get(&self, class: ClassId, perm: PermId) -> Option<PermMapping> {
        self.maps.get(&(class, perm)).copied()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
