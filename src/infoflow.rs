//! Information-flow analysis.
//!
//! A directed weighted graph is built from the policy's enabled `allow`
//! rules and the loaded permission map. Every type gets a source node and,
//! per object class it is accessed through, a target node; a permission
//! mapped as a read produces an edge from the target node to the source
//! node, a write the opposite edge. Edge length derives from the permission
//! weight (heavier permissions give shorter edges), so shortest paths
//! prefer wide channels.
//!
//! Three queries run over the graph:
//!
//! - **Direct flows** report single-rule flows touching the start type.
//! - **Transitive flows** compute one shortest path per reachable end type
//!   with a label-correcting algorithm (D'Esopo-Pape node selection); label
//!   correcting is required because the graph may contain cycles.
//! - **[`PathFinder`]** enumerates many distinct paths between two types
//!   with a randomized breadth-first search, yielding between batches so
//!   the caller bounds wall time.

mod paths;

use std::collections::VecDeque;

pub use paths::PathFinder;
use serde::Serialize;

use crate::{
    error::{AppResult, bad_direction_error, invalid_input_error, missing_perm_map_error},
    permmap::{PERMMAP_MAX_WEIGHT, PERMMAP_MIN_WEIGHT},
    policy::{AvRule, ClassId, PermId, Policy, RuleId, RuleKind, TypeId}
};

/// Direction bit: data flows into the start type
pub const FLOW_IN: u8 = 0x01;
/// Direction bit: data flows out of the start type
pub const FLOW_OUT: u8 = 0x02;
/// Flows in both directions between the same pair
pub const FLOW_BOTH: u8 = FLOW_IN | FLOW_OUT;
/// Flows in either direction
pub const FLOW_EITHER: u8 = 0x04;

/// Query direction for flow analyses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowDirection {
    In,
    Out,
    Both,
    Either
}

impl FlowDirection {
    /// Direction bits of this query direction
    pub fn mask(self) -> u8 {
        match self {
            Self::In => FLOW_IN,
            Self::Out => FLOW_OUT,
            Self::Both => FLOW_BOTH,
            Self::Either => FLOW_EITHER
        }
    }
}

/// Class exclusion of a flow query.
///
/// An empty permission list excludes the whole class; otherwise only the
/// listed permissions are ignored.
#[derive(Debug, Clone, Serialize)]
pub struct ClassFilter {
    pub class: ClassId,
    pub perms: Vec<PermId>
}

/// Parameters of an information-flow query
#[derive(Debug, Clone)]
pub struct FlowQuery {
    pub start_type:       TypeId,
    pub direction:        FlowDirection,
    /// Minimum permission weight considered; edges longer than
    /// `11 - min_weight` are pruned from the graph
    pub min_weight:       u32,
    pub end_types:        Vec<TypeId>,
    /// Types whose nodes are left out of the graph entirely
    pub excluded_types:   Vec<TypeId>,
    /// Classes or class permissions ignored while building the graph
    pub excluded_classes: Vec<ClassFilter>
}

impl FlowQuery {
    pub fn new(start_type: TypeId, direction: FlowDirection) -> Self {
        Self {
            start_type,
            direction,
            min_weight: PERMMAP_MIN_WEIGHT,
            end_types: Vec::new(),
            excluded_types: Vec::new(),
            excluded_classes: Vec::new()
        }
    }
}

/// Per-class rule list of a flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowObjClass {
    pub class: ClassId,
    pub rules: Vec<RuleId>
}

/// A direct information flow between two types
#[derive(Debug, Clone, Serialize)]
pub struct Flow {
    pub start_type:  TypeId,
    pub end_type:    TypeId,
    /// Bitwise-or of [`FLOW_IN`] and [`FLOW_OUT`]
    pub direction:   u8,
    pub obj_classes: Vec<FlowObjClass>
}

impl Flow {
    fn new(start_type: TypeId, end_type: TypeId) -> Self {
        Self {
            start_type,
            end_type,
            direction: 0,
            obj_classes: Vec::new()
        }
    }

    fn add_class_rules(&mut self, class: ClassId, rules: &[RuleId]) {
        let pos = match self.obj_classes.iter().position(|c| c.class == class) {
            Some(pos) => pos,
            None => {
                self.obj_classes.push(FlowObjClass {
                    class,
                    rules: Vec::new()
                });
                self.obj_classes.len() - 1
            }
        };
        let entry = &mut self.obj_classes[pos];
        for &r in rules {
            if !entry.rules.contains(&r) {
                entry.rules.push(r);
            }
        }
    }

    /// Hop equality for path deduplication
    fn same_hop(&self, other: &Self) -> bool {
        self.start_type == other.start_type
            && self.end_type == other.end_type
            && self.direction == other.direction
    }
}

/// A transitive path: consecutive flows from start to end
#[derive(Debug, Clone, Serialize)]
pub struct FlowPath {
    pub length: u32,
    pub iflows: Vec<Flow>
}

/// All paths found to one end type
#[derive(Debug, Clone, Serialize)]
pub struct EndTypeFlows {
    pub end_type: TypeId,
    pub paths:    Vec<FlowPath>
}

/// Answer of a transitive or multi-path query
#[derive(Debug, Clone, Serialize)]
pub struct TransitiveAnswer {
    pub start_type: TypeId,
    pub flows:      Vec<EndTypeFlows>
}

impl TransitiveAnswer {
    /// Paths found for a given end type
    pub fn paths_for(&self, end_type: TypeId) -> &[FlowPath] {
        self.flows
            .iter()
            .find(|f| f.end_type == end_type)
            .map(|f| f.paths.as_slice())
            .unwrap_or(&[])
    }

    /// Total number of paths across all end types
    pub fn num_paths(&self) -> usize {
        self.flows.iter().map(|f| f.paths.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FlowNode {
    pub type_id:   TypeId,
    /// `None` for source nodes, the class for target nodes
    pub obj_class: Option<ClassId>,
    pub in_edges:  Vec<usize>,
    pub out_edges: Vec<usize>
}

#[derive(Debug, Clone)]
pub(crate) struct FlowEdge {
    pub start:  usize,
    pub end:    usize,
    pub length: u32,
    pub rules:  Vec<RuleId>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Red
}

/// Directed weighted information-flow graph over a policy
#[derive(Debug)]
pub struct FlowGraph {
    nodes:       Vec<FlowNode>,
    edges:       Vec<FlowEdge>,
    src_index:   Vec<Option<usize>>,
    tgt_index:   Vec<Option<usize>>,
    num_classes: usize,
    unmapped:    bool
}

impl FlowGraph {
    /// Build the graph from the policy's enabled allow rules.
    ///
    /// # Errors
    ///
    /// - No permission map loaded on the policy view
    /// - Invalid start type, end type or weight in the query
    pub fn build(policy: &Policy, query: &FlowQuery) -> AppResult<Self> {
        let perm_map = policy.perm_map().ok_or_else(missing_perm_map_error)?;
        validate_query(policy, query)?;

        let num_classes = policy.num_classes();
        let mut graph = Self {
            nodes:       Vec::new(),
            edges:       Vec::new(),
            src_index:   vec![None; policy.num_types()],
            tgt_index:   vec![None; policy.num_types() * num_classes],
            num_classes,
            unmapped:    false
        };

        let max_len = PERMMAP_MAX_WEIGHT - query.min_weight + 1;

        for (rule_id, rule) in policy.av_rules().iter().enumerate() {
            if rule.kind != RuleKind::Allow || !policy.av_rule_enabled(rule) {
                continue;
            }

            for class in policy.expand_class_set(&rule.classes) {
                let filter = query.excluded_classes.iter().find(|f| f.class == class);
                if filter.is_some_and(|f| f.perms.is_empty()) {
                    continue;
                }
                let ignored: &[PermId] = filter.map(|f| f.perms.as_slice()).unwrap_or(&[]);

                let mut found_read = false;
                let mut found_write = false;
                let mut read_len = u32::MAX;
                let mut write_len = u32::MAX;

                for perm in policy.expand_perm_set(&rule.perms, class) {
                    if ignored.contains(&perm) {
                        continue;
                    }
                    let Some(mapping) = perm_map.get(class, perm) else {
                        graph.unmapped = true;
                        continue;
                    };
                    let len = mapping.edge_length();
                    if mapping.direction.is_read() && len <= max_len && len < read_len {
                        found_read = true;
                        read_len = len;
                    }
                    if mapping.direction.is_write() && len <= max_len && len < write_len {
                        found_write = true;
                        write_len = len;
                    }
                }

                // a negated permission set flips the flow directions
                if rule.perms.complement {
                    std::mem::swap(&mut found_read, &mut found_write);
                    std::mem::swap(&mut read_len, &mut write_len);
                }

                if !found_read && !found_write {
                    continue;
                }

                graph.add_edges(
                    policy, query, class, rule_id, rule, found_read, read_len, found_write,
                    write_len
                );
            }
        }

        Ok(graph)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Whether any permission of an indexed rule had no mapping
    pub fn has_unmapped_perms(&self) -> bool {
        self.unmapped
    }

    pub(crate) fn node(&self, id: usize) -> &FlowNode {
        &self.nodes[id]
    }

    pub(crate) fn edge(&self, id: usize) -> &FlowEdge {
        &self.edges[id]
    }

    /// All node indices carrying a type: its source node plus every
    /// per-class target node
    pub(crate) fn nodes_for_type(&self, t: TypeId) -> Vec<usize> {
        let mut nodes = Vec::new();
        if let Some(Some(id)) = self.src_index.get(t) {
            nodes.push(*id);
        }
        for class in 0..self.num_classes {
            if let Some(Some(id)) = self.tgt_index.get(t * self.num_classes + class) {
                nodes.push(*id);
            }
        }
        nodes
    }

    fn add_node(&mut self, t: TypeId, obj_class: Option<ClassId>) -> usize {
        let slot = match obj_class {
            None => &mut self.src_index[t],
            Some(c) => &mut self.tgt_index[t * self.num_classes + c]
        };
        if let Some(id) = *slot {
            return id;
        }
        let id = self.nodes.len();
        *slot = Some(id);
        self.nodes.push(FlowNode {
            type_id: t,
            obj_class,
            in_edges: Vec::new(),
            out_edges: Vec::new()
        });
        id
    }

    /// Add or merge a directed edge; duplicate edges keep the shorter length
    fn connect(&mut self, start: usize, end: usize, length: u32) -> usize {
        for i in 0..self.nodes[start].out_edges.len() {
            let edge = self.nodes[start].out_edges[i];
            if self.edges[edge].end == end {
                if length < self.edges[edge].length {
                    self.edges[edge].length = length;
                }
                return edge;
            }
        }
        let id = self.edges.len();
        self.edges.push(FlowEdge {
            start,
            end,
            length,
            rules: Vec::new()
        });
        self.nodes[start].out_edges.push(id);
        self.nodes[end].in_edges.push(id);
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn add_edges(
        &mut self,
        policy: &Policy,
        query: &FlowQuery,
        class: ClassId,
        rule_id: RuleId,
        rule: &AvRule,
        found_read: bool,
        read_len: u32,
        found_write: bool,
        write_len: u32
    ) {
        let src_types = policy.expand_type_set(&rule.src);
        let tgt_base = policy.expand_type_set(&rule.tgt);

        for &src in &src_types {
            if query.excluded_types.contains(&src) {
                continue;
            }
            let src_node = self.add_node(src, None);

            let mut tgts = tgt_base.clone();
            if rule.tgt.self_ref && !tgts.contains(&src) {
                tgts.push(src);
            }
            for &tgt in &tgts {
                if query.excluded_types.contains(&tgt) {
                    continue;
                }
                let tgt_node = self.add_node(tgt, Some(class));

                if found_read {
                    let edge = self.connect(tgt_node, src_node, read_len);
                    if !self.edges[edge].rules.contains(&rule_id) {
                        self.edges[edge].rules.push(rule_id);
                    }
                }
                if found_write {
                    let edge = self.connect(src_node, tgt_node, write_len);
                    if !self.edges[edge].rules.contains(&rule_id) {
                        self.edges[edge].rules.push(rule_id);
                    }
                }
            }
        }
    }

    /// Report every direct flow touching the query's start type.
    ///
    /// `Both` keeps only type pairs with flows found in both directions;
    /// `Either` reports the union of both passes.
    pub fn direct_flows(&self, query: &FlowQuery) -> Vec<Flow> {
        let nodes = self.nodes_for_type(query.start_type);
        let mut answers: Vec<Flow> = Vec::new();

        let want_in = matches!(
            query.direction,
            FlowDirection::In | FlowDirection::Either | FlowDirection::Both
        );
        let want_out = matches!(
            query.direction,
            FlowDirection::Out | FlowDirection::Either | FlowDirection::Both
        );

        if want_in {
            for &n in &nodes {
                for i in 0..self.nodes[n].in_edges.len() {
                    let edge = self.nodes[n].in_edges[i];
                    self.record_direct(query, &mut answers, n, edge, FLOW_IN);
                }
            }
        }
        if want_out {
            for &n in &nodes {
                for i in 0..self.nodes[n].out_edges.len() {
                    let edge = self.nodes[n].out_edges[i];
                    self.record_direct(query, &mut answers, n, edge, FLOW_OUT);
                }
            }
        }

        if query.direction == FlowDirection::Both {
            answers.retain(|f| f.direction == FLOW_BOTH);
        }
        answers
    }

    fn record_direct(&self, query: &FlowQuery, answers: &mut Vec<Flow>, node: usize, edge: usize, dir: u8) {
        let e = &self.edges[edge];
        let end_node = if e.start == node { e.end } else { e.start };
        let end_type = self.nodes[end_node].type_id;

        if !query.end_types.is_empty() && !query.end_types.contains(&end_type) {
            return;
        }

        let start_type = self.nodes[node].type_id;
        let pos = answers
            .iter()
            .position(|f| f.start_type == start_type && f.end_type == end_type)
            .unwrap_or_else(|| {
                answers.push(Flow::new(start_type, end_type));
                answers.len() - 1
            });

        let obj_class = self.nodes[e.start]
            .obj_class
            .or(self.nodes[e.end].obj_class)
            .unwrap_or(0);
        answers[pos].direction |= dir;
        answers[pos].add_class_rules(obj_class, &e.rules);
    }

    /// Compute one shortest path per reachable end type.
    ///
    /// Label-correcting single-source shortest path with the D'Esopo-Pape
    /// node selection rule: nodes seen before re-enter the deque at the
    /// front, first-timers at the back. Label correcting (rather than label
    /// setting) is required because the graph may contain cycles; lengths
    /// are positive so shortest paths remain well defined.
    pub fn transitive_flows(&self, query: &FlowQuery) -> AppResult<TransitiveAnswer> {
        if !matches!(query.direction, FlowDirection::In | FlowDirection::Out) {
            return Err(bad_direction_error(
                "Transitive flow analysis requires direction In or Out"
            ));
        }

        let mut accum = PathAccumulator::default();
        for start_node in self.nodes_for_type(query.start_type) {
            self.shortest_paths(start_node, query, &mut accum)?;
        }
        Ok(accum.into_answer(query.start_type))
    }

    fn shortest_paths(
        &self,
        start_node: usize,
        query: &FlowQuery,
        accum: &mut PathAccumulator
    ) -> AppResult<()> {
        let n = self.nodes.len();
        let mut dist = vec![u64::MAX; n];
        let mut parent: Vec<Option<usize>> = vec![None; n];
        let mut color = vec![Color::White; n];
        let mut queue: VecDeque<usize> = VecDeque::new();

        dist[start_node] = 0;
        color[start_node] = Color::Red;
        queue.push_back(start_node);

        while let Some(cur) = queue.pop_front() {
            color[cur] = Color::Grey;

            let edges = match query.direction {
                FlowDirection::Out => &self.nodes[cur].out_edges,
                _ => &self.nodes[cur].in_edges
            };
            for &edge in edges {
                let node = match query.direction {
                    FlowDirection::Out => self.edges[edge].end,
                    _ => self.edges[edge].start
                };
                if node == start_node {
                    continue;
                }
                let candidate = dist[cur] + u64::from(self.edges[edge].length);
                if dist[node] > candidate {
                    dist[node] = candidate;
                    parent[node] = Some(cur);
                    if color[node] != Color::Red {
                        if color[node] == Color::Grey {
                            queue.push_front(node);
                        } else {
                            queue.push_back(node);
                        }
                        color[node] = Color::Red;
                    }
                }
            }
        }

        for i in 0..n {
            if i == start_node || parent[i].is_none() {
                continue;
            }
            let end_type = self.nodes[i].type_id;
            if !query.end_types.is_empty() && !query.end_types.contains(&end_type) {
                continue;
            }

            // walk parents back to the start node
            let mut path = vec![i];
            let mut cur = i;
            while cur != start_node {
                let Some(p) = parent[cur] else {
                    break;
                };
                path.push(p);
                cur = p;
                if path.len() > n {
                    return Err(invalid_input_error("Cycle in shortest-path parent chain"));
                }
            }
            path.reverse();
            accum.append(self, query.direction, i, &path)?;
        }
        Ok(())
    }

    /// Find the edge between two consecutive path nodes in query direction
    pub(crate) fn hop_edge(&self, direction: FlowDirection, from: usize, to: usize) -> Option<usize> {
        match direction {
            FlowDirection::Out => self.nodes[from]
                .out_edges
                .iter()
                .copied()
                .find(|&e| self.edges[e].start == from && self.edges[e].end == to),
            _ => self.nodes[from]
                .in_edges
                .iter()
                .copied()
                .find(|&e| self.edges[e].end == from && self.edges[e].start == to)
        }
    }

    /// Build the per-hop flows of a node path
    pub(crate) fn build_path(
        &self,
        direction: FlowDirection,
        path: &[usize]
    ) -> AppResult<FlowPath> {
        let mut iflows = Vec::with_capacity(path.len().saturating_sub(1));
        let mut length = 0;

        for pair in path.windows(2) {
            let edge = self.hop_edge(direction, pair[0], pair[1]).ok_or_else(|| {
                invalid_input_error("Path reconstruction found no edge between adjacent nodes")
            })?;
            let e = &self.edges[edge];
            length += e.length;

            let (start_node, end_node, dir) = match direction {
                FlowDirection::Out => (pair[0], pair[1], FLOW_OUT),
                _ => (pair[1], pair[0], FLOW_IN)
            };
            let mut flow = Flow::new(self.nodes[start_node].type_id, self.nodes[end_node].type_id);
            flow.direction = dir;
            let obj_class = self.nodes[e.start]
                .obj_class
                .or(self.nodes[e.end].obj_class)
                .unwrap_or(0);
            flow.add_class_rules(obj_class, &e.rules);
            iflows.push(flow);
        }

        Ok(FlowPath {
            length,
            iflows
        })
    }
}

/// Collects paths grouped by end type, suppressing duplicates
#[derive(Debug, Default)]
pub(crate) struct PathAccumulator {
    entries: Vec<EndTypeFlows>
}

impl PathAccumulator {
    /// Append a path if no identical hop sequence was recorded yet.
    ///
    /// Returns whether a new path was added.
    pub(crate) fn append(
        &mut self,
        graph: &FlowGraph,
        direction: FlowDirection,
        end_node: usize,
        path: &[usize]
    ) -> AppResult<bool> {
        let flow_path = graph.build_path(direction, path)?;
        let end_type = graph.node(end_node).type_id;

        match self.entries.iter_mut().find(|e| e.end_type == end_type) {
            Some(entry) => {
                let duplicate = entry.paths.iter().any(|p| {
                    p.iflows.len() == flow_path.iflows.len()
                        && p.iflows
                            .iter()
                            .zip(flow_path.iflows.iter())
                            .all(|(a, b)| a.same_hop(b))
                });
                if duplicate {
                    return Ok(false);
                }
                entry.paths.push(flow_path);
            }
            None => {
                self.entries.push(EndTypeFlows {
                    end_type,
                    paths: vec![flow_path]
                });
            }
        }
        Ok(true)
    }

    /// Number of recorded paths to an end type
    pub(crate) fn num_paths(&self, end_type: TypeId) -> usize {
        self.entries
            .iter()
            .find(|e| e.end_type == end_type)
            .map(|e| e.paths.len())
            .unwrap_or(0)
    }

    /// Finish, sorting every end type's paths ascending by length
    pub(crate) fn into_answer(mut self, start_type: TypeId) -> TransitiveAnswer {
        for entry in &mut self.entries {
            entry.paths.sort_by_key(|p| p.length);
        }
        TransitiveAnswer {
            start_type,
            flows: self.entries
        }
    }
}

fn validate_query(policy: &Policy, query: &FlowQuery) -> AppResult<()> {
    if !policy.is_valid_type(query.start_type) {
        return Err(invalid_input_error(format!(
            "Invalid start type {} in query",
            query.start_type
        )));
    }
    if !(PERMMAP_MIN_WEIGHT..=PERMMAP_MAX_WEIGHT).contains(&query.min_weight) {
        return Err(invalid_input_error(format!(
            "Minimum weight {} out of range {}..={}",
            query.min_weight, PERMMAP_MIN_WEIGHT, PERMMAP_MAX_WEIGHT
        )));
    }
    for &t in query.end_types.iter().chain(query.excluded_types.iter()) {
        if !policy.is_valid_type(t) {
            return Err(invalid_input_error(format!("Invalid type {} in query", t)));
        }
    }
    for filter in &query.excluded_classes {
        if filter.class >= policy.num_classes() {
            return Err(invalid_input_error(format!(
                "Invalid class {} in query",
                filter.class
            )));
        }
    }
    Ok(())
}
