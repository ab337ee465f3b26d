//! Randomized multi-path enumeration between two types.
//!
//! [`PathFinder`] repeatedly runs a breadth-first search from the start
//! type's nodes towards a single end type, visiting out-edges (or in-edges)
//! in a freshly shuffled order on every pass. Each pass may surface paths
//! the previous ones missed; duplicates are suppressed, so the running
//! total only grows. The caller drives the iterator and bounds wall time by
//! deciding when to stop.
//!
//! Randomness is injected: [`PathFinder::with_seed`] gives deterministic
//! runs for tests, [`PathFinder::new`] seeds from OS entropy.

use std::collections::VecDeque;

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::{FlowDirection, FlowGraph, FlowQuery, PathAccumulator, TransitiveAnswer};
use crate::{
    error::{AppResult, bad_direction_error, invalid_input_error, truncated_error},
    policy::Policy
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BfsColor {
    White,
    Grey,
    Black
}

/// Iterative random-BFS path search between a start and a single end type.
///
/// # Example
///
/// ```no_run
/// use sepolicy_analyzer::infoflow::{FlowDirection, FlowQuery, PathFinder};
/// # fn demo(policy: &sepolicy_analyzer::policy::Policy) -> masterror::AppResult<()> {
/// let mut query = FlowQuery::new(3, FlowDirection::Out);
/// query.end_types = vec![7];
///
/// let mut finder = PathFinder::with_seed(policy, query, 42)?;
/// let mut total = 0;
/// for _ in 0..20 {
///     total = finder.next_pass()?;
/// }
/// let answer = finder.finish()?;
/// assert_eq!(answer.num_paths(), total);
/// # Ok(())
/// # }
/// ```
pub struct PathFinder {
    graph:    FlowGraph,
    query:    FlowQuery,
    /// Start-side nodes, reshuffled after every full round
    nodes:    Vec<usize>,
    /// Nodes carrying the end type
    enodes:   Vec<usize>,
    cur:      usize,
    accum:    PathAccumulator,
    rng:      StdRng,
    aborted:  bool
}

impl PathFinder {
    /// Start a path search seeded from OS entropy
    pub fn new(policy: &Policy, query: FlowQuery) -> AppResult<Self> {
        Self::with_rng(policy, query, StdRng::from_entropy())
    }

    /// Start a path search with a fixed seed; passes become deterministic
    pub fn with_seed(policy: &Policy, query: FlowQuery, seed: u64) -> AppResult<Self> {
        Self::with_rng(policy, query, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: &Policy, query: FlowQuery, rng: StdRng) -> AppResult<Self> {
        if !matches!(query.direction, FlowDirection::In | FlowDirection::Out) {
            return Err(bad_direction_error("Path search requires direction In or Out"));
        }
        if query.end_types.len() != 1 {
            return Err(invalid_input_error("Path search requires exactly one end type"));
        }

        let graph = FlowGraph::build(policy, &query)?;
        let nodes = graph.nodes_for_type(query.start_type);
        let enodes = graph.nodes_for_type(query.end_types[0]);

        Ok(Self {
            graph,
            query,
            nodes,
            enodes,
            cur: 0,
            accum: PathAccumulator::default(),
            rng,
            aborted: false
        })
    }

    /// Run one randomized BFS pass from the next start node.
    ///
    /// Returns the running total of distinct paths found so far.
    pub fn next_pass(&mut self) -> AppResult<usize> {
        if self.aborted {
            return Err(truncated_error());
        }
        if self.nodes.is_empty() || self.enodes.is_empty() {
            return Ok(0);
        }

        let start_node = self.nodes[self.cur];
        self.breadth_first_random(start_node)?;

        self.cur += 1;
        if self.cur >= self.nodes.len() {
            self.cur = 0;
            self.nodes.shuffle(&mut self.rng);
        }

        Ok(self.accum.num_paths(self.query.end_types[0]))
    }

    /// Abandon the search; further calls fail with a truncation error
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Finish the search, sorting each end type's paths by length
    pub fn finish(self) -> AppResult<TransitiveAnswer> {
        if self.aborted {
            return Err(truncated_error());
        }
        Ok(self.accum.into_answer(self.query.start_type))
    }

    fn breadth_first_random(&mut self, start_node: usize) -> AppResult<()> {
        let n = self.graph.num_nodes();
        let mut color = vec![BfsColor::White; n];
        let mut parent: Vec<Option<usize>> = vec![None; n];
        let mut distance = vec![0usize; n];
        let mut queue: VecDeque<usize> = VecDeque::new();

        color[start_node] = BfsColor::Grey;
        queue.push_back(start_node);

        while let Some(cur) = queue.pop_front() {
            if self.enodes.contains(&cur) {
                let path = walk_parents(&parent, &distance, cur);
                self.accum.append(&self.graph, self.query.direction, cur, &path)?;
            }

            color[cur] = BfsColor::Black;
            let mut edge_list: Vec<usize> = match self.query.direction {
                FlowDirection::Out => self.graph.node(cur).out_edges.clone(),
                _ => self.graph.node(cur).in_edges.clone()
            };
            edge_list.shuffle(&mut self.rng);

            for edge in edge_list {
                let node = match self.query.direction {
                    FlowDirection::Out => self.graph.edge(edge).end,
                    _ => self.graph.edge(edge).start
                };
                if color[node] == BfsColor::White {
                    color[node] = BfsColor::Grey;
                    distance[node] = distance[cur] + 1;
                    parent[node] = Some(cur);
                    queue.push_back(node);
                }
            }
        }

        Ok(())
    }
}

/// Reconstruct the node path to `node` from the BFS parent pointers
fn walk_parents(parent: &[Option<usize>], distance: &[usize], node: usize) -> Vec<usize> {
    let mut path = vec![0; distance[node] + 1];
    let mut cur = node;
    for slot in path.iter_mut().rev() {
        *slot = cur;
        match parent[cur] {
            Some(p) => cur = p,
            None => break
        }
    }
    path
}
