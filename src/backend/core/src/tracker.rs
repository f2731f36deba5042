//! Dependency tracking between attributes.
//!
//! The tracker maintains a directed graph of declared dependencies:
//! attribute → attribute and attribute → external source. It validates edge
//! additions (self-loops, per-attribute caps, cycles, depth bounds), resolves
//! computation order, and answers affected-set queries for invalidation
//! cascades.

use parking_lot::RwLock;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::config::TrackerConfig;
use crate::definition::DependencySpec;
use crate::error::{FacetError, Result};
use crate::events::{EventBus, GraphChangeKind, GraphEvent};

// ═══════════════════════════════════════════════════════════════════════════════
// Graph State
// ═══════════════════════════════════════════════════════════════════════════════

/// Node payload: the attribute id or external source key.
type NodeKey = String;

struct GraphInner {
    /// Edge u → v means "u depends on v". Forward dependencies are the
    /// `Outgoing` neighbours, dependents the `Incoming` ones.
    graph: DiGraph<NodeKey, DependencySpec>,

    /// Map from node key to graph node index for O(1) lookup
    index: HashMap<NodeKey, NodeIndex>,
}

impl GraphInner {
    fn node(&mut self, key: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(key) {
            return *idx;
        }
        let idx = self.graph.add_node(key.to_string());
        self.index.insert(key.to_string(), idx);
        idx
    }

    /// Longest dependency chain below `start`, following outgoing edges.
    /// A node already on the visited set contributes depth 0, which
    /// terminates cleanly on repeated encounters.
    fn depth_from(&self, start: NodeIndex, visited: &mut HashSet<NodeIndex>) -> usize {
        if !visited.insert(start) {
            return 0;
        }
        let mut max_child = 0usize;
        for next in self.graph.neighbors_directed(start, Direction::Outgoing) {
            max_child = max_child.max(1 + self.depth_from(next, visited));
        }
        visited.remove(&start);
        max_child
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics & Snapshots
// ═══════════════════════════════════════════════════════════════════════════════

/// Counters describing the current graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerStats {
    /// Number of nodes (attributes and external sources)
    pub nodes: usize,
    /// Number of dependency edges
    pub edges: usize,
    /// Deepest dependency chain observed
    pub max_depth: usize,
}

/// Adjacency listing for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// node key → keys it depends on
    pub dependencies: HashMap<String, Vec<String>>,
    /// node key → keys that depend on it
    pub dependents: HashMap<String, Vec<String>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dependency Tracker
// ═══════════════════════════════════════════════════════════════════════════════

/// Directed graph of declared dependencies with cycle detection, topological
/// ordering, and depth bounds.
pub struct DependencyTracker {
    inner: RwLock<GraphInner>,
    config: TrackerConfig,
    events: EventBus<GraphEvent>,
}

impl DependencyTracker {
    /// Create an empty tracker.
    pub fn new(config: TrackerConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: RwLock::new(GraphInner {
                graph: DiGraph::new(),
                index: HashMap::new(),
            }),
            config,
            events,
        }
    }

    /// Subscribe to graph change events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<GraphEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a dependency edge from `from` to `dep.target`.
    ///
    /// Fails on self-loops, when `from` is at its per-attribute dependency
    /// cap, when the edge would close a cycle, or when the resulting chain
    /// from `from` would exceed the configured depth bound. The graph is
    /// unchanged on failure.
    pub fn add_edge(&self, from: &str, dep: DependencySpec) -> Result<()> {
        let to_key = dep.node_key();
        if to_key == from {
            return Err(FacetError::circular_dependency(format!(
                "attribute '{}' cannot depend on itself",
                from
            )));
        }

        let mut inner = self.inner.write();

        let from_idx = inner.node(from);
        if inner
            .graph
            .edges_directed(from_idx, Direction::Outgoing)
            .count()
            >= self.config.max_dependencies_per_attribute
        {
            return Err(FacetError::dependency_limit_exceeded(
                from,
                self.config.max_dependencies_per_attribute,
            ));
        }

        let to_idx = inner.node(&to_key);
        if inner.graph.find_edge(from_idx, to_idx).is_some() {
            // Edge already present; re-adding is a no-op
            return Ok(());
        }

        let edge = inner.graph.add_edge(from_idx, to_idx, dep);

        // Check for cycles after adding the edge
        if is_cyclic_directed(&inner.graph) {
            inner.graph.remove_edge(edge);
            return Err(FacetError::circular_dependency(format!(
                "adding edge {} -> {} would create a cycle",
                from, to_key
            )));
        }

        // Check the depth bound from the dependent side
        let depth = inner.depth_from(from_idx, &mut HashSet::new());
        if depth > self.config.max_depth {
            inner.graph.remove_edge(edge);
            return Err(FacetError::max_depth_exceeded(
                from,
                depth,
                self.config.max_depth,
            ));
        }

        let affected = Self::dependents_of(&inner, from_idx);
        drop(inner);

        debug!(from = from, to = %to_key, "Dependency edge added");
        self.events.emit(GraphEvent {
            kind: GraphChangeKind::Added,
            attribute_id: Some(from.to_string()),
            edge: Some(to_key),
            affected,
        });
        Ok(())
    }

    /// Remove the edge from `from` to `to`, if present.
    pub fn remove_edge(&self, from: &str, to: &str) -> bool {
        let mut inner = self.inner.write();
        let (Some(&from_idx), Some(&to_idx)) = (inner.index.get(from), inner.index.get(to)) else {
            return false;
        };
        let Some(edge) = inner.graph.find_edge(from_idx, to_idx) else {
            return false;
        };
        inner.graph.remove_edge(edge);
        let affected = Self::dependents_of(&inner, from_idx);
        drop(inner);

        self.events.emit(GraphEvent {
            kind: GraphChangeKind::Removed,
            attribute_id: Some(from.to_string()),
            edge: Some(to.to_string()),
            affected,
        });
        true
    }

    /// Remove an attribute and every edge incident to it (graph garbage
    /// collection on unregister).
    pub fn remove_attribute(&self, attribute_id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(idx) = inner.index.remove(attribute_id) else {
            return false;
        };
        let affected = Self::dependents_of(&inner, idx);

        // remove_node swaps the last node into the removed slot; rebuild the
        // index from the surviving node weights.
        inner.graph.remove_node(idx);
        let rebuilt: HashMap<NodeKey, NodeIndex> = inner
            .graph
            .node_indices()
            .map(|i| (inner.graph[i].clone(), i))
            .collect();
        inner.index = rebuilt;
        drop(inner);

        self.events.emit(GraphEvent {
            kind: GraphChangeKind::Removed,
            attribute_id: Some(attribute_id.to_string()),
            edge: None,
            affected,
        });
        true
    }

    /// Drop the whole graph.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.graph.clear();
        inner.index.clear();
        drop(inner);

        self.events.emit(GraphEvent {
            kind: GraphChangeKind::Cleared,
            attribute_id: None,
            edge: None,
            affected: Vec::new(),
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Direct dependencies of an attribute.
    pub fn dependencies_of(&self, attribute_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let Some(&idx) = inner.index.get(attribute_id) else {
            return Vec::new();
        };
        inner
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| inner.graph[n].clone())
            .collect()
    }

    /// All transitive dependents of `root`, excluding the root itself.
    ///
    /// BFS over the reverse (incoming) direction; used by the invalidator to
    /// fan out cascades.
    pub fn affected(&self, root: &str) -> Vec<String> {
        let inner = self.inner.read();
        let Some(&idx) = inner.index.get(root) else {
            return Vec::new();
        };
        Self::dependents_of(&inner, idx)
    }

    fn dependents_of(inner: &GraphInner, root: NodeIndex) -> Vec<String> {
        let mut visited = HashSet::new();
        visited.insert(root);
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root]);

        while let Some(current) = queue.pop_front() {
            for dependent in inner.graph.neighbors_directed(current, Direction::Incoming) {
                if visited.insert(dependent) {
                    out.push(inner.graph[dependent].clone());
                    queue.push_back(dependent);
                }
            }
        }

        out
    }

    /// Longest dependency chain from the given attribute.
    pub fn depth(&self, attribute_id: &str) -> usize {
        let inner = self.inner.read();
        let Some(&idx) = inner.index.get(attribute_id) else {
            return 0;
        };
        inner.depth_from(idx, &mut HashSet::new())
    }

    /// Resolve a computation order for the given attributes: every dependency
    /// appears before its dependent, transitive dependencies included,
    /// repeated inputs deduplicated.
    ///
    /// Runs over a snapshot of the adjacency taken under the read lock, so
    /// concurrent structural edits cannot corrupt the traversal. Raises
    /// `CIRCULAR_DEPENDENCY` if a cycle is observed at resolution time.
    pub fn resolve(&self, ids: &[impl AsRef<str>]) -> Result<Vec<String>> {
        // Snapshot: key → outgoing dependency keys
        let adjacency: HashMap<String, Vec<String>> = {
            let inner = self.inner.read();
            inner
                .index
                .iter()
                .map(|(key, &idx)| {
                    let deps = inner
                        .graph
                        .neighbors_directed(idx, Direction::Outgoing)
                        .map(|n| inner.graph[n].clone())
                        .collect();
                    (key.clone(), deps)
                })
                .collect()
        };

        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            Visiting,
            Done,
        }

        fn visit(
            key: &str,
            adjacency: &HashMap<String, Vec<String>>,
            colours: &mut HashMap<String, Colour>,
            order: &mut Vec<String>,
        ) -> Result<()> {
            match colours.get(key) {
                Some(Colour::Done) => return Ok(()),
                Some(Colour::Visiting) => {
                    return Err(FacetError::circular_dependency(format!(
                        "cycle observed at '{}' during resolution",
                        key
                    )));
                }
                None => {}
            }
            colours.insert(key.to_string(), Colour::Visiting);
            if let Some(deps) = adjacency.get(key) {
                for dep in deps {
                    visit(dep, adjacency, colours, order)?;
                }
            }
            colours.insert(key.to_string(), Colour::Done);
            order.push(key.to_string());
            Ok(())
        }

        let mut colours = HashMap::new();
        let mut order = Vec::new();
        for id in ids {
            visit(id.as_ref(), &adjacency, &mut colours, &mut order)?;
        }
        Ok(order)
    }

    /// Counters describing the current graph.
    pub fn stats(&self) -> TrackerStats {
        let inner = self.inner.read();
        let max_depth = inner
            .graph
            .node_indices()
            .map(|idx| inner.depth_from(idx, &mut HashSet::new()))
            .max()
            .unwrap_or(0);
        TrackerStats {
            nodes: inner.graph.node_count(),
            edges: inner.graph.edge_count(),
            max_depth,
        }
    }

    /// Full adjacency listing for diagnostics.
    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.inner.read();
        let mut snapshot = GraphSnapshot::default();
        for (key, &idx) in &inner.index {
            let deps: Vec<String> = inner
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .map(|n| inner.graph[n].clone())
                .collect();
            let dependents: Vec<String> = inner
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|n| inner.graph[n].clone())
                .collect();
            snapshot.dependencies.insert(key.clone(), deps);
            snapshot.dependents.insert(key.clone(), dependents);
        }
        snapshot
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
