// Relation Graph Queries
// Callers, implementations, and bounded call-graph traversal over the
// store's relation rows. The graph is rebuilt per query from the live rows
// (relation counts are small relative to bodies) and traversal always runs
// with an explicit visited set and depth cap, so cyclic call chains
// terminate by construction.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::store::records::RelationRecord;
use crate::store::Store;
use crate::types::RelationType;

/// Hard cap on traversal depth regardless of the requested value.
const MAX_DEPTH: u32 = 10;

/// Traversal direction for call graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphDirection {
    /// Who does this symbol call.
    #[default]
    Callees,
    /// Who calls this symbol.
    Callers,
}

/// One edge in a graph answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub doc_id: String,
    pub line: u32,
    pub rel_type: RelationType,
}

/// One reachable symbol with its distance from the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub depth: u32,
}

/// Bounded call-graph answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGraph {
    pub root: String,
    pub direction: GraphDirection,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// True when the depth cap cut the traversal short.
    pub truncated: bool,
    /// True when the reachable subgraph contains a cycle.
    pub has_cycles: bool,
}

pub struct GraphEngine {
    store: Arc<Store>,
}

impl GraphEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Call sites targeting a symbol name.
    pub fn get_callers(&self, symbol: &str, limit: usize) -> Vec<GraphEdge> {
        self.store
            .all_relations()
            .into_iter()
            .filter(|r| r.rel_type == RelationType::Calls && r.to_symbol == symbol)
            .take(limit)
            .map(edge_of)
            .collect()
    }

    /// Types that implement or inherit from a symbol name.
    pub fn get_implementations(&self, symbol: &str, limit: usize) -> Vec<GraphEdge> {
        self.store
            .all_relations()
            .into_iter()
            .filter(|r| {
                matches!(
                    r.rel_type,
                    RelationType::Implements | RelationType::Inherits
                ) && r.to_symbol == symbol
            })
            .take(limit)
            .map(edge_of)
            .collect()
    }

    /// Breadth-first call graph from a root symbol, bounded by depth and
    /// node count.
    pub fn call_graph(
        &self,
        root: &str,
        direction: GraphDirection,
        depth: u32,
        max_nodes: usize,
    ) -> CallGraph {
        let depth = depth.clamp(1, MAX_DEPTH);
        let relations: Vec<RelationRecord> = self
            .store
            .all_relations()
            .into_iter()
            .filter(|r| r.rel_type == RelationType::Calls)
            .collect();

        // Name-keyed graph; symbols with the same name collapse into one
        // node, which is the coarse-but-stable contract of the tool.
        let mut graph: DiGraph<String, (String, u32)> = DiGraph::new();
        let mut index_of: HashMap<String, NodeIndex> = HashMap::new();
        let mut node = |graph: &mut DiGraph<String, (String, u32)>,
                        index_of: &mut HashMap<String, NodeIndex>,
                        name: &str| {
            *index_of
                .entry(name.to_string())
                .or_insert_with(|| graph.add_node(name.to_string()))
        };
        for relation in &relations {
            let from = node(&mut graph, &mut index_of, &relation.from_symbol);
            let to = node(&mut graph, &mut index_of, &relation.to_symbol);
            graph.add_edge(
                from,
                to,
                (relation.from_doc_id.as_str().to_string(), relation.line),
            );
        }

        let Some(&start) = index_of.get(root) else {
            return CallGraph {
                root: root.to_string(),
                direction,
                nodes: Vec::new(),
                edges: Vec::new(),
                truncated: false,
                has_cycles: false,
            };
        };

        let walk_direction = match direction {
            GraphDirection::Callees => Direction::Outgoing,
            GraphDirection::Callers => Direction::Incoming,
        };

        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut edges: Vec<GraphEdge> = Vec::new();
        let mut truncated = false;
        let mut queue: VecDeque<(NodeIndex, u32)> = VecDeque::new();

        visited.insert(start);
        nodes.push(GraphNode {
            name: graph[start].clone(),
            depth: 0,
        });
        queue.push_back((start, 0));

        while let Some((current, current_depth)) = queue.pop_front() {
            if current_depth >= depth {
                if graph
                    .neighbors_directed(current, walk_direction)
                    .next()
                    .is_some()
                {
                    truncated = true;
                }
                continue;
            }
            let mut walker = graph
                .neighbors_directed(current, walk_direction)
                .detach();
            while let Some((edge_idx, next)) = walker.next(&graph) {
                let (doc_id, line) = graph[edge_idx].clone();
                let (from_idx, to_idx) = match walk_direction {
                    Direction::Outgoing => (current, next),
                    Direction::Incoming => (next, current),
                };
                edges.push(GraphEdge {
                    from: graph[from_idx].clone(),
                    to: graph[to_idx].clone(),
                    doc_id,
                    line,
                    rel_type: RelationType::Calls,
                });
                if visited.insert(next) {
                    if nodes.len() >= max_nodes {
                        truncated = true;
                        continue;
                    }
                    nodes.push(GraphNode {
                        name: graph[next].clone(),
                        depth: current_depth + 1,
                    });
                    queue.push_back((next, current_depth + 1));
                }
            }
        }

        // Cycle flag over the visited subgraph.
        let sub = graph.filter_map(
            |idx, name| visited.contains(&idx).then(|| name.clone()),
            |_, edge| Some(edge.clone()),
        );
        let has_cycles = petgraph::algo::is_cyclic_directed(&sub);

        edges.sort_by(|a, b| {
            a.from
                .cmp(&b.from)
                .then(a.to.cmp(&b.to))
                .then(a.line.cmp(&b.line))
        });
        edges.dedup_by(|a, b| a.from == b.from && a.to == b.to && a.line == b.line);

        CallGraph {
            root: root.to_string(),
            direction,
            nodes,
            edges,
            truncated,
            has_cycles,
        }
    }
}

fn edge_of(relation: RelationRecord) -> GraphEdge {
    GraphEdge {
        from: relation.from_symbol,
        to: relation.to_symbol,
        doc_id: relation.from_doc_id.as_str().to_string(),
        line: relation.line,
        rel_type: relation.rel_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::wal::WalEntry;
    use crate::types::{DocId, RootId};

    fn relation(from: &str, to: &str, rel_type: RelationType, line: u32) -> RelationRecord {
        let root = RootId::parse("00112233aabbccdd").expect("root id");
        let doc_id = DocId::new(&root, "a.py").expect("doc id");
        RelationRecord {
            from_doc_id: doc_id.clone(),
            from_root_id: root,
            from_symbol: from.to_string(),
            from_symbol_id: None,
            to_symbol: to.to_string(),
            to_doc_id: None,
            to_symbol_id: None,
            rel_type,
            line,
            metadata: None,
        }
    }

    fn store_with(relations: Vec<RelationRecord>) -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
        let token = store.take_writer_token().expect("token");
        let root = RootId::parse("00112233aabbccdd").expect("root id");
        let doc_id = DocId::new(&root, "a.py").expect("doc id");
        store
            .commit(
                &token,
                vec![WalEntry::ReplaceSymbols {
                    doc_id,
                    symbols: vec![],
                    relations,
                }],
            )
            .expect("commit");
        (store, dir)
    }

    #[test]
    fn test_callers_and_implementations() {
        let (store, _dir) = store_with(vec![
            relation("handler", "login", RelationType::Calls, 10),
            relation("cron", "login", RelationType::Calls, 20),
            relation("login", "db_save", RelationType::Calls, 3),
            relation("AdminLogin", "Login", RelationType::Inherits, 1),
        ]);
        let graph = GraphEngine::new(store);

        let callers = graph.get_callers("login", 50);
        assert_eq!(callers.len(), 2);
        let implementations = graph.get_implementations("Login", 50);
        assert_eq!(implementations.len(), 1);
        assert_eq!(implementations[0].from, "AdminLogin");
    }

    #[test]
    fn test_call_graph_depth_cap() {
        let (store, _dir) = store_with(vec![
            relation("a", "b", RelationType::Calls, 1),
            relation("b", "c", RelationType::Calls, 2),
            relation("c", "d", RelationType::Calls, 3),
        ]);
        let graph = GraphEngine::new(store);

        let result = graph.call_graph("a", GraphDirection::Callees, 2, 100);
        let names: Vec<&str> = result.nodes.iter().map(|n| n.name.as_str()).collect();
        assert!(names.contains(&"a"));
        assert!(names.contains(&"b"));
        assert!(names.contains(&"c"));
        assert!(!names.contains(&"d"));
        assert!(result.truncated);
    }

    #[test]
    fn test_cycles_terminate_and_are_flagged() {
        let (store, _dir) = store_with(vec![
            relation("a", "b", RelationType::Calls, 1),
            relation("b", "a", RelationType::Calls, 2),
        ]);
        let graph = GraphEngine::new(store);

        let result = graph.call_graph("a", GraphDirection::Callees, 8, 100);
        assert_eq!(result.nodes.len(), 2);
        assert!(result.has_cycles);
    }

    #[test]
    fn test_callers_direction() {
        let (store, _dir) = store_with(vec![
            relation("x", "target", RelationType::Calls, 1),
            relation("y", "x", RelationType::Calls, 2),
        ]);
        let graph = GraphEngine::new(store);

        let result = graph.call_graph("target", GraphDirection::Callers, 5, 100);
        let names: Vec<&str> = result.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["target", "x", "y"]);
        assert!(result
            .edges
            .iter()
            .any(|e| e.from == "x" && e.to == "target"));
    }

    #[test]
    fn test_unknown_root_symbol_is_empty() {
        let (store, _dir) = store_with(vec![]);
        let graph = GraphEngine::new(store);
        let result = graph.call_graph("ghost", GraphDirection::Callees, 3, 100);
        assert!(result.nodes.is_empty());
        assert!(!result.has_cycles);
    }
}
