//! Path-scored graph expansion for long-term retrieval
//!
//! Starting from vector-search seed nodes, scores propagate hop by hop along
//! outgoing edges with per-hop damping. Paths reaching an already-visited
//! node merge, weak paths are pruned relative to the strongest path of the
//! hop, and expansion stops early once the path set stops growing. Memories
//! are then ranked by the paths that touch their nodes, blended with
//! importance and recency.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::{EdgeTypeWeights, ExpansionConfig, MergeStrategy};
use crate::similarity::cosine_similarity;
use crate::storage::{EdgeType, GraphStore, NodeType};

/// Score threshold under which two arrivals at a node count as one path
const MERGE_SCORE_WINDOW: f32 = 0.1;

/// Growth factor under which expansion stops early
const EARLY_STOP_GROWTH: f32 = 1.1;

/// Node score used when a node has no embedding
const DEFAULT_NODE_SCORE: f32 = 0.3;

/// Bonus multiplier for nodes of a preferred type
const PREFERRED_TYPE_BONUS: f32 = 1.2;

/// One scored walk through the graph
#[derive(Debug, Clone)]
pub struct Path {
    pub nodes: Vec<Uuid>,
    pub edges: Vec<Uuid>,
    pub score: f32,
    pub depth: usize,
    pub merged: bool,
}

/// A memory ranked by the expansion
#[derive(Debug, Clone)]
pub struct ExpandedMemory {
    pub memory_id: Uuid,
    pub final_score: f32,
    pub path_score: f32,
    pub recency: f32,
}

/// Per-edge-type weight lookup
pub fn edge_type_weight(weights: &EdgeTypeWeights, edge_type: EdgeType) -> f32 {
    match edge_type {
        EdgeType::Reference => weights.reference,
        EdgeType::Attribute => weights.attribute,
        EdgeType::HasProperty => weights.has_property,
        EdgeType::Relation => weights.relation,
        EdgeType::Temporal => weights.temporal,
        EdgeType::CoreRelation => weights.core_relation,
        EdgeType::Default => weights.default,
    }
}

/// Propagated score of one hop: the damped path component plus the node's
/// own similarity to the query.
pub fn propagate_score(
    path_score: f32,
    edge_weight: f32,
    node_score: f32,
    damping: f32,
    depth: usize,
) -> f32 {
    let delta = damping.powi(depth as i32);
    path_score * edge_weight * delta + node_score * (1.0 - delta)
}

fn merge_scores(strategy: MergeStrategy, a: f32, b: f32) -> f32 {
    match strategy {
        MergeStrategy::WeightedGeometric => (a * b).sqrt() * 1.2,
        MergeStrategy::MaxBonus => a.max(b) * 1.3,
    }
}

/// The expansion engine, borrowing the graph for one retrieval call
pub struct PathExpansion<'a> {
    graph: &'a GraphStore,
    config: &'a ExpansionConfig,
}

impl<'a> PathExpansion<'a> {
    pub fn new(graph: &'a GraphStore, config: &'a ExpansionConfig) -> Self {
        Self { graph, config }
    }

    /// Expand from vector seeds and rank the touched memories.
    ///
    /// `seeds` are `(node_id, score)` pairs from the vector index; nodes not
    /// present in the graph are ignored.
    pub fn expand(
        &self,
        seeds: &[(Uuid, f32)],
        query_embedding: Option<&[f32]>,
        preferred_types: &[NodeType],
        top_k: usize,
        now: DateTime<Utc>,
    ) -> Vec<ExpandedMemory> {
        let paths = self.expand_paths(seeds, query_embedding, preferred_types);
        self.aggregate(&paths, top_k, now)
    }

    /// The raw propagation walk, returning every surviving path
    pub fn expand_paths(
        &self,
        seeds: &[(Uuid, f32)],
        query_embedding: Option<&[f32]>,
        preferred_types: &[NodeType],
    ) -> Vec<Path> {
        let mut all_paths: Vec<Path> = Vec::new();
        let mut best_score_to_node: HashMap<Uuid, f32> = HashMap::new();

        for (node_id, score) in seeds {
            if !self.graph.has_node(*node_id) {
                continue;
            }
            let entry = best_score_to_node.entry(*node_id).or_insert(*score);
            *entry = entry.max(*score);
            all_paths.push(Path {
                nodes: vec![*node_id],
                edges: Vec::new(),
                score: *score,
                depth: 0,
                merged: false,
            });
        }
        if all_paths.is_empty() {
            return all_paths;
        }

        let mut active: Vec<usize> = (0..all_paths.len()).collect();

        for depth in 1..=self.config.max_hops {
            // One candidate path per newly reached terminal node
            let mut frontier: HashMap<Uuid, Path> = HashMap::new();

            for path_idx in &active {
                let path = all_paths[*path_idx].clone();
                let terminal = *path.nodes.last().expect("paths are never empty");

                let mut edges = self.graph.outgoing_edges(terminal);
                edges.sort_by(|a, b| {
                    let wa = edge_type_weight(&self.config.edge_type_weights, a.edge_type)
                        * a.importance;
                    let wb = edge_type_weight(&self.config.edge_type_weights, b.edge_type)
                        * b.importance;
                    wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
                });

                // Strong paths explore more branches
                let budget = ((self.config.max_branches_per_node as f32)
                    * (0.5 + 0.5 * path.score.min(1.0)))
                .floor()
                .max(1.0) as usize;

                for edge in edges.into_iter().take(budget) {
                    let next = edge.target_id;
                    if path.nodes.contains(&next) {
                        continue;
                    }

                    let edge_weight =
                        edge.importance * edge_type_weight(&self.config.edge_type_weights, edge.edge_type);
                    let node_score = self.node_score(next, query_embedding, preferred_types);
                    let mut new_score = propagate_score(
                        path.score,
                        edge_weight,
                        node_score,
                        self.config.damping_factor,
                        depth,
                    );

                    // Merge rule: a node already reached with a comparable
                    // score folds both arrivals into one path
                    let mut merged = false;
                    if let Some(best) = best_score_to_node.get(&next) {
                        if (new_score - best).abs() < MERGE_SCORE_WINDOW {
                            new_score = merge_scores(self.config.merge_strategy, new_score, *best);
                            merged = true;
                        }
                    }

                    match frontier.get_mut(&next) {
                        None => {
                            let mut nodes = path.nodes.clone();
                            nodes.push(next);
                            let mut edge_ids = path.edges.clone();
                            edge_ids.push(edge.id);
                            frontier.insert(
                                next,
                                Path {
                                    nodes,
                                    edges: edge_ids,
                                    score: new_score,
                                    depth,
                                    merged,
                                },
                            );
                        }
                        Some(existing) => {
                            if !merged && (new_score - existing.score).abs() < MERGE_SCORE_WINDOW {
                                new_score =
                                    merge_scores(self.config.merge_strategy, new_score, existing.score);
                                merged = true;
                            }
                            if new_score > existing.score {
                                let mut nodes = path.nodes.clone();
                                nodes.push(next);
                                let mut edge_ids = path.edges.clone();
                                edge_ids.push(edge.id);
                                existing.nodes = nodes;
                                existing.edges = edge_ids;
                                existing.score = new_score;
                            }
                            existing.merged |= merged;
                        }
                    }
                }
            }

            if frontier.is_empty() {
                break;
            }

            // Prune against the strongest path of this hop
            let max_score_this_hop = frontier
                .values()
                .map(|p| p.score)
                .fold(f32::MIN, f32::max);
            let cutoff = self.config.pruning_threshold * max_score_this_hop;

            let mut next_active = Vec::new();
            let before = all_paths.len();
            for (node_id, path) in frontier {
                if path.score < cutoff {
                    continue;
                }
                let best = best_score_to_node.entry(node_id).or_insert(path.score);
                // best_score_to_node is monotone within one call
                *best = best.max(path.score);

                next_active.push(all_paths.len());
                all_paths.push(path);
            }

            if next_active.is_empty() {
                break;
            }

            // Early stop once the path set stops growing meaningfully
            let grown = all_paths.len() as f32;
            if grown < before as f32 * EARLY_STOP_GROWTH {
                debug!(depth, total = all_paths.len(), "expansion growth stalled");
                active = next_active;
                break;
            }

            active = next_active;
        }

        all_paths
    }

    fn node_score(
        &self,
        node_id: Uuid,
        query_embedding: Option<&[f32]>,
        preferred_types: &[NodeType],
    ) -> f32 {
        let node = match self.graph.get_node(node_id) {
            Some(n) => n,
            None => return 0.0,
        };

        let base = match (query_embedding, &node.embedding) {
            (Some(q), Some(e)) => cosine_similarity(q, e).clamp(0.0, 1.0),
            _ => DEFAULT_NODE_SCORE,
        };

        if preferred_types.contains(&node.node_type) {
            base * PREFERRED_TYPE_BONUS
        } else {
            base
        }
    }

    /// Collect the memories each path touches, then blend the rank-weighted
    /// path score with importance and recency.
    fn aggregate(&self, paths: &[Path], top_k: usize, now: DateTime<Utc>) -> Vec<ExpandedMemory> {
        let mut contributions: HashMap<Uuid, Vec<f32>> = HashMap::new();

        for path in paths {
            let mut seen_memories: Vec<Uuid> = Vec::new();
            for node_id in &path.nodes {
                for memory_id in self.graph.memories_by_node(*node_id) {
                    if !seen_memories.contains(&memory_id) {
                        seen_memories.push(memory_id);
                    }
                }
            }
            for memory_id in seen_memories {
                contributions.entry(memory_id).or_default().push(path.score);
            }
        }

        let mut ranked: Vec<ExpandedMemory> = contributions
            .into_iter()
            .filter_map(|(memory_id, mut scores)| {
                let memory = self.graph.get_memory(memory_id)?;
                if memory.forgotten {
                    return None;
                }

                // Rank-weighted mean with weights 1, 1/2, 1/3, ...
                scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
                let mut weighted = 0.0f32;
                let mut weight_sum = 0.0f32;
                for (rank, score) in scores.iter().enumerate() {
                    let weight = 1.0 / (rank as f32 + 1.0);
                    weighted += weight * score;
                    weight_sum += weight;
                }
                let path_score = if weight_sum > 0.0 {
                    weighted / weight_sum
                } else {
                    0.0
                };

                let recency = recency_score(memory.created_at, memory.last_accessed_at, now);
                let final_score = self.config.path_weight * path_score
                    + self.config.importance_weight * memory.importance
                    + self.config.recency_weight * recency;

                Some(ExpandedMemory {
                    memory_id,
                    final_score,
                    path_score,
                    recency,
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(top_k);
        ranked
    }
}

/// Recency blend of creation and last access ages
pub fn recency_score(
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f32 {
    let created_days = (now - created_at).num_seconds().max(0) as f32 / 86_400.0;
    let accessed_days = (now - last_accessed_at).num_seconds().max(0) as f32 / 86_400.0;
    0.4 * (-created_days / 30.0).exp() + 0.6 * (-accessed_days / 7.0).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Edge, Memory, MemoryKind, Node};

    fn expansion_config() -> ExpansionConfig {
        ExpansionConfig {
            pruning_threshold: 0.0,
            ..ExpansionConfig::default()
        }
    }

    #[test]
    fn propagated_score_matches_worked_example() {
        // alpha = 0.85, path 0.8, edge weight 1.2, node score 0.6, depth 1
        let score = propagate_score(0.8, 1.2, 0.6, 0.85, 1);
        assert!((score - 0.906).abs() < 1e-4);
    }

    #[test]
    fn merge_bonuses_are_fixed() {
        let geometric = merge_scores(MergeStrategy::WeightedGeometric, 0.5, 0.5);
        assert!((geometric - 0.6).abs() < 1e-6);

        let max_bonus = merge_scores(MergeStrategy::MaxBonus, 0.4, 0.5);
        assert!((max_bonus - 0.65).abs() < 1e-6);
    }

    fn chain_graph(hops: usize) -> (GraphStore, Vec<Uuid>, Uuid) {
        // n0 -> n1 -> n2 -> ... with one memory over every node
        let mut graph = GraphStore::new();
        let mut node_ids = Vec::new();
        for i in 0..=hops {
            let node = Node::new(format!("node {}", i), NodeType::Entity);
            node_ids.push(node.id);
            graph.upsert_node(node);
        }
        let mut edge_ids = Vec::new();
        for pair in node_ids.windows(2) {
            let edge = Edge::new(pair[0], pair[1], EdgeType::Relation, "next", 0.9);
            edge_ids.push(edge.id);
            graph.upsert_edge(edge).unwrap();
        }
        let mut memory = Memory::new(MemoryKind::Fact, 0.5, 0.95);
        memory.node_ids = node_ids.clone();
        memory.edge_ids = edge_ids;
        let memory_id = memory.id;
        graph.upsert_memory(memory).unwrap();
        (graph, node_ids, memory_id)
    }

    #[test]
    fn expansion_respects_max_hops() {
        let (graph, node_ids, _) = chain_graph(5);
        let config = ExpansionConfig {
            max_hops: 2,
            ..expansion_config()
        };
        let engine = PathExpansion::new(&graph, &config);

        let paths = engine.expand_paths(&[(node_ids[0], 0.9)], None, &[]);
        assert!(!paths.is_empty());
        assert!(paths.iter().all(|p| p.depth <= 2));
        // A 5-node chain pruned at 2 hops never reaches the 4th node
        assert!(paths.iter().all(|p| !p.nodes.contains(&node_ids[4])));
    }

    #[test]
    fn seed_outside_graph_is_ignored() {
        let (graph, node_ids, _) = chain_graph(2);
        let config = expansion_config();
        let engine = PathExpansion::new(&graph, &config);

        let results = engine.expand(
            &[(Uuid::new_v4(), 0.9), (node_ids[0], 0.5)],
            None,
            &[],
            10,
            Utc::now(),
        );
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn forgotten_memories_are_excluded() {
        let (mut graph, node_ids, memory_id) = chain_graph(2);
        graph.get_memory_mut(memory_id).unwrap().forgotten = true;

        let config = expansion_config();
        let engine = PathExpansion::new(&graph, &config);
        let results = engine.expand(&[(node_ids[0], 0.9)], None, &[], 10, Utc::now());
        assert!(results.is_empty());
    }

    #[test]
    fn final_score_is_order_independent() {
        // Two memories with identical inputs score identically regardless of
        // seed order (convex combination property)
        let mut graph = GraphStore::new();
        let shared_time = Utc::now();

        let mut ids = Vec::new();
        for name in ["left", "right"] {
            let node = Node::new(name, NodeType::Entity);
            let node_id = node.id;
            graph.upsert_node(node);
            let mut memory = Memory::new(MemoryKind::Fact, 0.5, 0.95);
            memory.node_ids = vec![node_id];
            memory.created_at = shared_time;
            memory.last_accessed_at = shared_time;
            graph.upsert_memory(memory).unwrap();
            ids.push(node_id);
        }

        let config = expansion_config();
        let engine = PathExpansion::new(&graph, &config);

        let forward = engine.expand(&[(ids[0], 0.7), (ids[1], 0.7)], None, &[], 10, shared_time);
        let backward = engine.expand(&[(ids[1], 0.7), (ids[0], 0.7)], None, &[], 10, shared_time);

        assert_eq!(forward.len(), 2);
        assert!((forward[0].final_score - forward[1].final_score).abs() < 1e-6);
        assert!((forward[0].final_score - backward[0].final_score).abs() < 1e-6);
    }

    #[test]
    fn preferred_type_gets_bonus() {
        let mut graph = GraphStore::new();
        let seed = Node::new("seed", NodeType::Entity);
        let seed_id = seed.id;
        graph.upsert_node(seed);

        let mut preferred = Node::new("preferred person", NodeType::Person);
        preferred.embedding = Some(vec![1.0, 0.0]);
        let preferred_id = preferred.id;
        graph.upsert_node(preferred);

        let mut plain = Node::new("plain entity", NodeType::Entity);
        plain.embedding = Some(vec![1.0, 0.0]);
        let plain_id = plain.id;
        graph.upsert_node(plain);

        for target in [preferred_id, plain_id] {
            graph
                .upsert_edge(Edge::new(seed_id, target, EdgeType::Relation, "r", 0.8))
                .unwrap();
        }

        for (i, node_id) in [preferred_id, plain_id].into_iter().enumerate() {
            let mut memory = Memory::new(MemoryKind::Fact, 0.5, 0.95);
            memory.node_ids = vec![node_id];
            memory.metadata.insert("idx".into(), i.to_string());
            graph.upsert_memory(memory).unwrap();
        }

        let config = expansion_config();
        let engine = PathExpansion::new(&graph, &config);
        let query = vec![1.0, 0.0];
        let results = engine.expand(
            &[(seed_id, 0.9)],
            Some(&query),
            &[NodeType::Person],
            10,
            Utc::now(),
        );

        // The memory holding the preferred-type node outranks the plain one
        let preferred_memories = graph.memories_by_node(preferred_id);
        assert_eq!(results.len(), 2);
        let top = &results[0];
        assert!(preferred_memories.contains(&top.memory_id));
    }

    #[test]
    fn converging_paths_merge_with_bonus() {
        // Diamond: seed -> a -> sink, seed -> b -> sink. Both arrivals at the
        // sink carry identical scores, so they merge with the 1.2 bonus.
        let mut graph = GraphStore::new();
        let seed = Node::new("seed", NodeType::Entity);
        let a = Node::new("a", NodeType::Entity);
        let b = Node::new("b", NodeType::Entity);
        let sink = Node::new("sink", NodeType::Entity);
        let (seed_id, a_id, b_id, sink_id) = (seed.id, a.id, b.id, sink.id);
        for node in [seed, a, b, sink] {
            graph.upsert_node(node);
        }
        for (from, to) in [(seed_id, a_id), (seed_id, b_id), (a_id, sink_id), (b_id, sink_id)] {
            graph
                .upsert_edge(Edge::new(from, to, EdgeType::Relation, "r", 0.8))
                .unwrap();
        }

        let config = expansion_config();
        let engine = PathExpansion::new(&graph, &config);
        let paths = engine.expand_paths(&[(seed_id, 0.9)], None, &[]);

        let sink_path = paths
            .iter()
            .find(|p| p.nodes.last() == Some(&sink_id))
            .expect("sink reached");
        assert!(sink_path.merged);

        // The merged score beats what a single unmerged arrival would carry
        let a_path = paths.iter().find(|p| p.nodes.last() == Some(&a_id)).unwrap();
        let single = propagate_score(a_path.score, 0.8, DEFAULT_NODE_SCORE, config.damping_factor, 2);
        assert!(sink_path.score > single);
    }

    #[test]
    fn recency_decays_with_age() {
        let now = Utc::now();
        let fresh = recency_score(now, now, now);
        assert!((fresh - 1.0).abs() < 1e-5);

        let old = recency_score(
            now - chrono::Duration::days(60),
            now - chrono::Duration::days(30),
            now,
        );
        assert!(old < fresh);
        assert!(old > 0.0);
    }
}
