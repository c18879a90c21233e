//! Graph store: typed nodes and edges grouped into memories
//!
//! The store is held in memory (single-writer/multi-reader, guarded by the
//! long-term manager) and persisted as a whole to SQLite. Adjacency lists and
//! the node→memories inverted index are kept in lock-step with memory
//! mutations; every public mutation preserves the containment invariants.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Type of a graph node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Person,
    Entity,
    Event,
    Topic,
    Attribute,
    Value,
    Time,
    Location,
    Other,
}

impl NodeType {
    pub fn parse(s: &str) -> Self {
        match s {
            "person" => Self::Person,
            "entity" => Self::Entity,
            "event" => Self::Event,
            "topic" => Self::Topic,
            "attribute" => Self::Attribute,
            "value" => Self::Value,
            "time" => Self::Time,
            "location" => Self::Location,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::Person => "person",
            NodeType::Entity => "entity",
            NodeType::Event => "event",
            NodeType::Topic => "topic",
            NodeType::Attribute => "attribute",
            NodeType::Value => "value",
            NodeType::Time => "time",
            NodeType::Location => "location",
            NodeType::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Type of a graph edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Reference,
    Attribute,
    HasProperty,
    Relation,
    Temporal,
    CoreRelation,
    Default,
}

impl EdgeType {
    pub fn parse(s: &str) -> Self {
        match s {
            "reference" => Self::Reference,
            "attribute" => Self::Attribute,
            "has_property" => Self::HasProperty,
            "relation" => Self::Relation,
            "temporal" => Self::Temporal,
            "core_relation" => Self::CoreRelation,
            _ => Self::Default,
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EdgeType::Reference => "reference",
            EdgeType::Attribute => "attribute",
            EdgeType::HasProperty => "has_property",
            EdgeType::Relation => "relation",
            EdgeType::Temporal => "temporal",
            EdgeType::CoreRelation => "core_relation",
            EdgeType::Default => "default",
        };
        write!(f, "{}", s)
    }
}

/// Semantic category of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Fact,
    Opinion,
    Relation,
    Event,
    Other,
}

impl MemoryKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "fact" => Self::Fact,
            "opinion" => Self::Opinion,
            "relation" => Self::Relation,
            "event" => Self::Event,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemoryKind::Fact => "fact",
            MemoryKind::Opinion => "opinion",
            MemoryKind::Relation => "relation",
            MemoryKind::Event => "event",
            MemoryKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// A graph node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub content: String,
    pub node_type: NodeType,

    /// Populated lazily; never persisted to SQLite (the vector index owns it)
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,

    /// Set once the vector index carries an entry for this node
    #[serde(default)]
    pub has_vector: bool,
}

impl Node {
    pub fn new(content: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            node_type,
            embedding: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            has_vector: false,
        }
    }
}

/// A directed, typed edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub edge_type: EdgeType,
    pub relation_text: String,
    pub importance: f32,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(
        source_id: Uuid,
        target_id: Uuid,
        edge_type: EdgeType,
        relation_text: impl Into<String>,
        importance: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            edge_type,
            relation_text: relation_text.into(),
            importance: importance.clamp(0.0, 1.0),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// A long-term memory: a group of nodes and edges with lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub memory_type: MemoryKind,
    pub node_ids: Vec<Uuid>,
    pub edge_ids: Vec<Uuid>,
    pub importance: f32,
    pub activation: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,

    /// Last instant decay was applied; keeps repeated decay at the same
    /// timestamp a no-op
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decayed_at: Option<DateTime<Utc>>,

    pub access_count: u32,
    pub decay_factor: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_label: Option<String>,

    #[serde(default)]
    pub forgotten: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Memory {
    pub fn new(memory_type: MemoryKind, importance: f32, decay_factor: f32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            memory_type,
            node_ids: Vec::new(),
            edge_ids: Vec::new(),
            importance: importance.clamp(0.0, 1.0),
            activation: 1.0,
            created_at: now,
            last_accessed_at: now,
            last_decayed_at: None,
            access_count: 0,
            decay_factor,
            privacy_label: None,
            forgotten: false,
            metadata: HashMap::new(),
        }
    }

    /// Record an access: bump the counter and reset the decay baseline
    pub fn mark_accessed(&mut self) {
        self.last_accessed_at = Utc::now();
        self.last_decayed_at = None;
        self.access_count += 1;
    }
}

/// In-memory graph store with adjacency and the node→memories inverted index
#[derive(Debug, Default)]
pub struct GraphStore {
    nodes: HashMap<Uuid, Node>,
    edges: HashMap<Uuid, Edge>,
    memories: HashMap<Uuid, Memory>,

    /// node id → edge ids leaving it, in insertion order (deterministic)
    outgoing: HashMap<Uuid, Vec<Uuid>>,
    /// node id → edge ids entering it, in insertion order
    incoming: HashMap<Uuid, Vec<Uuid>>,
    /// node id → memory ids referencing it
    node_to_memories: HashMap<Uuid, BTreeSet<Uuid>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- nodes --

    /// Insert or replace a node
    pub fn upsert_node(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    pub fn get_node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_node_mut(&mut self, id: Uuid) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn has_node(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Nodes without a vector-index entry, for lazy indexing before search
    pub fn unindexed_nodes(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().filter(|n| !n.has_vector).collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub fn mark_node_indexed(&mut self, id: Uuid) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.has_vector = true;
        }
    }

    /// Merge `source` into `target`: rewires edges, updates memory node lists,
    /// then removes the source node.
    pub fn merge_nodes(&mut self, source: Uuid, target: Uuid) -> Result<()> {
        if source == target {
            return Ok(());
        }
        if !self.nodes.contains_key(&source) || !self.nodes.contains_key(&target) {
            return Err(Error::not_found(format!(
                "merge_nodes: {} or {} missing",
                source, target
            )));
        }

        let edge_ids: Vec<Uuid> = self
            .outgoing
            .get(&source)
            .into_iter()
            .chain(self.incoming.get(&source))
            .flatten()
            .copied()
            .collect();

        for edge_id in edge_ids {
            if let Some(edge) = self.edges.get_mut(&edge_id) {
                if edge.source_id == source {
                    edge.source_id = target;
                }
                if edge.target_id == source {
                    edge.target_id = target;
                }
            }
        }

        // Move adjacency entries over, preserving order
        let moved_out = self.outgoing.remove(&source).unwrap_or_default();
        self.outgoing.entry(target).or_default().extend(moved_out);
        let moved_in = self.incoming.remove(&source).unwrap_or_default();
        self.incoming.entry(target).or_default().extend(moved_in);

        // Rewrite memory node lists and the inverted index
        let referencing = self.node_to_memories.remove(&source).unwrap_or_default();
        for memory_id in &referencing {
            if let Some(memory) = self.memories.get_mut(memory_id) {
                for node_id in memory.node_ids.iter_mut() {
                    if *node_id == source {
                        *node_id = target;
                    }
                }
                let mut seen = BTreeSet::new();
                memory.node_ids.retain(|id| seen.insert(*id));
            }
            self.node_to_memories
                .entry(target)
                .or_default()
                .insert(*memory_id);
        }

        self.nodes.remove(&source);
        Ok(())
    }

    // -- edges --

    /// Insert an edge. Both endpoints must exist.
    pub fn upsert_edge(&mut self, edge: Edge) -> Result<()> {
        if !self.nodes.contains_key(&edge.source_id) {
            return Err(Error::not_found(format!(
                "edge source {} not in store",
                edge.source_id
            )));
        }
        if !self.nodes.contains_key(&edge.target_id) {
            return Err(Error::not_found(format!(
                "edge target {} not in store",
                edge.target_id
            )));
        }

        let is_new = !self.edges.contains_key(&edge.id);
        if is_new {
            self.outgoing.entry(edge.source_id).or_default().push(edge.id);
            self.incoming.entry(edge.target_id).or_default().push(edge.id);
        }
        self.edges.insert(edge.id, edge);
        Ok(())
    }

    pub fn get_edge(&self, id: Uuid) -> Option<&Edge> {
        self.edges.get(&id)
    }

    pub fn get_edge_mut(&mut self, id: Uuid) -> Option<&mut Edge> {
        self.edges.get_mut(&id)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn delete_edge(&mut self, id: Uuid) -> bool {
        let Some(edge) = self.edges.remove(&id) else {
            return false;
        };
        if let Some(out) = self.outgoing.get_mut(&edge.source_id) {
            out.retain(|e| *e != id);
        }
        if let Some(inc) = self.incoming.get_mut(&edge.target_id) {
            inc.retain(|e| *e != id);
        }
        for memory in self.memories.values_mut() {
            memory.edge_ids.retain(|e| *e != id);
        }
        true
    }

    /// Outgoing edges of a node, in insertion order
    pub fn outgoing_edges(&self, node_id: Uuid) -> Vec<&Edge> {
        self.outgoing
            .get(&node_id)
            .map(|ids| ids.iter().filter_map(|id| self.edges.get(id)).collect())
            .unwrap_or_default()
    }

    /// Incoming edges of a node, in insertion order
    pub fn incoming_edges(&self, node_id: Uuid) -> Vec<&Edge> {
        self.incoming
            .get(&node_id)
            .map(|ids| ids.iter().filter_map(|id| self.edges.get(id)).collect())
            .unwrap_or_default()
    }

    // -- memories --

    /// Insert or replace a memory, keeping the inverted index consistent.
    ///
    /// Duplicate node ids collapse; edge endpoints outside `node_ids` are
    /// rejected to preserve the containment invariant.
    pub fn upsert_memory(&mut self, mut memory: Memory) -> Result<()> {
        let mut seen = BTreeSet::new();
        memory.node_ids.retain(|id| seen.insert(*id));

        for node_id in &memory.node_ids {
            if !self.nodes.contains_key(node_id) {
                return Err(Error::not_found(format!(
                    "memory {} references missing node {}",
                    memory.id, node_id
                )));
            }
        }
        for edge_id in &memory.edge_ids {
            let Some(edge) = self.edges.get(edge_id) else {
                return Err(Error::not_found(format!(
                    "memory {} references missing edge {}",
                    memory.id, edge_id
                )));
            };
            if !memory.node_ids.contains(&edge.source_id)
                || !memory.node_ids.contains(&edge.target_id)
            {
                return Err(Error::invalid_input(format!(
                    "memory {} edge {} endpoints outside node set",
                    memory.id, edge_id
                )));
            }
        }

        // Drop stale index entries if this replaces an existing memory
        if let Some(previous) = self.memories.get(&memory.id) {
            for node_id in previous.node_ids.clone() {
                if let Some(set) = self.node_to_memories.get_mut(&node_id) {
                    set.remove(&memory.id);
                }
            }
        }

        for node_id in &memory.node_ids {
            self.node_to_memories
                .entry(*node_id)
                .or_default()
                .insert(memory.id);
        }

        self.memories.insert(memory.id, memory);
        Ok(())
    }

    pub fn get_memory(&self, id: Uuid) -> Option<&Memory> {
        self.memories.get(&id)
    }

    pub fn get_memory_mut(&mut self, id: Uuid) -> Option<&mut Memory> {
        self.memories.get_mut(&id)
    }

    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }

    pub fn all_memories(&self) -> impl Iterator<Item = &Memory> {
        self.memories.values()
    }

    pub fn all_memories_mut(&mut self) -> impl Iterator<Item = &mut Memory> {
        self.memories.values_mut()
    }

    /// Memory ids referencing a node
    pub fn memories_by_node(&self, node_id: Uuid) -> Vec<Uuid> {
        self.node_to_memories
            .get(&node_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Delete a memory and its index entries. Nodes and edges no longer
    /// referenced by any memory are pruned along with it.
    pub fn delete_memory(&mut self, id: Uuid) -> bool {
        let Some(memory) = self.memories.remove(&id) else {
            return false;
        };

        for node_id in &memory.node_ids {
            let orphaned = match self.node_to_memories.get_mut(node_id) {
                Some(set) => {
                    set.remove(&id);
                    set.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.node_to_memories.remove(node_id);
                let attached: Vec<Uuid> = self
                    .outgoing
                    .get(node_id)
                    .into_iter()
                    .chain(self.incoming.get(node_id))
                    .flatten()
                    .copied()
                    .collect();
                for edge_id in attached {
                    self.delete_edge(edge_id);
                }
                self.outgoing.remove(node_id);
                self.incoming.remove(node_id);
                self.nodes.remove(node_id);
            }
        }
        true
    }

    /// Merge `sources` into `target`: node and edge lists concatenate,
    /// access counts sum, importance keeps the maximum. Sources are removed.
    pub fn merge_memories(&mut self, target_id: Uuid, source_ids: &[Uuid]) -> Result<()> {
        if !self.memories.contains_key(&target_id) {
            return Err(Error::not_found(format!("merge target {}", target_id)));
        }

        for source_id in source_ids {
            if *source_id == target_id {
                continue;
            }
            let Some(source) = self.memories.remove(source_id) else {
                continue;
            };

            for node_id in &source.node_ids {
                if let Some(set) = self.node_to_memories.get_mut(node_id) {
                    set.remove(source_id);
                    set.insert(target_id);
                }
            }

            let target = self
                .memories
                .get_mut(&target_id)
                .expect("target checked above");
            for node_id in source.node_ids {
                if !target.node_ids.contains(&node_id) {
                    target.node_ids.push(node_id);
                }
            }
            for edge_id in source.edge_ids {
                if !target.edge_ids.contains(&edge_id) {
                    target.edge_ids.push(edge_id);
                }
            }
            target.access_count += source.access_count;
            target.importance = target.importance.max(source.importance);
        }
        Ok(())
    }

    /// Per-store counters for statistics reporting
    pub fn statistics(&self) -> GraphStatistics {
        GraphStatistics {
            total_nodes: self.nodes.len(),
            total_edges: self.edges.len(),
            total_memories: self.memories.len(),
            forgotten_memories: self.memories.values().filter(|m| m.forgotten).count(),
        }
    }
}

/// Counters reported by [`GraphStore::statistics`]
#[derive(Debug, Clone, Serialize)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub total_memories: usize,
    pub forgotten_memories: usize,
}

/// SQLite persistence for the graph store
pub struct GraphPersistence {
    conn: Arc<Mutex<Connection>>,
}

impl GraphPersistence {
    /// Open (or create) the graph database at `path`
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Persist the full store. Runs in one transaction; the table contents
    /// are replaced wholesale (the store is the source of truth).
    pub fn save(&self, store: &GraphStore) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM nodes", [])?;
        tx.execute("DELETE FROM edges", [])?;
        tx.execute("DELETE FROM memories", [])?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO nodes (id, content, node_type, metadata, created_at, has_vector)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for node in store.nodes.values() {
                stmt.execute(params![
                    node.id.to_string(),
                    node.content,
                    node.node_type.to_string(),
                    serde_json::to_string(&node.metadata)?,
                    node.created_at.to_rfc3339(),
                    node.has_vector,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO edges (id, source_id, target_id, edge_type, relation_text,
                                    importance, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for edge in store.edges.values() {
                stmt.execute(params![
                    edge.id.to_string(),
                    edge.source_id.to_string(),
                    edge.target_id.to_string(),
                    edge.edge_type.to_string(),
                    edge.relation_text,
                    edge.importance,
                    serde_json::to_string(&edge.metadata)?,
                    edge.created_at.to_rfc3339(),
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO memories (id, memory_type, node_ids, edge_ids, importance,
                                       activation, created_at, last_accessed_at, last_decayed_at,
                                       access_count, decay_factor, privacy_label, forgotten, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for memory in store.memories.values() {
                stmt.execute(params![
                    memory.id.to_string(),
                    memory.memory_type.to_string(),
                    serde_json::to_string(
                        &memory.node_ids.iter().map(Uuid::to_string).collect::<Vec<_>>()
                    )?,
                    serde_json::to_string(
                        &memory.edge_ids.iter().map(Uuid::to_string).collect::<Vec<_>>()
                    )?,
                    memory.importance,
                    memory.activation,
                    memory.created_at.to_rfc3339(),
                    memory.last_accessed_at.to_rfc3339(),
                    memory.last_decayed_at.map(|dt| dt.to_rfc3339()),
                    memory.access_count,
                    memory.decay_factor,
                    memory.privacy_label,
                    memory.forgotten,
                    serde_json::to_string(&memory.metadata)?,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the full store. Returns an empty store when the database is new.
    pub fn load(&self) -> Result<GraphStore> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let mut store = GraphStore::new();

        let mut stmt = conn
            .prepare("SELECT id, content, node_type, metadata, created_at, has_vector FROM nodes")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;
        for row in rows {
            let (id, content, node_type, metadata, created_at, has_vector) = row?;
            store.upsert_node(Node {
                id: parse_uuid(&id)?,
                content,
                node_type: NodeType::parse(&node_type),
                embedding: None,
                metadata: serde_json::from_str(&metadata)?,
                created_at: parse_timestamp(&created_at)?,
                has_vector,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT id, source_id, target_id, edge_type, relation_text, importance, metadata,
                    created_at
             FROM edges ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f32>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        for row in rows {
            let (id, source, target, edge_type, relation, importance, metadata, created_at) = row?;
            let edge = Edge {
                id: parse_uuid(&id)?,
                source_id: parse_uuid(&source)?,
                target_id: parse_uuid(&target)?,
                edge_type: EdgeType::parse(&edge_type),
                relation_text: relation,
                importance,
                metadata: serde_json::from_str(&metadata)?,
                created_at: parse_timestamp(&created_at)?,
            };
            // A dangling edge left behind by a partial write is skipped
            let _ = store.upsert_edge(edge);
        }

        let mut stmt = conn.prepare(
            "SELECT id, memory_type, node_ids, edge_ids, importance, activation, created_at,
                    last_accessed_at, last_decayed_at, access_count, decay_factor, privacy_label,
                    forgotten, metadata
             FROM memories",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MemoryRow {
                id: row.get(0)?,
                memory_type: row.get(1)?,
                node_ids: row.get(2)?,
                edge_ids: row.get(3)?,
                importance: row.get(4)?,
                activation: row.get(5)?,
                created_at: row.get(6)?,
                last_accessed_at: row.get(7)?,
                last_decayed_at: row.get(8)?,
                access_count: row.get(9)?,
                decay_factor: row.get(10)?,
                privacy_label: row.get(11)?,
                forgotten: row.get(12)?,
                metadata: row.get(13)?,
            })
        })?;
        for row in rows {
            let memory = row?.into_memory()?;
            store.upsert_memory(memory)?;
        }

        Ok(store)
    }
}

/// Intermediate struct for reading memories from SQLite
struct MemoryRow {
    id: String,
    memory_type: String,
    node_ids: String,
    edge_ids: String,
    importance: f32,
    activation: f32,
    created_at: String,
    last_accessed_at: String,
    last_decayed_at: Option<String>,
    access_count: u32,
    decay_factor: f32,
    privacy_label: Option<String>,
    forgotten: bool,
    metadata: String,
}

impl MemoryRow {
    fn into_memory(self) -> Result<Memory> {
        let node_ids: Vec<String> = serde_json::from_str(&self.node_ids)?;
        let edge_ids: Vec<String> = serde_json::from_str(&self.edge_ids)?;

        Ok(Memory {
            id: parse_uuid(&self.id)?,
            memory_type: MemoryKind::parse(&self.memory_type),
            node_ids: node_ids
                .iter()
                .map(|s| parse_uuid(s))
                .collect::<Result<Vec<_>>>()?,
            edge_ids: edge_ids
                .iter()
                .map(|s| parse_uuid(s))
                .collect::<Result<Vec<_>>>()?,
            importance: self.importance,
            activation: self.activation,
            created_at: parse_timestamp(&self.created_at)?,
            last_accessed_at: parse_timestamp(&self.last_accessed_at)?,
            last_decayed_at: self
                .last_decayed_at
                .as_deref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            access_count: self.access_count,
            decay_factor: self.decay_factor,
            privacy_label: self.privacy_label,
            forgotten: self.forgotten,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::storage(e.to_string()))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_pair() -> (GraphStore, Uuid, Uuid, Uuid) {
        let mut store = GraphStore::new();
        let alice = Node::new("Alice", NodeType::Person);
        let tea = Node::new("likes tea", NodeType::Event);
        let (a, t) = (alice.id, tea.id);
        store.upsert_node(alice);
        store.upsert_node(tea);

        let edge = Edge::new(a, t, EdgeType::Relation, "does", 0.6);
        let e = edge.id;
        store.upsert_edge(edge).unwrap();
        (store, a, t, e)
    }

    #[test]
    fn edge_requires_endpoints() {
        let mut store = GraphStore::new();
        let node = Node::new("solo", NodeType::Entity);
        let id = node.id;
        store.upsert_node(node);

        let edge = Edge::new(id, Uuid::new_v4(), EdgeType::Relation, "to nowhere", 0.5);
        assert!(store.upsert_edge(edge).is_err());
    }

    #[test]
    fn memory_keeps_inverted_index_consistent() {
        let (mut store, a, t, e) = store_with_pair();

        let mut memory = Memory::new(MemoryKind::Fact, 0.7, 0.95);
        memory.node_ids = vec![a, t];
        memory.edge_ids = vec![e];
        let mid = memory.id;
        store.upsert_memory(memory).unwrap();

        assert_eq!(store.memories_by_node(a), vec![mid]);
        assert_eq!(store.memories_by_node(t), vec![mid]);

        // Both directions of the node/memory index agree
        let memory = store.get_memory(mid).unwrap().clone();
        for node_id in &memory.node_ids {
            assert!(store.memories_by_node(*node_id).contains(&mid));
        }
    }

    #[test]
    fn duplicate_node_ids_collapse() {
        let (mut store, a, t, _) = store_with_pair();

        let mut memory = Memory::new(MemoryKind::Fact, 0.5, 0.95);
        memory.node_ids = vec![a, a, t];
        let mid = memory.id;
        store.upsert_memory(memory).unwrap();

        assert_eq!(store.get_memory(mid).unwrap().node_ids, vec![a, t]);
    }

    #[test]
    fn edge_endpoints_must_be_in_node_set() {
        let (mut store, a, _, e) = store_with_pair();

        let mut memory = Memory::new(MemoryKind::Fact, 0.5, 0.95);
        memory.node_ids = vec![a]; // missing the edge target
        memory.edge_ids = vec![e];
        assert!(store.upsert_memory(memory).is_err());
    }

    #[test]
    fn delete_memory_prunes_orphans() {
        let (mut store, a, t, _) = store_with_pair();

        let mut memory = Memory::new(MemoryKind::Fact, 0.5, 0.95);
        memory.node_ids = vec![a, t];
        let mid = memory.id;
        store.upsert_memory(memory).unwrap();

        assert!(store.delete_memory(mid));
        assert_eq!(store.node_count(), 0);
        assert_eq!(store.edge_count(), 0);
        assert!(store.memories_by_node(a).is_empty());
    }

    #[test]
    fn delete_memory_keeps_shared_nodes() {
        let (mut store, a, t, _) = store_with_pair();

        let mut first = Memory::new(MemoryKind::Fact, 0.5, 0.95);
        first.node_ids = vec![a, t];
        let first_id = first.id;
        store.upsert_memory(first).unwrap();

        let mut second = Memory::new(MemoryKind::Event, 0.6, 0.95);
        second.node_ids = vec![a];
        let second_id = second.id;
        store.upsert_memory(second).unwrap();

        store.delete_memory(first_id);
        // `a` survives (still referenced), `t` is pruned
        assert!(store.has_node(a));
        assert!(!store.has_node(t));
        assert_eq!(store.memories_by_node(a), vec![second_id]);
    }

    #[test]
    fn merge_memories_sums_access_and_keeps_max_importance() {
        let (mut store, a, t, _) = store_with_pair();

        let mut target = Memory::new(MemoryKind::Fact, 0.4, 0.95);
        target.node_ids = vec![a];
        target.access_count = 2;
        let target_id = target.id;
        store.upsert_memory(target).unwrap();

        let mut source = Memory::new(MemoryKind::Fact, 0.9, 0.95);
        source.node_ids = vec![t];
        source.access_count = 3;
        let source_id = source.id;
        store.upsert_memory(source).unwrap();

        store.merge_memories(target_id, &[source_id]).unwrap();

        let merged = store.get_memory(target_id).unwrap();
        assert_eq!(merged.access_count, 5);
        assert!((merged.importance - 0.9).abs() < f32::EPSILON);
        assert_eq!(merged.node_ids, vec![a, t]);
        assert!(store.get_memory(source_id).is_none());
        assert_eq!(store.memories_by_node(t), vec![target_id]);
    }

    #[test]
    fn merge_nodes_rewires_edges_and_memories() {
        let (mut store, a, t, e) = store_with_pair();
        let other = Node::new("Alice A.", NodeType::Person);
        let other_id = other.id;
        store.upsert_node(other);

        let mut memory = Memory::new(MemoryKind::Fact, 0.5, 0.95);
        memory.node_ids = vec![other_id, t];
        let mid = memory.id;
        store.upsert_memory(memory).unwrap();

        store.merge_nodes(other_id, a).unwrap();

        assert!(!store.has_node(other_id));
        assert!(store.get_memory(mid).unwrap().node_ids.contains(&a));
        assert!(store.memories_by_node(a).contains(&mid));
        // Original edge survives untouched
        assert_eq!(store.get_edge(e).unwrap().source_id, a);
    }

    #[test]
    fn outgoing_edges_deterministic_order() {
        let mut store = GraphStore::new();
        let hub = Node::new("hub", NodeType::Topic);
        let hub_id = hub.id;
        store.upsert_node(hub);

        let mut expected = Vec::new();
        for i in 0..5 {
            let spoke = Node::new(format!("spoke {}", i), NodeType::Entity);
            let spoke_id = spoke.id;
            store.upsert_node(spoke);
            let edge = Edge::new(hub_id, spoke_id, EdgeType::Relation, "links", 0.5);
            expected.push(edge.id);
            store.upsert_edge(edge).unwrap();
        }

        let observed: Vec<Uuid> = store.outgoing_edges(hub_id).iter().map(|e| e.id).collect();
        assert_eq!(observed, expected);
    }

    #[test]
    fn sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");

        let (mut store, a, t, e) = store_with_pair();
        let mut memory = Memory::new(MemoryKind::Fact, 0.7, 0.95);
        memory.node_ids = vec![a, t];
        memory.edge_ids = vec![e];
        memory.privacy_label = Some("personal".to_string());
        let mid = memory.id;
        store.upsert_memory(memory).unwrap();

        let persistence = GraphPersistence::new(&path).unwrap();
        persistence.save(&store).unwrap();

        let loaded = persistence.load().unwrap();
        assert_eq!(loaded.node_count(), 2);
        assert_eq!(loaded.edge_count(), 1);
        assert_eq!(loaded.memory_count(), 1);

        let memory = loaded.get_memory(mid).unwrap();
        assert_eq!(memory.privacy_label.as_deref(), Some("personal"));
        assert_eq!(loaded.memories_by_node(a), vec![mid]);
        assert_eq!(loaded.outgoing_edges(a).len(), 1);
    }
}
