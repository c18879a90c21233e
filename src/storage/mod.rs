//! Storage backends for the memory engine

mod blocks;
pub mod graph;
pub mod snapshot;
pub mod vector;

pub use blocks::BlockLog;
pub use graph::{
    Edge, EdgeType, GraphPersistence, GraphStatistics, GraphStore, Memory, MemoryKind, Node,
    NodeType,
};
pub use vector::{VectorEntry, VectorHit, VectorIndex};
