//! Vector index over graph nodes, backed by LanceDB

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::error::{Error, Result};

const TABLE_NAME: &str = "nodes";

/// A single nearest-neighbor hit
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub node_id: Uuid,
    pub content: String,
    pub node_type: String,
    pub score: f32,
}

/// One row to upsert into the index
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub node_id: Uuid,
    pub content: String,
    pub node_type: String,
    pub embedding: Vec<f32>,
}

/// Nearest-neighbor index over node embeddings
pub struct VectorIndex {
    db: lancedb::Connection,
    dimensions: usize,
}

impl VectorIndex {
    /// Open the index under the configured vector directory
    pub async fn new(config: &MemoryConfig) -> Result<Self> {
        let path = config.vector_db_path();
        std::fs::create_dir_all(&path)?;
        let db = connect(path.to_str().ok_or_else(|| {
            Error::vector_db("vector db path is not valid UTF-8")
        })?)
        .execute()
        .await
        .map_err(|e| Error::vector_db(e.to_string()))?;

        let index = Self {
            db,
            dimensions: config.embedding_dimensions,
        };
        index.ensure_table().await?;
        Ok(index)
    }

    /// Get the schema for the nodes table
    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("node_type", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimensions as i32,
                ),
                false,
            ),
        ])
    }

    /// Ensure the nodes table exists
    async fn ensure_table(&self) -> Result<()> {
        let tables = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        if !tables.contains(&TABLE_NAME.to_string()) {
            let schema = Arc::new(self.schema());
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let reader = RecordBatchIterator::new(vec![empty_batch].into_iter().map(Ok), schema);

            self.db
                .create_table(TABLE_NAME, Box::new(reader))
                .execute()
                .await
                .map_err(|e| Error::vector_db(e.to_string()))?;
        }

        Ok(())
    }

    fn build_batch(&self, entries: &[VectorEntry]) -> Result<RecordBatch> {
        let mut flat = Vec::with_capacity(entries.len() * self.dimensions);
        for entry in entries {
            if entry.embedding.len() != self.dimensions {
                return Err(Error::vector_db(format!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    self.dimensions,
                    entry.embedding.len()
                )));
            }
            flat.extend_from_slice(&entry.embedding);
        }

        let id_array = StringArray::from(
            entries.iter().map(|e| e.node_id.to_string()).collect::<Vec<_>>(),
        );
        let content_array =
            StringArray::from(entries.iter().map(|e| e.content.clone()).collect::<Vec<_>>());
        let type_array =
            StringArray::from(entries.iter().map(|e| e.node_type.clone()).collect::<Vec<_>>());

        let values = Float32Array::from(flat);
        let vector_array = FixedSizeListArray::try_new_from_values(values, self.dimensions as i32)
            .map_err(|e: arrow_schema::ArrowError| Error::vector_db(e.to_string()))?;

        RecordBatch::try_new(
            Arc::new(self.schema()),
            vec![
                Arc::new(id_array) as Arc<dyn Array>,
                Arc::new(content_array),
                Arc::new(type_array),
                Arc::new(vector_array),
            ],
        )
        .map_err(|e| Error::vector_db(e.to_string()))
    }

    /// Insert or update a single node
    pub async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        self.upsert_batch(vec![entry]).await
    }

    /// Insert or update a batch of nodes in one table append
    pub async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        // Replace any existing rows for these ids
        let id_list = entries
            .iter()
            .map(|e| format!("'{}'", e.node_id))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = table.delete(&format!("id IN ({})", id_list)).await;

        let schema = Arc::new(self.schema());
        let batch = self.build_batch(&entries)?;
        let reader = RecordBatchIterator::new(vec![batch].into_iter().map(Ok), schema);

        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        Ok(())
    }

    /// Delete a node from the index
    pub async fn delete(&self, node_id: Uuid) -> Result<()> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        table
            .delete(&format!("id = '{}'", node_id))
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        Ok(())
    }

    /// Nearest neighbors of a query vector, optionally filtered by node type.
    /// Scores are similarities in (0, 1], converted from L2 distance.
    pub async fn query(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        node_type_filter: Option<&str>,
    ) -> Result<Vec<VectorHit>> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let mut query = table
            .vector_search(query_embedding.to_vec())
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?
            .limit(top_k);

        if let Some(node_type) = node_type_filter {
            query = query.only_if(format!("node_type = '{}'", node_type));
        }

        let stream = query
            .execute()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect::<Vec<RecordBatch>>()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let mut hits = Vec::new();

        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let contents = string_column(&batch, "content")?;
            let types = string_column(&batch, "node_type")?;

            let distance_col = batch
                .column_by_name("_distance")
                .ok_or_else(|| Error::vector_db("Missing _distance column"))?;
            let distances = distance_col
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| Error::vector_db("_distance column is not Float32Array"))?;

            for i in 0..batch.num_rows() {
                let distance = distances.value(i);
                // LanceDB returns L2 distance, convert to a similarity score
                let score = 1.0 / (1.0 + distance);

                hits.push(VectorHit {
                    node_id: Uuid::parse_str(ids.value(i))
                        .map_err(|e| Error::vector_db(e.to_string()))?,
                    content: contents.value(i).to_string(),
                    node_type: types.value(i).to_string(),
                    score,
                });
            }
        }

        Ok(hits)
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::vector_db(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::vector_db(format!("{} column is not StringArray", name)))
}
