//! Semantic index over reasoning traces.
//!
//! Indexing is best-effort and optional: a missing index never blocks the
//! dialogue path. The default deployment runs without one.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::store::types::EmbeddingMetric;

/// A point written to the index, plus the metric of the embedding call that
/// produced it.
#[derive(Debug, Clone)]
pub struct IndexedPoint {
    pub point_id: String,
    pub metric: EmbeddingMetric,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Embed and index one reasoning trace. Returns `None` when indexing is
    /// unavailable or disabled.
    async fn index_reasoning(
        &self,
        reasoning_id: Uuid,
        content: &str,
    ) -> Result<Option<IndexedPoint>>;
}

/// No-op index for deployments without an embedding backend.
pub struct DisabledVectorIndex;

#[async_trait]
impl VectorIndex for DisabledVectorIndex {
    async fn index_reasoning(
        &self,
        _reasoning_id: Uuid,
        _content: &str,
    ) -> Result<Option<IndexedPoint>> {
        Ok(None)
    }
}
