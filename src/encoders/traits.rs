//! Encoder trait abstraction
//!
//! Defines a common interface for query and document encoders so indexing
//! does not depend on a particular embedding backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::device::ComputeDevice;
use crate::error::Result;

/// Which side of retrieval an encoder serves
///
/// Several model families use different instruction prefixes for queries and
/// passages, so the role changes the text that reaches the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderRole {
    Query,
    Document,
}

impl EncoderRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Document => "document",
        }
    }
}

/// Result of a batch encoding operation
#[derive(Debug, Clone)]
pub struct BatchEmbeddingResult {
    /// The embedding vectors, in input order
    pub embeddings: Vec<Vec<f32>>,
    /// Total time taken for the batch
    pub duration: Duration,
    /// Average time per embedding
    pub avg_duration: Duration,
}

impl BatchEmbeddingResult {
    pub fn empty() -> Self {
        Self {
            embeddings: vec![],
            duration: Duration::ZERO,
            avg_duration: Duration::ZERO,
        }
    }
}

/// Configuration of a constructed encoder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Human-readable name for this configuration
    pub name: String,
    /// Backend type (fastembed, mistralrs)
    pub backend: String,
    /// Model identifier as resolved by the registry
    pub model_name: String,
    /// Vector dimensions
    pub embedding_dim: usize,
    /// Device the encoder actually runs on
    pub device: ComputeDevice,
    pub role: EncoderRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Unified trait for encoders
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Get the configuration for this encoder
    fn config(&self) -> &EncoderConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Get the vector dimensions produced by this encoder
    fn dimensions(&self) -> usize {
        self.config().embedding_dim
    }

    /// Encode a batch of texts
    ///
    /// Output order matches input order. Batch composition never changes the
    /// vectors, only the wall-clock cost.
    async fn encode(&self, texts: &[String]) -> Result<BatchEmbeddingResult>;

    /// Warm up the model (load weights, allocate buffers, etc.)
    async fn warmup(&self) -> Result<Duration> {
        let result = self
            .encode(&["warmup text for model initialization".to_string()])
            .await?;
        Ok(result.duration)
    }

    /// Get model load duration
    fn load_duration(&self) -> Duration {
        Duration::ZERO
    }
}

/// Query and document encoders bound to the same pretrained model
#[derive(Clone)]
pub struct EncoderPair {
    pub query: Arc<dyn Encoder>,
    pub document: Arc<dyn Encoder>,
    load_duration: Duration,
}

impl EncoderPair {
    /// Pair of independently loaded encoders; their load times add up
    pub fn new(query: Arc<dyn Encoder>, document: Arc<dyn Encoder>) -> Self {
        let load_duration = query.load_duration() + document.load_duration();
        Self {
            query,
            document,
            load_duration,
        }
    }

    /// Pair of encoders on top of one model loaded in `load_duration`
    pub fn shared(
        query: Arc<dyn Encoder>,
        document: Arc<dyn Encoder>,
        load_duration: Duration,
    ) -> Self {
        Self {
            query,
            document,
            load_duration,
        }
    }

    /// Wall-clock time spent loading the model(s) behind the pair
    pub fn load_duration(&self) -> Duration {
        self.load_duration
    }
}

/// Helper to measure duration of a sync operation
pub fn measure_sync<F, T>(f: F) -> (T, Duration)
where
    F: FnOnce() -> T,
{
    let start = std::time::Instant::now();
    let result = f();
    let duration = start.elapsed();
    (result, duration)
}

/// Split a total duration evenly over `count` items
pub(crate) fn average_duration(total: Duration, count: usize) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        total / count as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoadedEncoder {
        config: EncoderConfig,
        load_duration: Duration,
    }

    impl LoadedEncoder {
        fn new(role: EncoderRole, load_duration: Duration) -> Arc<dyn Encoder> {
            Arc::new(Self {
                config: EncoderConfig {
                    name: format!("loaded-{}", role.name()),
                    backend: "test".to_string(),
                    model_name: "loaded".to_string(),
                    embedding_dim: 4,
                    device: ComputeDevice::Cpu,
                    role,
                    notes: None,
                },
                load_duration,
            })
        }
    }

    #[async_trait]
    impl Encoder for LoadedEncoder {
        fn config(&self) -> &EncoderConfig {
            &self.config
        }

        async fn encode(&self, texts: &[String]) -> Result<BatchEmbeddingResult> {
            Ok(BatchEmbeddingResult {
                embeddings: vec![vec![0.0; 4]; texts.len()],
                duration: Duration::ZERO,
                avg_duration: Duration::ZERO,
            })
        }

        fn load_duration(&self) -> Duration {
            self.load_duration
        }
    }

    #[test]
    fn test_shared_model_load_counted_once() {
        let load = Duration::from_secs(3);
        let pair = EncoderPair::shared(
            LoadedEncoder::new(EncoderRole::Query, load),
            LoadedEncoder::new(EncoderRole::Document, load),
            load,
        );
        assert_eq!(pair.load_duration(), Duration::from_secs(3));
    }

    #[test]
    fn test_separate_loads_add_up() {
        let pair = EncoderPair::new(
            LoadedEncoder::new(EncoderRole::Query, Duration::from_secs(1)),
            LoadedEncoder::new(EncoderRole::Document, Duration::from_secs(3)),
        );
        assert_eq!(pair.load_duration(), Duration::from_secs(4));
    }

    #[test]
    fn test_average_duration() {
        assert_eq!(average_duration(Duration::from_secs(4), 4), Duration::from_secs(1));
        assert_eq!(average_duration(Duration::from_secs(4), 0), Duration::ZERO);
    }
}
