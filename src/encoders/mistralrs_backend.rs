//! mistral.rs backend implementation
//!
//! Wraps the mistral.rs library for Candle-based embedding models. Unlike the
//! ONNX backend this one can run on an accelerator, so the document encoder
//! is loaded on the selected device and the query encoder on the CPU.

use async_trait::async_trait;
use mistralrs::{EmbeddingModelBuilder, EmbeddingRequest, Model};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::device::ComputeDevice;
use super::traits::{
    average_duration, BatchEmbeddingResult, Encoder, EncoderConfig, EncoderPair, EncoderRole,
};
use crate::error::{PipelineError, Result};

/// Supported mistral.rs embedding models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MistralRsModel {
    /// Google EmbeddingGemma 300M
    EmbeddingGemma300M,
    /// Qwen3 Embedding 0.6B
    Qwen3Embedding06B,
}

impl MistralRsModel {
    /// Get the HuggingFace model ID
    pub fn model_id(&self) -> &'static str {
        match self {
            Self::EmbeddingGemma300M => "google/embeddinggemma-300m",
            Self::Qwen3Embedding06B => "Qwen/Qwen3-Embedding-0.6B",
        }
    }

    /// Format text as a query for embedding (with instruction prefix)
    pub fn format_query(&self, text: &str) -> String {
        match self {
            Self::EmbeddingGemma300M => format!("task: search result | query: {}", text),
            Self::Qwen3Embedding06B => format!(
                "Instruct: Given a web search query, retrieve relevant passages that answer the query\nQuery: {}",
                text
            ),
        }
    }

    /// Format text as a document for embedding
    pub fn format_document(&self, text: &str) -> String {
        match self {
            Self::EmbeddingGemma300M => format!("title: none | text: {}", text),
            Self::Qwen3Embedding06B => text.to_string(),
        }
    }

    pub fn format(&self, role: EncoderRole, text: &str) -> String {
        match role {
            EncoderRole::Query => self.format_query(text),
            EncoderRole::Document => self.format_document(text),
        }
    }

    /// Short registry name
    pub fn name(&self) -> &'static str {
        match self {
            Self::EmbeddingGemma300M => "embeddinggemma-300m",
            Self::Qwen3Embedding06B => "qwen3-embedding-0.6b",
        }
    }

    /// Get default vector dimensions
    pub fn dimensions(&self) -> usize {
        match self {
            Self::EmbeddingGemma300M => 768,
            Self::Qwen3Embedding06B => 1024,
        }
    }

    /// Get approximate model size in GB
    pub fn size_gb(&self) -> f32 {
        match self {
            Self::EmbeddingGemma300M => 0.6,
            Self::Qwen3Embedding06B => 1.2,
        }
    }

    /// List all available models
    pub fn all() -> Vec<Self> {
        vec![Self::EmbeddingGemma300M, Self::Qwen3Embedding06B]
    }
}

/// Maximum tokens for embedding models (2048 - buffer for instruction prefix)
const MAX_TOKENS: usize = 1800;

/// Approximate characters per token (conservative estimate)
const CHARS_PER_TOKEN: usize = 4;

/// Maximum characters to allow (based on token estimate)
const MAX_CHARS: usize = MAX_TOKENS * CHARS_PER_TOKEN;

/// Truncate text to fit within token limits, preferring a whitespace break
fn truncate_to_limit(text: &str) -> &str {
    if text.len() <= MAX_CHARS {
        return text;
    }

    let mut end = MAX_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = &text[..end];

    match truncated.rfind(char::is_whitespace) {
        Some(pos) if pos > MAX_CHARS / 2 => &truncated[..pos],
        _ => truncated,
    }
}

/// mistral.rs encoder for one retrieval role
pub struct MistralRsEncoder {
    model: Arc<Mutex<Model>>,
    config: EncoderConfig,
    model_type: MistralRsModel,
    load_duration: Duration,
}

impl MistralRsEncoder {
    /// Build a query/document pair
    ///
    /// With an accelerator the model is loaded twice: once on the device for
    /// documents and once on the CPU for queries. On the CPU one load is
    /// shared.
    pub async fn pair(model_type: MistralRsModel, device: ComputeDevice) -> Result<EncoderPair> {
        let (doc_model, doc_load) = Self::load(model_type, device).await?;
        let document = Self::with_role(
            Arc::clone(&doc_model),
            model_type,
            EncoderRole::Document,
            device,
            doc_load,
        );

        if !device.is_accelerator() {
            let query = Self::with_role(doc_model, model_type, EncoderRole::Query, device, doc_load);
            return Ok(EncoderPair::shared(Arc::new(query), Arc::new(document), doc_load));
        }

        let (query_model, query_load) = Self::load(model_type, ComputeDevice::Cpu).await?;
        let query = Self::with_role(
            query_model,
            model_type,
            EncoderRole::Query,
            ComputeDevice::Cpu,
            query_load,
        );
        Ok(EncoderPair::new(Arc::new(query), Arc::new(document)))
    }

    async fn load(
        model_type: MistralRsModel,
        device: ComputeDevice,
    ) -> Result<(Arc<Mutex<Model>>, Duration)> {
        tracing::info!(
            "Initializing mistral.rs model: {} on {}",
            model_type.name(),
            device.name()
        );

        let start = std::time::Instant::now();

        let mut builder = EmbeddingModelBuilder::new(model_type.model_id()).with_logging();
        if !device.is_accelerator() {
            builder = builder.with_force_cpu();
        }

        let model = builder.build().await.map_err(|e| {
            PipelineError::Encoder(format!(
                "Failed to initialize mistral.rs model {}: {}",
                model_type.name(),
                e
            ))
        })?;

        let load_duration = start.elapsed();
        tracing::info!(
            "mistral.rs model {} loaded in {:?}",
            model_type.name(),
            load_duration
        );

        Ok((Arc::new(Mutex::new(model)), load_duration))
    }

    fn with_role(
        model: Arc<Mutex<Model>>,
        model_type: MistralRsModel,
        role: EncoderRole,
        device: ComputeDevice,
        load_duration: Duration,
    ) -> Self {
        let config = EncoderConfig {
            name: format!("mistralrs-{}-{}-{}", model_type.name(), role.name(), device.name()),
            backend: "mistralrs".to_string(),
            model_name: model_type.model_id().to_string(),
            embedding_dim: model_type.dimensions(),
            device,
            role,
            notes: Some(format!(
                "Candle runtime, load time: {:?}, ~{:.1}GB",
                load_duration,
                model_type.size_gb()
            )),
        };

        Self {
            model,
            config,
            model_type,
            load_duration,
        }
    }
}

#[async_trait]
impl Encoder for MistralRsEncoder {
    fn config(&self) -> &EncoderConfig {
        &self.config
    }

    async fn encode(&self, texts: &[String]) -> Result<BatchEmbeddingResult> {
        if texts.is_empty() {
            return Ok(BatchEmbeddingResult::empty());
        }

        let start = std::time::Instant::now();
        let count = texts.len();
        let role = self.config.role;

        let model = self.model.lock().await;

        let mut request = EmbeddingRequest::builder();
        for text in texts {
            let formatted_text = self.model_type.format(role, truncate_to_limit(text));
            request = request.add_prompt(&formatted_text);
        }

        let embeddings = model.generate_embeddings(request).await.map_err(|e| {
            tracing::error!(
                "mistral.rs embedding failed (batch size {}, first text {} chars): {:?}",
                count,
                texts.first().map(|t| t.len()).unwrap_or(0),
                e
            );
            PipelineError::Encoder(format!("Failed to generate batch embeddings: {}", e))
        })?;

        let duration = start.elapsed();

        Ok(BatchEmbeddingResult {
            embeddings,
            duration,
            avg_duration: average_duration(duration, count),
        })
    }

    fn load_duration(&self) -> Duration {
        self.load_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_text_unchanged() {
        assert_eq!(truncate_to_limit("short passage"), "short passage");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(MAX_CHARS);
        let truncated = truncate_to_limit(&text);
        assert!(truncated.len() <= MAX_CHARS);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_truncate_prefers_whitespace() {
        let text = format!("{} {}", "a".repeat(MAX_CHARS - 10), "b".repeat(100));
        let truncated = truncate_to_limit(&text);
        assert_eq!(truncated.len(), MAX_CHARS - 10);
    }

    #[tokio::test]
    #[ignore] // Requires model download
    async fn test_mistralrs_embedding_gemma_cpu() {
        let pair = MistralRsEncoder::pair(MistralRsModel::EmbeddingGemma300M, ComputeDevice::Cpu)
            .await
            .unwrap();
        let result = pair.query.encode(&["Hello, world!".to_string()]).await.unwrap();
        assert_eq!(result.embeddings[0].len(), 768);
    }
}
