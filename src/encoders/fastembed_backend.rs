//! FastEmbed backend implementation
//!
//! Wraps the fastembed-rs library for ONNX-based embedding models. On the
//! CPU both encoders of a pair share one loaded model. Builds with the
//! `cuda` feature load a second copy on the CUDA execution provider for
//! documents; other builds run everything on the CPU.

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::device::ComputeDevice;
use super::traits::{
    average_duration, measure_sync, BatchEmbeddingResult, Encoder, EncoderConfig, EncoderPair,
    EncoderRole,
};
use crate::error::{PipelineError, Result};

const BGE_QUERY_INSTRUCTION: &str = "Represent this sentence for searching relevant passages: ";

/// Supported fastembed models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastEmbedModel {
    /// Snowflake Arctic Embed XS (384 dims)
    SnowflakeArcticEmbedXs,
    /// Snowflake Arctic Embed S (384 dims)
    SnowflakeArcticEmbedS,
    /// Snowflake Arctic Embed M (768 dims)
    SnowflakeArcticEmbedM,
    /// Snowflake Arctic Embed L (1024 dims)
    SnowflakeArcticEmbedL,
    /// BAAI/bge-small-en-v1.5 (384 dims)
    BgeSmallEnV15,
    /// BAAI/bge-base-en-v1.5 (768 dims)
    BgeBaseEnV15,
    /// BAAI/bge-large-en-v1.5 (1024 dims)
    BgeLargeEnV15,
    /// Alibaba GTE base en v1.5 (768 dims)
    GteBaseEnV15,
    /// Alibaba GTE large en v1.5 (1024 dims)
    GteLargeEnV15,
    /// Nomic embed text v1 (768 dims)
    NomicEmbedTextV1,
    /// Nomic embed text v1.5 (768 dims)
    NomicEmbedTextV15,
    /// intfloat/multilingual-e5-small (384 dims)
    MultilingualE5Small,
    /// intfloat/multilingual-e5-base (768 dims)
    MultilingualE5Base,
    /// sentence-transformers/all-MiniLM-L6-v2 (384 dims)
    AllMiniLmL6V2,
}

impl FastEmbedModel {
    /// Convert to fastembed's EmbeddingModel enum
    pub fn to_fastembed_model(&self) -> EmbeddingModel {
        match self {
            Self::SnowflakeArcticEmbedXs => EmbeddingModel::SnowflakeArcticEmbedXS,
            Self::SnowflakeArcticEmbedS => EmbeddingModel::SnowflakeArcticEmbedS,
            Self::SnowflakeArcticEmbedM => EmbeddingModel::SnowflakeArcticEmbedM,
            Self::SnowflakeArcticEmbedL => EmbeddingModel::SnowflakeArcticEmbedL,
            Self::BgeSmallEnV15 => EmbeddingModel::BGESmallENV15,
            Self::BgeBaseEnV15 => EmbeddingModel::BGEBaseENV15,
            Self::BgeLargeEnV15 => EmbeddingModel::BGELargeENV15,
            Self::GteBaseEnV15 => EmbeddingModel::GTEBaseENV15,
            Self::GteLargeEnV15 => EmbeddingModel::GTELargeENV15,
            Self::NomicEmbedTextV1 => EmbeddingModel::NomicEmbedTextV1,
            Self::NomicEmbedTextV15 => EmbeddingModel::NomicEmbedTextV15,
            Self::MultilingualE5Small => EmbeddingModel::MultilingualE5Small,
            Self::MultilingualE5Base => EmbeddingModel::MultilingualE5Base,
            Self::AllMiniLmL6V2 => EmbeddingModel::AllMiniLML6V2,
        }
    }

    /// Format text as a query for embedding (with instruction prefix where needed)
    pub fn format_query(&self, text: &str) -> String {
        match self {
            Self::SnowflakeArcticEmbedXs
            | Self::SnowflakeArcticEmbedS
            | Self::SnowflakeArcticEmbedM
            | Self::SnowflakeArcticEmbedL
            | Self::BgeSmallEnV15
            | Self::BgeBaseEnV15
            | Self::BgeLargeEnV15 => format!("{}{}", BGE_QUERY_INSTRUCTION, text),
            Self::NomicEmbedTextV1 | Self::NomicEmbedTextV15 => format!("search_query: {}", text),
            Self::MultilingualE5Small | Self::MultilingualE5Base => format!("query: {}", text),
            Self::GteBaseEnV15 | Self::GteLargeEnV15 | Self::AllMiniLmL6V2 => text.to_string(),
        }
    }

    /// Format text as a document for embedding (with prefix where needed)
    pub fn format_document(&self, text: &str) -> String {
        match self {
            Self::NomicEmbedTextV1 | Self::NomicEmbedTextV15 => {
                format!("search_document: {}", text)
            }
            Self::MultilingualE5Small | Self::MultilingualE5Base => format!("passage: {}", text),
            _ => text.to_string(),
        }
    }

    pub fn format(&self, role: EncoderRole, text: &str) -> String {
        match role {
            EncoderRole::Query => self.format_query(text),
            EncoderRole::Document => self.format_document(text),
        }
    }

    /// Get the vector dimensions for this model
    pub fn dimensions(&self) -> usize {
        match self {
            Self::SnowflakeArcticEmbedXs | Self::SnowflakeArcticEmbedS => 384,
            Self::SnowflakeArcticEmbedM => 768,
            Self::SnowflakeArcticEmbedL => 1024,
            Self::BgeSmallEnV15 => 384,
            Self::BgeBaseEnV15 => 768,
            Self::BgeLargeEnV15 => 1024,
            Self::GteBaseEnV15 => 768,
            Self::GteLargeEnV15 => 1024,
            Self::NomicEmbedTextV1 | Self::NomicEmbedTextV15 => 768,
            Self::MultilingualE5Small => 384,
            Self::MultilingualE5Base => 768,
            Self::AllMiniLmL6V2 => 384,
        }
    }

    /// Short registry name, as used in configs and run file names
    pub fn name(&self) -> &'static str {
        match self {
            Self::SnowflakeArcticEmbedXs => "snowflake-arctic-embed-xs",
            Self::SnowflakeArcticEmbedS => "snowflake-arctic-embed-s",
            Self::SnowflakeArcticEmbedM => "snowflake-arctic-embed-m",
            Self::SnowflakeArcticEmbedL => "snowflake-arctic-embed-l",
            Self::BgeSmallEnV15 => "bge-small-en-v1.5",
            Self::BgeBaseEnV15 => "bge-base-en-v1.5",
            Self::BgeLargeEnV15 => "bge-large-en-v1.5",
            Self::GteBaseEnV15 => "gte-base-en-v1.5",
            Self::GteLargeEnV15 => "gte-large-en-v1.5",
            Self::NomicEmbedTextV1 => "nomic-embed-text-v1",
            Self::NomicEmbedTextV15 => "nomic-embed-text-v1.5",
            Self::MultilingualE5Small => "multilingual-e5-small",
            Self::MultilingualE5Base => "multilingual-e5-base",
            Self::AllMiniLmL6V2 => "all-minilm-l6-v2",
        }
    }

    /// Get model identifier (HuggingFace repository)
    pub fn model_id(&self) -> &'static str {
        match self {
            Self::SnowflakeArcticEmbedXs => "Snowflake/snowflake-arctic-embed-xs",
            Self::SnowflakeArcticEmbedS => "Snowflake/snowflake-arctic-embed-s",
            Self::SnowflakeArcticEmbedM => "Snowflake/snowflake-arctic-embed-m",
            Self::SnowflakeArcticEmbedL => "Snowflake/snowflake-arctic-embed-l",
            Self::BgeSmallEnV15 => "BAAI/bge-small-en-v1.5",
            Self::BgeBaseEnV15 => "BAAI/bge-base-en-v1.5",
            Self::BgeLargeEnV15 => "BAAI/bge-large-en-v1.5",
            Self::GteBaseEnV15 => "Alibaba-NLP/gte-base-en-v1.5",
            Self::GteLargeEnV15 => "Alibaba-NLP/gte-large-en-v1.5",
            Self::NomicEmbedTextV1 => "nomic-ai/nomic-embed-text-v1",
            Self::NomicEmbedTextV15 => "nomic-ai/nomic-embed-text-v1.5",
            Self::MultilingualE5Small => "intfloat/multilingual-e5-small",
            Self::MultilingualE5Base => "intfloat/multilingual-e5-base",
            Self::AllMiniLmL6V2 => "sentence-transformers/all-MiniLM-L6-v2",
        }
    }

    /// List all available models
    pub fn all() -> Vec<Self> {
        vec![
            Self::SnowflakeArcticEmbedXs,
            Self::SnowflakeArcticEmbedS,
            Self::SnowflakeArcticEmbedM,
            Self::SnowflakeArcticEmbedL,
            Self::BgeSmallEnV15,
            Self::BgeBaseEnV15,
            Self::BgeLargeEnV15,
            Self::GteBaseEnV15,
            Self::GteLargeEnV15,
            Self::NomicEmbedTextV1,
            Self::NomicEmbedTextV15,
            Self::MultilingualE5Small,
            Self::MultilingualE5Base,
            Self::AllMiniLmL6V2,
        ]
    }
}

/// FastEmbed encoder for one retrieval role
pub struct FastEmbedEncoder {
    model: Arc<Mutex<TextEmbedding>>,
    config: EncoderConfig,
    model_type: FastEmbedModel,
    load_duration: Duration,
}

impl FastEmbedEncoder {
    /// Build a query/document pair; queries always run on the CPU
    pub fn pair(model_type: FastEmbedModel, requested: ComputeDevice) -> Result<EncoderPair> {
        let device = document_device(model_type, requested);

        let (cpu_model, cpu_load) = Self::load(model_type, ComputeDevice::Cpu)?;
        let query = Self::with_role(
            Arc::clone(&cpu_model),
            model_type,
            EncoderRole::Query,
            ComputeDevice::Cpu,
            cpu_load,
        );

        if device == ComputeDevice::Cpu {
            let document = Self::with_role(
                cpu_model,
                model_type,
                EncoderRole::Document,
                ComputeDevice::Cpu,
                cpu_load,
            );
            return Ok(EncoderPair::shared(Arc::new(query), Arc::new(document), cpu_load));
        }

        let (device_model, device_load) = Self::load(model_type, device)?;
        let document = Self::with_role(
            device_model,
            model_type,
            EncoderRole::Document,
            device,
            device_load,
        );
        Ok(EncoderPair::new(Arc::new(query), Arc::new(document)))
    }

    fn load(
        model_type: FastEmbedModel,
        device: ComputeDevice,
    ) -> Result<(Arc<Mutex<TextEmbedding>>, Duration)> {
        tracing::info!(
            "Initializing FastEmbed model: {} on {}",
            model_type.name(),
            device.name()
        );

        let (model, load_duration) = measure_sync(|| {
            let init_options = InitOptions::new(model_type.to_fastembed_model())
                .with_show_download_progress(true);

            TextEmbedding::try_new(with_execution_provider(init_options, device))
        });

        let model = model.map_err(|e| {
            PipelineError::Encoder(format!(
                "Failed to initialize FastEmbed model {} on {}: {}",
                model_type.name(),
                device.name(),
                e
            ))
        })?;

        tracing::info!(
            "FastEmbed model {} loaded in {:?}",
            model_type.name(),
            load_duration
        );

        Ok((Arc::new(Mutex::new(model)), load_duration))
    }

    fn with_role(
        model: Arc<Mutex<TextEmbedding>>,
        model_type: FastEmbedModel,
        role: EncoderRole,
        device: ComputeDevice,
        load_duration: Duration,
    ) -> Self {
        let config = EncoderConfig {
            name: format!("fastembed-{}-{}-{}", model_type.name(), role.name(), device.name()),
            backend: "fastembed".to_string(),
            model_name: model_type.model_id().to_string(),
            embedding_dim: model_type.dimensions(),
            device,
            role,
            notes: Some(format!("ONNX runtime, load time: {:?}", load_duration)),
        };

        Self {
            model,
            config,
            model_type,
            load_duration,
        }
    }
}

/// Device the document encoder can actually use in this build
fn document_device(model_type: FastEmbedModel, requested: ComputeDevice) -> ComputeDevice {
    match requested {
        ComputeDevice::Cpu => ComputeDevice::Cpu,
        ComputeDevice::Cuda if cfg!(feature = "cuda") => ComputeDevice::Cuda,
        other => {
            tracing::warn!(
                "{} has no ONNX execution provider for {} in this build; using the CPU",
                model_type.name(),
                other.name()
            );
            ComputeDevice::Cpu
        }
    }
}

#[cfg(feature = "cuda")]
fn with_execution_provider(options: InitOptions, device: ComputeDevice) -> InitOptions {
    use ort::execution_providers::CUDAExecutionProvider;

    match device {
        // Fail the load instead of silently falling back to the CPU
        ComputeDevice::Cuda => options.with_execution_providers(vec![
            CUDAExecutionProvider::default().build().error_on_failure(),
        ]),
        _ => options,
    }
}

#[cfg(not(feature = "cuda"))]
fn with_execution_provider(options: InitOptions, _device: ComputeDevice) -> InitOptions {
    options
}

#[async_trait]
impl Encoder for FastEmbedEncoder {
    fn config(&self) -> &EncoderConfig {
        &self.config
    }

    async fn encode(&self, texts: &[String]) -> Result<BatchEmbeddingResult> {
        if texts.is_empty() {
            return Ok(BatchEmbeddingResult::empty());
        }

        let role = self.config.role;
        let formatted_texts: Vec<String> = texts
            .iter()
            .map(|t| self.model_type.format(role, t))
            .collect();
        let count = formatted_texts.len();
        let model = Arc::clone(&self.model);

        // Run in blocking task since fastembed is synchronous
        let (result, duration) = tokio::task::spawn_blocking(move || {
            let start = std::time::Instant::now();
            let embeddings = match model.lock() {
                Ok(mut guard) => {
                    let text_refs: Vec<&str> = formatted_texts.iter().map(|s| s.as_str()).collect();
                    guard.embed(text_refs, None).map_err(|e| e.to_string())
                }
                Err(_) => Err("FastEmbed model mutex poisoned".to_string()),
            };
            (embeddings, start.elapsed())
        })
        .await
        .map_err(|e| PipelineError::Encoder(format!("Embedding task failed: {}", e)))?;

        let embeddings = result.map_err(|e| {
            PipelineError::Encoder(format!("Failed to generate embeddings: {}", e))
        })?;

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
