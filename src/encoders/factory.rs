//! Model registry and encoder factory

use async_trait::async_trait;

use super::device::ComputeDevice;
use super::fastembed_backend::{FastEmbedEncoder, FastEmbedModel};
use super::mistralrs_backend::{MistralRsEncoder, MistralRsModel};
use super::traits::EncoderPair;
use crate::error::{PipelineError, Result};

/// A pretrained model family known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    FastEmbed(FastEmbedModel),
    MistralRs(MistralRsModel),
}

impl ModelFamily {
    /// Resolve a model name to its family
    ///
    /// Accepts the short registry name (`snowflake-arctic-embed-xs`) or the
    /// full repository id (`Snowflake/snowflake-arctic-embed-xs`), case
    /// insensitively.
    pub fn resolve(model_name: &str) -> Result<Self> {
        let wanted = model_name.trim().to_lowercase();
        let short = wanted.rsplit('/').next().unwrap_or(&wanted).to_string();

        Self::all()
            .into_iter()
            .find(|family| {
                family.name() == short || family.model_id().to_lowercase() == wanted
            })
            .ok_or_else(|| PipelineError::ModelResolution {
                model: model_name.to_string(),
            })
    }

    pub fn all() -> Vec<Self> {
        FastEmbedModel::all()
            .into_iter()
            .map(Self::FastEmbed)
            .chain(MistralRsModel::all().into_iter().map(Self::MistralRs))
            .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FastEmbed(m) => m.name(),
            Self::MistralRs(m) => m.name(),
        }
    }

    pub fn model_id(&self) -> &'static str {
        match self {
            Self::FastEmbed(m) => m.model_id(),
            Self::MistralRs(m) => m.model_id(),
        }
    }

    pub fn dimensions(&self) -> usize {
        match self {
            Self::FastEmbed(m) => m.dimensions(),
            Self::MistralRs(m) => m.dimensions(),
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::FastEmbed(_) => "fastembed",
            Self::MistralRs(_) => "mistralrs",
        }
    }

    /// Whether the backend can place the document encoder on an accelerator
    pub fn supports_accelerator(&self) -> bool {
        matches!(self, Self::MistralRs(_))
    }
}

/// Builds query/document encoder pairs on an injected device
#[derive(Debug, Clone, Copy)]
pub struct EncoderFactory {
    device: ComputeDevice,
}

impl EncoderFactory {
    pub fn new(device: ComputeDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    /// Check a model name and dimensionality without loading anything
    pub fn resolve(&self, model_name: &str, embedding_dim: usize) -> Result<ModelFamily> {
        let family = ModelFamily::resolve(model_name)?;
        if family.dimensions() != embedding_dim {
            return Err(PipelineError::DimensionMismatch {
                context: format!("model {}", family.name()),
                expected: embedding_dim,
                actual: family.dimensions(),
            });
        }
        Ok(family)
    }

    /// Load the encoders for `model_name`
    ///
    /// The query encoder runs on the CPU; the document encoder runs on the
    /// factory's device when the backend supports it.
    pub async fn build(&self, model_name: &str, embedding_dim: usize) -> Result<EncoderPair> {
        let family = self.resolve(model_name, embedding_dim)?;

        tracing::info!(
            "Building encoders for {} ({} dims, backend {}, device {})",
            family.name(),
            embedding_dim,
            family.backend(),
            self.device.name()
        );

        match family {
            ModelFamily::FastEmbed(model) => FastEmbedEncoder::pair(model, self.device),
            ModelFamily::MistralRs(model) => MistralRsEncoder::pair(model, self.device).await,
        }
    }
}

/// Anything that can produce an encoder pair for a model name
///
/// The indexing pipeline depends on this rather than on [`EncoderFactory`]
/// so tests can substitute encoders that need no model download.
#[async_trait]
pub trait EncoderProvider: Send + Sync {
    async fn build(&self, model_name: &str, embedding_dim: usize) -> Result<EncoderPair>;
}

#[async_trait]
impl EncoderProvider for EncoderFactory {
    async fn build(&self, model_name: &str, embedding_dim: usize) -> Result<EncoderPair> {
        EncoderFactory::build(self, model_name, embedding_dim).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_short_and_full_names() {
        assert_eq!(
            ModelFamily::resolve("snowflake-arctic-embed-xs").unwrap(),
            ModelFamily::FastEmbed(FastEmbedModel::SnowflakeArcticEmbedXs)
        );
        assert_eq!(
            ModelFamily::resolve("Snowflake/snowflake-arctic-embed-m").unwrap(),
            ModelFamily::FastEmbed(FastEmbedModel::SnowflakeArcticEmbedM)
        );
        assert_eq!(
            ModelFamily::resolve("BGE-BASE-EN-V1.5").unwrap().dimensions(),
            768
        );
        assert_eq!(
            ModelFamily::resolve("google/embeddinggemma-300m").unwrap(),
            ModelFamily::MistralRs(MistralRsModel::EmbeddingGemma300M)
        );
    }

    #[test]
    fn test_resolve_unknown_model() {
        let err = ModelFamily::resolve("tct_colbert_msmarco").unwrap_err();
        assert!(matches!(err, PipelineError::ModelResolution { ref model } if model == "tct_colbert_msmarco"));
    }

    #[test]
    fn test_registry_names_are_unique() {
        let all = ModelFamily::all();
        let mut names: Vec<_> = all.iter().map(|f| f.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), all.len());
    }

    #[tokio::test]
    async fn test_build_rejects_dimension_mismatch_before_loading() {
        let factory = EncoderFactory::new(ComputeDevice::Cpu);
        let err = factory.build("snowflake-arctic-embed-xs", 768).await.err().unwrap();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch { expected: 768, actual: 384, .. }
        ));
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_model() {
        let factory = EncoderFactory::new(ComputeDevice::Cuda);
        let err = factory.build("no-such-model", 384).await.err().unwrap();
        assert!(matches!(err, PipelineError::ModelResolution { .. }));
        assert_eq!(factory.device(), ComputeDevice::Cuda);
    }
}
