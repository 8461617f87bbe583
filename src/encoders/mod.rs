//! Encoder backends and factory
//!
//! Provides query/document encoder pairs over different embedding runtimes:
//! - fastembed (ONNX runtime, CPU)
//! - mistral.rs (Candle, CPU/CUDA/Metal)

pub mod device;
pub mod factory;
pub mod fastembed_backend;
pub mod mistralrs_backend;
pub mod traits;

pub use device::{ComputeDevice, DeviceEnvironment, DeviceProbe};
pub use factory::{EncoderFactory, EncoderProvider, ModelFamily};
pub use fastembed_backend::{FastEmbedEncoder, FastEmbedModel};
pub use mistralrs_backend::{MistralRsEncoder, MistralRsModel};
pub use traits::{BatchEmbeddingResult, Encoder, EncoderConfig, EncoderPair, EncoderRole};
