//! Retrieval benchmark pipelines
//!
//! Two offline batch pipelines for dense retrieval experiments:
//! - indexing: encode a dataset with a pretrained embedding model and store
//!   the vectors as a dense index artifact
//! - significance: compare TREC runs of several systems with paired t-tests
//!   and write text and JSON reports

pub mod catalog;
pub mod config;
pub mod encoders;
pub mod error;
pub mod indexing;
pub mod pipeline;
pub mod resource_monitor;
pub mod significance;

pub use error::{PipelineError, Result};
