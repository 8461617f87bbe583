//! Pipeline A: encode a collection and persist its dense index
//!
//! [`CollectionIndexer`] does the work, [`TimeBoundedRunner`] keeps it
//! inside the scheduler's wall-clock allocation, and [`artifact`] owns the
//! on-disk format.

pub mod artifact;
pub mod indexer;
pub mod runner;

pub use artifact::{DenseIndex, DenseIndexWriter, IndexManifest, IndexMetadata, VectorRecord};
pub use indexer::{CollectionIndexer, IndexJob, IndexSummary};
pub use runner::{CancellationFlag, TaskOutcome, TimeBoundedRunner, TimeBudget};
