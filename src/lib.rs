// Export modules
pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod fusion;
pub mod metrics;
pub mod pipeline;
pub mod preprocess;

// Re-export commonly used types
pub use batch::{BatchDispatcher, BatchReport, BatchRequest, ImagePairRequest, PairResult};
pub use config::{load_config, Config, OutputScale, PipelineConfig, Variant};
pub use error::{Result, SimilarityError};
pub use metrics::{MetricComparator, MetricKind, MetricScore};
pub use pipeline::{SimilarityPipeline, SimilarityResult};
pub use preprocess::PreparedPair;
