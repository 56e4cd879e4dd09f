use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crate::error::{Result, SimilarityError};
use crate::pipeline::SimilarityPipeline;

/// One pair of image paths to compare
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImagePairRequest {
    pub image1: String,
    pub image2: String,
}

impl ImagePairRequest {
    pub fn new(image1: impl Into<String>, image2: impl Into<String>) -> Self {
        Self {
            image1: image1.into(),
            image2: image2.into(),
        }
    }
}

/// JSON body accepted by the batch entry point
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub pairs: Vec<ImagePairRequest>,
    #[serde(default)]
    pub max_workers: Option<i64>,
}

impl BatchRequest {
    pub fn from_json(input: &str) -> Result<Self> {
        let request: BatchRequest = serde_json::from_str(input)
            .map_err(|e| SimilarityError::MalformedRequest(format!("JSON parse error: {}", e)))?;
        if request.pairs.is_empty() {
            return Err(SimilarityError::MalformedRequest("no image pairs provided".into()));
        }
        Ok(request)
    }
}

/// Outcome for one pair; failures carry a zero similarity and the reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairResult {
    pub image1: String,
    pub image2: String,
    pub similarity: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PairResult {
    fn scored(request: &ImagePairRequest, similarity: f64) -> Self {
        PairResult {
            image1: request.image1.clone(),
            image2: request.image2.clone(),
            similarity,
            success: true,
            error: None,
        }
    }

    fn failed(request: &ImagePairRequest, error: String) -> Self {
        PairResult {
            image1: request.image1.clone(),
            image2: request.image2.clone(),
            similarity: 0.0,
            success: false,
            error: Some(error),
        }
    }
}

/// Results of one batch, in completion order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub success: bool,
    pub total_pairs: usize,
    pub processed_pairs: usize,
    pub results: Vec<PairResult>,
}

impl BatchReport {
    /// Result for a given pair, if the batch contained it
    pub fn result_for(&self, request: &ImagePairRequest) -> Option<&PairResult> {
        self.results
            .iter()
            .find(|r| r.image1 == request.image1 && r.image2 == request.image2)
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

/// JSON error object printed instead of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
}

/// Worker count: a positive override wins, otherwise the available
/// parallelism bounded by `ceiling`
pub fn resolve_workers(max_workers: Option<i64>, ceiling: usize) -> usize {
    match max_workers {
        Some(n) if n > 0 => n as usize,
        _ => {
            let available = std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1);
            available.min(ceiling).max(1)
        }
    }
}

/// Threads actually started for a batch: never more than there are pairs
pub fn pool_size(max_workers: Option<i64>, ceiling: usize, pairs: usize) -> usize {
    resolve_workers(max_workers, ceiling).min(pairs).max(1)
}

/// Runs one pipeline invocation per pair on a bounded worker pool
pub struct BatchDispatcher {
    pipeline: SimilarityPipeline,
    workers_ceiling: usize,
}

impl BatchDispatcher {
    pub fn new(pipeline: SimilarityPipeline, workers_ceiling: usize) -> Self {
        Self {
            pipeline,
            workers_ceiling,
        }
    }

    /// Score every pair. A failure in one pair never affects another.
    pub fn run(&self, requests: &[ImagePairRequest], max_workers: Option<i64>) -> BatchReport {
        let start_time = Instant::now();
        let workers = pool_size(max_workers, self.workers_ceiling, requests.len());
        log::info!("Processing {} image pairs with {} workers", requests.len(), workers);

        // Results are pushed as each pair finishes
        let results = Mutex::new(Vec::with_capacity(requests.len()));
        let process_all = || {
            requests.par_iter().for_each(|request| {
                let result = self.process_pair(request);
                results.lock().push(result);
            });
        };

        // Build a dedicated pool; if the OS refuses the threads, score on this one
        match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("similarity-worker-{}", i))
            .build()
        {
            Ok(pool) => pool.install(process_all),
            Err(e) => {
                log::warn!("Failed to start {} workers ({}), scoring pairs sequentially", workers, e);
                for request in requests {
                    let result = self.process_pair(request);
                    results.lock().push(result);
                }
            }
        }

        // Assemble the report
        let results = results.into_inner();
        let report = BatchReport {
            success: true,
            total_pairs: requests.len(),
            processed_pairs: results.len(),
            results,
        };

        log::info!(
            "Batch completed: {} pairs, {} failed, in {:?}",
            report.processed_pairs,
            report.failures(),
            start_time.elapsed()
        );
        report
    }

    fn process_pair(&self, request: &ImagePairRequest) -> PairResult {
        // A panic inside one comparison must not take down the batch
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pipeline.compare_paths(&request.image1, &request.image2)
        }));

        match outcome {
            Ok(Ok(result)) => PairResult::scored(request, result.similarity),
            Ok(Err(e)) => {
                if e.is_recoverable() {
                    log::warn!("{} vs {}: {}", request.image1, request.image2, e);
                } else {
                    log::error!("{} vs {}: {}", request.image1, request.image2, e);
                }
                PairResult::failed(request, e.to_string())
            }
            Err(payload) => {
                // Recover the panic message when it is a string
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "comparison panicked".to_string());
                log::error!("{} vs {}: {}", request.image1, request.image2, message);
                PairResult::failed(request, message)
            }
        }
    }
}
