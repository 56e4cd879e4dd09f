//! Entry points shared by the subprocess binaries and the multi-command tool.
//!
//! Each `run_*` function takes the arguments after the program name, writes
//! only the documented result to `out` and returns the process exit code.
//! Arguments stay `OsString` so that any path the OS accepts reaches the loader.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::Path;

use env_logger::Env;

use crate::batch::{BatchDispatcher, BatchReport, BatchRequest, ErrorReport, ImagePairRequest};
use crate::config::{load_config, Config, Variant};
use crate::error::{Result, SimilarityError};
use crate::pipeline::SimilarityPipeline;

/// Signature shared by the three subprocess entry points
pub type Runner = fn(&[OsString], &Config, &mut dyn Write) -> i32;

/// Initialise stderr logging at the configured level unless `RUST_LOG` overrides it
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .try_init();
}

/// Load configuration and start logging. An invalid configuration is logged
/// and returned as an error; the caller decides the exit code.
fn startup() -> Result<Config> {
    match load_config() {
        Ok(config) => {
            init_logging(&config.log_level);
            Ok(config)
        }
        Err(e) => {
            init_logging("warn");
            log::error!("Failed to load configuration: {}", e);
            Err(e)
        }
    }
}

fn emit(out: &mut dyn Write, line: &str) -> i32 {
    match writeln!(out, "{}", line).and_then(|_| out.flush()) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("Failed to write result: {}", e);
            1
        }
    }
}

fn pipeline_for(config: &Config, variant: Variant) -> Option<SimilarityPipeline> {
    match SimilarityPipeline::for_variant(config, variant) {
        Ok(pipeline) => Some(pipeline),
        Err(e) => {
            log::error!("Cannot build {} pipeline: {}", variant.as_str(), e);
            None
        }
    }
}

/// Fused score for one pair, or 0 when the images cannot be read
fn score_or_zero(pipeline: &SimilarityPipeline, first: &OsString, second: &OsString) -> f64 {
    match pipeline.compare_paths(first, second) {
        Ok(result) => result.similarity,
        Err(e) => {
            log::warn!("Similarity computation failed: {}", e);
            0.0
        }
    }
}

/// Precision pair comparison: six decimals, zero score on unreadable images
pub fn run_precision(args: &[OsString], config: &Config, out: &mut dyn Write) -> i32 {
    if args.len() != 2 {
        eprintln!("Usage: weighbridge_image_similarity <image1> <image2>");
        return 1;
    }
    let Some(pipeline) = pipeline_for(config, Variant::Precision) else {
        return 1;
    };

    let similarity = score_or_zero(&pipeline, &args[0], &args[1]);
    emit(out, &format!("{:.6}", similarity))
}

/// SIFT pair comparison on the percent scale: two decimals, missing files exit 1
pub fn run_sift(args: &[OsString], config: &Config, out: &mut dyn Write) -> i32 {
    if args.len() != 2 {
        eprintln!("Usage: sift_similarity <image1> <image2>");
        return 1;
    }
    // Both inputs must exist before any work starts
    for path in args {
        let path = Path::new(path);
        if !path.exists() {
            log::error!("Image does not exist: {}", path.display());
            return 1;
        }
    }
    let Some(pipeline) = pipeline_for(config, Variant::Sift) else {
        return 1;
    };

    let similarity = score_or_zero(&pipeline, &args[0], &args[1]);
    emit(out, &format!("{:.2}", similarity))
}

fn emit_error(out: &mut dyn Write, message: String) -> i32 {
    log::error!("{}", message);
    let report = ErrorReport { error: message };
    match serde_json::to_string(&report) {
        Ok(json) => {
            emit(out, &json);
        }
        Err(e) => log::error!("Failed to serialize error report: {}", e),
    }
    1
}

/// Throughput comparison: a bare score for two paths, or a JSON batch report
pub fn run_batch(args: &[OsString], config: &Config, out: &mut dyn Write) -> i32 {
    if args.is_empty() {
        eprintln!("Usage: weighbridge_image_similarity_batch '<json_input>'");
        eprintln!("   or: weighbridge_image_similarity_batch <image1> <image2>");
        return 1;
    }
    let Some(pipeline) = pipeline_for(config, Variant::Throughput) else {
        return 1;
    };

    // Two positional paths: single pair mode
    if args.len() == 2 {
        let similarity = score_or_zero(&pipeline, &args[0], &args[1]);
        return emit(out, &format!("{:?}", similarity));
    }

    // Otherwise the first argument is the JSON request
    let request = match args[0].to_str() {
        Some(input) => BatchRequest::from_json(input),
        None => Err(SimilarityError::MalformedRequest(
            "JSON parse error: argument is not valid UTF-8".into(),
        )),
    };
    let request = match request {
        Ok(request) => request,
        Err(SimilarityError::MalformedRequest(reason)) => return emit_error(out, reason),
        Err(e) => return emit_error(out, e.to_string()),
    };

    let dispatcher = BatchDispatcher::new(pipeline, config.max_workers_ceiling);
    let report = dispatcher.run(&request.pairs, request.max_workers);
    match serde_json::to_string(&report) {
        Ok(json) => emit(out, &json),
        Err(e) => emit_error(out, format!("processing error: {}", e)),
    }
}

/// Score a list of pairs with the throughput pipeline
pub fn batch_pairs(
    pairs: &[ImagePairRequest],
    max_workers: Option<i64>,
    config: &Config,
) -> Result<BatchReport> {
    let pipeline = SimilarityPipeline::for_variant(config, Variant::Throughput)?;
    Ok(BatchDispatcher::new(pipeline, config.max_workers_ceiling).run(pairs, max_workers))
}

/// Process entry used by the binaries: load configuration, run, return the exit code
pub fn main_with(runner: Runner, json_errors: bool) -> i32 {
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let config = match startup() {
        Ok(config) => config,
        Err(e) if json_errors => return emit_error(&mut out, format!("configuration error: {}", e)),
        Err(_) => return 1,
    };
    runner(&args, &config, &mut out)
}
