use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::Path;

use weighbridge_similarity::cli;
use weighbridge_similarity::config::{load_config, Config, Variant, DEFAULT_CONFIG_FILE};
use weighbridge_similarity::metrics::MetricKind;
use weighbridge_similarity::{BatchRequest, SimilarityPipeline};

// Main application
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Get command line arguments, keeping paths as the OS gave them
    let args: Vec<OsString> = env::args_os().collect();
    let word = |i: usize| args.get(i).map(|a| a.to_string_lossy().into_owned());

    if args.len() <= 1 {
        print_help();
        return Ok(());
    }

    // Handle different commands
    match word(1).unwrap_or_default().as_str() {
        "compare" => {
            if args.len() < 4 {
                println!("Usage: weighbridge-similarity compare <image1> <image2> [precision|throughput|sift]");
                return Ok(());
            }

            let variant = match word(4).as_deref() {
                None | Some("precision") => Variant::Precision,
                Some("throughput") => Variant::Throughput,
                Some("sift") => Variant::Sift,
                Some(other) => return Err(format!("Unknown variant: {}", other).into()),
            };

            // Load configuration
            let config = load_config()?;
            cli::init_logging(&config.log_level);

            // Compare the images
            compare_images(Path::new(&args[2]), Path::new(&args[3]), variant, &config)?;
        }
        "sift" => {
            if args.len() < 4 {
                println!("Usage: weighbridge-similarity sift <image1> <image2>");
                return Ok(());
            }

            // Load configuration
            let config = load_config()?;
            cli::init_logging(&config.log_level);

            // Compare the images
            compare_images(Path::new(&args[2]), Path::new(&args[3]), Variant::Sift, &config)?;
        }
        "batch" => {
            if args.len() < 3 {
                println!("Usage: weighbridge-similarity batch <request.json> [max_workers]");
                println!("  The request file holds {{\"pairs\": [{{\"image1\": ..., \"image2\": ...}}]}}");
                return Ok(());
            }

            // Load configuration
            let config = load_config()?;
            cli::init_logging(&config.log_level);

            // Run the request file
            run_batch_file(Path::new(&args[2]), word(3).as_deref(), &config)?;
        }
        "config" => {
            if args.len() < 3 {
                println!("Usage: weighbridge-similarity config <command>");
                println!("Commands:");
                println!("  create - Create default configuration file");
                println!("  show   - Show current configuration");
                println!("  check  - Check configuration settings");
                return Ok(());
            }

            let command = word(2).unwrap_or_default();
            match command.as_str() {
                "create" => create_config()?,
                "show" => show_config()?,
                "check" => check_config()?,
                _ => {
                    println!("Unknown config command: {}", command);
                }
            }
        }
        "help" => {
            print_help();
        }
        other => {
            println!("Unknown command: {}", other);
            print_help();
        }
    }

    Ok(())
}

/// Compare two images and print the fused score with its components
fn compare_images(
    img1_path: &Path,
    img2_path: &Path,
    variant: Variant,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Comparing images ({} pipeline):", variant.as_str());
    println!("  1: {}", img1_path.display());
    println!("  2: {}", img2_path.display());

    let pipeline = SimilarityPipeline::for_variant(config, variant)?;
    let result = pipeline.compare_paths(img1_path, img2_path)?;

    for kind in MetricKind::ALL {
        if pipeline.config().weights.get(kind) <= 0.0 {
            continue;
        }
        match (result.raw(kind), result.normalized(kind)) {
            (Some(raw), Some(normalized)) => {
                println!("  {:<10} raw {:>9.4}  normalized {:>9.4}", kind, raw, normalized)
            }
            _ => println!("  {:<10} failed, scored as 0", kind),
        }
    }

    println!("Similarity: {:.6} (of {})", result.similarity, result.scale.max());
    Ok(())
}

/// Run a batch request stored in a JSON file and print the report
fn run_batch_file(
    request_path: &Path,
    max_workers: Option<&str>,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    // Load the request
    let contents = fs::read_to_string(request_path)?;
    let request = BatchRequest::from_json(&contents)?;

    // A command line worker count overrides the file

    let max_workers = match max_workers {
        Some(value) => Some(value.parse::<i64>()?),
        None => request.max_workers,
    };

    // Score the pairs
    let report = cli::batch_pairs(&request.pairs, max_workers, config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!(
        "Processed {} of {} pairs, {} failed",
        report.processed_pairs,
        report.total_pairs,
        report.failures()
    );
    Ok(())
}

/// Create default configuration file
fn create_config() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    config.save_to_file(DEFAULT_CONFIG_FILE)?;
    println!("Created default configuration file: {}", DEFAULT_CONFIG_FILE);
    Ok(())
}

/// Show current configuration
fn show_config() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Check configuration settings
fn check_config() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;

    println!("Configuration check:");
    println!("  Log level: {}", config.log_level);
    println!("  Batch worker ceiling: {}", config.max_workers_ceiling);
    for variant in [Variant::Precision, Variant::Throughput, Variant::Sift] {
        let pipeline = config.pipeline(variant);
        let resolution = pipeline
            .resolution
            .map(|r| format!("{}x{}", r, r))
            .unwrap_or_else(|| "original".to_string());
        let active: Vec<&str> = pipeline.weights.active_kinds().iter().map(|k| k.as_str()).collect();
        println!(
            "  {:<10} resolution {:<9} metrics [{}], weight sum {:.6}",
            variant.as_str(),
            resolution,
            active.join(", "),
            pipeline.weights.sum()
        );
    }
    println!("Configuration is valid");
    Ok(())
}

/// Print help information
fn print_help() {
    println!("Weighbridge Similarity - Image similarity scoring for weighbridge captures");
    println!();
    println!("Commands:");
    println!("  compare <image1> <image2> [variant]  - Compare two images and show every metric");
    println!("  sift <image1> <image2>               - Compare two images with the SIFT pipeline");
    println!("  batch <request.json> [max_workers]   - Score a JSON list of image pairs in parallel");
    println!("  config <subcommand>                  - Manage configuration (create, show, check)");
    println!("  help                                 - Show this help message");
    println!();
    println!("Variants: precision (default), throughput, sift");
    println!();
    println!("Configuration is read from ${} or ./{} when present.",
        weighbridge_similarity::config::CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE);
}
