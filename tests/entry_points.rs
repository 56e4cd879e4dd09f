mod common;

use common::{arg, write_flat, write_textured};
use std::ffi::OsString;
use std::fs;
use weighbridge_similarity::cli::{run_batch, run_precision, run_sift, Runner};
use weighbridge_similarity::Config;

fn run(runner: Runner, args: &[String]) -> (i32, String) {
    let args: Vec<OsString> = args.iter().map(OsString::from).collect();
    let mut out = Vec::new();
    let code = runner(&args, &Config::default(), &mut out);
    (code, String::from_utf8(out).unwrap())
}

#[test]
fn precision_identical_files_score_near_one() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_textured(dir.path(), "scale.png", 256, 11);

    let (code, out) = run(run_precision, &[arg(&image), arg(&image)]);
    assert_eq!(code, 0);
    let line = out.trim_end();
    assert_eq!(line.split('.').nth(1).map(str::len), Some(6), "output was {:?}", line);
    let score: f64 = line.parse().unwrap();
    assert!(score >= 0.99, "score was {}", score);
}

#[test]
fn precision_white_against_black_is_low() {
    let dir = tempfile::tempdir().unwrap();
    let white = write_flat(dir.path(), "white.png", 256, 255);
    let black = write_flat(dir.path(), "black.png", 256, 0);

    let (code, out) = run(run_precision, &[arg(&white), arg(&black)]);
    assert_eq!(code, 0);
    let score: f64 = out.trim().parse().unwrap();
    assert!((0.0..=0.21).contains(&score), "score was {}", score);
}

#[test]
fn precision_scores_undecodable_files_as_zero() {
    let dir = tempfile::tempdir().unwrap();
    let garbage = dir.path().join("broken.jpg");
    fs::write(&garbage, b"definitely not a jpeg").unwrap();
    let image = write_textured(dir.path(), "scale.png", 64, 2);

    let (code, out) = run(run_precision, &[arg(&garbage), arg(&image)]);
    assert_eq!(code, 0);
    assert_eq!(out, "0.000000\n");
}

#[test]
fn sift_identical_files_score_near_one_hundred() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_textured(dir.path(), "scale.png", 128, 5);

    let (code, out) = run(run_sift, &[arg(&image), arg(&image)]);
    assert_eq!(code, 0);
    let line = out.trim_end();
    assert_eq!(line.split('.').nth(1).map(str::len), Some(2), "output was {:?}", line);
    let score: f64 = line.parse().unwrap();
    assert!(score >= 99.0, "score was {}", score);
}

#[test]
fn sift_missing_second_file_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_textured(dir.path(), "scale.png", 64, 5);
    let missing = dir.path().join("missing.png");

    let (code, out) = run(run_sift, &[arg(&image), arg(&missing)]);
    assert_eq!(code, 1);
    assert!(out.is_empty());
}

#[test]
fn batch_pair_mode_prints_a_number_in_range() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_textured(dir.path(), "a.png", 200, 1);
    let second = write_textured(dir.path(), "b.png", 200, 2);

    let (code, out) = run(run_batch, &[arg(&first), arg(&second)]);
    assert_eq!(code, 0);
    let score: f64 = out.trim().parse().unwrap();
    assert!((0.0..=1.0).contains(&score), "score was {}", score);
}

#[test]
fn batch_json_mode_reports_every_pair() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_textured(dir.path(), "a.png", 160, 1);
    let second = write_textured(dir.path(), "b.png", 160, 2);
    let request = serde_json::json!({
        "pairs": [
            {"image1": arg(&first), "image2": arg(&first)},
            {"image1": arg(&first), "image2": arg(&second)},
        ],
        "max_workers": 2
    });

    let (code, out) = run(run_batch, &[request.to_string()]);
    assert_eq!(code, 0);
    let report: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(report["success"], true);
    assert_eq!(report["total_pairs"], 2);
    assert_eq!(report["processed_pairs"], 2);
    for result in report["results"].as_array().unwrap() {
        assert_eq!(result["success"], true);
        assert!(result.get("error").is_none());
        let similarity = result["similarity"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&similarity));
    }
}

#[test]
fn batch_json_mode_rejects_bad_input() {
    for input in ["[1, 2", r#"{"pairs": []}"#, r#"{"max_workers": 4}"#] {
        let (code, out) = run(run_batch, &[input.to_string()]);
        assert_eq!(code, 1, "input {}", input);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(value["error"].is_string(), "input {}", input);
    }
}
