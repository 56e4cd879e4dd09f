mod common;

use common::{arg, write_flat, write_textured};
use weighbridge_similarity::batch::{BatchDispatcher, ImagePairRequest};
use weighbridge_similarity::{Config, SimilarityPipeline, Variant};

fn dispatcher(config: &Config) -> BatchDispatcher {
    let pipeline = SimilarityPipeline::for_variant(config, Variant::Throughput).unwrap();
    BatchDispatcher::new(pipeline, config.max_workers_ceiling)
}

#[test]
fn one_bad_pair_does_not_affect_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_textured(dir.path(), "a.png", 128, 1);
    let second = write_textured(dir.path(), "b.png", 128, 2);
    let missing = dir.path().join("gone.png");

    let good = ImagePairRequest::new(arg(&first), arg(&first));
    let other = ImagePairRequest::new(arg(&first), arg(&second));
    let bad = ImagePairRequest::new(arg(&missing), arg(&second));
    let requests = vec![good.clone(), bad.clone(), other.clone()];

    let report = dispatcher(&Config::default()).run(&requests, Some(3));
    assert!(report.success);
    assert_eq!(report.total_pairs, 3);
    assert_eq!(report.processed_pairs, 3);
    assert_eq!(report.failures(), 1);

    let failed = report.result_for(&bad).unwrap();
    assert!(!failed.success);
    assert_eq!(failed.similarity, 0.0);
    assert!(failed.error.as_deref().unwrap().contains("gone.png"));

    let identical = report.result_for(&good).unwrap();
    assert!(identical.success);
    assert!(identical.similarity >= 0.99, "similarity was {}", identical.similarity);

    let different = report.result_for(&other).unwrap();
    assert!(different.success);
    assert!(different.similarity < identical.similarity);
}

#[test]
fn worker_count_does_not_change_scores() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = (0..4)
        .map(|seed| write_textured(dir.path(), &format!("img{}.png", seed), 96, seed))
        .collect();
    let flat = write_flat(dir.path(), "flat.png", 96, 128);

    let mut requests: Vec<ImagePairRequest> = paths
        .windows(2)
        .map(|w| ImagePairRequest::new(arg(&w[0]), arg(&w[1])))
        .collect();
    requests.push(ImagePairRequest::new(arg(&paths[0]), arg(&flat)));

    let config = Config::default();
    let serial = dispatcher(&config).run(&requests, Some(1));
    let parallel = dispatcher(&config).run(&requests, Some(8));
    assert_eq!(serial.processed_pairs, requests.len());
    assert_eq!(parallel.processed_pairs, requests.len());

    for request in &requests {
        let a = serial.result_for(request).unwrap();
        let b = parallel.result_for(request).unwrap();
        assert_eq!(a.similarity, b.similarity, "{:?}", request);
        assert_eq!(a.success, b.success);
    }
}

#[test]
fn undecodable_file_is_reported_per_pair() {
    let dir = tempfile::tempdir().unwrap();
    let garbage = dir.path().join("broken.png");
    std::fs::write(&garbage, [0u8, 1, 2, 3]).unwrap();
    let image = write_textured(dir.path(), "a.png", 64, 9);

    let request = ImagePairRequest::new(arg(&image), arg(&garbage));
    let report = dispatcher(&Config::default()).run(&[request.clone()], None);
    let result = report.result_for(&request).unwrap();
    assert!(!result.success);
    assert_eq!(result.similarity, 0.0);
    assert!(result.error.as_deref().unwrap().contains("decode"));
}
