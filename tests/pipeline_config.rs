use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use framewatch::config::PipelineConfig;
use framewatch::DetectorKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FRAMEWATCH_CONFIG",
        "FRAMEWATCH_STORE_ROOT",
        "FRAMEWATCH_ANNOTATIONS_DB",
        "FRAMEWATCH_QUEUE_DB",
        "FRAMEWATCH_OUTPUT_BUCKET",
        "FRAMEWATCH_VISIBILITY_TIMEOUT_SECS",
        "FRAMEWATCH_DETECTION_TIMEOUT_SECS",
        "FRAMEWATCH_ABS_DIFF_THRESHOLD",
        "FRAMEWATCH_SIMILARITY_THRESHOLD",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_cover_every_detector() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = PipelineConfig::load().expect("load defaults");
    assert_eq!(cfg.keyframes.policy.abs_diff_threshold, 50.0);
    assert_eq!(cfg.keyframes.policy.similarity_threshold, 0.95);
    assert_eq!(cfg.detectors.len(), 4);
    assert_eq!(
        cfg.detector(DetectorKind::Vehicle).unwrap().queue,
        "vehicle-detections"
    );
    assert_eq!(cfg.queue.visibility_timeout, Duration::from_secs(30));
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = write_config(
        ".toml",
        r#"
        [storage]
        root = "/srv/framewatch"
        output_bucket = "stills"
        annotations_db = "/srv/annotations.db"

        [queue]
        db_path = "/srv/queue.db"
        visibility_timeout_secs = 90
        max_receives = 5

        [keyframes]
        abs_diff_threshold = 40.0
        jpeg_quality = 80

        [consumer]
        detection_timeout_secs = 12

        [[detectors]]
        kind = "fire"
        queue = "fire-jobs"
        endpoint = "http://fire.internal:8080/detect"

        [[detectors]]
        kind = "car"
        "#,
    );

    std::env::set_var("FRAMEWATCH_CONFIG", file.path());
    std::env::set_var("FRAMEWATCH_OUTPUT_BUCKET", "keyframes-prod");
    std::env::set_var("FRAMEWATCH_SIMILARITY_THRESHOLD", "0.9");
    std::env::set_var("FRAMEWATCH_VISIBILITY_TIMEOUT_SECS", "120");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.storage.root.to_str(), Some("/srv/framewatch"));
    assert_eq!(cfg.storage.output_bucket, "keyframes-prod");
    assert_eq!(cfg.storage.annotations_db, "/srv/annotations.db");
    assert_eq!(cfg.queue.db_path, "/srv/queue.db");
    assert_eq!(cfg.queue.visibility_timeout, Duration::from_secs(120));
    assert_eq!(cfg.queue.max_receives, 5);
    assert_eq!(cfg.keyframes.policy.abs_diff_threshold, 40.0);
    assert_eq!(cfg.keyframes.policy.similarity_threshold, 0.9);
    assert_eq!(cfg.keyframes.jpeg_quality, 80);
    assert_eq!(cfg.consumer.detection_timeout, Duration::from_secs(12));
    assert_eq!(cfg.detectors.len(), 2);
    let fire = cfg.detector(DetectorKind::Fire).unwrap();
    assert_eq!(fire.queue, "fire-jobs");
    assert_eq!(fire.endpoint, "http://fire.internal:8080/detect");
    let vehicle = cfg.detector(DetectorKind::Vehicle).unwrap();
    assert_eq!(vehicle.queue, "vehicle-detections");
    assert_eq!(vehicle.endpoint, "stub://clear");
    assert!(cfg.detector(DetectorKind::Person).is_none());

    clear_env();
}

#[test]
fn loads_json_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = write_config(
        ".json",
        r#"{"keyframes": {"abs_diff_threshold": 12.5}, "detectors": [{"kind": "person"}]}"#,
    );
    std::env::set_var("FRAMEWATCH_CONFIG", file.path());
    let cfg = PipelineConfig::load().expect("load json config");
    assert_eq!(cfg.keyframes.policy.abs_diff_threshold, 12.5);
    assert_eq!(cfg.detectors.len(), 1);

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let duplicate = write_config(
        ".toml",
        r#"
        [[detectors]]
        kind = "fall"
        [[detectors]]
        kind = "fall"
        queue = "other"
        "#,
    );
    std::env::set_var("FRAMEWATCH_CONFIG", duplicate.path());
    assert!(PipelineConfig::load().is_err());

    let unknown = write_config(".toml", "[[detectors]]\nkind = \"smoke\"\n");
    std::env::set_var("FRAMEWATCH_CONFIG", unknown.path());
    assert!(PipelineConfig::load().is_err());

    std::env::remove_var("FRAMEWATCH_CONFIG");
    std::env::set_var("FRAMEWATCH_SIMILARITY_THRESHOLD", "1.5");
    assert!(PipelineConfig::load().is_err());
    std::env::remove_var("FRAMEWATCH_SIMILARITY_THRESHOLD");

    std::env::set_var("FRAMEWATCH_VISIBILITY_TIMEOUT_SECS", "0");
    assert!(PipelineConfig::load().is_err());
    std::env::set_var("FRAMEWATCH_VISIBILITY_TIMEOUT_SECS", "soon");
    assert!(PipelineConfig::load().is_err());

    clear_env();
}
