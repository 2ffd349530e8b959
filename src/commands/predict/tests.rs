use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

use super::triage::{
    MANIFEST_FILENAME, NON_PREDICTED_DIRNAME, PREDICTED_DIRNAME, resolve_rendered_file,
};
use super::*;
use crate::model::{BoundingBox, Detection, DetectionRecord, InferenceResult};
use crate::snapshot::testing::RecordingCommitter;
use crate::tracking::{RunStatus, TrackingStore};

fn detection(name: &str, confidence: f64) -> Detection {
    Detection {
        name: name.to_string(),
        class: 0,
        confidence,
        bbox: BoundingBox {
            x1: 10.0,
            y1: 20.0,
            x2: 110.0,
            y2: 220.0,
        },
        extra: serde_json::Map::new(),
    }
}

fn result(renderer_dir: &Path, source: &str, detections: Vec<Detection>) -> InferenceResult {
    InferenceResult {
        path: PathBuf::from("data/test/images").join(source),
        save_dir: renderer_dir.to_path_buf(),
        detections,
    }
}

fn render(renderer_dir: &Path, file_name: &str) {
    fs::create_dir_all(renderer_dir).expect("create renderer dir");
    fs::write(renderer_dir.join(file_name), file_name.as_bytes()).expect("write rendered image");
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read partition")
        .map(|entry| {
            entry
                .expect("dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}

fn read_manifest(layout: &OutputLayout) -> Vec<DetectionRecord> {
    let raw = fs::read(&layout.manifest_path).expect("manifest exists");
    serde_json::from_slice(&raw).expect("manifest parses")
}

// Three images: two detected, one empty.
fn scenario_a(renderer_dir: &Path) -> Vec<InferenceResult> {
    render(renderer_dir, "dog.jpg");
    render(renderer_dir, "cat.png");
    render(renderer_dir, "empty.jpg");
    vec![
        result(renderer_dir, "dog.jpg", vec![detection("dog", 0.9)]),
        result(renderer_dir, "cat.png", vec![detection("cat", 0.7)]),
        result(renderer_dir, "empty.jpg", Vec::new()),
    ]
}

#[test]
fn scenario_a_partitions_and_manifest_order() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let renderer_dir = dir.path().join("runs/detect/predict");
    let results = scenario_a(&renderer_dir);
    let layout = OutputLayout::for_model(&dir.path().join("Predict"), "best", 0.5, None);

    let outcome = triage(&results, &layout, &renderer_dir).expect("triage");

    assert_eq!(files_in(&layout.predicted_dir), vec!["cat.png", "dog.jpg"]);
    assert_eq!(files_in(&layout.non_predicted_dir), vec!["empty.jpg"]);

    let manifest = read_manifest(&layout);
    let names: Vec<&str> = manifest.iter().map(|record| record.image_name.as_str()).collect();
    assert_eq!(names, vec!["dog.jpg", "cat.png"]);
    assert_eq!(manifest[0].detections[0].confidence, 0.9);
    assert_eq!(manifest[1].detections[0].name, "cat");

    let summary = outcome.summary().expect("organized");
    assert_eq!(summary.predicted, 2);
    assert_eq!(summary.non_predicted, 1);
    assert!(summary.unresolved.is_empty());
    assert!(!renderer_dir.exists(), "renderer output must be drained");
}

#[test]
fn layout_directory_name_is_keyed_by_model_and_threshold() {
    let layout = OutputLayout::for_model(Path::new("Predict"), "best", 0.25, None);
    assert_eq!(
        layout.output_dir,
        PathBuf::from("Predict/PREDICT-best_CONFIDENCE-0.25")
    );
    assert_eq!(
        layout.manifest_path,
        PathBuf::from("Predict/PREDICT-best_CONFIDENCE-0.25/predicted_results.json")
    );

    let per_run = OutputLayout::for_model(
        Path::new("Predict"),
        "best",
        0.25,
        Some("0123456789abcdef"),
    );
    assert_eq!(
        per_run.output_dir,
        PathBuf::from("Predict/PREDICT-best_CONFIDENCE-0.25_RUN-01234567")
    );
}

#[test]
fn resolution_prefers_jpg_over_png() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    render(dir.path(), "photo.png");
    render(dir.path(), "photo.jpg");
    render(dir.path(), "photo.bmp");

    let resolved = resolve_rendered_file(dir.path(), "photo.png").expect("resolved");
    assert_eq!(resolved, dir.path().join("photo.jpg"));
}

#[test]
fn resolution_falls_through_extension_list() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    render(dir.path(), "scan.bmp");

    assert_eq!(
        resolve_rendered_file(dir.path(), "scan.tiff"),
        Some(dir.path().join("scan.bmp"))
    );
    assert_eq!(resolve_rendered_file(dir.path(), "absent.jpg"), None);
}

#[test]
fn renderer_extension_change_keeps_rendered_name() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let renderer_dir = dir.path().join("render");
    render(&renderer_dir, "frame.jpg");
    let results = vec![result(&renderer_dir, "frame.webp", vec![detection("car", 0.6)])];
    let layout = OutputLayout::new(dir.path().join("out"));

    triage(&results, &layout, &renderer_dir).expect("triage");

    assert_eq!(files_in(&layout.predicted_dir), vec!["frame.jpg"]);
    assert_eq!(read_manifest(&layout)[0].image_name, "frame.webp");
}

#[test]
fn unresolved_image_is_dropped_without_aborting() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let renderer_dir = dir.path().join("render");
    render(&renderer_dir, "dog.jpg");
    let results = vec![
        result(&renderer_dir, "ghost.jpg", vec![detection("ghost", 0.99)]),
        result(&renderer_dir, "dog.jpg", vec![detection("dog", 0.9)]),
    ];
    let layout = OutputLayout::new(dir.path().join("out"));

    let outcome = triage(&results, &layout, &renderer_dir).expect("triage continues");

    let summary = outcome.summary().expect("organized");
    assert_eq!(summary.unresolved, vec!["ghost.jpg".to_string()]);
    let manifest = read_manifest(&layout);
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].image_name, "dog.jpg");
}

#[test]
fn blocked_destination_counts_as_unresolved() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let renderer_dir = dir.path().join("render");
    render(&renderer_dir, "dog.jpg");
    render(&renderer_dir, "cat.jpg");
    let results = vec![
        result(&renderer_dir, "dog.jpg", vec![detection("dog", 0.9)]),
        result(&renderer_dir, "cat.jpg", vec![detection("cat", 0.8)]),
    ];
    let layout = OutputLayout::new(dir.path().join("out"));
    fs::create_dir_all(layout.predicted_dir.join("dog.jpg").join("occupied"))
        .expect("block destination");

    let outcome = triage(&results, &layout, &renderer_dir).expect("triage continues");

    let summary = outcome.summary().expect("organized");
    assert_eq!(summary.unresolved, vec!["dog.jpg".to_string()]);
    assert_eq!(summary.predicted, 1);
    let manifest = read_manifest(&layout);
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].image_name, "cat.jpg");
    assert!(layout.predicted_dir.join("dog.jpg").is_dir());
}

#[test]
fn triage_twice_on_same_layout_is_idempotent() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let layout = OutputLayout::new(dir.path().join("out"));

    for _ in 0..2 {
        let renderer_dir = dir.path().join("render");
        let results = scenario_a(&renderer_dir);
        triage(&results, &layout, &renderer_dir).expect("triage");
    }

    assert_eq!(files_in(&layout.predicted_dir), vec!["cat.png", "dog.jpg"]);
    assert_eq!(files_in(&layout.non_predicted_dir), vec!["empty.jpg"]);
    assert_eq!(read_manifest(&layout).len(), 2);
}

#[test]
fn image_changing_partition_between_runs_is_not_duplicated() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let layout = OutputLayout::new(dir.path().join("out"));
    let renderer_dir = dir.path().join("render");

    render(&renderer_dir, "dog.jpg");
    let first = vec![result(&renderer_dir, "dog.jpg", Vec::new())];
    triage(&first, &layout, &renderer_dir).expect("first triage");
    assert_eq!(files_in(&layout.non_predicted_dir), vec!["dog.jpg"]);

    render(&renderer_dir, "dog.jpg");
    let second = vec![result(&renderer_dir, "dog.jpg", vec![detection("dog", 0.8)])];
    triage(&second, &layout, &renderer_dir).expect("second triage");

    assert_eq!(files_in(&layout.predicted_dir), vec!["dog.jpg"]);
    assert!(files_in(&layout.non_predicted_dir).is_empty());
}

#[test]
fn missing_renderer_dir_signals_no_predictions_with_empty_manifest() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let layout = OutputLayout::new(dir.path().join("out"));
    let renderer_dir = dir.path().join("never-created");
    let results = vec![result(&renderer_dir, "dog.jpg", vec![detection("dog", 0.9)])];

    let outcome = triage(&results, &layout, &renderer_dir).expect("triage");

    assert!(matches!(outcome, TriageOutcome::NoPredictions));
    assert!(read_manifest(&layout).is_empty());
    assert!(layout.predicted_dir.is_dir());
    assert!(layout.non_predicted_dir.is_dir());
}

struct FakeDetector {
    renderer_dir: PathBuf,
}

impl Detector for FakeDetector {
    fn predict(&self, params: &PredictParams) -> Result<Vec<InferenceResult>> {
        assert_eq!(params.conf_threshold, 0.5);
        Ok(scenario_a(&self.renderer_dir))
    }
}

struct SilentDetector;

impl Detector for SilentDetector {
    fn predict(&self, _params: &PredictParams) -> Result<Vec<InferenceResult>> {
        Ok(Vec::new())
    }
}

fn predict_params() -> PredictParams {
    PredictParams {
        model_path: PathBuf::from("models/abc/best.pt"),
        conf_threshold: 0.5,
        imgsz: 640,
        source: "data/test/images".to_string(),
        device: None,
    }
}

#[test]
fn pipeline_records_artifacts_and_survives_snapshot_failure() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let workspace = Workspace::new(dir.path());
    let store = TrackingStore::open(&workspace.tracking_dir()).expect("store");
    let detector = FakeDetector {
        renderer_dir: dir.path().join("runs/detect/predict"),
    };
    let committer = RecordingCommitter::failing();
    let env = PipelineEnv {
        workspace: &workspace,
        store: &store,
        committer: Some(&committer),
    };

    let report = execute(&predict_params(), &detector, &env, false).expect("pipeline succeeds");

    assert_eq!(report.run.status, RunStatus::Finished);
    assert_eq!(report.run.experiment, "YOLO_Predictions");
    assert_eq!(report.version_tag, None);
    assert_eq!(
        report.layout.output_dir,
        workspace.predict_dir().join("PREDICT-best_CONFIDENCE-0.5")
    );
    assert_eq!(committer.requests.borrow()[0].target, Path::new("Predict"));
    assert_eq!(
        store.run_artifacts(&report.run.run_id).expect("artifacts"),
        vec![
            MANIFEST_FILENAME.to_string(),
            PREDICTED_DIRNAME.to_string(),
            NON_PREDICTED_DIRNAME.to_string(),
        ]
    );
    let metrics = store.run_metrics(&report.run.run_id).expect("metrics");
    assert!(metrics.contains(&("predicted_images".to_string(), 2.0)));
    assert!(metrics.contains(&("non_predicted_images".to_string(), 1.0)));
    assert!(
        report
            .run
            .artifact_dir
            .join(PREDICTED_DIRNAME)
            .join("dog.jpg")
            .is_file()
    );
}

#[test]
fn pipeline_with_no_results_still_closes_run() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let workspace = Workspace::new(dir.path());
    let store = TrackingStore::open(&workspace.tracking_dir()).expect("store");
    let committer = RecordingCommitter::default();
    let env = PipelineEnv {
        workspace: &workspace,
        store: &store,
        committer: Some(&committer),
    };

    let report =
        execute(&predict_params(), &SilentDetector, &env, true).expect("pipeline succeeds");

    assert!(matches!(report.outcome, TriageOutcome::NoPredictions));
    assert_eq!(report.run.status, RunStatus::Finished);
    assert!(report.layout.manifest_path.is_file());
    assert!(
        report
            .layout
            .output_dir
            .to_string_lossy()
            .ends_with(&format!("_RUN-{}", &report.run.run_id[..8]))
    );
    assert_eq!(
        report.version_tag,
        Some(format!("predict_{}", &report.run.run_id[..8]))
    );
}
