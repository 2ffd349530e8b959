use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PipelineKind {
    Train,
    Predict,
}

impl PipelineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Predict => "predict",
        }
    }

    pub fn experiment_name(self) -> &'static str {
        match self {
            Self::Train => "YOLO_Experiments",
            Self::Predict => "YOLO_Predictions",
        }
    }

    pub fn commit_message(self, run_id: &str) -> String {
        match self {
            Self::Train => format!("Add train model version {run_id}"),
            Self::Predict => format!("Add predict run {run_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub name: String,
    pub class: u32,
    pub confidence: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub path: PathBuf,
    pub save_dir: PathBuf,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl InferenceResult {
    pub fn has_detections(&self) -> bool {
        !self.detections.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub image_name: String,
    pub detections: Vec<Detection>,
}

pub type DetectionsManifest = Vec<DetectionRecord>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOutcome {
    pub save_dir: PathBuf,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl TrainOutcome {
    pub fn best_checkpoint(&self) -> PathBuf {
        self.save_dir.join("weights").join("best.pt")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelArtifactRecord {
    pub run_id: String,
    pub checkpoint_path: PathBuf,
    pub source_path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}
