use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::model::PipelineKind;
use crate::snapshot::{SnapshotCommitter, SnapshotRequest, snapshot_best_effort};
use crate::tracking::TrackingStore;

pub mod predict;
pub mod status;
pub mod train;

pub const MODEL_STORE_DIRNAME: &str = "models";
pub const PREDICT_DIRNAME: &str = "Predict";
pub const TRACKING_DIRNAME: &str = "mlruns";

#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODEL_STORE_DIRNAME)
    }

    pub fn predict_dir(&self) -> PathBuf {
        self.root.join(PREDICT_DIRNAME)
    }

    pub fn tracking_dir(&self) -> PathBuf {
        self.root.join(TRACKING_DIRNAME)
    }
}

pub struct PipelineEnv<'a> {
    pub workspace: &'a Workspace,
    pub store: &'a TrackingStore,
    pub committer: Option<&'a dyn SnapshotCommitter>,
}

impl PipelineEnv<'_> {
    pub fn finalize_snapshot(
        &self,
        kind: PipelineKind,
        run_id: &str,
        target: &str,
    ) -> Option<String> {
        let Some(committer) = self.committer else {
            info!(run_id, target, "snapshot skipped");
            return None;
        };

        let request = SnapshotRequest::new(kind, run_id, Path::new(target));
        let tag = snapshot_best_effort(committer, &request)?;

        if let Err(err) = self.store.set_run_tag(run_id, "version_tag", &tag) {
            warn!(run_id, tag = %tag, error = %err, "failed to record version tag on run");
        }

        Some(tag)
    }
}
