use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::model::{DetectionRecord, DetectionsManifest, InferenceResult};
use crate::util::{ensure_directory, move_file, short_prefix, write_json_pretty};

pub const PREDICTED_DIRNAME: &str = "Predicted_images";
pub const NON_PREDICTED_DIRNAME: &str = "NonPredicted_images";
pub const MANIFEST_FILENAME: &str = "predicted_results.json";

// Extensions the renderer may have written, probed in this order.
pub const RENDERED_EXTENSIONS: [&str; 4] = ["jpg", "png", "jpeg", "bmp"];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    Predicted,
    NonPredicted,
}

impl Disposition {
    pub fn of(result: &InferenceResult) -> Self {
        if result.has_detections() {
            Self::Predicted
        } else {
            Self::NonPredicted
        }
    }

    fn opposite(self) -> Self {
        match self {
            Self::Predicted => Self::NonPredicted,
            Self::NonPredicted => Self::Predicted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub output_dir: PathBuf,
    pub predicted_dir: PathBuf,
    pub non_predicted_dir: PathBuf,
    pub manifest_path: PathBuf,
}

impl OutputLayout {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            predicted_dir: output_dir.join(PREDICTED_DIRNAME),
            non_predicted_dir: output_dir.join(NON_PREDICTED_DIRNAME),
            manifest_path: output_dir.join(MANIFEST_FILENAME),
            output_dir,
        }
    }

    pub fn for_model(
        predict_root: &Path,
        model_name: &str,
        conf_threshold: f64,
        run_id: Option<&str>,
    ) -> Self {
        let mut dirname = format!("PREDICT-{model_name}_CONFIDENCE-{conf_threshold}");
        if let Some(run_id) = run_id {
            dirname.push_str("_RUN-");
            dirname.push_str(short_prefix(run_id, 8));
        }
        Self::new(predict_root.join(dirname))
    }

    pub fn ensure(&self) -> Result<()> {
        ensure_directory(&self.predicted_dir)?;
        ensure_directory(&self.non_predicted_dir)?;
        Ok(())
    }

    pub fn partition(&self, disposition: Disposition) -> &Path {
        match disposition {
            Disposition::Predicted => &self.predicted_dir,
            Disposition::NonPredicted => &self.non_predicted_dir,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TriageSummary {
    pub manifest: DetectionsManifest,
    pub predicted: usize,
    pub non_predicted: usize,
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum TriageOutcome {
    Organized(TriageSummary),
    NoPredictions,
}

impl TriageOutcome {
    pub fn summary(&self) -> Option<&TriageSummary> {
        match self {
            Self::Organized(summary) => Some(summary),
            Self::NoPredictions => None,
        }
    }
}

pub fn resolve_rendered_file(renderer_dir: &Path, image_name: &str) -> Option<PathBuf> {
    let base = renderer_dir.join(image_name);
    RENDERED_EXTENSIONS
        .iter()
        .map(|extension| base.with_extension(extension))
        .find(|candidate| candidate.is_file())
}

/// Images that cannot be found or moved are logged and left out; only
/// failing to create the layout or write the manifest is an error.
pub fn triage(
    results: &[InferenceResult],
    layout: &OutputLayout,
    renderer_dir: &Path,
) -> Result<TriageOutcome> {
    layout.ensure()?;

    if results.is_empty() || !renderer_dir.is_dir() {
        error!(
            renderer_dir = %renderer_dir.display(),
            results = results.len(),
            "no prediction folder found"
        );
        write_json_pretty(&layout.manifest_path, &DetectionsManifest::new())?;
        return Ok(TriageOutcome::NoPredictions);
    }

    let mut summary = TriageSummary::default();

    for result in results {
        let Some(image_name) = result
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
        else {
            warn!(path = %result.path.display(), "inference result has no file name; skipping");
            summary.unresolved.push(result.path.display().to_string());
            continue;
        };

        let Some(rendered) = resolve_rendered_file(renderer_dir, &image_name) else {
            warn!(
                image = %image_name,
                renderer_dir = %renderer_dir.display(),
                "rendered image not found under any known extension; skipping"
            );
            summary.unresolved.push(image_name);
            continue;
        };

        let disposition = Disposition::of(result);
        if let Err(err) = relocate(&rendered, layout, disposition) {
            warn!(
                image = %image_name,
                error = %format!("{err:#}"),
                "failed to relocate rendered image; skipping"
            );
            summary.unresolved.push(image_name);
            continue;
        }

        match disposition {
            Disposition::Predicted => {
                summary.predicted += 1;
                summary.manifest.push(DetectionRecord {
                    image_name,
                    detections: result.detections.clone(),
                });
            }
            Disposition::NonPredicted => summary.non_predicted += 1,
        }
    }

    write_json_pretty(&layout.manifest_path, &summary.manifest)?;

    if let Err(err) = fs::remove_dir_all(renderer_dir) {
        warn!(
            renderer_dir = %renderer_dir.display(),
            error = %err,
            "failed to clean up renderer output"
        );
    } else {
        debug!(renderer_dir = %renderer_dir.display(), "removed renderer output");
    }

    info!(
        output_dir = %layout.output_dir.display(),
        predicted = summary.predicted,
        non_predicted = summary.non_predicted,
        unresolved = summary.unresolved.len(),
        manifest = %layout.manifest_path.display(),
        "predictions organized"
    );

    Ok(TriageOutcome::Organized(summary))
}

fn relocate(rendered: &Path, layout: &OutputLayout, disposition: Disposition) -> Result<PathBuf> {
    let file_name = rendered
        .file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_default();

    // A same-named image left in the other partition by an earlier run with
    // this layout would break partition exclusivity.
    let stale = layout.partition(disposition.opposite()).join(&file_name);
    if stale.is_file() {
        fs::remove_file(&stale)?;
        debug!(path = %stale.display(), "removed stale image from opposite partition");
    }

    let destination = layout.partition(disposition).join(&file_name);
    move_file(rendered, &destination)?;
    Ok(destination)
}
