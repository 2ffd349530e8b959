use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use crate::bridge::{Detector, ModelBridge};
use crate::cli::PredictArgs;
use crate::commands::{PREDICT_DIRNAME, PipelineEnv, Workspace};
use crate::config::{ParameterSet, PredictParams};
use crate::model::PipelineKind;
use crate::snapshot::{DvcGitCommitter, SnapshotCommitter};
use crate::tracking::{RunInfo, TrackingStore};
use crate::util::{ensure_directory, run_name_now};

mod triage;
#[cfg(test)]
mod tests;

pub use triage::{OutputLayout, TriageOutcome, triage};

#[derive(Debug)]
pub struct PredictReport {
    pub run: RunInfo,
    pub layout: OutputLayout,
    pub outcome: TriageOutcome,
    pub version_tag: Option<String>,
}

pub fn run(args: PredictArgs) -> Result<()> {
    let workspace = Workspace::new(args.common.root.clone());
    let params = ParameterSet::load(&workspace.resolve(&args.common.params))?;

    let store = TrackingStore::open(&workspace.tracking_dir())?;
    let bridge = ModelBridge::new(&args.common.model_bridge, &workspace.root);
    let committer = DvcGitCommitter::new(&workspace.root);
    let env = PipelineEnv {
        workspace: &workspace,
        store: &store,
        committer: if args.common.skip_snapshot {
            None
        } else {
            Some(&committer as &dyn SnapshotCommitter)
        },
    };

    let report = execute(&params.predict, &bridge, &env, args.per_run_output)?;
    let (predicted, non_predicted, unresolved) = match report.outcome.summary() {
        Some(summary) => (
            summary.predicted,
            summary.non_predicted,
            summary.unresolved.len(),
        ),
        None => (0, 0, 0),
    };

    info!(
        run_id = %report.run.run_id,
        output_dir = %report.layout.output_dir.display(),
        manifest = %report.layout.manifest_path.display(),
        predicted,
        non_predicted,
        unresolved,
        version_tag = %report.version_tag.as_deref().unwrap_or("-"),
        "prediction run completed"
    );

    Ok(())
}

pub fn execute(
    params: &PredictParams,
    detector: &dyn Detector,
    env: &PipelineEnv<'_>,
    per_run_output: bool,
) -> Result<PredictReport> {
    let kind = PipelineKind::Predict;
    let predict_root = env.workspace.predict_dir();
    ensure_directory(&predict_root)?;

    let model_name = params.model_name();
    let run_name = run_name_now(kind);
    let experiment = kind.experiment_name();

    let ((layout, outcome), run) = env.store.scoped_run(experiment, &run_name, |run| {
        run.log_params(&params.param_pairs())?;

        let layout = OutputLayout::for_model(
            &predict_root,
            &model_name,
            params.conf_threshold,
            per_run_output.then(|| run.run_id()),
        );
        layout.ensure()?;

        let results = detector.predict(params)?;
        let renderer_dir = results
            .first()
            .map(|result| result.save_dir.clone())
            .unwrap_or_else(PathBuf::new);

        let outcome = triage(&results, &layout, &renderer_dir)?;
        let summary = outcome.summary().cloned().unwrap_or_default();

        run.log_metric("predicted_images", summary.predicted as f64)?;
        run.log_metric("non_predicted_images", summary.non_predicted as f64)?;
        run.log_metric("unresolved_images", summary.unresolved.len() as f64)?;
        run.log_artifact(&layout.manifest_path)?;
        run.log_artifact(&layout.predicted_dir)?;
        run.log_artifact(&layout.non_predicted_dir)?;
        run.set_tag("output_dir", &layout.output_dir.display().to_string())?;

        Ok((layout, outcome))
    })?;

    let version_tag = env.finalize_snapshot(kind, &run.run_id, PREDICT_DIRNAME);

    Ok(PredictReport {
        run,
        layout,
        outcome,
        version_tag,
    })
}
