use std::collections::BTreeMap;

use anyhow::Result;
use tracing::info;

use crate::artifacts::version_checkpoint;
use crate::bridge::{ModelBridge, Trainer};
use crate::cli::TrainArgs;
use crate::commands::{MODEL_STORE_DIRNAME, PipelineEnv, Workspace};
use crate::config::{ParameterSet, TrainParams};
use crate::model::{ModelArtifactRecord, PipelineKind};
use crate::snapshot::{DvcGitCommitter, SnapshotCommitter};
use crate::tracking::{RunInfo, TrackingStore};
use crate::util::run_name_now;

#[derive(Debug)]
pub struct TrainReport {
    pub run: RunInfo,
    pub artifact: ModelArtifactRecord,
    pub metrics: BTreeMap<String, f64>,
    pub version_tag: Option<String>,
}

pub fn run(args: TrainArgs) -> Result<()> {
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

    let report = execute(&params.train, &bridge, &env)?;

    info!(
        run_id = %report.run.run_id,
        checkpoint = %report.artifact.checkpoint_path.display(),
        source = %report.artifact.source_path.display(),
        size_bytes = report.artifact.size_bytes,
        metrics = report.metrics.len(),
        version_tag = %report.version_tag.as_deref().unwrap_or("-"),
        "training run completed"
    );

    Ok(())
}

pub fn execute(
    params: &TrainParams,
    trainer: &dyn Trainer,
    env: &PipelineEnv<'_>,
) -> Result<TrainReport> {
    let kind = PipelineKind::Train;
    let run_name = run_name_now(kind);
    let models_dir = env.workspace.models_dir();
    let experiment = kind.experiment_name();

    let ((artifact, metrics), run) = env.store.scoped_run(experiment, &run_name, |run| {
        run.log_params(&params.param_pairs())?;

        let outcome = trainer.train(params)?;
        let artifact = version_checkpoint(&outcome.best_checkpoint(), &models_dir, run.run_id())?;

        run.log_metrics(&outcome.metrics)?;
        run.log_artifact(&artifact.checkpoint_path)?;
        run.set_tag("checkpoint_sha256", &artifact.sha256)?;
        run.set_tag("run_name", &run_name)?;

        info!(
            path = %artifact.checkpoint_path.display(),
            run_id = %run.run_id(),
            "model saved"
        );

        Ok((artifact, outcome.metrics))
    })?;

    let version_tag = env.finalize_snapshot(kind, &run.run_id, MODEL_STORE_DIRNAME);

    Ok(TrainReport {
        run,
        artifact,
        metrics,
        version_tag,
    })
}
