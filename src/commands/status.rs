use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::Workspace;
use crate::tracking::TrackingStore;

pub fn run(args: StatusArgs) -> Result<()> {
    let workspace = Workspace::new(args.root);
    let tracking_dir = workspace.tracking_dir();

    info!(root = %workspace.root.display(), "status requested");

    if !tracking_dir.exists() {
        warn!(path = %tracking_dir.display(), "tracking store missing");
        return Ok(());
    }

    let store = TrackingStore::open(&tracking_dir)?;
    if let Some(run_id) = &args.run_id {
        return show_run(&store, run_id);
    }

    let runs = store.recent_runs(args.limit)?;
    if runs.is_empty() {
        warn!(path = %store.root().display(), "no runs recorded");
    }

    for run in runs {
        let tags = store.run_tags(&run.run_id)?;
        let version_tag = tags
            .iter()
            .find(|(key, _)| key == "version_tag")
            .map(|(_, value)| value.as_str())
            .unwrap_or_default();
        let metrics = store.run_metrics(&run.run_id)?;
        let artifacts = store.run_artifacts(&run.run_id)?;

        info!(
            run_id = %run.run_id,
            experiment = %run.experiment,
            run_name = %run.run_name,
            status = run.status.as_str(),
            started_at = %run.started_at,
            ended_at = %run.ended_at.unwrap_or_default(),
            version_tag = %version_tag,
            metrics = metrics.len(),
            artifacts = artifacts.len(),
            "tracked run"
        );
    }

    Ok(())
}

fn show_run(store: &TrackingStore, run_id: &str) -> Result<()> {
    let run = store
        .run_info(run_id)?
        .with_context(|| format!("run {run_id} not found in {}", store.root().display()))?;

    info!(
        run_id = %run.run_id,
        experiment = %run.experiment,
        run_name = %run.run_name,
        status = run.status.as_str(),
        started_at = %run.started_at,
        ended_at = %run.ended_at.clone().unwrap_or_default(),
        artifact_dir = %run.artifact_dir.display(),
        "run"
    );
    for (key, value) in store.run_params(run_id)? {
        info!(key = %key, value = %value, "param");
    }
    for (key, value) in store.run_metrics(run_id)? {
        info!(key = %key, value, "metric");
    }
    for (key, value) in store.run_tags(run_id)? {
        info!(key = %key, value = %value, "tag");
    }
    for artifact in store.run_artifacts(run_id)? {
        info!(path = %run.artifact_dir.join(&artifact).display(), "artifact");
    }

    Ok(())
}
