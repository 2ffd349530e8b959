use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::model::PipelineKind;
use crate::util::short_prefix;

const TAG_ID_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub target: PathBuf,
    pub run_id: String,
    pub message: String,
    pub tag: String,
}

impl SnapshotRequest {
    pub fn new(kind: PipelineKind, run_id: &str, target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            run_id: run_id.to_string(),
            message: kind.commit_message(run_id),
            tag: version_tag(kind.as_str(), run_id),
        }
    }
}

pub trait SnapshotCommitter {
    fn commit_and_tag(&self, request: &SnapshotRequest) -> Result<()>;
}

pub fn version_tag(prefix: &str, run_id: &str) -> String {
    format!("{prefix}_{}", short_prefix(run_id, TAG_ID_LEN))
}

#[derive(Debug, Clone)]
pub struct DvcGitCommitter {
    workdir: PathBuf,
}

impl DvcGitCommitter {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn run_step(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("failed to execute {program} {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{program} {} returned non-zero exit status {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            );
        }

        Ok(())
    }
}

impl SnapshotCommitter for DvcGitCommitter {
    fn commit_and_tag(&self, request: &SnapshotRequest) -> Result<()> {
        let target = request.target.to_string_lossy().into_owned();
        let pointer = format!("{target}.dvc");

        self.run_step("dvc", &["add", &target])?;
        self.run_step("git", &["add", &pointer])?;
        self.run_step("git", &["commit", "-m", &request.message])?;
        self.run_step("git", &["tag", &request.tag])?;

        Ok(())
    }
}

/// Runs the committer and swallows any failure: the run is already recorded
/// in the tracking store by the time this is called.
pub fn snapshot_best_effort(
    committer: &dyn SnapshotCommitter,
    request: &SnapshotRequest,
) -> Option<String> {
    match committer.commit_and_tag(request) {
        Ok(()) => {
            info!(
                tag = %request.tag,
                target = %request.target.display(),
                "snapshot committed and tagged"
            );
            Some(request.tag.clone())
        }
        Err(err) => {
            warn!(
                run_id = %request.run_id,
                target = %request.target.display(),
                error = %format!("{err:#}"),
                "snapshot commit/tag failed; continuing"
            );
            None
        }
    }
}
