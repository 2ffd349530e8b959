use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::model::ModelArtifactRecord;
use crate::util::sha256_file;

const CHECKPOINT_STEM: &str = "best";
const DEFAULT_CHECKPOINT_EXTENSION: &str = "pt";

#[derive(Debug, Error)]
pub enum ArtifactCopyError {
    #[error("checkpoint not found at {0}")]
    MissingCheckpoint(PathBuf),
    #[error("failed to create model version directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy checkpoint {from} to {to}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to hash checkpoint {path}: {reason}")]
    Hash { path: PathBuf, reason: String },
    #[error("checkpoint copy {path} does not match its source")]
    DigestMismatch { path: PathBuf },
}

pub fn version_checkpoint(
    checkpoint: &Path,
    store: &Path,
    run_id: &str,
) -> Result<ModelArtifactRecord, ArtifactCopyError> {
    if !checkpoint.is_file() {
        return Err(ArtifactCopyError::MissingCheckpoint(
            checkpoint.to_path_buf(),
        ));
    }

    let version_dir = store.join(run_id);
    fs::create_dir_all(&version_dir).map_err(|source| ArtifactCopyError::CreateDir {
        path: version_dir.clone(),
        source,
    })?;

    let extension = checkpoint
        .extension()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_CHECKPOINT_EXTENSION);
    let destination = version_dir.join(format!("{CHECKPOINT_STEM}.{extension}"));

    let size_bytes =
        fs::copy(checkpoint, &destination).map_err(|source| ArtifactCopyError::Copy {
            from: checkpoint.to_path_buf(),
            to: destination.clone(),
            source,
        })?;

    let source_digest = digest(checkpoint)?;
    if digest(&destination)? != source_digest {
        return Err(ArtifactCopyError::DigestMismatch { path: destination });
    }

    info!(
        run_id,
        path = %destination.display(),
        sha256 = %source_digest,
        size_bytes,
        "versioned checkpoint"
    );

    Ok(ModelArtifactRecord {
        run_id: run_id.to_string(),
        checkpoint_path: destination,
        source_path: checkpoint.to_path_buf(),
        sha256: source_digest,
        size_bytes,
    })
}

fn digest(path: &Path) -> Result<String, ArtifactCopyError> {
    sha256_file(path).map_err(|err| ArtifactCopyError::Hash {
        path: path.to_path_buf(),
        reason: format!("{err:#}"),
    })
}
