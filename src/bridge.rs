use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{Device, PredictParams, TrainParams};
use crate::model::{InferenceResult, TrainOutcome};

pub trait Detector {
    fn predict(&self, params: &PredictParams) -> Result<Vec<InferenceResult>>;
}

pub trait Trainer {
    fn train(&self, params: &TrainParams) -> Result<TrainOutcome>;
}

#[derive(Debug, Clone)]
pub struct ModelBridge {
    program: PathBuf,
    workdir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct PredictionBatch {
    #[serde(default)]
    results: Vec<InferenceResult>,
}

impl ModelBridge {
    pub fn new(program: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            workdir: workdir.into(),
        }
    }

    fn invoke(&self, subcommand: &str, args: Vec<OsString>) -> Result<String> {
        info!(
            program = %self.program.display(),
            subcommand,
            "invoking model bridge"
        );

        let output = Command::new(&self.program)
            .arg(subcommand)
            .args(&args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| {
                format!(
                    "failed to execute model bridge {} {subcommand}",
                    self.program.display()
                )
            })?;

        if !output.status.success() {
            bail!(
                "model bridge {} {subcommand} returned non-zero exit status: {}",
                self.program.display(),
                output.status
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let payload = last_json_line(&stdout).with_context(|| {
            format!(
                "model bridge {} {subcommand} produced no JSON output",
                self.program.display()
            )
        })?;
        debug!(bytes = payload.len(), "model bridge payload received");

        Ok(payload.to_string())
    }
}

impl Detector for ModelBridge {
    fn predict(&self, params: &PredictParams) -> Result<Vec<InferenceResult>> {
        let mut args = vec![
            OsString::from("--model"),
            params.model_path.clone().into_os_string(),
            OsString::from("--source"),
            OsString::from(&params.source),
            OsString::from("--imgsz"),
            OsString::from(params.imgsz.to_string()),
            OsString::from("--conf"),
            OsString::from(params.conf_threshold.to_string()),
        ];
        push_device(&mut args, params.device.as_ref());

        let payload = self.invoke("predict", args)?;
        let batch: PredictionBatch =
            serde_json::from_str(&payload).context("failed to parse prediction output")?;

        let results = batch
            .results
            .into_iter()
            .map(|result| self.anchor_result(result))
            .collect::<Vec<_>>();
        info!(results = results.len(), "model bridge prediction completed");

        Ok(results)
    }
}

impl Trainer for ModelBridge {
    fn train(&self, params: &TrainParams) -> Result<TrainOutcome> {
        let mut args = vec![
            OsString::from("--model"),
            params.model_path.clone().into_os_string(),
            OsString::from("--data"),
            params.data_yaml.clone().into_os_string(),
            OsString::from("--epochs"),
            OsString::from(params.epochs.to_string()),
            OsString::from("--imgsz"),
            OsString::from(params.imgsz.to_string()),
        ];
        push_device(&mut args, params.device.as_ref());

        let payload = self.invoke("train", args)?;
        let mut outcome: TrainOutcome =
            serde_json::from_str(&payload).context("failed to parse training output")?;
        outcome.save_dir = self.anchor(&outcome.save_dir);
        info!(
            save_dir = %outcome.save_dir.display(),
            metrics = outcome.metrics.len(),
            "model bridge training completed"
        );

        Ok(outcome)
    }
}

impl ModelBridge {
    // Relative paths reported by the bridge are relative to its working directory.
    fn anchor(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    fn anchor_result(&self, mut result: InferenceResult) -> InferenceResult {
        result.save_dir = self.anchor(&result.save_dir);
        result
    }
}

fn push_device(args: &mut Vec<OsString>, device: Option<&Device>) {
    if let Some(device) = device {
        args.push(OsString::from("--device"));
        args.push(OsString::from(device.to_string()));
    }
}

fn last_json_line(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .filter(|line| line.starts_with('{'))
}
