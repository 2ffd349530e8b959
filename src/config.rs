use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read parameter file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse parameter file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid parameter {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrainParams {
    pub model_path: PathBuf,
    pub data_yaml: PathBuf,
    pub epochs: u32,
    pub imgsz: u32,
    #[serde(default)]
    pub device: Option<Device>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PredictParams {
    pub model_path: PathBuf,
    pub conf_threshold: f64,
    pub imgsz: u32,
    pub source: String,
    #[serde(default)]
    pub device: Option<Device>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Device {
    Index(u32),
    Name(String),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParameterSet {
    pub train: TrainParams,
    pub predict: PredictParams,
}

impl ParameterSet {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    pub fn parse(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let params: ParameterSet =
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_path("train.model_path", &self.train.model_path)?;
        require_path("train.data_yaml", &self.train.data_yaml)?;
        require_positive("train.epochs", self.train.epochs)?;
        require_positive("train.imgsz", self.train.imgsz)?;

        require_path("predict.model_path", &self.predict.model_path)?;
        require_positive("predict.imgsz", self.predict.imgsz)?;
        if self.predict.source.trim().is_empty() {
            return Err(invalid("predict.source", "must not be empty"));
        }
        let threshold = self.predict.conf_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "predict.conf_threshold",
                format!("must be within [0, 1], got {threshold}"),
            ));
        }

        Ok(())
    }
}

impl TrainParams {
    pub fn param_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            pair("model_path", self.model_path.display()),
            pair("data_yaml", self.data_yaml.display()),
            pair("epochs", self.epochs),
            pair("imgsz", self.imgsz),
        ];
        if let Some(device) = &self.device {
            pairs.push(pair("device", device));
        }
        pairs
    }
}

impl PredictParams {
    pub fn param_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            pair("model_path", self.model_path.display()),
            pair("conf_threshold", self.conf_threshold),
            pair("imgsz", self.imgsz),
            pair("source", &self.source),
        ];
        if let Some(device) = &self.device {
            pairs.push(pair("device", device));
        }
        pairs
    }

    pub fn model_name(&self) -> String {
        self.model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string())
    }
}

fn pair(key: &str, value: impl std::fmt::Display) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn require_path(key: &str, value: &Path) -> Result<(), ConfigError> {
    if value.as_os_str().is_empty() {
        return Err(invalid(key, "must not be empty"));
    }
    Ok(())
}

fn require_positive(key: &str, value: u32) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(key, "must be greater than zero"));
    }
    Ok(())
}
