use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "yolo-runs",
    version,
    about = "Tracked, versioned training and prediction runs for a YOLO detector"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Train(TrainArgs),
    Predict(PredictArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    #[arg(long, default_value = "params.yaml")]
    pub params: PathBuf,

    #[arg(long, default_value = "yolo-bridge")]
    pub model_bridge: PathBuf,

    #[arg(long, default_value_t = false)]
    pub skip_snapshot: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    #[command(flatten)]
    pub common: PipelineArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PredictArgs {
    #[command(flatten)]
    pub common: PipelineArgs,

    #[arg(long, default_value_t = false)]
    pub per_run_output: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    #[arg(long)]
    pub run_id: Option<String>,
}
