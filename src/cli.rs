use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use sync_shutter::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "sync-shutter")]
#[command(about = "Trigger several cameras at the same moment", long_about = None)]
pub struct Cli {
    /// Drive N generated simulated cameras instead of the configured ones
    #[arg(long, global = true, value_name = "N")]
    pub simulate: Option<usize>,

    /// Open cameras concurrently
    #[arg(long, global = true)]
    pub parallel_open: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List detected cameras
    List,
    /// Open every camera, print its serial number and close it again
    Identify,
    /// Trigger all cameras at once, optionally downloading the images
    Trigger(TriggerArgs),
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Args)]
pub struct TriggerArgs {
    /// Download each image right after capture
    #[arg(long)]
    pub download: bool,

    /// Leave camera clocks untouched
    #[arg(long)]
    pub no_clock_sync: bool,

    /// Root directory for downloaded images
    #[arg(long, short, value_name = "DIR")]
    pub output: Option<PathBuf>,

    #[arg(long, value_name = "MS")]
    pub capture_timeout_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    pub retrieval_timeout_ms: Option<u64>,

    /// Fire without waiting for Enter
    #[arg(long, short)]
    pub yes: bool,

    /// Write a per-camera CSV summary
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

impl TriggerArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        if self.download {
            config.download_after_capture = true;
        }
        if self.no_clock_sync {
            config.sync_device_clock = false;
        }
        if let Some(output) = &self.output {
            config.download_root = output.to_string_lossy().into_owned();
        }
        if let Some(ms) = self.capture_timeout_ms {
            config.capture_timeout_ms = ms;
        }
        if let Some(ms) = self.retrieval_timeout_ms {
            config.retrieval_timeout_ms = ms;
        }
    }
}
