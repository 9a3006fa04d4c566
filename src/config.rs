use anyhow::Result;
use config::{Config, File};
use serde::Deserialize;

use crate::estimator::{DwellUnit, KinematicLimits};

#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub estimator: EstimatorConfig,
    pub jobs: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Serial(SerialConfig),
}

#[derive(Debug, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub limits: KinematicLimits,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub save: bool,
    pub path: String,
}

/// The two buffer-nice-size thresholds and the poll intervals the
/// Dispatcher gates on, exposed as configuration rather than baked-in
/// constants.
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_nice_size_normal")]
    pub nice_size_normal: usize,
    #[serde(default = "default_nice_size_barrier")]
    pub nice_size_barrier: usize,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_buffer_poll_ms")]
    pub buffer_poll_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            nice_size_normal: default_nice_size_normal(),
            nice_size_barrier: default_nice_size_barrier(),
            idle_poll_ms: default_idle_poll_ms(),
            buffer_poll_ms: default_buffer_poll_ms(),
        }
    }
}

fn default_nice_size_normal() -> usize {
    crate::dispatcher::NICE_SIZE_NORMAL
}

fn default_nice_size_barrier() -> usize {
    crate::dispatcher::NICE_SIZE_BARRIER
}

fn default_idle_poll_ms() -> u64 {
    10
}

fn default_buffer_poll_ms() -> u64 {
    50
}

/// Limits and dwell-unit dialect used when estimating offline. May differ
/// from the live connection's mirrored `KinematicLimits` (e.g. estimating
/// against a different machine than the one currently plugged in).
#[derive(Debug, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default)]
    pub dwell_unit: DwellUnit,
    pub limits: KinematicLimits,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    Plot(PlotStepConfig),
    Bash(BashStepConfig),
}

#[derive(Debug, Deserialize)]
pub struct PlotStepConfig {
    pub path: String,
    #[serde(default = "default_check")]
    pub check: bool,
}

#[derive(Debug, Deserialize)]
pub struct BashStepConfig {
    pub command: String,
}

fn default_check() -> bool {
    true
}

impl JobConfig {
    pub fn load(config_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(config_path))
            .build()?;

        let config: JobConfig = settings.try_deserialize()?;

        Ok(config)
    }
}

pub fn expand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home_dir) = dirs::home_dir() {
            let home_str = home_dir.to_string_lossy();
            return path.replacen('~', &home_str, 1);
        }
    }
    path.to_string()
}

pub fn apply_template(text: &str, timestamp: &str) -> String {
    text.replace("{%t}", timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_config_defaults_match_dispatcher_constants() {
        let config = DispatchConfig::default();
        assert_eq!(config.nice_size_normal, crate::dispatcher::NICE_SIZE_NORMAL);
        assert_eq!(config.nice_size_barrier, crate::dispatcher::NICE_SIZE_BARRIER);
        assert_eq!(config.idle_poll_ms, 10);
        assert_eq!(config.buffer_poll_ms, 50);
    }

    #[test]
    fn apply_template_substitutes_timestamp_placeholder() {
        assert_eq!(apply_template("plot_{%t}.csv", "20260101T120000"), "plot_20260101T120000.csv");
    }

    #[test]
    fn expand_path_leaves_absolute_paths_untouched() {
        assert_eq!(expand_path("/tmp/plot.gcode"), "/tmp/plot.gcode");
    }
}
