use std::fs;

use anyhow::{Context, Result, bail};
use log::{error, info, warn};

use crate::config::{EstimatorConfig, PlotStepConfig, apply_template, expand_path};
use crate::controller::Controller;
use crate::dispatcher::Dispatcher;
use crate::estimator::estimate;

/// Runs a single `Step::Plot`. With a live controller/dispatcher, optionally
/// check-mode-validates the file and then streams it; without one (offline),
/// estimates duration and bounds instead and logs the prediction.
pub fn execute_plot_step(
    step: &PlotStepConfig,
    timestamp: &str,
    live: Option<(&Controller, &Dispatcher)>,
    estimator: &EstimatorConfig,
) -> Result<()> {
    let path = expand_path(&apply_template(&step.path, timestamp));
    let gcode = fs::read_to_string(&path)
        .with_context(|| format!("Failed to open G-code file '{}'", path))?;

    let Some((controller, dispatcher)) = live else {
        let (seconds, bounds) = estimate(&gcode, &estimator.limits, estimator.dwell_unit)
            .with_context(|| format!("Failed to estimate '{}'", path))?;
        info!(
            "Estimated '{}': {:.1}s, bounds {:.1}x{:.1}mm (x: {:.1}..{:.1}, y: {:.1}..{:.1})",
            path,
            seconds,
            bounds.width(),
            bounds.height(),
            bounds.min_x,
            bounds.max_x,
            bounds.min_y,
            bounds.max_y,
        );
        return Ok(());
    };

    if step.check {
        info!("Checking '{}' in GRBL check mode", path);
        controller.command("$C\n").context("Failed to enable check mode")?;

        let mut errors = Vec::new();
        for (number, line) in gcode.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('(') {
                continue;
            }

            let response = controller
                .query(trimmed)
                .with_context(|| format!("Failed to check line {}", number + 1))?;

            if response.contains("error:") {
                errors.push(format!("line {}: {}", number + 1, response));
            }
        }

        controller
            .command("$C\n")
            .context("Failed to disable check mode")?;

        if !errors.is_empty() {
            error!(
                "Checking '{}' complete: {} error(s):\n{}",
                path,
                errors.len(),
                errors.join("\n")
            );
            bail!("'{}' failed check mode with {} error(s)", path, errors.len());
        }

        info!("Checking '{}' complete: no errors found", path);
    }

    info!("Streaming '{}'", path);
    for line in gcode.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('(') {
            continue;
        }
        dispatcher.enqueue(format!("{}\n", trimmed));
    }

    dispatcher.wait_for_empty_queue();
    if let Err(err) = dispatcher.wait_for_empty_planner_buffer() {
        warn!("Failed to confirm planner buffer drained: {}", err);
    }

    if let Some(failure) = dispatcher.take_failure() {
        bail!("Dispatcher failed while streaming '{}': {}", path, failure);
    }

    info!("Streaming '{}' complete", path);
    Ok(())
}
