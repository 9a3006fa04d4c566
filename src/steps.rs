mod bash;
mod gcode;

use anyhow::Result;

use crate::config::{EstimatorConfig, Step};
use crate::controller::Controller;
use crate::dispatcher::Dispatcher;

use bash::execute_bash_step;
use gcode::execute_plot_step;

impl Step {
    /// Runs this step. `live` carries the controller/dispatcher pair when
    /// connected to a real device; offline runs pass `None` and plot steps
    /// fall back to estimating instead of streaming.
    pub fn execute(
        &self,
        timestamp: &str,
        live: Option<(&Controller, &Dispatcher)>,
        estimator: &EstimatorConfig,
    ) -> Result<()> {
        match self {
            Step::Plot(step) => execute_plot_step(step, timestamp, live, estimator),
            Step::Bash(step) => execute_bash_step(step, timestamp),
        }
    }
}
