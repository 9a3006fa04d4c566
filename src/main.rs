mod config;
mod controller;
mod dispatcher;
mod estimator;
mod probe;
mod serial;
mod steps;

use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use log::{error, info, warn};
use simplelog::{CombinedLogger, Config as LogConfig, LevelFilter, TermLogger, WriteLogger};

use config::JobConfig;
use controller::{Controller, ControllerHandle};
use dispatcher::Dispatcher;
use probe::ProbeError;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match run(&args) {
        Ok(()) => process::exit(0),
        Err(err) => {
            error!("{:#}", err);

            // §6: 0 success, 1 no device found, 2 protocol/timeout failure.
            let code = if err.downcast_ref::<ProbeError>().is_some() {
                1
            } else {
                2
            };
            process::exit(code);
        }
    }
}

fn run(args: &[String]) -> Result<()> {
    let mut config_path = None;
    let mut connect = false;
    let mut send_command = None;

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--connect" => connect = true,
            "--send-command" => {
                send_command = Some(
                    rest.next()
                        .context("--send-command requires a command argument")?
                        .clone(),
                );
            }
            other if config_path.is_none() => config_path = Some(other.to_string()),
            other => bail!("unrecognized argument '{}'", other),
        }
    }

    let config_path = config_path
        .context("usage: plotter-ctrl <config.toml> [--connect] [--send-command <line>]")?;
    let config = JobConfig::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path))?;

    install_logging(&config.logging)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            warn!("Received interrupt signal; stopping after the current step");
            running.store(false, Ordering::SeqCst);
        })
        .context("Failed to install interrupt handler")?;
    }

    if let Some(command) = send_command {
        let controller = open_controller(&config)?;
        let response = controller.query(&command)?;
        println!("{}", response);
        return Ok(());
    }

    let timestamp = chrono::Local::now().format("%Y%m%dT%H%M%S").to_string();

    if connect {
        let controller = Arc::new(open_controller(&config)?);
        let mut dispatcher = Dispatcher::with_config(
            controller.clone() as Arc<dyn ControllerHandle>,
            std::time::Duration::from_millis(config.dispatch.idle_poll_ms),
            std::time::Duration::from_millis(config.dispatch.buffer_poll_ms),
            config.dispatch.nice_size_normal,
            config.dispatch.nice_size_barrier,
        );
        dispatcher.start();

        for step in &config.jobs {
            if !running.load(Ordering::SeqCst) {
                warn!("Interrupted; skipping remaining steps");
                break;
            }

            step.execute(
                &timestamp,
                Some((controller.as_ref(), &dispatcher)),
                &config.estimator,
            )?;
        }

        dispatcher.stop_and_join();
    } else {
        info!("No --connect flag given; running plot steps through the offline estimator");

        for step in &config.jobs {
            if !running.load(Ordering::SeqCst) {
                warn!("Interrupted; skipping remaining steps");
                break;
            }

            step.execute(&timestamp, None, &config.estimator)?;
        }
    }

    Ok(())
}

fn open_controller(job_config: &JobConfig) -> Result<Controller> {
    let config::ConnectionConfig::Serial(serial_config) = &job_config.connection;

    let controller = probe::probe_and_open_preferring(&serial_config.port)?
        .with_timeout_seconds((serial_config.timeout_ms / 1000).max(1));

    Ok(controller)
}

fn install_logging(logging_config: &config::LoggingConfig) -> Result<()> {
    let level = if logging_config.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let term_logger = TermLogger::new(
        level,
        LogConfig::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if logging_config.save {
        let file = std::fs::File::create(&logging_config.path)
            .with_context(|| format!("Failed to create log file '{}'", logging_config.path))?;
        CombinedLogger::init(vec![
            term_logger,
            WriteLogger::new(level, LogConfig::default(), file),
        ])
        .context("Failed to install logger")?;
    } else {
        CombinedLogger::init(vec![term_logger]).context("Failed to install logger")?;
    }

    Ok(())
}
