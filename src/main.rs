mod cli;
mod console_reporter;
mod logging;

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use cli::{Cli, Commands, TriggerArgs};
use colored::*;
use console::style;
use console_reporter::{print_summary, CliReporter};
use dotenv::dotenv;
use sync_shutter::transport::SimulatedTransport;
use sync_shutter::{AppConfig, CaptureEngine};
use tracing::{error, info};

fn main() -> ExitCode {
    dotenv().ok();

    let args = Cli::parse();

    let config = match sync_shutter::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {}", "Error loading configuration:".red(), err);
            return ExitCode::FAILURE;
        }
    };

    let _guard = logging::init_logger(&config);

    match run(args, config) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli, mut config: AppConfig) -> Result<u8> {
    if args.parallel_open {
        config.parallel_open = true;
    }

    match args.command {
        Some(Commands::List) => run_list(config, args.simulate),
        Some(Commands::Identify) => run_identify(config, args.simulate),
        Some(Commands::Trigger(trigger_args)) => {
            run_trigger(config, args.simulate, &trigger_args)
        }
        Some(Commands::PrintConfig) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(0)
        }
        None => {
            let _ = Cli::command().print_long_help();
            Ok(0)
        }
    }
}

fn build_engine(config: AppConfig, simulate: Option<usize>) -> CaptureEngine<SimulatedTransport> {
    let transport = match simulate {
        Some(count) => {
            info!("Simulating {} camera(s)", count);
            SimulatedTransport::generated(count)
        }
        None => {
            info!(
                "Using {} configured simulated camera(s)",
                config.simulated_devices.len()
            );
            SimulatedTransport::new(config.simulated_devices.clone())
        }
    };
    CaptureEngine::new(config, Arc::new(transport))
}

fn run_list(config: AppConfig, simulate: Option<usize>) -> Result<u8> {
    let engine = build_engine(config, simulate);
    let devices = engine.discover()?;
    if devices.is_empty() {
        println!("{}", "No cameras detected.".red());
        return Ok(1);
    }
    for device in &devices {
        println!(
            "{:>3}  {:<32} {}",
            device.session_id(),
            device.name,
            device.address.cyan()
        );
    }
    Ok(0)
}

fn run_identify(config: AppConfig, simulate: Option<usize>) -> Result<u8> {
    let engine = build_engine(config, simulate);
    let reporter = CliReporter::new();
    let report = engine.identify(&reporter)?;
    print_summary(&report);

    let opened = report.count_reached(sync_shutter::report::Stage::Opened);
    Ok(if opened > 0 { 0 } else { 1 })
}

fn run_trigger(mut config: AppConfig, simulate: Option<usize>, args: &TriggerArgs) -> Result<u8> {
    args.apply(&mut config);
    let engine = build_engine(config, simulate);
    let reporter = CliReporter::new();

    let report = engine.run(
        |armed| {
            if args.yes {
                return true;
            }
            prompt_trigger(armed).unwrap_or_else(|err| {
                error!("Error reading confirmation: {}", err);
                false
            })
        },
        &reporter,
    )?;
    print_summary(&report);

    if let Some(path) = &args.report {
        report
            .write_csv(path)
            .with_context(|| format!("Error writing report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    Ok(report.exit_code())
}

/// Enter fires, `q` or `n` aborts. End of input aborts as well.
fn prompt_trigger(armed: usize) -> io::Result<bool> {
    let mut input = String::new();
    print!(
        "{} ",
        style(format!(
            "{} camera(s) ready. Press Enter to trigger, q to abort:",
            armed
        ))
        .bold()
    );
    io::stdout().flush()?;

    if io::stdin().read_line(&mut input)? == 0 {
        return Ok(false);
    }
    Ok(!matches!(
        input.trim().to_uppercase().as_str(),
        "Q" | "N" | "QUIT"
    ))
}
