// Staking Simulator - Entry point

use clap::Parser;
use epoch_staking::cli::config::SimConfig;
use epoch_staking::cli::runner::{demo_scenario, Scenario, Simulator, StepReport};
use epoch_staking::cli::{Cli, Commands};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.verbose {
        "debug"
    } else {
        &cli.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Demo(cmd) => {
            let config = load_config(&cmd.params)?;
            let scenario = demo_scenario(&config);
            run_scenario(config, &scenario, cmd.trace_state)?;
        }

        Commands::Run(cmd) => {
            let config = load_config(&cmd.params)?;
            let scenario = Scenario::load(&cmd.scenario)?;
            info!("Loaded scenario {} from {}", scenario.name, cmd.scenario.display());
            run_scenario(config, &scenario, cmd.trace_state)?;
        }

        Commands::Config(cmd) => {
            let config = load_config(&cmd.params)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(params: &epoch_staking::cli::ConfigArgs) -> anyhow::Result<SimConfig> {
    SimConfig::from_args(params).map_err(|e| {
        error!("Configuration error: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })
}

fn run_scenario(config: SimConfig, scenario: &Scenario, trace_state: bool) -> anyhow::Result<()> {
    let mut simulator = Simulator::new(config)?;
    let reports = simulator.run(scenario, trace_state).map_err(|e| {
        error!("Scenario {} aborted: {}", scenario.name, e);
        anyhow::anyhow!("Scenario aborted: {}", e)
    })?;

    for report in &reports {
        print_report(report)?;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&simulator.runtime().snapshot())?
    );
    Ok(())
}

fn print_report(report: &StepReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}
