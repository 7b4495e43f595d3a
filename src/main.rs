use anyhow::Context;
use clap::Parser;
use panther::cli::{format_status, Cli, Commands, ControlClient};
use panther::config::AppConfig;
use panther::coordination::install_signal_handlers;
use panther::coordinator::{Engine, EngineOptions, ExitStatus};
use std::process::ExitCode;
use tracing::{error, info};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(ExitStatus::StartupFailure.code() as u8)
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    match &cli.command {
        Commands::Run => run_engine(&cli).await,
        Commands::CheckConfig => {
            init_logging_simple();
            let config = AppConfig::load_from(&cli.config)
                .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
            match config.validate() {
                Ok(()) => {
                    println!("Configuration OK ({} mode)", config.mode);
                    for (id, fraction) in config.strategies.enabled_fractions() {
                        println!("  {:<12} capital_fraction {}", id, fraction);
                    }
                    Ok(0)
                }
                Err(problems) => {
                    println!("Configuration invalid:");
                    for p in problems {
                        println!("  - {}", p);
                    }
                    Ok(1)
                }
            }
        }
        Commands::Status => {
            init_logging_simple();
            let status = control_client(&cli)?.status().await?;
            print!("{}", format_status(&status));
            Ok(0)
        }
        Commands::Stop => {
            init_logging_simple();
            control_client(&cli)?.stop().await?;
            println!("Stop requested; the engine is draining");
            Ok(0)
        }
        Commands::ResetKillSwitch { operator } => {
            init_logging_simple();
            let state = control_client(&cli)?.reset_kill_switch(operator).await?;
            println!(
                "Kill switch {} (reset by {})",
                if state.engaged { "still engaged" } else { "cleared" },
                state.last_reset_by.as_deref().unwrap_or(operator)
            );
            Ok(0)
        }
        Commands::Reload => {
            init_logging_simple();
            let strategies = control_client(&cli)?.reload().await?;
            println!("Configuration reloaded; allocations rewritten for {}", strategies.join(", "));
            Ok(0)
        }
        Commands::TriggerExit { strategy, symbol } => {
            init_logging_simple();
            let result = control_client(&cli)?.trigger_exit(strategy, symbol).await?;
            println!("{}: {}", strategy, result);
            Ok(0)
        }
    }
}

fn control_client(cli: &Cli) -> anyhow::Result<ControlClient> {
    let client = match &cli.control_url {
        Some(url) => ControlClient::new(url.clone())?,
        None => {
            let bind = AppConfig::load_from(&cli.config)
                .map(|c| c.control.bind)
                .unwrap_or_else(|_| "127.0.0.1:8089".to_string());
            ControlClient::for_bind(&bind)?
        }
    };
    Ok(client)
}

async fn run_engine(cli: &Cli) -> anyhow::Result<u8> {
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let _log_guard = init_logging(&config.logging);

    let options = EngineOptions {
        config_dir: Some(cli.config.clone()),
        ..Default::default()
    };
    let engine = match Engine::start(config, options).await {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Engine startup failed");
            return Ok(ExitStatus::StartupFailure.code() as u8);
        }
    };

    install_signal_handlers(engine.shutdown_handle());
    let status = engine.run().await;
    info!(exit_code = status.code(), "Exiting");
    Ok(status.code() as u8)
}
