use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod cli;

use cli::{Cli, Commands};
use ralph::agent::CommandAgent;
use ralph::breaker::{CircuitBreakerState, CircuitState, IterationSignal};
use ralph::config::Config;
use ralph::monitor::Monitor;
use ralph::operator::{InitOutcome, Operator};
use ralph::runner::{LoopController, LoopControllerConfig, StopReason};
use ralph::state::{InitParams, StateLayout};

fn setup_logging(config: &Config) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ralph")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("ralph.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let level = config.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Returns the process exit code.
fn run_application(cli: &Cli, config: &Config) -> Result<i32> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let state_dir = cli.state_dir.clone().unwrap_or_else(|| config.state_dir.clone());
    let layout = StateLayout::new(state_dir);
    let operator = Operator::new(layout.clone(), config.breaker.thresholds());

    match &cli.command {
        Commands::Init { max_iterations, force } => handle_init_command(&operator, *max_iterations, *force, config),
        Commands::Status { json } => handle_status_command(&operator, *json),
        Commands::Reset => handle_reset_command(&operator),
        Commands::Check => handle_check_command(&operator),
        Commands::Record {
            iteration,
            files_changed,
            has_errors,
            output_length,
        } => handle_record_command(
            &operator,
            IterationSignal {
                loop_number: *iteration,
                files_changed: *files_changed,
                has_errors: *has_errors,
                output_length: *output_length,
            },
        ),
        Commands::Run => handle_run_command(&layout, config),
        Commands::Monitor { once, interval_ms } => handle_monitor_command(&layout, *once, *interval_ms, config),
    }
}

fn handle_init_command(operator: &Operator, max_iterations: Option<u64>, force: bool, config: &Config) -> Result<i32> {
    let params = InitParams {
        max_iterations: max_iterations.unwrap_or(config.loop_.max_iterations),
        max_calls_per_hour: config.rate_limit.max_calls_per_hour,
        session_expiry_hours: config.loop_.session_expiry_hours,
        project_dir: std::env::current_dir().ok(),
    };

    match operator.init(&params, force)? {
        InitOutcome::Created(doc) => {
            println!(
                "{} {} (session {})",
                "Initialized:".green(),
                operator.layout().state_file().display(),
                doc.session.session_id
            );
        }
        InitOutcome::AlreadyInitialized(_) => {
            println!(
                "{} {} (use --force to replace)",
                "Already initialized:".yellow(),
                operator.layout().state_file().display()
            );
        }
    }
    Ok(0)
}

fn print_breaker(state: &CircuitBreakerState) {
    let label = match state.state {
        CircuitState::Closed => state.state.to_string().green(),
        CircuitState::HalfOpen => state.state.to_string().yellow(),
        CircuitState::Open => state.state.to_string().red(),
    };
    println!("{} {}", "Circuit breaker:".cyan(), label);
    println!("  consecutive_no_progress: {}", state.consecutive_no_progress);
    println!("  consecutive_same_error: {}", state.consecutive_same_error);
    println!("  last_progress_loop: {}", state.last_progress_loop);
    println!("  total_opens: {}", state.total_opens);
    if let Some(reason) = &state.open_reason {
        println!("  reason: {}", reason);
    }
    if let Some(opened_at) = &state.opened_at {
        println!("  opened_at: {}", opened_at.to_rfc3339());
    }
}

fn handle_status_command(operator: &Operator, json: bool) -> Result<i32> {
    let state = operator.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_breaker(&state);
    }
    Ok(0)
}

fn handle_reset_command(operator: &Operator) -> Result<i32> {
    let state = operator.reset()?;
    println!("{} breaker is now {}", "Reset:".green(), state.state);
    Ok(0)
}

fn handle_check_command(operator: &Operator) -> Result<i32> {
    if operator.check()? {
        println!("{}", "Loop may execute".green());
        Ok(0)
    } else {
        println!("{}", "Circuit breaker is OPEN".red());
        Ok(1)
    }
}

fn handle_record_command(operator: &Operator, signal: IterationSignal) -> Result<i32> {
    info!("Recording iteration: {:?}", signal);
    let state = operator.record(&signal)?;
    print_breaker(&state);
    Ok(0)
}

fn handle_run_command(layout: &StateLayout, config: &Config) -> Result<i32> {
    if config.agent.command.trim().is_empty() {
        return Err(eyre!("agent.command must not be empty"));
    }
    let prompt = fs::read_to_string(&config.agent.prompt_file)
        .with_context(|| format!("Failed to read prompt file {}", config.agent.prompt_file.display()))?;

    let agent = Arc::new(CommandAgent::from_config(&config.agent));
    let mut controller = LoopController::new(agent, layout, prompt, LoopControllerConfig::from_config(config));
    if let Some(notes) = &config.agent.notes_file {
        controller = controller.with_notes(notes);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let reason = runtime.block_on(controller.run())?;

    let code = match &reason {
        StopReason::MaxIterations | StopReason::ExitCondition(_) => {
            println!("{} {}", "Stopped:".green(), reason.describe());
            0
        }
        StopReason::CircuitOpen(_) => {
            println!("{} {}", "Halted:".red(), reason.describe());
            println!("Inspect with `ralph status`, then `ralph reset` to retry");
            2
        }
        StopReason::AgentFailedToStart(_) => {
            println!("{} {}", "Failed:".red(), reason.describe());
            1
        }
    };
    Ok(code)
}

fn handle_monitor_command(layout: &StateLayout, once: bool, interval_ms: Option<u64>, config: &Config) -> Result<i32> {
    let interval = Duration::from_millis(interval_ms.unwrap_or(config.monitor.poll_interval_ms).max(1));
    let mut monitor = Monitor::new(layout.store(), interval);

    if once {
        match monitor.snapshot() {
            Some(snapshot) => println!("{}", snapshot.render()),
            None => println!("{}", "No readable state yet".yellow()),
        }
        return Ok(0);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(monitor.run(
        |snapshot| println!("{}\n", snapshot.render()),
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
    ));
    Ok(0)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(&config).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    let code = run_application(&cli, &config).context("Application failed")?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
