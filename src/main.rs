use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;

mod cli;

use agentloop::backend::{Backend, BackendFactory, DefaultBackendFactory};
use agentloop::config::ExecutionConfig;
use agentloop::domain::{
    BackendKind, ExecutionRequest, ExecutionResult, IterationLimit, ProgressPayload,
};
use agentloop::engine::ExecutionEngine;
use agentloop::id::generate_session_id;
use agentloop::session::{JsonlSessionRecorder, NullSessionRecorder, SessionRecorder};
use cli::Cli;
use cli::commands::Commands;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentloop")
        .join("logs");

    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("agentloop.log");

    // Setup env_logger with file output
    let target = Box::new(
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn parse_backend(name: &str) -> Result<BackendKind> {
    name.parse::<BackendKind>().map_err(|err| eyre::eyre!(err))
}

fn session_recorder() -> Arc<dyn SessionRecorder> {
    let session_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentloop")
        .join("sessions")
        .join(generate_session_id());

    match JsonlSessionRecorder::new(&session_dir) {
        Ok(recorder) => Arc::new(recorder),
        Err(err) => {
            log::warn!("session recording disabled: {}", err);
            Arc::new(NullSessionRecorder)
        }
    }
}

fn print_summary(result: &ExecutionResult) {
    let status = format!("{:?}", result.status).to_lowercase();
    let status = if result.is_success() {
        status.green()
    } else {
        status.red()
    };

    println!();
    println!("{} {}", "Status:".bold(), status);
    println!(
        "{} {} total, {} ok, {} failed",
        "Iterations:".bold(),
        result.statistics.total_iterations,
        result.statistics.successful_iterations,
        result.statistics.failed_iterations
    );
    println!(
        "{} {:.0}ms avg, {} tool calls",
        "Timing:".bold(),
        result.statistics.average_iteration_ms,
        result.statistics.total_tool_calls
    );
    if result.statistics.rate_limit_encounters > 0 {
        println!(
            "{} {} encounters, {}ms waited",
            "Rate limits:".bold(),
            result.statistics.rate_limit_encounters,
            result.statistics.rate_limit_wait_ms
        );
    }
    for (category, count) in &result.statistics.errors_by_category {
        println!("{} {} x{}", "Errors:".bold(), category, count);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    verbose: bool,
    mut config: ExecutionConfig,
    instruction: String,
    backend: String,
    iterations: Option<u32>,
    unlimited: bool,
    model: Option<String>,
    subagent: Option<String>,
    working_dir: Option<PathBuf>,
    completion_marker: Option<String>,
) -> Result<()> {
    if let Some(marker) = completion_marker {
        config.completion_marker = Some(marker);
    }

    let backend = parse_backend(&backend)?;
    let limit = if unlimited {
        IterationLimit::Unlimited
    } else {
        IterationLimit::Bounded(iterations.unwrap_or(10))
    };

    let mut request = ExecutionRequest::new(instruction)
        .with_backend(backend)
        .with_limit(limit);
    if let Some(model) = model {
        request = request.with_model(model);
    }
    if let Some(subagent) = subagent {
        request = request.with_subagent(subagent);
    }
    if let Some(dir) = working_dir {
        request = request.with_working_dir(dir);
    }

    info!("Running {} on {} backend (limit {})", request.id, backend, limit);

    let engine = ExecutionEngine::new(config, session_recorder());

    // Ctrl-C cancels at the next iteration boundary.
    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Cancelling after current iteration...".yellow());
            cancel.cancel();
        }
    });

    let mut progress = engine.on_progress();
    let printer = tokio::spawn(async move {
        while let Some(event) = progress.recv().await {
            match event.payload {
                ProgressPayload::Thinking { content } => println!("{}", content),
                ProgressPayload::IterationStart { iteration } => {
                    println!("{} iteration {}", "Starting".cyan(), iteration);
                }
                ProgressPayload::IterationComplete {
                    iteration,
                    success,
                    duration_ms,
                } => {
                    let verdict = if success { "ok".green() } else { "failed".red() };
                    println!(
                        "{} iteration {} {} ({}ms)",
                        "Finished".cyan(),
                        iteration,
                        verdict,
                        duration_ms
                    );
                }
                ProgressPayload::ToolStart { tool } => {
                    if verbose {
                        println!("{} {}", "Tool".blue(), tool);
                    }
                }
                ProgressPayload::ToolResult { tool, success } => {
                    if verbose {
                        let verdict = if success { "ok" } else { "failed" };
                        println!("{} {} {}", "Tool".blue(), tool, verdict);
                    }
                }
                ProgressPayload::RateLimit { reset_at } => {
                    println!("{} reset_at={:?}", "Rate limited".yellow(), reset_at);
                }
                ProgressPayload::Error { content } => {
                    eprintln!("{} {}", "Error:".red(), content);
                }
                ProgressPayload::Info { content } => {
                    if verbose {
                        println!("{} {}", "Info".blue(), content);
                    }
                }
            }
        }
    });

    let result = engine.run(request).await?;

    // Dropping the engine closes the stream and lets the printer drain.
    drop(engine);
    let _ = printer.await;

    print_summary(&result);

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn check_backend(name: String, config: ExecutionConfig) -> Result<()> {
    let kind = parse_backend(&name)?;
    let factory = DefaultBackendFactory::new(config);
    let backend = factory.create(kind)?;

    if let Err(err) = backend.initialize().await {
        println!("{} {} backend: {}", "unavailable".red(), kind, err);
        std::process::exit(1);
    }

    let available = backend.is_available().await;
    if let Err(err) = backend.cleanup().await {
        log::warn!("cleanup after probe failed: {}", err);
    }

    if available {
        println!("{} {} backend is available", "ok".green(), kind);
        Ok(())
    } else {
        println!("{} {} backend failed its probe", "unavailable".red(), kind);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging()?;

    let config = ExecutionConfig::load(cli.config.as_ref())?;
    config.validate()?;

    match cli.command {
        Commands::Run {
            instruction,
            backend,
            iterations,
            unlimited,
            model,
            subagent,
            working_dir,
            completion_marker,
        } => {
            run_task(
                cli.verbose,
                config,
                instruction,
                backend,
                iterations,
                unlimited,
                model,
                subagent,
                working_dir,
                completion_marker,
            )
            .await
        }
        Commands::Check { backend } => check_backend(backend, config).await,
    }
}
