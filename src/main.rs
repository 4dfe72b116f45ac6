//! Permuter CLI entry point

use anyhow::{Context, Result};
use permuter::config::cli::{Cli, ExecutionMode};
use permuter::config::{toml, validator, Config};
use permuter::coordinator::watchdog::{install_interrupt_handler, Heartbeat};
use permuter::coordinator::Coordinator;
use permuter::distributed::{self, NodeService, ServiceSettings};
use permuter::eval::script::{ScriptFactory, ServerTools};
use permuter::output::json::write_json_summary;
use permuter::worker::channel::CancelToken;
use permuter::RunError;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logging(cli.debug);

    let result = cli.validate().and_then(|()| match cli.mode {
        ExecutionMode::Service => run_service(&cli),
        ExecutionMode::Search if cli.vouch => run_vouch(&cli),
        ExecutionMode::Search => run_search(&cli),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if RunError::is_interrupt(&e) => {
            println!("\nExiting.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let Some(RunError::NoWorkers) = e.downcast_ref::<RunError>() {
                println!("{}", e);
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr; `RUST_LOG` overrides the default level
fn init_logging(debug: bool) {
    let default = if debug { "permuter=debug" } else { "permuter=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Search the configured target directories
fn run_search(cli: &Cli) -> Result<()> {
    let config = toml::load_config(cli)?;
    validator::validate_config(&config).context("Configuration validation failed")?;
    let config: Arc<Config> = Arc::new(config);

    let heartbeat = Heartbeat::new();
    let cancel = CancelToken::new();
    install_interrupt_handler(heartbeat.clone(), cancel.clone(), config.stuck_grace())?;

    let coordinator = Coordinator::new(Arc::clone(&config), Arc::new(ScriptFactory::new()), heartbeat, cancel);
    let summary = coordinator.run()?;

    if let Some(path) = &config.output.json_output {
        write_json_summary(path, &summary)?;
    }
    Ok(())
}

/// Serve evaluation requests until killed
fn run_service(cli: &Cli) -> Result<()> {
    let mut settings = ServiceSettings {
        listen_port: cli.listen_port,
        min_priority: cli.min_priority,
        allow_list: cli.allow_list.clone(),
        ..ServiceSettings::default()
    };
    if let Some(threads) = cli.threads {
        settings.threads = threads;
    }

    // Checked by Cli::validate
    let tools = ServerTools {
        mutator: cli.mutator.clone().context("--mutator is required")?,
        compiler: cli.compiler.clone().context("--compiler is required")?,
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(NodeService::new(settings, Arc::new(ScriptFactory::for_server(tools))).run())
}

/// Ask the first configured server to allow another client
fn run_vouch(cli: &Cli) -> Result<()> {
    let servers = cli.servers();
    let server = servers.first().context("--vouch needs a server (use --host-list)")?;
    let grantee = cli.directories[0].to_string_lossy();

    distributed::vouch(server, &grantee)?;
    println!("{} may now use {}", grantee, server);
    Ok(())
}
