mod tracing_setup;

use std::net::SocketAddr;

use anyhow::{Context as AnyhowContext, Result};
use clap::Parser;
use tracing::{info, warn};

use flowbench::{
    adapters::inbound::{
        cli::{CliAdapter, help_command},
        server::{ServeOptions, ServerAdapter},
    },
    bootstrap::Engine,
    cli::{Cli, Commands, ServeArgs},
    config::EngineConfig,
    paths,
};
use tracing_setup::JsonLogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_file = matches!(cli.command, Commands::Serve(_)).then_some("serve");
    let json_format = if cli.verbose {
        JsonLogFormat::Pretty
    } else {
        JsonLogFormat::Compact
    };
    let _guard = tracing_setup::init(cli.verbose, cli.log_json, json_format, log_file);

    match cli.command {
        Commands::Help(args) => help_command(args),
        Commands::Serve(args) => {
            let config = EngineConfig::load_or_default(&cli.config)?;
            serve_command(config, args).await
        }
        command => {
            let config = EngineConfig::load_or_default(&cli.config)?;
            let engine = Engine::build(&config, paths::data_dir())?;
            let adapter = CliAdapter::new(engine.service.clone());
            let outcome = adapter.execute(command).await;
            engine.shutdown().await;
            outcome
        }
    }
}

async fn serve_command(config: EngineConfig, args: ServeArgs) -> Result<()> {
    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address {bind}"))?;

    let mut engine = Engine::build(&config, paths::data_dir())?;
    if args.scheduler || config.scheduler.enabled {
        engine.start_scheduler();
    }
    let options = ServeOptions {
        default_limit: config.server.default_page_size,
        ..ServeOptions::default()
    };
    info!("Serving flow API on http://{addr}");
    let served = ServerAdapter::new(engine.service.clone(), options)
        .run(addr, shutdown_signal())
        .await;
    engine.shutdown().await;
    served
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested, draining in-flight jobs"),
        Err(err) => {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
