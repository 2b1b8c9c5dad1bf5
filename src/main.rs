use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use commands::rewards;
use commands::utils::init_logging;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.config;
    match args.command {
        Commands::Init {
            output,
            device_id,
            force,
        } => rewards::init(output.or(config), device_id, force),
        Commands::AppId { token } => rewards::app_id(config.as_deref(), &token),
        command => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_service_command(command, config))
        }
    }
}

async fn run_service_command(command: Commands, config: Option<std::path::PathBuf>) -> Result<()> {
    let service = rewards::open_service(config.as_deref()).await?;

    match command {
        Commands::Balance { child } => rewards::balance(&service, &child),
        Commands::History { child, limit } => rewards::history(&service, &child, limit),
        Commands::Adjust {
            child,
            points,
            reason,
            app,
        } => rewards::adjust(&service, &child, points, &reason, app.as_deref()).await,
        Commands::Redeem { child, points, app } => {
            rewards::redeem(&service, &child, points, app.as_deref()).await
        }
        Commands::Status { child } => rewards::status(&service, child.as_deref()),
        Commands::Cancel { child } => rewards::cancel(&service, &child).await,
        Commands::Audit { limit } => rewards::audit(&service, limit),
        Commands::Classify {
            app,
            category,
            name,
        } => rewards::classify(&service, &app, category.into(), name).await,
        Commands::Run => rewards::run(&service).await,
        Commands::Init { .. } | Commands::AppId { .. } => Ok(()),
    }
}
