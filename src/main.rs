use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use finverify::{
    cli::{execute_command, Commands},
    config::{Config, LogFormat},
    AppContext,
};

/// Verified answers to financial questions.
#[derive(Parser, Debug)]
#[command(name = "finverify", version, about)]
struct Cli {
    /// Use template code generation, local analysts and synthetic data
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let loaded = if cli.offline {
        Config::from_env_offline()
    } else {
        Config::from_env()
    };
    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        offline = cli.offline,
        "finverify starting"
    );

    let ctx = Arc::new(AppContext::from_config(&config, cli.offline).await?);
    let result = execute_command(cli.command, ctx).await;

    println!("{}", result.output);
    if result.exit_code != 0 {
        std::process::exit(result.exit_code);
    }
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
