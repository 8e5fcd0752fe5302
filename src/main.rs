//! hive-trust - token validation and trust gateway for FocusHive services

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use hive_trust::{
    cli::{Cli, Command, TokenCommand},
    config::Config,
    gateway::{AuthGateway, Server},
    setup_tracing,
    token::Subject,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Token(ref cmd)) => run_token_command(&cli, cmd).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

fn run_check_config(cli: &Cli) -> ExitCode {
    match load_config(cli) {
        Ok(config) => {
            println!("Configuration OK");
            println!("  local issuer:  {}", config.local.issuer);
            if config.remote.enabled {
                println!(
                    "  remote issuer: {} ({:?})",
                    config.remote.issuer, config.remote.mode
                );
            }
            println!("  route rules:   {}", config.routes.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Configuration invalid: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_token_command(cli: &Cli, cmd: &TokenCommand) -> ExitCode {
    match token_command(cli, cmd).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn token_command(cli: &Cli, cmd: &TokenCommand) -> anyhow::Result<String> {
    let config = load_config(cli)?;
    let gateway = AuthGateway::from_config(&config).context("failed to build gateway")?;

    match cmd {
        TokenCommand::Issue {
            subject,
            user_id,
            email,
            roles,
            ttl,
        } => {
            let mut subject = Subject::new(subject.as_str());
            subject.user_id.clone_from(user_id);
            subject.email.clone_from(email);
            subject.roles.clone_from(roles);

            let issued = gateway.issue(&subject, *ttl).context("failed to issue token")?;
            Ok(serde_json::to_string_pretty(&issued)?)
        }
        TokenCommand::Verify { token } => {
            let verified = gateway
                .authenticate_token(token)
                .await
                .context("token rejected")?;
            Ok(serde_json::to_string_pretty(&verified.identity)?)
        }
    }
}

async fn run_server(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    if config.metrics.enabled {
        install_metrics_exporter(&config);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        remote = config.remote.enabled,
        "Starting hive-trust"
    );

    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

#[cfg(feature = "metrics")]
fn install_metrics_exporter(config: &Config) {
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(config.metrics.listen)
        .install()
    {
        Ok(()) => info!(listen = %config.metrics.listen, "Prometheus exporter listening"),
        Err(e) => error!(error = %e, "Failed to install Prometheus exporter"),
    }
}

#[cfg(not(feature = "metrics"))]
fn install_metrics_exporter(_config: &Config) {
    tracing::warn!("metrics.enabled is set but hive-trust was built without the `metrics` feature");
}
