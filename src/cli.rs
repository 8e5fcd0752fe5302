//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// FocusHive token validation and trust gateway
#[derive(Parser, Debug)]
#[command(name = "hive-trust")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "HIVE_TRUST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "HIVE_TRUST_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "HIVE_TRUST_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "HIVE_TRUST_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "HIVE_TRUST_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate the configuration, then exit
    CheckConfig,

    /// Local token commands
    #[command(subcommand)]
    Token(TokenCommand),
}

/// Token subcommands
#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Issue a local token
    Issue {
        /// Username (`sub` claim)
        #[arg(required = true)]
        subject: String,

        /// User id (defaults to the username)
        #[arg(long)]
        user_id: Option<String>,

        /// Email
        #[arg(long)]
        email: Option<String>,

        /// Role, repeatable
        #[arg(short, long = "role")]
        roles: Vec<String>,

        /// Lifetime (e.g. "15m"); defaults to the configured access token TTL
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Option<Duration>,
    },

    /// Verify a token and print the resolved identity
    Verify {
        /// Raw token
        #[arg(required = true)]
        token: String,
    },
}
