use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vmgate_server::credentials::Credentials;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "vmgated",
    about = "Remote VM control daemon",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Print a freshly generated API key and HMAC secret
    Keygen,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "VMGATE_PORT", default_value = "8000")]
    port: u16,
    /// Host to bind
    #[arg(long, env = "VMGATE_HOST", default_value = "0.0.0.0")]
    host: String,
    /// Shared API key expected in x-api-key
    #[arg(long, env = "API_KEY", hide_env_values = true, default_value = "")]
    api_key: String,
    /// Shared secret for x-signature
    #[arg(long, env = "HMAC_SECRET", hide_env_values = true, default_value = "")]
    hmac_secret: String,
    /// Comma-separated addresses or CIDR ranges allowed to connect (empty = any)
    #[arg(long, env = "ALLOW_IP", default_value = "")]
    allow_ip: String,
    /// Directory for audit.log and app.log
    #[arg(long, env = "VMGATE_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,
    /// Maximum run time of one VM tool invocation
    #[arg(long, env = "VMGATE_COMMAND_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    command_timeout: Duration,
    /// Accepted clock skew of x-timestamp, in either direction
    #[arg(long, env = "VMGATE_REPLAY_WINDOW", default_value = "300s", value_parser = humantime::parse_duration)]
    replay_window: Duration,
    /// Take the caller address from X-Forwarded-For (only behind a trusted proxy)
    #[arg(long, env = "VMGATE_TRUST_FORWARDED_FOR")]
    trust_forwarded_for: bool,
    /// PowerShell executable used to drive Hyper-V
    #[arg(long, env = "VMGATE_POWERSHELL", default_value = "powershell")]
    powershell: String,
    /// Log level: error, warn, info, debug, verbose
    #[arg(long, env = "VMGATE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let level = match &cli.command {
        Commands::Serve(args) if args.log_level.eq_ignore_ascii_case("verbose") => "debug".to_owned(),
        Commands::Serve(args) => args.log_level.clone(),
        Commands::Keygen => "warn".to_owned(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&level))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Keygen => cmd_keygen(),
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let credentials = Credentials::from_config(&args.api_key, &args.hmac_secret, &args.allow_ip)
        .context("invalid configuration")?;

    let cfg = vmgate_server::ServerConfig {
        host: args.host,
        port: args.port,
        log_dir: args.log_dir,
        command_timeout: args.command_timeout,
        replay_window: args.replay_window,
        trust_forwarded_for: args.trust_forwarded_for,
        powershell: args.powershell,
        ..vmgate_server::ServerConfig::new(credentials)
    };

    vmgate_server::run(cfg).await
}

fn cmd_keygen() -> Result<()> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let api_key: [u8; 32] = rng.gen();
    let secret: [u8; 32] = rng.gen();
    println!("API_KEY={}", hex::encode(api_key));
    println!("HMAC_SECRET={}", hex::encode(secret));
    Ok(())
}
