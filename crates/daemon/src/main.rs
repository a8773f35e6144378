// tetherd: standalone coordinator entry point.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tether_daemon::config::{CoordinatorConfig, LogFormat};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tetherd", about = "Connection-stability coordinator for a shared messaging session")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "TETHER_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the instance id.
    #[arg(long)]
    instance_id: Option<String>,

    /// SQLite database backing the durable store.
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Serve /healthz, /status and /restart on this address.
    #[arg(long, value_name = "ADDR")]
    status_addr: Option<SocketAddr>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

fn load_config(args: &Args) -> anyhow::Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::load_from(path)
            .with_context(|| format!("failed to load config from `{}`", path.display()))?,
        None => CoordinatorConfig::default(),
    }
    .apply_env();

    if let Some(instance_id) = &args.instance_id {
        config.instance_id = Some(instance_id.clone());
    }
    if let Some(database) = &args.database {
        config.database_path = database.clone();
    }
    if let Some(addr) = args.status_addr {
        config.status_listen_addr = Some(addr);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing(config: &CoordinatorConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config).context("failed to render config")?);
        return Ok(());
    }

    init_tracing(&config);
    info!("starting tether coordinator");
    let code = tether_daemon::runtime::run_standalone(config)
        .await
        .context("coordinator terminated unexpectedly")?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
