//! Herald - PA announcement arbiter
//!
//! Runs the lock arbiter with its liveness and schedule loops, and serves it
//! to dashboards and consoles over TCP until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use herald_core::{Arbiter, HeraldConfig};
use herald_net::Server;

/// Herald daemon
#[derive(Parser, Debug)]
#[command(name = "heraldd")]
#[command(about = "PA announcement lock and priority scheduler")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address, overriding the configuration
    #[arg(long)]
    bind: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    /// Load the configuration file and apply command line overrides
    fn load_config(&self) -> Result<HeraldConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => HeraldConfig::default_path().context("No configuration directory")?,
        };

        let mut config = HeraldConfig::load_or_default(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?;

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.load_config()?;

    if args.print_config {
        println!("{}", config.to_toml_string()?);
        return Ok(());
    }

    tracing::info!(zones = config.zones.names.len(), "Starting Herald");

    let arbiter = Arbiter::new(&config).context("Failed to start arbiter")?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let loops = arbiter.spawn_loops(shutdown_tx.subscribe());

    let server = Server::start(&config.server, arbiter.clone())
        .await
        .with_context(|| format!("Failed to listen on {}:{}", config.server.bind, config.server.port))?;
    tracing::info!(addr = %server.addr(), "Listening");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    server.shutdown();
    let _ = shutdown_tx.send(());
    let _ = loops.await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["heraldd"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_overrides_apply() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9000\n").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = args(&["--config", &path]).load_config().unwrap();
        assert_eq!(config.server.port, 9000);

        let config = args(&["--config", &path, "--port", "9100", "--bind", "127.0.0.1"])
            .load_config()
            .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind, "127.0.0.1");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.toml");
        let config = args(&["--config", path.to_str().unwrap()])
            .load_config()
            .unwrap();
        assert_eq!(config.zones.names.len(), 4);
    }

    #[test]
    fn test_invalid_file_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[zones]\nnames = []\n").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert!(args(&["--config", &path]).load_config().is_err());
    }
}
