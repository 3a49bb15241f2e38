//! wschannel host (feature-gated).

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wschannel::{ChannelSpec, ErrorCategory, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "wschannel", version, about = "WebSocket channel server")]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Bind host
    #[arg(long = "host")]
    host: Option<String>,

    /// Bind port
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Create a default-kind channel (repeatable)
    #[arg(long = "channel", action = ArgAction::Append)]
    channels: Vec<String>,

    /// Accept any Origin header
    #[arg(long = "no-origin-check", action = ArgAction::SetTrue)]
    no_origin_check: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, wschannel::Error> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_toml_file(path)?,
            None => ServerConfig::default(),
        };
        config.apply_env_overrides()?;

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.no_origin_check {
            config.check_origin = false;
        }
        for name in self.channels {
            if !config.channels.iter().any(|spec| spec.name == name) {
                config.channels.push(ChannelSpec::new(name));
            }
        }
        Ok(config)
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli) -> Result<(), wschannel::Error> {
    let config = cli.into_config()?;
    let tick = config.tick_interval();
    let mut server = Server::builder(config).bind()?;
    info!(
        category = "server",
        channels = ?server.channels().names(),
        "serving"
    );
    server.run(tick)
}

fn main() -> ExitCode {
    init_logging();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(category = "server", error = %err, "server stopped");
            match err.category() {
                ErrorCategory::Config | ErrorCategory::Application => ExitCode::from(1),
                _ => ExitCode::from(2),
            }
        }
    }
}
