//! socktun CLI
//!
//! Runs the tunnel daemon and talks to it over the control socket.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use socktun_engine::{
    Command, Config, ControlClient, JsonProfileStore, ProfileStore, ProxyEndpoint,
    SelectedProfile, StatusInfo,
};

mod daemon;
mod recorder;

/// socktun - route all traffic through a SOCKS proxy
#[derive(Parser)]
#[command(name = "socktun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "socktun.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel daemon
    Run,

    /// Connect to a proxy, or to the selected profile when no host is given
    Connect {
        /// Proxy host
        #[arg(long)]
        host: Option<String>,

        /// Proxy port
        #[arg(long)]
        port: Option<String>,

        /// SOCKS username
        #[arg(long)]
        user: Option<String>,

        /// SOCKS password
        #[arg(long)]
        pass: Option<String>,
    },

    /// Disconnect the current session
    Disconnect,

    /// Show the session status
    Status,

    /// Stop the daemon
    Shutdown,

    /// Manage saved proxy profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "socktun.toml")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum ProfileCommand {
    /// List saved profiles
    List,

    /// Save a profile
    Add {
        host: String,
        port: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        pass: Option<String>,
    },

    /// Remove every saved copy of a profile
    Remove {
        host: String,
        port: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        pass: Option<String>,
    },

    /// Make a profile the default for `connect`
    Select {
        host: String,
        port: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        pass: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::GenConfig { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            return generate_config(output);
        }
        command => command,
    };

    let config = load_config(&cli.config)?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    match command {
        Commands::Run => daemon::run(config).await,
        Commands::Connect {
            host,
            port,
            user,
            pass,
        } => connect(&config, host, port, user, pass).await,
        Commands::Disconnect => {
            client(&config).disconnect().await?;
            println!("Disconnected");
            Ok(())
        }
        Commands::Status => {
            print_status(&client(&config).status().await?);
            Ok(())
        }
        Commands::Shutdown => {
            client(&config).shutdown().await?;
            println!("Shutdown requested");
            Ok(())
        }
        Commands::Profile { command } => profile(&config, command),
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if !path.exists() {
        info!("No configuration at {:?}, using defaults", path);
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);

    Ok(())
}

fn client(config: &Config) -> ControlClient {
    ControlClient::new(&config.control.socket)
}

fn store(config: &Config) -> JsonProfileStore {
    JsonProfileStore::new(&config.store.path)
}

/// Parse profile fields the same way the daemon parses CONNECT
fn parse_endpoint(
    host: &str,
    port: &str,
    user: Option<&str>,
    pass: Option<&str>,
) -> Result<ProxyEndpoint> {
    match Command::connect(Some(host), Some(port), user, pass)? {
        Command::Connect(endpoint) => Ok(endpoint),
        Command::Disconnect => anyhow::bail!("expected a connect command"),
    }
}

async fn connect(
    config: &Config,
    host: Option<String>,
    port: Option<String>,
    user: Option<String>,
    pass: Option<String>,
) -> Result<()> {
    let endpoint = match host {
        Some(host) => {
            let port = port.context("--port is required with --host")?;
            parse_endpoint(&host, &port, user.as_deref(), pass.as_deref())?
        }
        None => {
            store(config)
                .selected()?
                .context("No host given and no profile selected")?
                .endpoint
        }
    };

    let info = client(config).connect(&endpoint).await?;
    print_status(&info);
    Ok(())
}

fn print_status(info: &StatusInfo) {
    let status = info
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| info.state.to_uppercase());
    match info.endpoint {
        Some(ref endpoint) => println!("{} {}", status, endpoint),
        None => println!("{}", status),
    }
    if let Some(ref message) = info.message {
        println!("  {}", message);
    }
}

fn profile(config: &Config, command: ProfileCommand) -> Result<()> {
    let store = store(config);
    match command {
        ProfileCommand::List => {
            let selected = store.selected()?;
            for endpoint in store.profiles()? {
                let marker = match selected {
                    Some(ref s) if s.endpoint == endpoint => "*",
                    _ => " ",
                };
                println!("{} {}", marker, endpoint);
            }
        }
        ProfileCommand::Add {
            host,
            port,
            user,
            pass,
        } => {
            let endpoint = parse_endpoint(&host, &port, user.as_deref(), pass.as_deref())?;
            store.add(endpoint.clone())?;
            println!("Added {}", endpoint);
        }
        ProfileCommand::Remove {
            host,
            port,
            user,
            pass,
        } => {
            let endpoint = parse_endpoint(&host, &port, user.as_deref(), pass.as_deref())?;
            let removed = store.remove(&endpoint)?;
            println!("Removed {} profile(s)", removed);
        }
        ProfileCommand::Select {
            host,
            port,
            user,
            pass,
        } => {
            let endpoint = parse_endpoint(&host, &port, user.as_deref(), pass.as_deref())?;
            store.select(SelectedProfile {
                endpoint: endpoint.clone(),
                status: None,
            })?;
            println!("Selected {}", endpoint);
        }
    }
    Ok(())
}
