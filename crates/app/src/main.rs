//! Commander - supervised client/server messaging from the command line
//!
//! # Usage
//!
//! ```bash
//! # Host a server on every interface, broadcasting stdin lines
//! commander server --interface '*' --port 30000
//!
//! # Connect a client
//! commander client --address 127.0.0.1 --port 30000 --id abc
//!
//! # Drive a client and a server interactively
//! commander --config commander.toml repl
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use commander_net::{ReconnectPolicy, ANY_INTERFACE, DEFAULT_PORT};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod network;
mod repl;
mod settings;

use settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "commander")]
#[command(about = "Supervised client/server messaging")]
#[command(version)]
struct Args {
    /// TOML file with [client] and [server] tables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a server and broadcast each stdin line as an `echo` message
    Server {
        /// Interface to listen on (`*` for all)
        #[arg(long)]
        interface: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Connect to a server and print what it sends
    Client {
        #[arg(short, long)]
        address: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Client id; a random one is generated when absent
        #[arg(long)]
        id: Option<String>,
        /// Local interface for the outbound socket
        #[arg(long)]
        interface: Option<String>,
        /// Local port for the outbound socket
        #[arg(long)]
        bind_port: Option<u16>,
        /// Do not reconnect after an unexpected close
        #[arg(long)]
        no_reconnect: bool,
    },
    /// Interactive controller for one client and one server
    Repl,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let settings = Settings::load_or_default(args.config.as_deref())?;

    match args.command {
        Command::Server { interface, port } => {
            let mut config = settings.server;
            // Flags override the file; the file overrides defaults
            config.interface = interface
                .or(config.interface)
                .or_else(|| Some(ANY_INTERFACE.to_string()));
            config.port = port.or(config.port).or(Some(DEFAULT_PORT));
            network::run_server(config).await
        }
        Command::Client {
            address,
            port,
            id,
            interface,
            bind_port,
            no_reconnect,
        } => {
            let mut config = settings.client;
            config.address = address.or(config.address);
            config.port = port.or(config.port).or(Some(DEFAULT_PORT));
            config.client_id = id.or(config.client_id);
            config.interface = interface.or(config.interface);
            config.bind_port = bind_port.or(config.bind_port);
            if no_reconnect {
                config.reconnect = ReconnectPolicy {
                    enabled: false,
                    ..config.reconnect
                };
            }
            network::run_client(config).await
        }
        Command::Repl => {
            tracing::info!("Starting REPL, type 'help' for commands");
            let repl = repl::Repl::new(settings.client, settings.server);
            repl.echo_events();
            repl.run().await?;
            Ok(())
        }
    }
}
