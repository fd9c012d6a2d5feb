//! socket-link
//!
//! ```text
//! socket-link serve [--port P]         echo server until Ctrl-C
//! socket-link send --addr A MSG...     send each message, print the echo
//! ```

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use socket_link::config::load_or_default;
use socket_link::observability::{logging, metrics};
use socket_link::{default_factory, Connection, EchoHandler, Server, Settings};

#[derive(Parser)]
#[command(name = "socket-link")]
#[command(about = "Framed, handshaken TCP messaging", long_about = None)]
struct Cli {
    /// Configuration file; defaults are used when it does not exist.
    #[arg(short, long, default_value = "socket-link.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Serve {
        /// Overrides `server.port`
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Send messages to a server and print the replies
    Send {
        #[arg(short, long, default_value = "127.0.0.1:11000")]
        addr: String,

        #[arg(required = true)]
        messages: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let (settings, source) = load_or_default(&cli.config)?;

    logging::init_logging(&settings.observability.log_level)?;
    if source.is_default() {
        tracing::info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    if settings.observability.metrics_enabled {
        let addr: SocketAddr = settings.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    match cli.command {
        Commands::Serve { port } => serve(&settings, port.unwrap_or(settings.server.port)).await,
        Commands::Send { addr, messages } => send(&settings, &addr, &messages).await,
    }
}

async fn serve(settings: &Settings, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(port, default_factory::<EchoHandler>(), settings).await?;
    server.start()?;
    tracing::info!(port = server.port(), "Echo server running");

    tokio::signal::ctrl_c().await?;
    tracing::info!(active = server.active_connections(), "Shutting down");
    server.shutdown().await?;
    Ok(())
}

async fn send(settings: &Settings, addr: &str, messages: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let connection = Connection::connect(addr, settings).await?;
    for message in messages {
        connection.write(message).await?;
        let reply = connection.read().await?;
        println!("{reply}");
    }
    connection.shutdown();
    Ok(())
}
