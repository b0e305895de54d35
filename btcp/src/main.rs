//! Entry point for `btcp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, argument parsing, file I/O).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use btcp::{ClientSocket, Config, ServerSocket};

/// Reliable file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct Common {
    /// Window size in segments.
    #[arg(short, long, default_value_t = 100)]
    window: u8,
    /// Retransmission timeout in milliseconds.
    #[arg(short, long, default_value_t = 100)]
    timeout: u64,
    /// Handshake and teardown attempts.
    #[arg(short, long, default_value_t = 20)]
    retries: u32,
    /// Verbose protocol logging (overridden by RUST_LOG).
    #[arg(short, long)]
    debug: bool,
}

impl Common {
    fn config(&self) -> Config {
        Config::default()
            .with_window(self.window)
            .with_timeout(Duration::from_millis(self.timeout))
            .with_retries(self.retries)
            .with_debug(self.debug)
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Accept one connection and write the received stream to a file.
    Server {
        #[command(flatten)]
        common: Common,
        /// Local address to bind.
        #[arg(long, default_value = "127.0.0.1:9001")]
        bind: SocketAddr,
        /// Client address to answer.
        #[arg(long, default_value = "127.0.0.1:9000")]
        peer: SocketAddr,
        /// Where to write the received bytes.
        #[arg(short, long, default_value = "output.file")]
        output: PathBuf,
    },
    /// Connect, send a file, disconnect.
    Client {
        #[command(flatten)]
        common: Common,
        /// Local address to bind.
        #[arg(long, default_value = "127.0.0.1:9000")]
        bind: SocketAddr,
        /// Server address.
        #[arg(long, default_value = "127.0.0.1:9001")]
        peer: SocketAddr,
        /// File to send.
        #[arg(short, long, default_value = "input.file")]
        input: PathBuf,
    },
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

async fn run_server(common: Common, bind: SocketAddr, peer: SocketAddr, output: PathBuf) -> Result<()> {
    let config = common.config();
    let linger = config.timeout * config.retries;
    let server = ServerSocket::bind(config, bind, peer)
        .await
        .with_context(|| format!("binding server to {bind}"))?;

    log::info!("Server listening on {bind}");
    server.accept().await?;
    let data = server.recv_all().await.context("receiving stream")?;
    std::fs::write(&output, &data).with_context(|| format!("writing {}", output.display()))?;
    log::info!("Received {} bytes into {}", data.len(), output.display());

    if !server.wait_disconnected(linger).await {
        log::warn!("Client did not disconnect within {linger:?}");
    }
    server.close();
    Ok(())
}

async fn run_client(common: Common, bind: SocketAddr, peer: SocketAddr, input: PathBuf) -> Result<()> {
    let data = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
    let client = ClientSocket::bind(common.config(), bind, peer)
        .await
        .with_context(|| format!("binding client to {bind}"))?;

    log::info!("Connecting to {peer}");
    client.connect().await.context("handshake failed")?;
    client.send(&data).await.context("sending file")?;
    log::info!(
        "Sent {} bytes from {} ({} retransmission rounds)",
        data.len(),
        input.display(),
        client.retransmissions()
    );
    client.disconnect().await;
    client.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            common,
            bind,
            peer,
            output,
        } => {
            init_logging(common.debug);
            run_server(common, bind, peer, output).await
        }
        Mode::Client {
            common,
            bind,
            peer,
            input,
        } => {
            init_logging(common.debug);
            run_client(common, bind, peer, input).await
        }
    }
}
