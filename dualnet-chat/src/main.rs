use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use dualnet_chat::{
    cli::{Cli, Command},
    client,
    config::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, DatagramConfig, StreamConfig},
    datagram::DatagramServer,
    netutils,
    stream::StreamServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::TcpServer(args) => {
            let listen = args.listen_addr(DEFAULT_TCP_PORT);
            let listener = TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to listen on {listen}"))?;
            let server = StreamServer::new(listener, StreamConfig::default());
            let addr = server.local_addr()?;
            info!("tcp server listening on {}", addr);
            info!("reachable at {}", netutils::display_addr(addr));
            if let Err(err) = server.run_until_terminated().await {
                warn!("tcp server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::UdpServer(args) => {
            let listen = args.listen_addr(DEFAULT_UDP_PORT);
            let socket = UdpSocket::bind(listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;
            let server = DatagramServer::new(socket, DatagramConfig::default());
            let addr = server.local_addr()?;
            info!("udp server listening on {}", addr);
            info!("reachable at {}", netutils::display_addr(addr));
            if let Err(err) = server.run_until_terminated().await {
                warn!("udp server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::TcpClient(args) => client::tcp::run(args).await?,
        Command::UdpClient(args) => client::udp::run(args).await?,
    }

    Ok(())
}
