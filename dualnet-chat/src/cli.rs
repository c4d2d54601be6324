use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::{Args, Parser, Subcommand};

use crate::client;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the TCP chat relay (default port 4000).
    TcpServer(ServerArgs),
    /// Run the UDP chat relay (default port 4001).
    UdpServer(ServerArgs),
    /// Join a TCP relay from this terminal (default server 127.0.0.1:4000).
    TcpClient(ClientArgs),
    /// Join a UDP relay from this terminal (default server 127.0.0.1:4001).
    UdpClient(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address of the interface to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port to listen on (1-65535); each transport has its own default.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,
}

impl ServerArgs {
    pub fn listen_addr(&self, default_port: u16) -> SocketAddr {
        SocketAddr::new(self.bind, self.port.unwrap_or(default_port))
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name shown to other participants; defaults to this machine's host name.
    #[arg(long, default_value_t = client::default_name())]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long)]
    pub server: Option<SocketAddr>,
}

impl ClientArgs {
    pub fn server_addr(&self, default_port: u16) -> SocketAddr {
        self.server
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), default_port))
    }
}
