use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    net::UdpSocket,
    select,
    time::{Instant, interval_at},
};
use tracing::warn;

use super::{Input, classify_input, write_stdout};
use crate::{
    cli::ClientArgs,
    config::{DEFAULT_UDP_PORT, HEARTBEAT_INTERVAL},
    netutils, protocol,
};

const RECEIVE_BUFFER: usize = 4096;

pub async fn run(args: ClientArgs) -> Result<()> {
    let server = args.server_addr(DEFAULT_UDP_PORT);
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("failed to bind udp socket")?;
    socket
        .connect(server)
        .await
        .with_context(|| format!("failed to connect to {}", server))?;

    let local = SocketAddr::new(netutils::local_ipv4().into(), socket.local_addr()?.port());
    let display_name = netutils::display_name(&args.name, local);

    write_stdout("[dualnet-chat UDP Client]").await?;
    write_stdout("[info] Enter \"/exit\" to disconnect").await?;
    write_stdout(&format!(
        "[info] You are connected to [{}] as [{display_name}]\n",
        server
    ))
    .await?;

    // The relay builds the full `name@ip:port` itself from our source address.
    socket
        .send(protocol::register(&args.name).as_bytes())
        .await
        .context("failed to register with server")?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    run_client_loop(&socket, &mut stdin).await
}

async fn run_client_loop(socket: &UdpSocket, stdin: &mut BufReader<tokio::io::Stdin>) -> Result<()> {
    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let mut buf = vec![0u8; RECEIVE_BUFFER];
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            received = socket.recv(&mut buf) => {
                if !handle_datagram(received, &buf).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, socket).await? {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(error) = socket.send(protocol::HEARTBEAT.as_bytes()).await {
                    warn!(?error, "failed to send heartbeat");
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                say_goodbye(socket).await;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_datagram(received: io::Result<usize>, buf: &[u8]) -> Result<bool> {
    match received {
        Ok(len) => {
            let text = String::from_utf8_lossy(&buf[..len]);
            write_stdout(text.trim_end_matches(['\r', '\n'])).await?;
            Ok(true)
        }
        Err(_) => {
            write_stdout("[info] Connection to server lost. Exiting...").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    socket: &UdpSocket,
) -> Result<bool> {
    if bytes_read? == 0 {
        say_goodbye(socket).await;
        return Ok(false);
    }

    match classify_input(input) {
        Input::Exit => {
            say_goodbye(socket).await;
            write_stdout("Goodbye!").await?;
            Ok(false)
        }
        Input::Skip => Ok(true),
        Input::Send(text) => {
            if let Err(error) = socket.send(text.as_bytes()).await {
                write_stdout(&format!("[error] Failed to send message: {error}")).await?;
            }
            Ok(true)
        }
    }
}

async fn say_goodbye(socket: &UdpSocket) {
    if let Err(error) = socket.send(protocol::BYE.as_bytes()).await {
        warn!(?error, "failed to send goodbye");
    }
}
