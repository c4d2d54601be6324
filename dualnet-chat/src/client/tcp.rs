use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::warn;

use super::{Input, classify_input, write_stdout};
use crate::{
    cli::ClientArgs,
    config::{DEFAULT_TCP_PORT, MAX_LINE_LEN},
    netutils,
    protocol::{read_line, write_line},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let server = args.server_addr(DEFAULT_TCP_PORT);
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {}", server))?;

    let local = SocketAddr::new(netutils::local_ipv4().into(), stream.local_addr()?.port());
    let display_name = netutils::display_name(&args.name, local);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_stdout("[dualnet-chat TCP Client]").await?;
    write_stdout("[info] Enter \"/exit\" to disconnect").await?;
    write_stdout(&format!(
        "[info] You are connected to [{}] as [{display_name}]\n",
        server
    ))
    .await?;

    // The relay treats the first line as our display name.
    write_line(&mut writer, &display_name).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    run_client_loop(&mut reader, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
) -> Result<()> {
    let mut input = String::new();
    loop {
        input.clear();
        select! {
            server_line = read_line(reader, MAX_LINE_LEN) => {
                if !handle_server_line(server_line).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(line: io::Result<Option<String>>) -> Result<bool> {
    match line {
        Ok(Some(line)) => {
            write_stdout(&line).await?;
            Ok(true)
        }
        Ok(None) | Err(_) => {
            write_stdout("[info] Server disconnected. Exiting...").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    match classify_input(input) {
        Input::Exit => {
            write_stdout("Exiting...").await?;
            Ok(false)
        }
        Input::Skip => Ok(true),
        Input::Send(text) => {
            write_line(writer, text).await?;
            Ok(true)
        }
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}
