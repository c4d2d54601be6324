//! Interactive terminal clients for both relays.
//!
//! Both read lines from stdin, print whatever the relay sends, and leave on
//! `/exit` (any case) or end of input.

pub mod tcp;
pub mod udp;

use tokio::io::{self, AsyncWriteExt};

const EXIT_COMMAND: &str = "/exit";

/// What a line typed by the user asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Exit,
    Skip,
    Send(&'a str),
}

fn classify_input(line: &str) -> Input<'_> {
    let text = line.trim();
    if text.eq_ignore_ascii_case(EXIT_COMMAND) {
        Input::Exit
    } else if text.is_empty() {
        Input::Skip
    } else {
        Input::Send(text)
    }
}

/// Default name offered when the user does not pick one.
pub fn default_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "anonymous".to_string())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
