use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub const REGISTER_PREFIX: &str = "REGISTER:";
pub const HEARTBEAT: &str = "HEARTBEAT";
pub const BYE: &str = "BYE";

pub const RATE_LIMITED_NOTICE: &str = "[server]: You are sending messages too fast. Please slow down.";
pub const SHUTDOWN_NOTICE: &str = "[server]: Server is shutting down. Goodbye!";

/// A client-to-server datagram after whitespace trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramCommand<'a> {
    Register { name: &'a str },
    Heartbeat,
    Bye,
    Chat { text: &'a str },
}

impl<'a> DatagramCommand<'a> {
    pub fn parse(payload: &'a str) -> Self {
        let payload = payload.trim();
        if let Some(name) = payload.strip_prefix(REGISTER_PREFIX) {
            return DatagramCommand::Register { name: name.trim() };
        }
        match payload {
            HEARTBEAT => DatagramCommand::Heartbeat,
            BYE => DatagramCommand::Bye,
            text => DatagramCommand::Chat { text },
        }
    }
}

pub fn register(name: &str) -> String {
    format!("{REGISTER_PREFIX}{name}")
}

pub fn chat_line(display_name: &str, text: &str) -> String {
    format!("[{display_name}]: {text}")
}

pub fn joined(display_name: &str) -> String {
    format!("[+] {display_name} joined the chat")
}

pub fn left(display_name: &str) -> String {
    format!("[-] {display_name} left the chat")
}

pub fn left_timeout(display_name: &str) -> String {
    format!("[-] {display_name} left the chat (timeout)")
}

pub fn welcome(display_name: &str) -> String {
    format!("[server]: Welcome {display_name}, you are now registered!")
}

/// Appends the newline terminator every logical chat line carries on the wire.
pub fn frame(line: &str) -> Vec<u8> {
    let mut framed = Vec::with_capacity(line.len() + 1);
    framed.extend_from_slice(line.as_bytes());
    framed.push(b'\n');
    framed
}

/// Reads one line of at most `max_len` bytes, terminator included, and strips
/// the terminator. `None` means the peer closed.
///
/// Invalid UTF-8 is replaced rather than rejected. A line longer than
/// `max_len` is an `InvalidData` error; the oversized bytes are never buffered.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let bytes = (&mut *reader)
        .take(max_len as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if bytes == 0 {
        return Ok(None);
    }
    if bytes == max_len && line.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {max_len} bytes"),
        ));
    }
    let text = String::from_utf8_lossy(&line);
    Ok(Some(text.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Reads lines until a non-blank one arrives; used for the name handshake.
pub async fn read_nonblank_line<R>(reader: &mut R, max_len: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_line(reader, max_len).await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return Ok(Some(line.trim().to_string())),
            None => return Ok(None),
        }
    }
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame(line)).await?;
    writer.flush().await
}
