//! NUT (Network UPS Tools) protocol client.
//!
//! Opens one TCP connection per poll, authenticates if the device config
//! carries credentials, and lists all variables for the configured UPS.
//! Responses are line-framed: `BEGIN LIST`/`END LIST` blocks for data, a
//! single `ERR` line for rejections.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::RawPoll;
use crate::db::Device;

/// NUT client error types, one per distinct failure condition.
#[derive(Error, Debug)]
pub enum NutError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("response timed out after {0:?}")]
    ReadTimeout(Duration),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("unknown UPS {requested:?}; server exports {available:?}")]
    UnknownUps {
        requested: String,
        available: Vec<String>,
    },
    #[error("server error: {0}")]
    Server(String),
    #[error("empty or unparsable response")]
    EmptyResponse,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

type LineReader = Lines<BufReader<OwnedReadHalf>>;

/// Poll a NUT server for all variables of the configured UPS.
///
/// The timeout covers the connect and the full read independently; on
/// expiry the connection is dropped. No retries happen here.
pub async fn poll(device: &Device, timeout: Duration) -> Result<RawPoll, NutError> {
    let addr = format!("{}:{}", device.host, device.effective_port());

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(NutError::Connect { addr, source }),
        Err(_) => return Err(NutError::ConnectTimeout { addr, timeout }),
    };

    match tokio::time::timeout(timeout, run_session(stream, device)).await {
        Ok(result) => result,
        Err(_) => Err(NutError::ReadTimeout(timeout)),
    }
}

async fn run_session(stream: TcpStream, device: &Device) -> Result<RawPoll, NutError> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    if let Some(username) = &device.username {
        send_command(&mut writer, &format!("USERNAME {}", username)).await?;
        expect_ok(&mut reader).await?;

        if let Some(password) = &device.password {
            send_command(&mut writer, &format!("PASSWORD {}", password)).await?;
            expect_ok(&mut reader).await?;
        }
    }

    send_command(&mut writer, &format!("LIST VAR {}", device.ups_name)).await?;
    let first = read_line(&mut reader).await?;

    if let Some(err) = first.strip_prefix("ERR ") {
        return Err(classify_err(err, device, &mut writer, &mut reader).await);
    }
    if !first.starts_with("BEGIN LIST VAR") {
        return Err(NutError::EmptyResponse);
    }

    let mut vars = BTreeMap::new();
    loop {
        let line = read_line(&mut reader).await?;
        if line.starts_with("END LIST VAR") {
            break;
        }
        // Malformed lines are skipped, not fatal.
        if let Some((key, value)) = parse_var_line(&line) {
            vars.insert(key, value);
        }
    }

    if vars.is_empty() {
        return Err(NutError::EmptyResponse);
    }

    Ok(RawPoll::Nut { vars })
}

/// Map an `ERR` reply to its failure kind. An unknown UPS name degrades to
/// `LIST UPS` so the caller can report the mismatch distinctly from a dead
/// server.
async fn classify_err(
    err: &str,
    device: &Device,
    writer: &mut OwnedWriteHalf,
    reader: &mut LineReader,
) -> NutError {
    let code = err.split_whitespace().next().unwrap_or(err);
    match code {
        "UNKNOWN-UPS" => {
            let available = list_ups_names(writer, reader).await.unwrap_or_default();
            NutError::UnknownUps {
                requested: device.ups_name.clone(),
                available,
            }
        }
        "ACCESS-DENIED" | "USERNAME-REQUIRED" | "PASSWORD-REQUIRED" => {
            NutError::AccessDenied(err.to_string())
        }
        _ => NutError::Server(err.to_string()),
    }
}

/// Ask the server which UPS names it exports.
async fn list_ups_names(
    writer: &mut OwnedWriteHalf,
    reader: &mut LineReader,
) -> Result<Vec<String>, NutError> {
    send_command(writer, "LIST UPS").await?;
    let first = read_line(reader).await?;
    if !first.starts_with("BEGIN LIST UPS") {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.starts_with("END LIST UPS") {
            break;
        }
        if let Some(name) = parse_ups_line(&line) {
            names.push(name);
        }
    }
    Ok(names)
}

async fn send_command(writer: &mut OwnedWriteHalf, command: &str) -> Result<(), NutError> {
    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

async fn read_line(reader: &mut LineReader) -> Result<String, NutError> {
    match reader.next_line().await? {
        Some(line) => Ok(line),
        // Server closed the connection mid-response.
        None => Err(NutError::EmptyResponse),
    }
}

async fn expect_ok(reader: &mut LineReader) -> Result<(), NutError> {
    let line = read_line(reader).await?;
    if line.starts_with("OK") {
        Ok(())
    } else {
        Err(NutError::AccessDenied(line))
    }
}

/// Parse a variable-record line: `VAR <upsname> <key> "<value>"`.
pub(crate) fn parse_var_line(line: &str) -> Option<(String, String)> {
    static VAR_LINE: OnceLock<Regex> = OnceLock::new();
    let re = VAR_LINE.get_or_init(|| {
        Regex::new(r#"^VAR\s+\S+\s+(?P<key>\S+)\s+"(?P<val>.*)"\s*$"#).unwrap()
    });

    let caps = re.captures(line)?;
    Some((caps["key"].to_string(), unescape(&caps["val"])))
}

/// Parse a UPS-record line: `UPS <name> "<description>"`.
fn parse_ups_line(line: &str) -> Option<String> {
    static UPS_LINE: OnceLock<Regex> = OnceLock::new();
    let re = UPS_LINE.get_or_init(|| Regex::new(r#"^UPS\s+(?P<name>\S+)\s+""#).unwrap());

    let caps = re.captures(line)?;
    Some(caps["name"].to_string())
}

/// Resolve backslash escapes inside a quoted value.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => break,
            }
        } else {
            out.push(c);
        }
    }
    out
}
