//! Wire protocol shared by the coordination services.
//!
//! Every exchange is a short ASCII command, a short ASCII reply, and optionally a
//! multi-part transfer. Transfers have no length prefixes: parts are joined with
//! [`SEPARATOR`] and the stream is closed off with [`TERMINATOR`]. All framing lives
//! here so services never split on literal tokens themselves.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CoordError, Result};

/// Field separator between transfer parts.
pub const SEPARATOR: &[u8] = b"$%^next^%$";
/// Marks the end of a transfer.
pub const TERMINATOR: &[u8] = b"$%^endtransfer^%$";

pub const GET_STATUS: &str = "getstatus";
pub const RECV_EVAL_LOG: &str = "recvevallog";
pub const RESET_EXP: &str = "resetexp";
pub const DEPLOY_RUN: &str = "deployrun";

pub const READY_TO_RECEIVE: &str = "ready_to_receive";
pub const RECEIVED: &str = "received";
pub const EXP_CLEARED: &str = "exp_cleared";
pub const RESET_SUCCESSFUL: &str = "reset_successful";
pub const RESET_ERROR: &str = "reset_error";

/// Whether a worker or server reply is `token`. Surrounding whitespace is ignored.
pub fn is_reply(raw: &str, token: &str) -> bool {
    raw.trim() == token
}

/// Commands and replies are expected to fit in a single read of this size.
pub const MESSAGE_READ_LIMIT: usize = 1024;

const TRANSFER_CHUNK: usize = 4096;

/// Identifies one training run as `project:run`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExperimentId {
    project: String,
    run: String,
}

impl ExperimentId {
    pub fn new(project: &str, run: &str) -> Result<Self> {
        if !is_path_safe(project) || !is_path_safe(run) {
            return Err(CoordError::InvalidExperimentId(format!("{}:{}", project, run)));
        }
        Ok(Self {
            project: project.to_string(),
            run: run.to_string(),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn run(&self) -> &str {
        &self.run
    }

    /// Directory holding this run's files under `runs_root`.
    pub fn run_dir(&self, runs_root: &Path) -> PathBuf {
        runs_root.join(&self.project).join(&self.run)
    }
}

/// Components become path segments, so they must not be able to walk out of the run root.
fn is_path_safe(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && !component.contains(['/', '\\', ':'])
        && !component.chars().any(char::is_control)
}

impl FromStr for ExperimentId {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((project, run)) => Self::new(project, run),
            None => Err(CoordError::InvalidExperimentId(s.to_string())),
        }
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.run)
    }
}

/// A command as received on one of the listeners or sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetStatus,
    RecvEvalLog,
    ResetExp(ExperimentId),
    /// Worker-facing form: announces an incoming run transfer.
    DeployRun,
    /// Operator-facing form: deploy `exp` to the worker at `worker` (`ip:port`).
    DeployRunTo { worker: String, exp: ExperimentId },
}

impl Command {
    /// Parse a command. The keyword is case-insensitive; arguments keep their case.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let parts: Vec<&str> = raw.split(':').collect();
        let keyword = parts[0].to_ascii_lowercase();

        match (keyword.as_str(), parts.len()) {
            (GET_STATUS, 1) => Ok(Command::GetStatus),
            (RECV_EVAL_LOG, 1) => Ok(Command::RecvEvalLog),
            (DEPLOY_RUN, 1) => Ok(Command::DeployRun),
            (RESET_EXP, 3) => Ok(Command::ResetExp(ExperimentId::new(parts[1], parts[2])?)),
            (DEPLOY_RUN, 5) => {
                let (ip, port) = (parts[1], parts[2]);
                if ip.is_empty() || port.parse::<u16>().is_err() {
                    return Err(CoordError::Protocol(format!(
                        "invalid worker address {}:{}",
                        ip, port
                    )));
                }
                Ok(Command::DeployRunTo {
                    worker: format!("{}:{}", ip, port),
                    exp: ExperimentId::new(parts[3], parts[4])?,
                })
            }
            _ => Err(CoordError::Protocol(format!("unrecognized command {:?}", raw))),
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            Command::GetStatus => GET_STATUS.to_string(),
            Command::RecvEvalLog => RECV_EVAL_LOG.to_string(),
            Command::DeployRun => DEPLOY_RUN.to_string(),
            Command::ResetExp(exp) => format!("{}:{}", RESET_EXP, exp),
            Command::DeployRunTo { worker, exp } => format!("{}:{}:{}", DEPLOY_RUN, worker, exp),
        }
    }
}

/// Join `parts` with [`SEPARATOR`] and append [`TERMINATOR`].
pub fn encode_transfer<P: AsRef<[u8]>>(parts: &[P]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(SEPARATOR);
        }
        out.extend_from_slice(part.as_ref());
    }
    out.extend_from_slice(TERMINATOR);
    out
}

/// Split a received transfer into its parts. The terminator and anything after it are dropped.
pub fn decode_transfer(buf: &[u8]) -> Result<Vec<&[u8]>> {
    let end = find(buf, TERMINATOR, 0)
        .ok_or_else(|| CoordError::Protocol("transfer terminator missing".to_string()))?;
    let body = &buf[..end];

    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(pos) = find(body, SEPARATOR, start) {
        parts.push(&body[start..pos]);
        start = pos + SEPARATOR.len();
    }
    parts.push(&body[start..]);
    Ok(parts)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || haystack.len() - from < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Write a message and flush it.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &[u8]) -> Result<()> {
    writer.write_all(msg).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one command or reply (a single read of up to [`MESSAGE_READ_LIMIT`] bytes).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R, timeout: Duration) -> Result<String> {
    let mut buf = [0u8; MESSAGE_READ_LIMIT];
    let n = tokio::time::timeout(timeout, reader.read(&mut buf))
        .await
        .map_err(|_| CoordError::Timeout("waiting for a message"))??;
    if n == 0 {
        return Err(CoordError::ConnectionClosed);
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// Read until [`TERMINATOR`] shows up in the accumulated bytes, however the peer chunks them.
///
/// Returns everything read so far, terminator included. Each read is bounded by `timeout`
/// and the whole transfer by `limit` bytes.
pub async fn read_transfer<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
    limit: usize,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; TRANSFER_CHUNK];
    loop {
        let n = tokio::time::timeout(timeout, reader.read(&mut chunk))
            .await
            .map_err(|_| CoordError::Timeout("receiving a transfer"))??;
        if n == 0 {
            return Err(CoordError::ConnectionClosed);
        }

        // The terminator may straddle the previous chunk boundary.
        let search_from = buf.len().saturating_sub(TERMINATOR.len() - 1);
        buf.extend_from_slice(&chunk[..n]);
        if find(&buf, TERMINATOR, search_from).is_some() {
            return Ok(buf);
        }
        if buf.len() > limit {
            return Err(CoordError::Protocol(format!(
                "transfer exceeds {} bytes without terminator",
                limit
            )));
        }
    }
}

/// Read until the accumulated bytes form one complete JSON document.
pub async fn read_json<R, T>(reader: &mut R, timeout: Duration, limit: usize) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; TRANSFER_CHUNK];
    loop {
        let n = tokio::time::timeout(timeout, reader.read(&mut chunk))
            .await
            .map_err(|_| CoordError::Timeout("waiting for a JSON reply"))??;
        if n == 0 {
            return Err(if buf.is_empty() {
                CoordError::ConnectionClosed
            } else {
                CoordError::Protocol("JSON reply truncated".to_string())
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        match serde_json::from_slice::<T>(&buf) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_eof() && buf.len() <= limit => continue,
            Err(e) if e.is_eof() => {
                return Err(CoordError::Protocol(format!(
                    "JSON reply exceeds {} bytes",
                    limit
                )))
            }
            Err(e) => return Err(e.into()),
        }
    }
}
