use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::CommunityConfig;
use crate::error::{VpnAcctError, VpnAcctResult};
use crate::model::{BackendKind, LiveSession};
use super::backend::VpnBackend;

/// Driver for the OpenVPN community daemon's management interface.
///
/// Every call opens its own TCP session, discards the banner, sends one
/// command, reads to the response terminator and closes. Each read and write
/// is bounded by the configured timeout.
pub struct CommunityBackend {
    address: String,
    timeout: Duration,
    status_command: String,
}

impl CommunityBackend {
    pub fn new(config: &CommunityConfig) -> Self {
        let status_command = match config.status_version {
            Some(version) => format!("status {}", version),
            None => "status".to_string(),
        };
        Self {
            address: config.address(),
            timeout: config.timeout(),
            status_command,
        }
    }

    /// Send `kill <username>`. The daemon's "not found" reply means the user
    /// has no session and counts as success; any other `ERROR:` is a rejection.
    pub async fn kill(&self, username: &str) -> VpnAcctResult<()> {
        let command = format!("kill {}", username);
        let mut session = ManagementSession::connect(&self.address, self.timeout).await?;
        session.send(&command).await?;
        let lines = session.read_response(is_command_reply_end).await;
        session.close().await;

        match lines?.last() {
            Some(line) if is_not_connected_reply(line, username) => {
                debug!(backend = "community", username = %username, "No live session to kill");
                Ok(())
            }
            Some(line) if line.starts_with("ERROR") => Err(VpnAcctError::CommandFailed {
                cmd: command,
                code: None,
                stderr: line.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// `ERROR: common name '<username>' not found`
fn is_not_connected_reply(line: &str, username: &str) -> bool {
    line.strip_prefix("ERROR:")
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix("common name '"))
        .and_then(|rest| rest.strip_prefix(username))
        .map_or(false, |rest| rest == "' not found")
}

fn is_command_reply_end(line: &str) -> bool {
    line == "END" || line.starts_with("SUCCESS:") || line.starts_with("ERROR:")
}

#[async_trait]
impl VpnBackend for CommunityBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Community
    }

    async fn query_sessions(&self) -> VpnAcctResult<Vec<LiveSession>> {
        let mut session = ManagementSession::connect(&self.address, self.timeout).await?;
        session.send(&self.status_command).await?;
        let lines = session.read_response(|line| line == "END").await;
        session.close().await;
        Ok(parse_client_list(&lines?))
    }

    async fn disconnect(&self, username: &str) -> VpnAcctResult<()> {
        let result = self.kill(username).await;
        if let Err(e) = &result {
            debug!(backend = "community", username = %username, "kill failed: {}", e);
        }
        result
    }
}

/// One short-lived management interface connection
struct ManagementSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl ManagementSession {
    async fn connect(address: &str, timeout: Duration) -> VpnAcctResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| VpnAcctError::Timeout(format!("connecting to management interface at {}", address)))?
            .map_err(|e| VpnAcctError::ConnectionFailed {
                reason: format!("Cannot connect to management interface at {}: {}", address, e),
            })?;

        let (reader, writer) = stream.into_split();
        let mut session = Self {
            reader: BufReader::new(reader),
            writer,
            timeout,
        };

        // Banner, e.g. ">INFO:OpenVPN Management Interface Version 5 ..."
        match session.read_line().await? {
            Some(banner) => debug!("Management banner: {}", banner),
            None => {
                return Err(VpnAcctError::ConnectionFailed {
                    reason: format!("Management interface at {} closed before sending a banner", address),
                })
            }
        }

        Ok(session)
    }

    async fn send(&mut self, command: &str) -> VpnAcctResult<()> {
        let data = format!("{}\n", command);
        tokio::time::timeout(self.timeout, async {
            self.writer.write_all(data.as_bytes()).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| VpnAcctError::Timeout(format!("sending '{}'", command)))??;
        Ok(())
    }

    async fn read_line(&mut self) -> VpnAcctResult<Option<String>> {
        let mut buf = Vec::new();
        let n = tokio::time::timeout(self.timeout, self.reader.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| VpnAcctError::Timeout("waiting for management interface output".to_string()))??;

        if n == 0 {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Read lines until `is_last` matches, skipping real-time `>` notifications
    async fn read_response<F>(&mut self, is_last: F) -> VpnAcctResult<Vec<String>>
    where
        F: Fn(&str) -> bool,
    {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?.ok_or_else(|| VpnAcctError::ConnectionFailed {
                reason: "Management interface closed the session before the response ended".to_string(),
            })?;

            if line.starts_with('>') {
                continue;
            }

            let done = is_last(&line);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Extract sessions from `CLIENT_LIST` lines of a status dump.
///
/// Works on both the management interface response and the status log file.
/// Fields are comma separated (status version 2) or tab separated (version 3);
/// the username is the 2nd field, real address 3rd, virtual address 4th.
pub fn parse_client_list<S: AsRef<str>>(lines: &[S]) -> Vec<LiveSession> {
    lines
        .iter()
        .filter_map(|line| parse_client_line(line.as_ref()))
        .collect()
}

fn parse_client_line(line: &str) -> Option<LiveSession> {
    let rest = line.strip_prefix("CLIENT_LIST")?;
    let mut fields = rest.split([',', '\t']);

    // Text right after the prefix must be a separator, not e.g. "CLIENT_LISTX"
    if fields.next() != Some("") {
        return None;
    }

    let username = fields.next().map(str::trim).filter(|s| !s.is_empty())?;
    let mut optional = || fields.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let real_address = optional();
    let virtual_address = optional();

    Some(LiveSession {
        username: username.to_string(),
        real_address,
        virtual_address,
        backend: BackendKind::Community,
    })
}
