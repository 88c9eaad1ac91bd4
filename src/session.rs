use crate::config::HostConfig;
use ssh2::Session;
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Seam between the collector and the transport. Production code uses
/// [`SshSession`]; tests substitute scripted runners.
pub trait CommandRunner {
    fn run(&mut self, command: &str) -> Result<CommandOutput, SessionError>;

    fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        source: std::io::Error,
    },
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("ssh handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        source: ssh2::Error,
    },
    #[error("authentication of {username}@{address} failed: {source}")]
    Auth {
        username: String,
        address: String,
        source: ssh2::Error,
    },
    #[error("failed to open channel to {address}: {source}")]
    Channel {
        address: String,
        source: ssh2::Error,
    },
    #[error("command failed on {address}: {source}")]
    Exec {
        address: String,
        source: ssh2::Error,
    },
    #[error("failed to read command output from {address}: {source}")]
    Read {
        address: String,
        source: std::io::Error,
    },
}

/// At most one live SSH connection to one host, reconnecting on demand.
/// Host keys are accepted without verification, matching a
/// trust-on-first-use policy with no known-hosts persistence.
pub struct SshSession {
    config: HostConfig,
    connect_timeout: Duration,
    command_timeout: Duration,
    session: Option<Session>,
    state: SessionState,
}

impl SshSession {
    pub fn new(config: HostConfig, connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            config,
            connect_timeout,
            command_timeout,
            session: None,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.hostname, self.config.port)
    }

    /// Makes exactly one connection attempt when the session is not
    /// known to be connected. Liveness is not probed here; transport
    /// failures detected during `run` flip the state back to
    /// `Disconnected` so the next call reconnects.
    pub fn ensure_connected(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Connected && self.session.is_some() {
            return Ok(());
        }

        self.session = None;
        self.state = SessionState::Disconnected;

        let address = self.address();
        let addr = resolve_first(&self.config.hostname, self.config.port)?;
        let tcp =
            TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|source| {
                SessionError::Connect {
                    address: address.clone(),
                    source,
                }
            })?;

        let mut session = Session::new().map_err(|source| SessionError::Handshake {
            address: address.clone(),
            source,
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.command_timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|source| SessionError::Handshake {
                address: address.clone(),
                source,
            })?;
        session
            .userauth_password(&self.config.username, &self.config.password)
            .map_err(|source| SessionError::Auth {
                username: self.config.username.clone(),
                address: address.clone(),
                source,
            })?;

        info!(host = %self.config.name, address = %address, "ssh session established");
        self.session = Some(session);
        self.state = SessionState::Connected;
        Ok(())
    }
}

impl CommandRunner for SshSession {
    /// Runs one command and drains stdout and stderr to completion.
    /// A failed channel open is treated as transport death; exec and
    /// read failures leave the session connected for the next command.
    fn run(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        self.ensure_connected()?;
        let address = self.address();
        let Some(session) = self.session.as_ref() else {
            return Err(SessionError::Connect {
                address,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "session unavailable",
                ),
            });
        };

        let mut channel = match session.channel_session() {
            Ok(channel) => channel,
            Err(source) => {
                warn!(host = %self.config.name, error = %source, "channel open failed, dropping session");
                self.session = None;
                self.state = SessionState::Disconnected;
                return Err(SessionError::Channel { address, source });
            }
        };

        channel
            .exec(command)
            .map_err(|source| SessionError::Exec {
                address: address.clone(),
                source,
            })?;

        let mut stdout_bytes = Vec::new();
        channel
            .read_to_end(&mut stdout_bytes)
            .map_err(|source| SessionError::Read {
                address: address.clone(),
                source,
            })?;
        let mut stderr_bytes = Vec::new();
        channel
            .stderr()
            .read_to_end(&mut stderr_bytes)
            .map_err(|source| SessionError::Read {
                address: address.clone(),
                source,
            })?;
        let _ = channel.wait_close();
        debug!(host = %self.config.name, command, "command completed");

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        })
    }

    /// Idempotent; safe to call on a never-connected session.
    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "shutting down", None);
            info!(host = %self.config.name, "ssh session closed");
        }
        self.state = SessionState::Disconnected;
    }
}

fn resolve_first(hostname: &str, port: u16) -> Result<SocketAddr, SessionError> {
    let address = format!("{hostname}:{port}");
    (hostname, port)
        .to_socket_addrs()
        .map_err(|source| SessionError::Resolve {
            address: address.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| SessionError::Resolve {
            address,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn unreachable_host() -> HostConfig {
        // Bind to an ephemeral port, then free it so the connect is
        // refused.
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);
        HostConfig {
            name: "dead".to_string(),
            hostname: "127.0.0.1".to_string(),
            port,
            username: "monitor".to_string(),
            password: "secret".to_string(),
        }
    }

    fn session_for(config: HostConfig) -> SshSession {
        SshSession::new(
            config,
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn run_on_unreachable_host_reports_connect_error() {
        let mut session = session_for(unreachable_host());
        let err = session.run("free -m").unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn close_is_idempotent_without_a_connection() {
        let mut session = session_for(unreachable_host());
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
