//! High-level SSH client.
//!
//! [`SshClient`] bundles a [`Session`] with the usual client workflow:
//! connect, check the host key, authenticate, run commands.
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::client::SshClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SshClient::connect("127.0.0.1:22").await?;
//! client.authenticate_password("user", "password").await?;
//!
//! let output = client.exec("ls -la").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::InteractiveHandler;
use crate::ssh::hostkey::{PublicKey, Signable};
use crate::ssh::packet::BufferedStream;
use crate::ssh::session::Session;
use crate::ssh::transport::{HostKeyVerifier, Transport, TransportConfig};
use kestrel_platform::{KestrelError, KestrelResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::info;

/// SSH client configuration.
pub struct SshClientConfig {
    /// Transport settings (algorithms, windows, timeouts).
    pub transport: TransportConfig,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Only accept this server key.
    pub host_key: Option<PublicKey>,
    /// Called with the server key when `host_key` is not set.
    ///
    /// With neither set, any key that proves itself is accepted.
    pub host_key_verifier: Option<HostKeyVerifier>,
}

// Manual Debug implementation because HostKeyVerifier is not Debug
impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("transport", &self.transport)
            .field("connect_timeout", &self.connect_timeout)
            .field("host_key", &self.host_key)
            .field(
                "host_key_verifier",
                &self.host_key_verifier.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::new(true),
            connect_timeout: Duration::from_secs(30),
            host_key: None,
            host_key_verifier: None,
        }
    }
}

/// Result of [`SshClient::exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Everything the command wrote to stdout.
    pub stdout: Vec<u8>,
    /// Everything the command wrote to stderr.
    pub stderr: Vec<u8>,
    /// Exit status, or -1 if the server never sent one.
    pub exit_status: i32,
}

/// SSH client.
pub struct SshClient<T = TcpStream> {
    session: Session<T>,
    server_addr: String,
}

impl SshClient<TcpStream> {
    /// Connects with the default configuration.
    pub async fn connect(addr: &str) -> KestrelResult<Self> {
        Self::connect_with_config(addr, SshClientConfig::default()).await
    }

    /// Connects over TCP and completes the first key exchange.
    pub async fn connect_with_config(addr: &str, config: SshClientConfig) -> KestrelResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                KestrelError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Connection timeout",
                ))
            })??;
        stream.set_nodelay(true)?;
        Self::handshake(stream, addr, config).await
    }
}

impl<T> SshClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the client over an already connected stream.
    pub async fn handshake(io: T, server_addr: &str, config: SshClientConfig) -> KestrelResult<Self> {
        if !config.transport.is_client {
            return Err(KestrelError::Config(
                "Client config must be in client mode".to_string(),
            ));
        }
        let mut transport = Transport::new(BufferedStream::new(), config.transport);
        if let Some(key) = config.host_key {
            transport.pin_host_key(key);
        } else if let Some(verifier) = config.host_key_verifier {
            transport.set_host_key_verifier(verifier);
        }

        let mut session = Session::new(io, transport);
        session.start_client().await?;
        info!("Connected to {}", server_addr);

        Ok(Self {
            session,
            server_addr: server_addr.to_string(),
        })
    }

    /// Authenticates with a password.
    pub async fn authenticate_password(&mut self, username: &str, password: &str) -> KestrelResult<()> {
        let next = self.session.auth_password(username, password).await?;
        self.require_complete(next)
    }

    /// Authenticates with a private key.
    pub async fn authenticate_publickey(
        &mut self,
        username: &str,
        key: Arc<dyn Signable>,
    ) -> KestrelResult<()> {
        let next = self.session.auth_publickey(username, key).await?;
        self.require_complete(next)
    }

    /// Authenticates by answering keyboard-interactive prompts.
    pub async fn authenticate_interactive(
        &mut self,
        username: &str,
        handler: InteractiveHandler,
    ) -> KestrelResult<()> {
        let next = self.session.auth_interactive(username, handler, "").await?;
        self.require_complete(next)
    }

    fn require_complete(&self, next: Vec<String>) -> KestrelResult<()> {
        if next.is_empty() {
            Ok(())
        } else {
            Err(KestrelError::Auth(format!(
                "Partial authentication; still required: {}",
                next.join(",")
            )))
        }
    }

    /// Runs `command` on a fresh session channel and collects its output.
    pub async fn exec(&mut self, command: &str) -> KestrelResult<ExecOutput> {
        if !self.is_authenticated() {
            return Err(KestrelError::Auth("Not authenticated".to_string()));
        }
        let chanid = self.session.open_session().await?;
        self.session.exec(chanid, command).await?;
        let (stdout, stderr) = self.session.read_to_end(chanid).await?;
        let exit_status = self.session.recv_exit_status(chanid).await?;
        self.session.close_channel(chanid).await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_status,
        })
    }

    /// Forces a new key exchange.
    pub async fn rekey(&mut self) -> KestrelResult<()> {
        self.session.renegotiate_keys().await
    }

    /// Disconnects.
    pub async fn disconnect(&mut self) -> KestrelResult<()> {
        self.session.close().await
    }

    /// Returns the authenticated username.
    pub fn username(&self) -> Option<&str> {
        self.session.transport().get_username()
    }

    /// Returns the server address.
    pub fn server_address(&self) -> &str {
        &self.server_addr
    }

    /// Returns whether authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.session.transport().is_authenticated()
    }

    /// Returns the server's verified host key.
    pub fn server_host_key(&self) -> Option<&PublicKey> {
        self.session.transport().get_remote_server_key()
    }

    /// Borrows the underlying session for channel-level work.
    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }
}

impl<T> std::fmt::Debug for SshClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("server_addr", &self.server_addr)
            .field("session", &self.session)
            .finish()
    }
}
