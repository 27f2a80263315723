//! Async driver for a [`Transport`].
//!
//! The transport itself never touches a socket. A [`Session`] owns a tokio
//! byte stream and shuttles bytes between it and a
//! `Transport<BufferedStream>`: queued output is written, input is read and
//! fed, and [`Transport::run`] processes it. Each helper drives this loop
//! until the state it waits for shows up.
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::packet::BufferedStream;
//! use kestrel_proto::ssh::session::Session;
//! use kestrel_proto::ssh::transport::{Transport, TransportConfig};
//!
//! # async fn example() -> kestrel_platform::KestrelResult<()> {
//! let transport = Transport::new(BufferedStream::new(), TransportConfig::new(true));
//! let mut session = Session::connect("127.0.0.1:22", transport).await?;
//! session.auth_password("robey", "foo").await?;
//!
//! let chanid = session.open_session().await?;
//! session.exec(chanid, "ls").await?;
//! let (stdout, _stderr) = session.read_to_end(chanid).await?;
//! println!("{}", String::from_utf8_lossy(&stdout));
//! # Ok(())
//! # }
//! ```

pub mod keepalive;

pub use keepalive::KeepaliveTask;

use crate::ssh::auth::{AuthStatus, InteractiveHandler};
use crate::ssh::channel::Channel;
use crate::ssh::hostkey::Signable;
use crate::ssh::packet::BufferedStream;
use crate::ssh::server::ServerInterface;
use crate::ssh::transport::{GlobalResponse, Transport};
use kestrel_platform::{KestrelError, KestrelResult};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, info};

const READ_CHUNK: usize = 32 * 1024;

/// A transport bound to a tokio byte stream.
pub struct Session<T> {
    io: T,
    transport: Transport<BufferedStream>,
    read_buf: Vec<u8>,
    keepalive: Option<KeepaliveTask>,
    ticks: Option<mpsc::Receiver<()>>,
}

impl Session<TcpStream> {
    /// Connects over TCP and completes the first key exchange.
    ///
    /// `transport` must be in client mode; pin or verify the host key on it
    /// before calling.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        transport: Transport<BufferedStream>,
    ) -> KestrelResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        if let Ok(peer) = stream.peer_addr() {
            info!("Connecting to {}", peer);
        }
        let mut session = Session::new(stream, transport);
        session.start_client().await?;
        Ok(session)
    }
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an unstarted transport.
    pub fn new(io: T, transport: Transport<BufferedStream>) -> Self {
        Self {
            io,
            transport,
            read_buf: vec![0u8; READ_CHUNK],
            keepalive: None,
            ticks: None,
        }
    }

    /// Borrows the transport.
    pub fn transport(&self) -> &Transport<BufferedStream> {
        &self.transport
    }

    /// Mutably borrows the transport. Changes go out on the next drive.
    pub fn transport_mut(&mut self) -> &mut Transport<BufferedStream> {
        &mut self.transport
    }

    /// Starts the client side and waits for the first key exchange.
    pub async fn start_client(&mut self) -> KestrelResult<()> {
        self.transport.start_client()?;
        self.handshake().await
    }

    /// Starts the server side and waits for the first key exchange.
    pub async fn start_server(&mut self, server: Box<dyn ServerInterface>) -> KestrelResult<()> {
        self.transport.start_server(server)?;
        self.handshake().await
    }

    async fn handshake(&mut self) -> KestrelResult<()> {
        let banner_timeout = self.transport.config().banner_timeout;
        let banner = self.drive_until(|t| t.remote_version().is_some());
        match tokio::time::timeout(banner_timeout, banner).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(KestrelError::Protocol(
                    "Error reading SSH protocol banner".to_string(),
                ))
            }
        }
        self.drive_until(|t| t.initial_kex_done()).await?;
        let interval = self.transport.config().keepalive_interval;
        self.set_keepalive(interval);
        Ok(())
    }

    /// Enables (or with `None` disables) keepalives.
    pub fn set_keepalive(&mut self, interval: Option<std::time::Duration>) {
        self.transport.set_keepalive(interval);
        if let Some(mut task) = self.keepalive.take() {
            task.stop();
        }
        self.ticks = None;
        if let Some(interval) = interval {
            let mut task = KeepaliveTask::new(interval);
            self.ticks = Some(task.start());
            self.keepalive = Some(task);
        }
    }

    // driving

    /// Runs the transport until `done` holds.
    ///
    /// Fails with `Closed` if the session ends first.
    pub async fn drive_until<F>(&mut self, mut done: F) -> KestrelResult<()>
    where
        F: FnMut(&mut Transport<BufferedStream>) -> bool,
    {
        loop {
            self.transport.run()?;
            self.write_out().await?;
            if done(&mut self.transport) {
                return Ok(());
            }
            if !self.transport.is_active() {
                return Err(KestrelError::Closed("SSH session not active".to_string()));
            }
            self.read_in().await?;
        }
    }

    /// One read, one run, one write. A dead transport has unlinked every
    /// channel, so callers polling a channel see end of stream.
    async fn drive_once(&mut self) -> KestrelResult<()> {
        if !self.transport.is_active() {
            return Ok(());
        }
        self.transport.flush()?;
        self.write_out().await?;
        self.read_in().await?;
        self.transport.run()?;
        self.write_out().await
    }

    async fn write_out(&mut self) -> KestrelResult<()> {
        let out = self.transport.stream_mut().take_written();
        if !out.is_empty() {
            self.io.write_all(&out).await?;
            self.io.flush().await?;
        }
        Ok(())
    }

    async fn read_in(&mut self) -> KestrelResult<()> {
        tokio::select! {
            n = self.io.read(&mut self.read_buf) => {
                let n = n?;
                if n == 0 {
                    debug!("EOF in transport");
                    self.transport.stream_mut().set_eof();
                } else {
                    self.transport.stream_mut().feed(&self.read_buf[..n]);
                }
            }
            Some(()) = next_tick(&mut self.ticks) => {
                self.transport.check_keepalive()?;
            }
        }
        Ok(())
    }

    // authentication

    /// Authenticates with a password.
    ///
    /// Returns the methods still required after a partial success (empty
    /// when fully authenticated).
    pub async fn auth_password(&mut self, username: &str, password: &str) -> KestrelResult<Vec<String>> {
        self.transport.auth_password(username, password)?;
        self.wait_for_auth().await
    }

    /// Authenticates with a private key.
    pub async fn auth_publickey(
        &mut self,
        username: &str,
        key: Arc<dyn Signable>,
    ) -> KestrelResult<Vec<String>> {
        self.transport.auth_publickey(username, key)?;
        self.wait_for_auth().await
    }

    /// Tries the `none` method, mostly to learn the allowed methods.
    pub async fn auth_none(&mut self, username: &str) -> KestrelResult<Vec<String>> {
        self.transport.auth_none(username)?;
        self.wait_for_auth().await
    }

    /// Authenticates by answering keyboard-interactive prompts.
    pub async fn auth_interactive(
        &mut self,
        username: &str,
        handler: InteractiveHandler,
        submethods: &str,
    ) -> KestrelResult<Vec<String>> {
        self.transport.auth_interactive(username, handler, submethods)?;
        self.wait_for_auth().await
    }

    async fn wait_for_auth(&mut self) -> KestrelResult<Vec<String>> {
        self.drive_until(|t| !matches!(t.auth_status(), AuthStatus::Pending))
            .await?;
        match self.transport.auth_status() {
            AuthStatus::Success => Ok(Vec::new()),
            AuthStatus::Partial(next) => Ok(next.clone()),
            AuthStatus::BadMethod(allowed) => Err(KestrelError::Auth(format!(
                "Bad authentication type; allowed types: {:?}",
                allowed
            ))),
            _ => Err(KestrelError::Auth("Authentication failed.".to_string())),
        }
    }

    // channels

    /// Opens a session channel and waits for the peer's answer.
    pub async fn open_session(&mut self) -> KestrelResult<u32> {
        let chanid = self.transport.open_session()?;
        self.drive_until(|t| match t.channel(chanid) {
            Some(chan) => chan.is_active() || chan.is_closed() || chan.open_error().is_some(),
            None => true,
        })
        .await?;

        match self.transport.channel(chanid) {
            Some(chan) if chan.is_active() => Ok(chanid),
            Some(chan) => match chan.open_error() {
                Some((code, reason)) => Err(KestrelError::Channel {
                    code,
                    reason: reason.to_string(),
                }),
                None => Err(KestrelError::Closed("Channel closed.".to_string())),
            },
            None => Err(KestrelError::Closed("Channel closed.".to_string())),
        }
    }

    /// Waits for the peer to open a channel to us.
    pub async fn accept(&mut self) -> KestrelResult<u32> {
        let mut accepted = None;
        self.drive_until(|t| {
            accepted = t.accept();
            accepted.is_some()
        })
        .await?;
        accepted.ok_or_else(|| KestrelError::Closed("SSH session not active".to_string()))
    }

    /// Runs `command` on a session channel and waits for the answer.
    pub async fn exec(&mut self, chanid: u32, command: &str) -> KestrelResult<()> {
        self.channel_mut(chanid)?.exec_command(command)?;
        self.wait_for_request(chanid).await
    }

    /// Starts a shell on a session channel.
    pub async fn invoke_shell(&mut self, chanid: u32) -> KestrelResult<()> {
        self.channel_mut(chanid)?.invoke_shell()?;
        self.wait_for_request(chanid).await
    }

    /// Starts a subsystem such as `sftp`.
    pub async fn invoke_subsystem(&mut self, chanid: u32, name: &str) -> KestrelResult<()> {
        self.channel_mut(chanid)?.invoke_subsystem(name)?;
        self.wait_for_request(chanid).await
    }

    async fn wait_for_request(&mut self, chanid: u32) -> KestrelResult<()> {
        self.drive_until(|t| match t.channel(chanid) {
            Some(chan) => chan.last_request_status().is_some() || chan.is_closed(),
            None => true,
        })
        .await?;
        match self.transport.channel(chanid).and_then(|c| c.last_request_status()) {
            Some(true) => Ok(()),
            _ => Err(KestrelError::Closed("Channel request failed".to_string())),
        }
    }

    /// Sends all of `data`, waiting for window space as needed.
    pub async fn send_all(&mut self, chanid: u32, data: &[u8]) -> KestrelResult<()> {
        self.channel_mut(chanid)?.sendall(data)?;
        self.drive_until(|t| match t.channel(chanid) {
            Some(chan) => chan.pending_len() == 0 || chan.is_closed(),
            None => true,
        })
        .await
    }

    /// Receives up to `nbytes`; empty at end of stream.
    ///
    /// Honors the channel timeout, if one is set.
    pub async fn recv(&mut self, chanid: u32, nbytes: usize) -> KestrelResult<Vec<u8>> {
        let limit = self.channel_mut(chanid)?.gettimeout();
        with_timeout(limit, self.recv_inner(chanid, nbytes, false)).await
    }

    /// Receives up to `nbytes` of stderr; empty at end of stream.
    pub async fn recv_stderr(&mut self, chanid: u32, nbytes: usize) -> KestrelResult<Vec<u8>> {
        let limit = self.channel_mut(chanid)?.gettimeout();
        with_timeout(limit, self.recv_inner(chanid, nbytes, true)).await
    }

    async fn recv_inner(&mut self, chanid: u32, nbytes: usize, stderr: bool) -> KestrelResult<Vec<u8>> {
        loop {
            let chan = self.channel_mut(chanid)?;
            let got = if stderr {
                chan.recv_stderr(nbytes)
            } else {
                chan.recv(nbytes)
            };
            match got {
                Ok(data) => {
                    // window adjusts may be waiting
                    self.transport.flush()?;
                    self.write_out().await?;
                    return Ok(data);
                }
                Err(KestrelError::WouldBlock) => self.drive_once().await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads stdout and stderr until the peer sends EOF or closes.
    pub async fn read_to_end(&mut self, chanid: u32) -> KestrelResult<(Vec<u8>, Vec<u8>)> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let chan = self.channel_mut(chanid)?;
            while chan.recv_ready() {
                stdout.extend(chan.recv(READ_CHUNK)?);
            }
            while chan.recv_stderr_ready() {
                stderr.extend(chan.recv_stderr(READ_CHUNK)?);
            }
            if chan.eof_received() || chan.is_closed() {
                break;
            }
            self.transport.flush()?;
            self.drive_until(|t| match t.channel(chanid) {
                Some(chan) => {
                    chan.recv_ready()
                        || chan.recv_stderr_ready()
                        || chan.eof_received()
                        || chan.is_closed()
                }
                None => true,
            })
            .await?;
        }
        self.transport.flush()?;
        self.write_out().await?;
        Ok((stdout, stderr))
    }

    /// Waits for the exit status of the command on `chanid`.
    pub async fn recv_exit_status(&mut self, chanid: u32) -> KestrelResult<i32> {
        self.drive_until(|t| match t.channel(chanid) {
            Some(chan) => chan.exit_status_ready(),
            None => true,
        })
        .await?;
        Ok(self.channel_mut(chanid)?.recv_exit_status())
    }

    /// Closes a channel, waits for the peer's CLOSE, then forgets it.
    ///
    /// Returns the exit status, which the peer may still send after our
    /// CLOSE went out.
    pub async fn close_channel(&mut self, chanid: u32) -> KestrelResult<i32> {
        self.channel_mut(chanid)?.close();
        self.transport.flush()?;
        self.write_out().await?;
        self.drive_until(|t| t.channel(chanid).map_or(true, |c| c.is_unlinked()))
            .await?;
        Ok(self
            .transport
            .release_channel(chanid)
            .map_or(-1, |c| c.recv_exit_status()))
    }

    fn channel_mut(&mut self, chanid: u32) -> KestrelResult<&mut Channel> {
        self.transport
            .channel_mut(chanid)
            .ok_or_else(|| KestrelError::Closed(format!("No such channel {}", chanid)))
    }

    // global requests

    /// Sends a global request and waits for the answer.
    pub async fn global_request(&mut self, kind: &str, data: &[u8]) -> KestrelResult<GlobalResponse> {
        self.transport.global_request(kind, data, true)?;
        let mut response = None;
        self.drive_until(|t| {
            response = t.take_global_response();
            response.is_some()
        })
        .await?;
        response.ok_or_else(|| KestrelError::Closed("SSH session not active".to_string()))
    }

    /// Forces a new key exchange and waits for it to finish.
    pub async fn renegotiate_keys(&mut self) -> KestrelResult<()> {
        self.transport.renegotiate_keys()?;
        self.drive_until(|t| !t.kex_in_progress()).await
    }

    /// Sends DISCONNECT and shuts the stream down.
    pub async fn close(&mut self) -> KestrelResult<()> {
        if let Some(mut task) = self.keepalive.take() {
            task.stop();
        }
        self.ticks = None;
        self.transport.close();
        self.write_out().await?;
        self.io.shutdown().await?;
        Ok(())
    }
}

impl<T> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.transport)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

async fn next_tick(ticks: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match ticks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn with_timeout<F, R>(limit: Option<std::time::Duration>, fut: F) -> KestrelResult<R>
where
    F: Future<Output = KestrelResult<R>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| KestrelError::Io(io::Error::new(io::ErrorKind::TimedOut, "Channel timed out")))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::transport::TransportConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_banner_timeout() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let mut config = TransportConfig::new(true);
        config.banner_timeout = Duration::from_millis(50);
        let mut session = Session::new(client_io, Transport::new(BufferedStream::new(), config));

        let err = session.start_client().await.unwrap_err();
        assert!(err.to_string().contains("SSH protocol banner"));
    }

    #[tokio::test]
    async fn test_peer_hangup_during_handshake() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        drop(server_io);
        let mut session = Session::new(
            client_io,
            Transport::new(BufferedStream::new(), TransportConfig::new(true)),
        );
        assert!(session.start_client().await.is_err());
        assert!(!session.transport().is_active());
    }

    #[tokio::test]
    async fn test_auth_before_kex_is_rejected() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let mut session = Session::new(
            client_io,
            Transport::new(BufferedStream::new(), TransportConfig::new(true)),
        );
        let err = session.auth_password("u", "p").await.unwrap_err();
        assert!(matches!(err, KestrelError::Closed(_)));
    }
}
