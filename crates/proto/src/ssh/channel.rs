//! SSH channels (RFC 4254 Section 5).
//!
//! A [`Channel`] is one flow-controlled duplex stream multiplexed over the
//! transport. It behaves like a non-blocking socket:
//!
//! - `recv` returns buffered data, an empty vector at end of stream, or
//!   [`KestrelError::WouldBlock`] when nothing has arrived yet
//! - `send` writes as much as the peer's window allows and reports how much
//!   that was; it returns `Ok(0)` once the channel is closed for writing
//!
//! Channels never touch the packetizer. Outbound messages collect in a
//! per-channel outbox that the transport drains after every operation, so
//! they are held back while a rekey is in progress.
//!
//! ```text
//! INACTIVE --open confirmation--> ACTIVE --EOF / CLOSE--> CLOSED
//! ```

use crate::ssh::message::{Message, MessageType};
use crate::ssh::server::{PtyRequest, ServerInterface, X11Request};
use bytes::BytesMut;
use kestrel_platform::{KestrelError, KestrelResult};
use rand::RngCore;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// Lower bound on the max packet size we accept from the peer.
pub const MIN_PACKET_SIZE: u32 = 1024;

/// Bytes kept free in each CHANNEL_DATA for the message header.
const PACKET_OVERHEAD: u32 = 64;

/// Channel ids wrap at 2^24.
const CHANNEL_ID_MASK: u32 = 0x00ff_ffff;

/// Peer-closed channels kept for collection; the oldest is dropped beyond this.
pub const CLOSED_CHANNEL_BACKLOG: usize = 64;

/// Extended data type for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// A multiplexed channel.
#[derive(Debug)]
pub struct Channel {
    chanid: u32,
    remote_chanid: u32,
    kind: String,
    name: String,

    active: bool,
    closed: bool,
    eof_received: bool,
    eof_sent: bool,
    unlinked: bool,

    in_buffer: BytesMut,
    in_stderr_buffer: BytesMut,
    combine_stderr: bool,

    in_window_size: u32,
    in_max_packet_size: u32,
    in_window_threshold: u32,
    in_window_sofar: u32,
    out_window_size: u32,
    out_max_packet_size: u32,

    pending_out: Vec<u8>,
    pending_stderr: Vec<u8>,

    exit_status: i32,
    last_request: Option<bool>,
    open_error: Option<(u32, String)>,
    origin_addr: Option<(String, u32)>,
    x11_requested: bool,
    timeout: Option<Duration>,

    outbox: Vec<Message>,
}

impl Channel {
    /// Creates an inactive channel with local id `chanid`.
    pub fn new(chanid: u32, kind: &str) -> Self {
        Self {
            chanid,
            remote_chanid: 0,
            kind: kind.to_string(),
            name: chanid.to_string(),
            active: false,
            closed: false,
            eof_received: false,
            eof_sent: false,
            unlinked: false,
            in_buffer: BytesMut::new(),
            in_stderr_buffer: BytesMut::new(),
            combine_stderr: false,
            in_window_size: 0,
            in_max_packet_size: 0,
            in_window_threshold: 0,
            in_window_sofar: 0,
            out_window_size: 0,
            out_max_packet_size: 0,
            pending_out: Vec::new(),
            pending_stderr: Vec::new(),
            exit_status: -1,
            last_request: None,
            open_error: None,
            origin_addr: None,
            x11_requested: false,
            timeout: None,
            outbox: Vec::new(),
        }
    }

    /// Local channel id.
    pub fn get_id(&self) -> u32 {
        self.chanid
    }

    /// Channel id assigned by the peer.
    pub fn remote_id(&self) -> u32 {
        self.remote_chanid
    }

    /// Channel type, e.g. `session`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Name used in log lines; defaults to the id.
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Renames the channel for logging.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// True once the peer confirmed the open.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True once closed locally or by the peer.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True after the peer sent EOF (or after `shutdown_read`).
    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    /// True after we sent EOF.
    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    /// Bytes we may still send before the peer adjusts the window.
    pub fn out_window_size(&self) -> u32 {
        self.out_window_size
    }

    /// `(code, text)` if the peer rejected the open.
    pub fn open_error(&self) -> Option<(u32, &str)> {
        self.open_error.as_ref().map(|(c, s)| (*c, s.as_str()))
    }

    /// Reply to the most recent request: `Some(true)` for success.
    pub fn last_request_status(&self) -> Option<bool> {
        self.last_request
    }

    /// Originating address of a forwarded channel.
    pub fn origin_addr(&self) -> Option<(&str, u32)> {
        self.origin_addr.as_ref().map(|(a, p)| (a.as_str(), *p))
    }

    /// Advisory timeout the async driver applies to blocking calls.
    pub fn settimeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// See [`Channel::settimeout`].
    pub fn gettimeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn check_open(&self) -> KestrelResult<()> {
        if self.closed || self.eof_received || self.eof_sent || !self.active {
            return Err(KestrelError::Closed("Channel is not open".to_string()));
        }
        Ok(())
    }

    fn request(&self, kind: &str, want_reply: bool) -> Message {
        let mut m = Message::with_type(MessageType::ChannelRequest);
        m.add_int(self.remote_chanid)
            .add_string(kind)
            .add_boolean(want_reply);
        m
    }

    // requests

    /// Requests a pseudo-terminal.
    pub fn get_pty(&mut self, term: &str, width: u32, height: u32) -> KestrelResult<()> {
        self.check_open()?;
        let mut m = self.request("pty-req", true);
        m.add_string(term)
            .add_int(width)
            .add_int(height)
            .add_int(0)
            .add_int(0)
            .add_string(b"");
        self.last_request = None;
        self.outbox.push(m);
        Ok(())
    }

    /// Requests an interactive shell.
    pub fn invoke_shell(&mut self) -> KestrelResult<()> {
        self.check_open()?;
        let m = self.request("shell", true);
        self.last_request = None;
        self.outbox.push(m);
        Ok(())
    }

    /// Runs `command` on the server.
    pub fn exec_command(&mut self, command: &str) -> KestrelResult<()> {
        self.check_open()?;
        let mut m = self.request("exec", true);
        m.add_string(command);
        self.last_request = None;
        self.outbox.push(m);
        Ok(())
    }

    /// Requests a subsystem, e.g. `sftp`.
    pub fn invoke_subsystem(&mut self, subsystem: &str) -> KestrelResult<()> {
        self.check_open()?;
        let mut m = self.request("subsystem", true);
        m.add_string(subsystem);
        self.last_request = None;
        self.outbox.push(m);
        Ok(())
    }

    /// Resizes the pseudo-terminal.
    pub fn resize_pty(&mut self, width: u32, height: u32) -> KestrelResult<()> {
        self.check_open()?;
        let mut m = self.request("window-change", true);
        m.add_int(width).add_int(height).add_int(0).add_int(0);
        self.last_request = None;
        self.outbox.push(m);
        Ok(())
    }

    /// Sends a command's exit status (server side).
    ///
    /// Allowed after EOF, since the status usually follows the output.
    pub fn send_exit_status(&mut self, status: u32) -> KestrelResult<()> {
        if self.closed {
            return Err(KestrelError::Closed("Channel is not open".to_string()));
        }
        let mut m = self.request("exit-status", false);
        m.add_int(status);
        self.outbox.push(m);
        Ok(())
    }

    /// Requests X11 forwarding and returns the cookie used.
    ///
    /// Defaults to `MIT-MAGIC-COOKIE-1` with a random 128-bit hex cookie.
    pub fn request_x11(
        &mut self,
        screen_number: u32,
        auth_protocol: Option<&str>,
        auth_cookie: Option<&str>,
        single_connection: bool,
    ) -> KestrelResult<String> {
        self.check_open()?;
        let protocol = auth_protocol.unwrap_or("MIT-MAGIC-COOKIE-1");
        let cookie = match auth_cookie {
            Some(c) => c.to_string(),
            None => {
                let mut raw = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut raw);
                hex::encode(raw)
            }
        };

        let mut m = self.request("x11-req", true);
        m.add_boolean(single_connection)
            .add_string(protocol)
            .add_string(&cookie)
            .add_int(screen_number);
        self.last_request = None;
        self.outbox.push(m);
        self.x11_requested = true;
        Ok(cookie)
    }

    /// Merges stderr into the main stream; returns the previous setting.
    pub fn set_combine_stderr(&mut self, combine: bool) -> bool {
        let old = self.combine_stderr;
        self.combine_stderr = combine;
        if combine && !old && !self.in_stderr_buffer.is_empty() {
            let data = self.in_stderr_buffer.split();
            self.in_buffer.extend_from_slice(&data);
        }
        old
    }

    /// True once the exit status will not change any more.
    pub fn exit_status_ready(&self) -> bool {
        self.closed
    }

    /// Exit status from the peer, or -1 if none was sent.
    pub fn recv_exit_status(&self) -> i32 {
        self.exit_status
    }

    // reading

    /// True if `recv` would return data now.
    pub fn recv_ready(&self) -> bool {
        !self.in_buffer.is_empty()
    }

    /// True if `recv_stderr` would return data now.
    pub fn recv_stderr_ready(&self) -> bool {
        !self.in_stderr_buffer.is_empty()
    }

    /// Takes up to `nbytes` from the main stream.
    ///
    /// Returns an empty vector at end of stream.
    pub fn recv(&mut self, nbytes: usize) -> KestrelResult<Vec<u8>> {
        if self.in_buffer.is_empty() {
            return self.end_or_block();
        }
        let n = nbytes.min(self.in_buffer.len());
        let out = self.in_buffer.split_to(n).to_vec();
        self.ack(out.len());
        Ok(out)
    }

    /// Takes up to `nbytes` from the stderr stream.
    pub fn recv_stderr(&mut self, nbytes: usize) -> KestrelResult<Vec<u8>> {
        if self.in_stderr_buffer.is_empty() {
            return self.end_or_block();
        }
        let n = nbytes.min(self.in_stderr_buffer.len());
        let out = self.in_stderr_buffer.split_to(n).to_vec();
        self.ack(out.len());
        Ok(out)
    }

    fn end_or_block(&self) -> KestrelResult<Vec<u8>> {
        if self.closed || self.eof_received {
            Ok(Vec::new())
        } else {
            Err(KestrelError::WouldBlock)
        }
    }

    fn ack(&mut self, consumed: usize) {
        let ack = self.check_add_window(consumed as u32);
        if ack > 0 {
            let mut m = Message::with_type(MessageType::ChannelWindowAdjust);
            m.add_int(self.remote_chanid).add_int(ack);
            self.outbox.push(m);
        }
    }

    /// Accumulates consumed bytes; returns the adjust to send, if due.
    fn check_add_window(&mut self, n: u32) -> u32 {
        if self.closed || self.eof_received || !self.active {
            return 0;
        }
        self.in_window_sofar = self.in_window_sofar.saturating_add(n);
        if self.in_window_sofar <= self.in_window_threshold {
            return 0;
        }
        std::mem::take(&mut self.in_window_sofar)
    }

    // writing

    /// True if `send` would not block.
    pub fn send_ready(&self) -> bool {
        if self.closed || self.eof_sent {
            return true;
        }
        self.out_window_size > 0
    }

    /// Reserves up to `size` bytes of send window.
    ///
    /// `Ok(0)` means the channel no longer accepts data.
    fn wait_for_send_window(&mut self, size: usize) -> KestrelResult<u32> {
        if self.closed || self.eof_sent {
            return Ok(0);
        }
        if self.out_window_size == 0 {
            return Err(KestrelError::WouldBlock);
        }
        let size = u32::try_from(size)
            .unwrap_or(u32::MAX)
            .min(self.out_window_size)
            .min(self.out_max_packet_size.saturating_sub(PACKET_OVERHEAD));
        self.out_window_size -= size;
        Ok(size)
    }

    fn send_chunk(&mut self, data: &[u8], stderr: bool) -> KestrelResult<usize> {
        let size = self.wait_for_send_window(data.len())? as usize;
        if size == 0 {
            return Ok(0);
        }
        let m = if stderr {
            let mut m = Message::with_type(MessageType::ChannelExtendedData);
            m.add_int(self.remote_chanid)
                .add_int(EXTENDED_DATA_STDERR)
                .add_string(&data[..size]);
            m
        } else {
            let mut m = Message::with_type(MessageType::ChannelData);
            m.add_int(self.remote_chanid).add_string(&data[..size]);
            m
        };
        self.outbox.push(m);
        Ok(size)
    }

    /// Sends as much of `data` as the window allows.
    pub fn send(&mut self, data: &[u8]) -> KestrelResult<usize> {
        if !self.pending_out.is_empty() {
            return Err(KestrelError::WouldBlock);
        }
        self.send_chunk(data, false)
    }

    /// Sends on the stderr stream (server side).
    pub fn send_stderr(&mut self, data: &[u8]) -> KestrelResult<usize> {
        if !self.pending_stderr.is_empty() {
            return Err(KestrelError::WouldBlock);
        }
        self.send_chunk(data, true)
    }

    /// Queues all of `data`; whatever the window refuses now goes out as
    /// WINDOW_ADJUST messages arrive.
    pub fn sendall(&mut self, data: &[u8]) -> KestrelResult<()> {
        if self.closed {
            return Err(KestrelError::Closed("Socket is closed".to_string()));
        }
        self.pending_out.extend_from_slice(data);
        self.drain_pending()
    }

    /// [`Channel::sendall`] for the stderr stream.
    pub fn sendall_stderr(&mut self, data: &[u8]) -> KestrelResult<()> {
        if self.closed {
            return Err(KestrelError::Closed("Socket is closed".to_string()));
        }
        self.pending_stderr.extend_from_slice(data);
        self.drain_pending()
    }

    /// Bytes accepted by `sendall` but not yet sent.
    pub fn pending_len(&self) -> usize {
        self.pending_out.len() + self.pending_stderr.len()
    }

    fn drain_pending(&mut self) -> KestrelResult<()> {
        for stderr in [false, true] {
            loop {
                let pending = if stderr {
                    std::mem::take(&mut self.pending_stderr)
                } else {
                    std::mem::take(&mut self.pending_out)
                };
                if pending.is_empty() {
                    break;
                }
                let sent = match self.send_chunk(&pending, stderr) {
                    Ok(n) => n,
                    Err(KestrelError::WouldBlock) => 0,
                    Err(e) => return Err(e),
                };
                let rest = if self.closed || self.eof_sent {
                    Vec::new()
                } else {
                    pending[sent..].to_vec()
                };
                if stderr {
                    self.pending_stderr = rest;
                } else {
                    self.pending_out = rest;
                }
                if sent == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    // shutdown

    /// Shuts down reading (0), writing (1) or both (2).
    pub fn shutdown(&mut self, how: u8) {
        if how == 0 || how == 2 {
            self.eof_received = true;
        }
        if how == 1 || how == 2 {
            if let Some(m) = self.send_eof() {
                self.outbox.push(m);
            }
        }
    }

    /// Equivalent to `shutdown(0)`.
    pub fn shutdown_read(&mut self) {
        self.shutdown(0);
    }

    /// Equivalent to `shutdown(1)`.
    pub fn shutdown_write(&mut self) {
        self.shutdown(1);
    }

    /// Sends EOF and CLOSE and drops any unread data.
    ///
    /// The channel stays registered until the peer's CLOSE arrives.
    pub fn close(&mut self) {
        if !self.active || self.closed {
            return;
        }
        let msgs = self.close_internal();
        self.outbox.extend(msgs);
        self.in_buffer.clear();
        self.in_stderr_buffer.clear();
    }

    fn send_eof(&mut self) -> Option<Message> {
        if self.eof_sent {
            return None;
        }
        let mut m = Message::with_type(MessageType::ChannelEof);
        m.add_int(self.remote_chanid);
        self.eof_sent = true;
        debug!(chanid = self.chanid, "EOF sent ({})", self.name);
        Some(m)
    }

    fn close_internal(&mut self) -> Vec<Message> {
        if !self.active || self.closed {
            return Vec::new();
        }
        let mut msgs = Vec::with_capacity(2);
        msgs.extend(self.send_eof());
        let mut close = Message::with_type(MessageType::ChannelClose);
        close.add_int(self.remote_chanid);
        msgs.push(close);
        self.closed = true;
        self.pending_out.clear();
        self.pending_stderr.clear();
        msgs
    }

    // calls from the transport

    pub(crate) fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn take_x11_requested(&mut self) -> bool {
        std::mem::take(&mut self.x11_requested)
    }

    pub(crate) fn is_unlinked(&self) -> bool {
        self.unlinked
    }

    pub(crate) fn set_origin_addr(&mut self, addr: &str, port: u32) {
        self.origin_addr = Some((addr.to_string(), port));
    }

    pub(crate) fn set_window(&mut self, window_size: u32, max_packet_size: u32) {
        self.in_window_size = window_size;
        self.in_max_packet_size = max_packet_size;
        self.in_window_threshold = window_size / 10;
        self.in_window_sofar = 0;
        debug!(chanid = self.chanid, "Max packet in: {} bytes", max_packet_size);
    }

    pub(crate) fn set_remote_channel(&mut self, chanid: u32, window_size: u32, max_packet_size: u32) {
        self.remote_chanid = chanid;
        self.out_window_size = window_size;
        self.out_max_packet_size = max_packet_size.max(MIN_PACKET_SIZE);
        self.active = true;
        debug!(chanid = self.chanid, "Max packet out: {} bytes", max_packet_size);
    }

    pub(crate) fn open_failed(&mut self, code: u32, reason: &str) {
        self.open_error = Some((code, reason.to_string()));
        self.closed = true;
        self.unlinked = true;
    }

    pub(crate) fn request_success(&mut self) {
        debug!(chanid = self.chanid, "Sesch channel {} request ok", self.chanid);
        self.last_request = Some(true);
    }

    pub(crate) fn request_failed(&mut self) {
        self.last_request = Some(false);
        let msgs = self.close_internal();
        self.outbox.extend(msgs);
    }

    pub(crate) fn feed(&mut self, m: &mut Message) -> KestrelResult<()> {
        let s = m.get_string()?;
        if self.eof_received {
            warn!(chanid = self.chanid, "Received {} bytes of data after EOF; dropped", s.len());
            return Ok(());
        }
        self.in_buffer.extend_from_slice(&s);
        Ok(())
    }

    pub(crate) fn feed_extended(&mut self, m: &mut Message) -> KestrelResult<()> {
        let code = m.get_int()?;
        let s = m.get_string()?;
        if code != EXTENDED_DATA_STDERR {
            warn!(chanid = self.chanid, "unknown extended_data type {}; discarding", code);
            return Ok(());
        }
        if self.eof_received {
            warn!(chanid = self.chanid, "Received {} bytes of stderr after EOF; dropped", s.len());
            return Ok(());
        }
        if self.combine_stderr {
            self.in_buffer.extend_from_slice(&s);
        } else {
            self.in_stderr_buffer.extend_from_slice(&s);
        }
        Ok(())
    }

    pub(crate) fn window_adjust(&mut self, m: &mut Message) -> KestrelResult<()> {
        let nbytes = m.get_int()?;
        self.out_window_size = self.out_window_size.saturating_add(nbytes);
        self.drain_pending()
    }

    pub(crate) fn handle_request(
        &mut self,
        m: &mut Message,
        server: Option<&mut (dyn ServerInterface + 'static)>,
    ) -> KestrelResult<()> {
        let key = m.get_text()?;
        let want_reply = m.get_boolean()?;
        let chanid = self.chanid;

        let ok = match key.as_str() {
            "exit-status" => {
                self.exit_status = m.get_int()? as i32;
                true
            }
            "xon-xoff" => true,
            "pty-req" => {
                let pty = PtyRequest {
                    term: m.get_text()?,
                    width: m.get_int()?,
                    height: m.get_int()?,
                    pixel_width: m.get_int()?,
                    pixel_height: m.get_int()?,
                    modes: m.get_string()?,
                };
                server.is_some_and(|s| s.check_channel_pty_request(chanid, &pty))
            }
            "shell" => server.is_some_and(|s| s.check_channel_shell_request(chanid)),
            "exec" => {
                let cmd = m.get_string()?;
                server.is_some_and(|s| s.check_channel_exec_request(chanid, &cmd))
            }
            "subsystem" => {
                let name = m.get_text()?;
                server.is_some_and(|s| s.check_channel_subsystem_request(chanid, &name))
            }
            "window-change" => {
                let (w, h, pw, ph) = (m.get_int()?, m.get_int()?, m.get_int()?, m.get_int()?);
                server.is_some_and(|s| s.check_channel_window_change_request(chanid, w, h, pw, ph))
            }
            "x11-req" => {
                let req = X11Request {
                    single_connection: m.get_boolean()?,
                    auth_protocol: m.get_text()?,
                    auth_cookie: m.get_text()?,
                    screen_number: m.get_int()?,
                };
                server.is_some_and(|s| s.check_channel_x11_request(chanid, &req))
            }
            other => {
                debug!(chanid, "Unhandled channel request \"{}\"", other);
                false
            }
        };

        if want_reply {
            let mt = if ok {
                MessageType::ChannelSuccess
            } else {
                MessageType::ChannelFailure
            };
            let mut reply = Message::with_type(mt);
            reply.add_int(self.remote_chanid);
            self.outbox.push(reply);
        }
        Ok(())
    }

    pub(crate) fn handle_eof(&mut self) {
        self.eof_received = true;
        debug!(chanid = self.chanid, "EOF received ({})", self.name);
    }

    /// Peer CLOSE: answer it and leave the live table. Buffered data stays
    /// readable until the channel is released or ages out of the backlog.
    pub(crate) fn handle_close(&mut self) {
        let msgs = self.close_internal();
        self.outbox.extend(msgs);
        self.closed = true;
        self.unlinked = true;
    }

    /// Transport teardown.
    pub(crate) fn unlink(&mut self) {
        self.closed = true;
        self.unlinked = true;
    }
}

/// Live channels, recently closed ones, and every id ever handed out.
#[derive(Debug)]
pub struct ChannelTable {
    channels: BTreeMap<u32, Channel>,
    retired: VecDeque<Channel>,
    seen: HashSet<u32>,
    counter: u32,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self {
            channels: BTreeMap::new(),
            retired: VecDeque::new(),
            seen: HashSet::new(),
            counter: 1,
        }
    }
}

impl ChannelTable {
    /// Creates an empty table; ids start at 1.
    pub fn new() -> Self {
        Self::default()
    }

    fn in_use(&self, chanid: u32) -> bool {
        self.channels.contains_key(&chanid) || self.retired.iter().any(|c| c.chanid == chanid)
    }

    /// Allocates the next id not held by a registered or retired channel.
    pub fn next_channel(&mut self) -> u32 {
        let mut chanid = self.counter;
        while self.in_use(chanid) {
            self.counter = (self.counter + 1) & CHANNEL_ID_MASK;
            chanid = self.counter;
        }
        self.counter = (self.counter + 1) & CHANNEL_ID_MASK;
        chanid
    }

    /// Registers a channel under its own id.
    pub fn insert(&mut self, channel: Channel) {
        self.seen.insert(channel.chanid);
        self.channels.insert(channel.chanid, channel);
    }

    /// Any registered or retired channel.
    pub fn get(&self, chanid: u32) -> Option<&Channel> {
        self.channels
            .get(&chanid)
            .or_else(|| self.retired.iter().find(|c| c.chanid == chanid))
    }

    /// Mutable access to any registered or retired channel.
    pub fn get_mut(&mut self, chanid: u32) -> Option<&mut Channel> {
        if self.channels.contains_key(&chanid) {
            return self.channels.get_mut(&chanid);
        }
        self.retired.iter_mut().find(|c| c.chanid == chanid)
    }

    /// A channel still linked to the transport.
    pub fn live_mut(&mut self, chanid: u32) -> Option<&mut Channel> {
        self.channels.get_mut(&chanid).filter(|c| !c.unlinked)
    }

    /// True if `chanid` was ever allocated on this transport.
    pub fn was_seen(&self, chanid: u32) -> bool {
        self.seen.contains(&chanid)
    }

    /// Moves a channel the peer closed out of the live table.
    ///
    /// It stays reachable through [`ChannelTable::get`] until released or
    /// pushed out by [`CLOSED_CHANNEL_BACKLOG`] newer closures.
    pub fn retire(&mut self, chanid: u32) {
        let Some(chan) = self.channels.remove(&chanid) else {
            return;
        };
        self.retired.push_back(chan);
        while self.retired.len() > CLOSED_CHANNEL_BACKLOG {
            if let Some(old) = self.retired.pop_front() {
                debug!(chanid = old.chanid, "Dropping uncollected channel {}", old.chanid);
            }
        }
    }

    /// Frees `chanid` for reuse; returns the channel if it was still held.
    pub fn release(&mut self, chanid: u32) -> Option<Channel> {
        if let Some(chan) = self.channels.remove(&chanid) {
            return Some(chan);
        }
        let pos = self.retired.iter().position(|c| c.chanid == chanid)?;
        self.retired.remove(pos)
    }

    /// Iterates over the registered (not retired) channels.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.values_mut()
    }

    /// Number of registered channels, not counting retired ones.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True if no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Number of peer-closed channels awaiting collection.
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_channel(window: u32, max_packet: u32) -> Channel {
        let mut c = Channel::new(1, "session");
        c.set_window(2_097_152, 32768);
        c.set_remote_channel(7, window, max_packet);
        c
    }

    fn body(msg: &Message) -> (u8, Message) {
        let bytes = msg.as_bytes();
        (bytes[0], Message::from_bytes(&bytes[1..]))
    }

    fn data_msg(data: &[u8]) -> Message {
        let mut m = Message::new();
        m.add_string(data);
        Message::from_bytes(m.as_bytes())
    }

    fn adjust_msg(n: u32) -> Message {
        let mut m = Message::new();
        m.add_int(n);
        Message::from_bytes(m.as_bytes())
    }

    #[test]
    fn test_inactive_channel_refuses_requests() {
        let mut c = Channel::new(1, "session");
        assert!(matches!(c.exec_command("ls"), Err(KestrelError::Closed(_))));
        assert_eq!(c.recv_exit_status(), -1);
    }

    #[test]
    fn test_exec_request_layout() {
        let mut c = open_channel(1000, 32768);
        c.exec_command("echo hi").unwrap();
        let out = c.take_outbox();
        let (ptype, mut m) = body(&out[0]);
        assert_eq!(ptype, MessageType::ChannelRequest as u8);
        assert_eq!(m.get_int().unwrap(), 7);
        assert_eq!(m.get_text().unwrap(), "exec");
        assert!(m.get_boolean().unwrap());
        assert_eq!(m.get_text().unwrap(), "echo hi");
    }

    #[test]
    fn test_send_respects_window_and_packet_size() {
        let mut c = open_channel(100, 32768);
        assert_eq!(c.send(&[0u8; 60]).unwrap(), 60);
        assert_eq!(c.send(&[0u8; 60]).unwrap(), 40);
        assert_eq!(c.out_window_size(), 0);
        assert!(!c.send_ready());
        assert!(matches!(c.send(b"x"), Err(KestrelError::WouldBlock)));

        c.window_adjust(&mut adjust_msg(10)).unwrap();
        assert!(c.send_ready());
        assert_eq!(c.send(&[0u8; 60]).unwrap(), 10);

        // max packet floor of 1024, minus header room
        let mut c = open_channel(1 << 20, 10);
        assert_eq!(c.send(&[0u8; 5000]).unwrap(), 1024 - 64);
    }

    #[test]
    fn test_sendall_drains_on_window_adjust() {
        let mut c = open_channel(10, 32768);
        c.sendall(&[1u8; 25]).unwrap();
        assert_eq!(c.pending_len(), 15);
        assert_eq!(c.take_outbox().len(), 1);

        c.window_adjust(&mut adjust_msg(100)).unwrap();
        assert_eq!(c.pending_len(), 0);
        let out = c.take_outbox();
        assert_eq!(out.len(), 1);
        let (_, mut m) = body(&out[0]);
        m.get_int().unwrap();
        assert_eq!(m.get_string().unwrap().len(), 15);
    }

    #[test]
    fn test_window_adjust_batched_at_threshold() {
        let mut c = Channel::new(1, "session");
        c.set_window(1000, 32768);
        c.set_remote_channel(7, 1000, 32768);
        c.feed(&mut data_msg(&[b'a'; 150])).unwrap();

        assert_eq!(c.recv(100).unwrap().len(), 100);
        assert!(c.take_outbox().is_empty());

        assert_eq!(c.recv(50).unwrap().len(), 50);
        let out = c.take_outbox();
        assert_eq!(out.len(), 1);
        let (ptype, mut m) = body(&out[0]);
        assert_eq!(ptype, MessageType::ChannelWindowAdjust as u8);
        assert_eq!(m.get_int().unwrap(), 7);
        assert_eq!(m.get_int().unwrap(), 150);
    }

    #[test]
    fn test_recv_would_block_then_eof() {
        let mut c = open_channel(1000, 32768);
        assert!(matches!(c.recv(10), Err(KestrelError::WouldBlock)));
        c.feed(&mut data_msg(b"hi\n")).unwrap();
        c.handle_eof();
        assert_eq!(c.recv(10).unwrap(), b"hi\n");
        assert!(c.recv(10).unwrap().is_empty());
        // no adjust accounting after EOF
        assert!(c.take_outbox().is_empty());
    }

    #[test]
    fn test_data_after_eof_dropped() {
        let mut c = open_channel(1000, 32768);
        c.handle_eof();
        c.feed(&mut data_msg(b"late")).unwrap();
        assert!(!c.recv_ready());
    }

    #[test]
    fn test_extended_data_routing() {
        let mut c = open_channel(1000, 32768);
        let mut m = Message::new();
        m.add_int(1).add_string(b"err");
        c.feed_extended(&mut Message::from_bytes(m.as_bytes())).unwrap();
        assert_eq!(c.recv_stderr(10).unwrap(), b"err");

        let mut m = Message::new();
        m.add_int(2).add_string(b"odd");
        c.feed_extended(&mut Message::from_bytes(m.as_bytes())).unwrap();
        assert!(!c.recv_stderr_ready());

        let mut m = Message::new();
        m.add_int(1).add_string(b"more");
        c.feed_extended(&mut Message::from_bytes(m.as_bytes())).unwrap();
        assert!(!c.set_combine_stderr(true));
        assert_eq!(c.recv(10).unwrap(), b"more");
    }

    #[test]
    fn test_close_handshake() {
        let mut c = open_channel(1000, 32768);
        c.shutdown_write();
        c.shutdown_write();
        c.close();
        let types: Vec<u8> = c.take_outbox().iter().map(|m| m.as_bytes()[0]).collect();
        assert_eq!(
            types,
            vec![MessageType::ChannelEof as u8, MessageType::ChannelClose as u8]
        );
        assert!(c.is_closed());
        assert!(!c.is_unlinked());
        assert_eq!(c.send(b"x").unwrap(), 0);

        // peer CLOSE completes the handshake without sending again
        c.handle_close();
        assert!(c.take_outbox().is_empty());
        assert!(c.is_unlinked());
    }

    #[test]
    fn test_peer_close_keeps_buffered_data_and_status() {
        let mut c = open_channel(1000, 32768);
        c.feed(&mut data_msg(b"hi\n")).unwrap();
        let mut m = Message::new();
        m.add_string("exit-status").add_boolean(false).add_int(3);
        c.handle_request(&mut Message::from_bytes(m.as_bytes()), None).unwrap();
        c.handle_eof();
        c.handle_close();

        assert!(c.exit_status_ready());
        assert_eq!(c.recv_exit_status(), 3);
        assert_eq!(c.recv(100).unwrap(), b"hi\n");
        let types: Vec<u8> = c.take_outbox().iter().map(|m| m.as_bytes()[0]).collect();
        assert_eq!(
            types,
            vec![MessageType::ChannelEof as u8, MessageType::ChannelClose as u8]
        );
    }

    #[test]
    fn test_request_reply_only_when_wanted() {
        let mut c = open_channel(1000, 32768);
        let mut m = Message::new();
        m.add_string("shell").add_boolean(true);
        c.handle_request(&mut Message::from_bytes(m.as_bytes()), None).unwrap();
        let out = c.take_outbox();
        assert_eq!(out[0].as_bytes()[0], MessageType::ChannelFailure as u8);

        let mut m = Message::new();
        m.add_string("xon-xoff").add_boolean(false).add_boolean(true);
        c.handle_request(&mut Message::from_bytes(m.as_bytes()), None).unwrap();
        assert!(c.take_outbox().is_empty());
    }

    #[test]
    fn test_request_failed_closes() {
        let mut c = open_channel(1000, 32768);
        c.request_failed();
        assert!(c.is_closed());
        assert_eq!(c.last_request_status(), Some(false));
    }

    #[test]
    fn test_x11_cookie_default() {
        let mut c = open_channel(1000, 32768);
        let cookie = c.request_x11(0, None, None, false).unwrap();
        assert_eq!(cookie.len(), 32);
        assert!(c.take_x11_requested());
    }

    #[test]
    fn test_channel_table_ids() {
        let mut t = ChannelTable::new();
        let a = t.next_channel();
        assert_eq!(a, 1);
        t.insert(Channel::new(a, "session"));
        t.counter = 1;
        // skips an id still registered
        assert_eq!(t.next_channel(), 2);

        t.get_mut(a).unwrap().unlink();
        assert!(t.live_mut(a).is_none());
        assert!(t.was_seen(a));
        assert!(t.release(a).is_some());
        assert!(t.was_seen(a));

        t.counter = CHANNEL_ID_MASK;
        assert_eq!(t.next_channel(), CHANNEL_ID_MASK);
        assert_eq!(t.next_channel(), 0);
    }

    #[test]
    fn test_retired_channels_stay_readable_then_age_out() {
        let mut t = ChannelTable::new();
        let first = t.next_channel();
        let mut chan = open_channel(1000, 32768);
        chan.chanid = first;
        chan.feed(&mut data_msg(b"late")).unwrap();
        chan.handle_close();
        t.insert(chan);
        t.retire(first);

        assert!(t.is_empty());
        assert!(t.live_mut(first).is_none());
        // a retired id is not handed out again while it is held
        assert_ne!(t.next_channel(), first);
        assert_eq!(t.get_mut(first).unwrap().recv(100).unwrap(), b"late");

        for _ in 0..CLOSED_CHANNEL_BACKLOG {
            let id = t.next_channel();
            t.insert(Channel::new(id, "session"));
            t.retire(id);
        }
        assert_eq!(t.retired_len(), CLOSED_CHANNEL_BACKLOG);
        assert!(t.get(first).is_none());
        assert!(t.release(first).is_none());
    }
}
