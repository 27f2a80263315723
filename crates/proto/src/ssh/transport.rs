//! SSH transport orchestration (RFC 4253, RFC 4254).
//!
//! A [`Transport`] owns one [`Packetizer`] and everything multiplexed over
//! it: key exchange, user authentication and channels. It is sans-IO. The
//! caller feeds received bytes into the underlying [`ByteStream`], calls
//! [`Transport::run`] to process whatever is complete, and ships whatever
//! the stream has queued for writing. [`crate::ssh::session::Session`] does
//! this over a tokio socket.
//!
//! # Lifecycle
//!
//! ```text
//! start_client / start_server      banner written
//!          |
//!   peer banner read  ------------> KEXINIT sent, KEXINIT expected
//!          |
//!   kex engine packets (30..49)
//!          |
//!   NEWKEYS out, NEWKEYS in  ------> encrypted, session_id fixed
//!          |
//!   userauth, channels, global requests
//! ```
//!
//! A rekey (requested by the packetizer's volume counters or by
//! [`Transport::renegotiate_keys`]) repeats the exchange. User traffic is
//! held back until the new keys are active in both directions.

use crate::ssh::auth::{AuthContext, AuthHandler, AuthMethod, AuthStatus, InteractiveHandler};
use crate::ssh::channel::{Channel, ChannelTable};
use crate::ssh::crypto::{
    CipherAlgorithm, CipherDirection, CompressionAlgorithm, HashAlgorithm, MacAlgorithm, MacKey,
    PacketCipher, ZlibCompressor, ZlibDecompressor,
};
use crate::ssh::hostkey::{PublicKey, Signable, Verifiable};
use crate::ssh::kex::{
    derive_key, engine_for, GexBits, KexContext, KexEngine, KexInit, KexResult, KexStep,
    NegotiatedAlgorithms, SUPPORTED_KEX,
};
use crate::ssh::message::{disconnect, Message, MessageType};
use crate::ssh::packet::{ByteStream, Packetizer, RekeyLimits, REKEY_BYTES, REKEY_PACKETS};
use crate::ssh::server::{open_failure, ServerInterface, OPEN_SUCCEEDED};
use crate::ssh::version::Version;
use kestrel_platform::{KestrelError, KestrelResult};
use rand::{Rng, RngCore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default max packet size for our channels.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1 << 15;

/// Default receive window for our channels.
pub const DEFAULT_WINDOW_SIZE: u32 = 64 * DEFAULT_MAX_PACKET_SIZE;

/// Global request sent as a keepalive.
pub const KEEPALIVE_REQUEST: &str = "keepalive@lag.net";

/// Decides whether a server host key is acceptable.
pub type HostKeyVerifier = Box<dyn FnMut(&PublicKey) -> bool + Send>;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Transport layer configuration.
///
/// # Example
///
/// ```rust
/// use kestrel_proto::ssh::transport::TransportConfig;
///
/// let mut config = TransportConfig::new(true);
/// config.ciphers = vec!["aes256-ctr".to_string()];
/// assert_eq!(config.window_size, 64 * config.max_packet_size);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Whether we are the client (true) or server (false).
    pub is_client: bool,

    /// Our identification line.
    pub software_version: Version,

    /// Key exchange methods, most preferred first.
    pub kex_algorithms: Vec<String>,

    /// Host key types, most preferred first.
    pub host_key_algorithms: Vec<String>,

    /// Ciphers, most preferred first.
    pub ciphers: Vec<String>,

    /// MACs, most preferred first.
    pub macs: Vec<String>,

    /// Offer zlib compression.
    pub use_compression: bool,

    /// Initial receive window for channels we open or accept.
    pub window_size: u32,

    /// Largest CHANNEL_DATA we accept.
    pub max_packet_size: u32,

    /// How long the async driver waits for the peer banner (default: 15 s).
    pub banner_timeout: Duration,

    /// Send a keepalive after this much outbound silence.
    pub keepalive_interval: Option<Duration>,

    /// Packets per direction before rekeying (default: 2^29).
    pub rekey_packets: u64,

    /// Bytes per direction before rekeying (default: 2^29).
    pub rekey_bytes: u64,

    /// Group-exchange modulus sizes requested by a client.
    pub gex_bits: GexBits,

    /// Use the old group-exchange request that carries only the preferred size.
    pub gex_old_style: bool,
}

impl TransportConfig {
    /// Creates a configuration with the default algorithm preferences.
    pub fn new(is_client: bool) -> Self {
        Self {
            is_client,
            software_version: Version::default_kestrel(),
            kex_algorithms: names(SUPPORTED_KEX),
            host_key_algorithms: names(&["ssh-ed25519", "ssh-rsa", "ssh-dss"]),
            ciphers: names(&["aes128-ctr", "aes256-ctr", "aes128-cbc", "aes256-cbc"]),
            macs: names(&["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1", "hmac-sha1-96"]),
            use_compression: false,
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            banner_timeout: Duration::from_secs(15),
            keepalive_interval: None,
            rekey_packets: REKEY_PACKETS,
            rekey_bytes: REKEY_BYTES,
            gex_bits: GexBits::default(),
            gex_old_style: false,
        }
    }

    fn compression_list(&self) -> Vec<String> {
        if self.use_compression {
            names(&["zlib@openssh.com", "zlib", "none"])
        } else {
            names(&["none"])
        }
    }

    fn rekey_limits(&self) -> RekeyLimits {
        RekeyLimits {
            packets: self.rekey_packets,
            bytes: self.rekey_bytes,
            ..RekeyLimits::default()
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Reply to the last global request we sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalResponse {
    /// REQUEST_SUCCESS with any response-specific data
    Success(Vec<u8>),
    /// REQUEST_FAILURE
    Failure,
}

/// Key exchange bookkeeping; cleared when NEWKEYS arrives.
#[derive(Default)]
struct KexState {
    engine: Option<Box<dyn KexEngine>>,
    local_init: Option<KexInit>,
    local_kex_init: Option<Vec<u8>>,
    remote_kex_init: Option<Vec<u8>>,
    agreed: Option<NegotiatedAlgorithms>,
    result: Option<KexResult>,
    hash: Option<HashAlgorithm>,
    expected: Vec<u8>,
    in_kex: bool,
    initial_done: bool,
}

impl KexState {
    fn reset(&mut self) {
        self.engine = None;
        self.local_init = None;
        self.local_kex_init = None;
        self.remote_kex_init = None;
        self.result = None;
        self.hash = None;
    }
}

/// An SSH session over one byte stream.
pub struct Transport<S: ByteStream> {
    config: TransportConfig,
    packetizer: Packetizer<S>,
    server_mode: bool,
    active: bool,
    got_banner: bool,
    local_version: String,
    remote_version: Option<String>,
    session_id: Option<Vec<u8>>,

    host_key_type: Option<String>,
    host_key: Option<PublicKey>,
    pinned_key: Option<PublicKey>,
    host_key_verifier: Option<HostKeyVerifier>,
    server_keys: Vec<Arc<dyn Signable>>,
    server: Option<Box<dyn ServerInterface>>,

    kex: KexState,
    local_compression: CompressionAlgorithm,
    remote_compression: CompressionAlgorithm,
    clear_to_send: bool,
    pending_user: VecDeque<Message>,
    auth_trigger_pending: bool,
    remote_disconnect: Option<(u32, String)>,

    auth: AuthHandler,
    channels: ChannelTable,
    accept_queue: VecDeque<u32>,
    x11_forwarding: bool,
    tcp_forwards: Vec<(String, u32)>,
    global_response: Option<GlobalResponse>,
}

impl<S: ByteStream> Transport<S> {
    /// Wraps `stream`. Nothing is sent until `start_client`/`start_server`.
    pub fn new(stream: S, config: TransportConfig) -> Self {
        let server_mode = !config.is_client;
        let mut packetizer = Packetizer::new(stream);
        packetizer.set_rekey_limits(config.rekey_limits());
        packetizer.set_keepalive(config.keepalive_interval);

        Self {
            local_version: config.software_version.to_string(),
            config,
            packetizer,
            server_mode,
            active: false,
            got_banner: false,
            remote_version: None,
            session_id: None,
            host_key_type: None,
            host_key: None,
            pinned_key: None,
            host_key_verifier: None,
            server_keys: Vec::new(),
            server: None,
            kex: KexState::default(),
            local_compression: CompressionAlgorithm::None,
            remote_compression: CompressionAlgorithm::None,
            clear_to_send: false,
            pending_user: VecDeque::new(),
            auth_trigger_pending: false,
            remote_disconnect: None,
            auth: AuthHandler::new(server_mode),
            channels: ChannelTable::new(),
            accept_queue: VecDeque::new(),
            x11_forwarding: false,
            tcp_forwards: Vec::new(),
            global_response: None,
        }
    }

    // setup

    /// Adds a host key the server can prove possession of.
    pub fn add_server_key(&mut self, key: Arc<dyn Signable>) {
        self.server_keys.retain(|k| k.name() != key.name());
        self.server_keys.push(key);
    }

    /// Installs a callback that accepts or rejects the server's host key.
    pub fn set_host_key_verifier(&mut self, verifier: HostKeyVerifier) {
        self.host_key_verifier = Some(verifier);
    }

    /// Accepts only `key` from the server, and asks for its type only.
    pub fn pin_host_key(&mut self, key: PublicKey) {
        self.pinned_key = Some(key);
    }

    /// Starts the client side: writes our banner.
    pub fn start_client(&mut self) -> KestrelResult<()> {
        if self.server_mode {
            return Err(KestrelError::Config(
                "Transport is configured for server mode".to_string(),
            ));
        }
        self.start()
    }

    /// Starts the server side: writes our banner.
    ///
    /// At least one host key must have been added.
    pub fn start_server(&mut self, server: Box<dyn ServerInterface>) -> KestrelResult<()> {
        if !self.server_mode {
            return Err(KestrelError::Config(
                "Transport is configured for client mode".to_string(),
            ));
        }
        if self.server_keys.is_empty() {
            return Err(KestrelError::Config(
                "Server mode requires a host key".to_string(),
            ));
        }
        self.server = Some(server);
        self.start()
    }

    fn start(&mut self) -> KestrelResult<()> {
        self.active = true;
        let banner = self.config.software_version.to_wire_format();
        self.packetizer.write_all(&banner)
    }

    // accessors

    /// Configuration this transport was built with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// True until the session ends.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True on the server side.
    pub fn is_server(&self) -> bool {
        self.server_mode
    }

    /// True once userauth has succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.active && self.auth.is_authenticated()
    }

    /// Username bound by authentication, if any.
    pub fn get_username(&self) -> Option<&str> {
        self.auth.get_username()
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// The server's host key, once verified (client side).
    pub fn get_remote_server_key(&self) -> Option<&PublicKey> {
        self.host_key.as_ref()
    }

    /// Peer identification line.
    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.as_deref()
    }

    /// True once the first key exchange has completed.
    pub fn initial_kex_done(&self) -> bool {
        self.kex.initial_done
    }

    /// True while keys are being (re)negotiated.
    pub fn kex_in_progress(&self) -> bool {
        self.kex.in_kex
    }

    /// Algorithms agreed in the current or last exchange.
    pub fn agreed_algorithms(&self) -> Option<&NegotiatedAlgorithms> {
        self.kex.agreed.as_ref()
    }

    /// Client-side authentication progress.
    pub fn auth_status(&self) -> &AuthStatus {
        self.auth.status()
    }

    /// Banner sent by the server during authentication.
    pub fn auth_banner(&self) -> Option<&str> {
        self.auth.banner()
    }

    /// Reason code and text of the DISCONNECT the peer sent, if any.
    pub fn remote_disconnect(&self) -> Option<(u32, &str)> {
        self.remote_disconnect
            .as_ref()
            .map(|(code, desc)| (*code, desc.as_str()))
    }

    /// Borrows the packetizer, e.g. to inspect counters.
    pub fn packetizer(&self) -> &Packetizer<S> {
        &self.packetizer
    }

    /// Mutably borrows the underlying stream to feed or drain bytes.
    pub fn stream_mut(&mut self) -> &mut S {
        self.packetizer.stream_mut()
    }

    // main loop

    /// Processes every complete inbound packet, then flushes channel output.
    ///
    /// Returns `Ok(())` when more bytes are needed. Any error is fatal: a
    /// DISCONNECT is attempted and the transport closes.
    pub fn run(&mut self) -> KestrelResult<()> {
        if !self.active {
            return Ok(());
        }
        let result = match self.pump() {
            Err(KestrelError::WouldBlock) => Ok(()),
            other => other,
        };
        match result.and_then(|_| self.flush()) {
            Ok(()) => Ok(()),
            Err(KestrelError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("EOF in transport");
                self.shutdown();
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn pump(&mut self) -> KestrelResult<()> {
        if !self.got_banner {
            self.check_banner()?;
        }
        while self.active {
            if self.packetizer.need_rekey() && !self.kex.in_kex {
                self.send_kex_init()?;
            }
            let (ptype, mut m) = self.packetizer.read_message()?;
            self.dispatch(ptype, &mut m)?;
        }
        Ok(())
    }

    fn check_banner(&mut self) -> KestrelResult<()> {
        let line = loop {
            let line = self.packetizer.read_line()?;
            if line.starts_with("SSH-") {
                break line;
            }
            debug!("Banner: {}", line);
        };
        let version = Version::parse(&line)?;
        info!(
            "Connected (version {}, client {})",
            version.proto_version(),
            version.software()
        );
        self.remote_version = Some(line);
        self.got_banner = true;

        self.send_kex_init()?;
        self.kex.expected = vec![MessageType::KexInit as u8];
        Ok(())
    }

    fn dispatch(&mut self, ptype: u8, m: &mut Message) -> KestrelResult<()> {
        match MessageType::from_u8(ptype) {
            Some(MessageType::Ignore) => return Ok(()),
            Some(MessageType::Disconnect) => return self.parse_disconnect(m),
            Some(MessageType::Debug) => return self.parse_debug(m),
            _ => {}
        }

        if !self.kex.expected.is_empty() {
            if !self.kex.expected.contains(&ptype) {
                return Err(KestrelError::Protocol(format!(
                    "Expecting packet from {:?}, got {}",
                    self.kex.expected, ptype
                )));
            }
            self.kex.expected.clear();
            if (30..=49).contains(&ptype) {
                return self.parse_kex_packet(ptype, m);
            }
        }

        let Some(mt) = MessageType::from_u8(ptype) else {
            return self.unhandled(ptype, m);
        };
        match mt {
            MessageType::KexInit => self.negotiate_keys(m),
            MessageType::NewKeys => self.parse_newkeys(),
            MessageType::Unimplemented => {
                debug!("Peer could not handle packet {}", m.get_int()?);
                Ok(())
            }
            MessageType::GlobalRequest => self.parse_global_request(m),
            MessageType::RequestSuccess => {
                debug!("Global request successful.");
                self.global_response = Some(GlobalResponse::Success(m.get_remainder()));
                Ok(())
            }
            MessageType::RequestFailure => {
                debug!("Global request denied.");
                self.global_response = Some(GlobalResponse::Failure);
                Ok(())
            }
            MessageType::ChannelOpen => self.parse_channel_open(m),
            MessageType::ChannelOpenConfirmation => self.parse_channel_open_success(m),
            MessageType::ChannelOpenFailure => self.parse_channel_open_failure(m),
            MessageType::ChannelWindowAdjust
            | MessageType::ChannelData
            | MessageType::ChannelExtendedData
            | MessageType::ChannelEof
            | MessageType::ChannelClose
            | MessageType::ChannelRequest
            | MessageType::ChannelSuccess
            | MessageType::ChannelFailure => self.dispatch_channel(mt, m),
            _ if self.auth.handles(ptype) => self.dispatch_auth(ptype, m),
            _ => self.unhandled(ptype, m),
        }
    }

    fn unhandled(&mut self, ptype: u8, m: &Message) -> KestrelResult<()> {
        warn!(ptype, "Oops, unhandled type {}", ptype);
        let mut reply = Message::with_type(MessageType::Unimplemented);
        reply.add_int(m.seqno());
        self.packetizer.send_message(&reply)
    }

    fn parse_disconnect(&mut self, m: &mut Message) -> KestrelResult<()> {
        let code = m.get_int()?;
        let desc = m.get_text()?;
        info!("Disconnect (code {}): {}", code, desc);
        self.remote_disconnect = Some((code, desc));
        self.shutdown();
        Ok(())
    }

    fn parse_debug(&mut self, m: &mut Message) -> KestrelResult<()> {
        let _always_display = m.get_boolean()?;
        let text = m.get_text()?;
        debug!("Debug msg: {}", text);
        Ok(())
    }

    // outbound

    /// Sends a message that must wait for any rekey in progress.
    fn send_user_message(&mut self, msg: Message) -> KestrelResult<()> {
        if self.clear_to_send {
            self.packetizer.send_message(&msg)
        } else {
            self.pending_user.push_back(msg);
            Ok(())
        }
    }

    /// Sends whatever channels have queued.
    pub fn flush(&mut self) -> KestrelResult<()> {
        if !self.active {
            return Ok(());
        }
        let mut outgoing = Vec::new();
        for chan in self.channels.iter_mut() {
            if chan.take_x11_requested() {
                self.x11_forwarding = true;
            }
            outgoing.extend(chan.take_outbox());
        }
        for msg in outgoing {
            self.send_user_message(msg)?;
        }
        Ok(())
    }

    fn send_disconnect(&mut self, code: u32, reason: &str) -> KestrelResult<()> {
        let mut m = Message::with_type(MessageType::Disconnect);
        m.add_int(code).add_string(reason).add_string("en");
        self.packetizer.send_message(&m)
    }

    fn fail(&mut self, e: &KestrelError) {
        error!("Exception: {}", e);
        let code = match e {
            KestrelError::MacMismatch => disconnect::MAC_ERROR,
            _ if self.kex.in_kex => disconnect::KEY_EXCHANGE_FAILED,
            _ => disconnect::PROTOCOL_ERROR,
        };
        if !self.packetizer.is_closed() {
            // the stream may already be gone
            if let Err(send_err) = self.send_disconnect(code, &e.to_string()) {
                debug!("Unable to send disconnect: {}", send_err);
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.active = false;
        self.packetizer.close();
        for chan in self.channels.iter_mut() {
            chan.unlink();
        }
    }

    /// Ends the session, telling the peer why.
    pub fn close(&mut self) {
        if !self.active {
            return;
        }
        if let Err(e) = self.flush() {
            debug!("Flush before close failed: {}", e);
        }
        if let Err(e) = self.send_disconnect(disconnect::BY_APPLICATION, "Closed by application") {
            debug!("Unable to send disconnect: {}", e);
        }
        self.shutdown();
    }

    // key exchange

    fn send_kex_init(&mut self) -> KestrelResult<()> {
        self.clear_to_send = false;
        self.kex.in_kex = true;

        let host_keys = if self.server_mode {
            self.config
                .host_key_algorithms
                .iter()
                .filter(|name| self.server_keys.iter().any(|k| k.name() == name.as_str()))
                .cloned()
                .collect()
        } else if let Some(pinned) = &self.pinned_key {
            vec![pinned.name().to_string()]
        } else {
            self.config.host_key_algorithms.clone()
        };

        let init = KexInit::new(
            &self.config.kex_algorithms,
            &host_keys,
            &self.config.ciphers,
            &self.config.macs,
            &self.config.compression_list(),
        );
        let msg = init.to_message();
        self.kex.local_kex_init = Some(msg.as_bytes().to_vec());
        self.kex.local_init = Some(init);
        self.packetizer.send_message(&msg)
    }

    fn negotiate_keys(&mut self, m: &mut Message) -> KestrelResult<()> {
        self.clear_to_send = false;
        if self.kex.local_init.is_none() {
            // peer-initiated rekey
            self.send_kex_init()?;
        }
        self.kex.in_kex = true;

        let remote = KexInit::from_message(m)?;
        let mut raw = vec![MessageType::KexInit as u8];
        raw.extend_from_slice(&m.get_so_far());
        self.kex.remote_kex_init = Some(raw);

        let local = self
            .kex
            .local_init
            .as_ref()
            .ok_or_else(|| KestrelError::Protocol("No local KEXINIT".to_string()))?;
        let agreed = if self.server_mode {
            NegotiatedAlgorithms::negotiate(&remote, local)?
        } else {
            NegotiatedAlgorithms::negotiate(local, &remote)?
        };
        if remote.first_kex_packet_follows {
            debug!("Peer sent a guessed kex packet");
        }
        debug!(
            kex = %agreed.kex,
            host_key = %agreed.host_key,
            "Ciphers agreed: local={}, remote={}",
            self.local_cipher_name(&agreed),
            self.remote_cipher_name(&agreed)
        );

        let mut engine = engine_for(&agreed.kex).ok_or_else(|| {
            KestrelError::Protocol(format!("Unsupported kex algorithm {}", agreed.kex))
        })?;
        self.host_key_type = Some(agreed.host_key.clone());
        self.kex.hash = Some(engine.hash_algorithm());
        self.kex.agreed = Some(agreed);

        let step = engine.start_kex(&self.kex_context()?)?;
        self.kex.engine = Some(engine);
        self.apply_kex_step(step)
    }

    fn local_cipher_name<'a>(&self, agreed: &'a NegotiatedAlgorithms) -> &'a str {
        if self.server_mode {
            &agreed.cipher_server_to_client
        } else {
            &agreed.cipher_client_to_server
        }
    }

    fn remote_cipher_name<'a>(&self, agreed: &'a NegotiatedAlgorithms) -> &'a str {
        if self.server_mode {
            &agreed.cipher_client_to_server
        } else {
            &agreed.cipher_server_to_client
        }
    }

    fn kex_context(&self) -> KestrelResult<KexContext<'_>> {
        let missing = || KestrelError::Protocol("Key exchange state incomplete".to_string());
        let host_key = if self.server_mode {
            let kind = self.host_key_type.as_deref().ok_or_else(missing)?;
            self.server_keys
                .iter()
                .find(|k| k.name() == kind)
                .map(|k| k.as_ref() as &dyn Signable)
        } else {
            None
        };
        Ok(KexContext {
            server_mode: self.server_mode,
            local_version: &self.local_version,
            remote_version: self.remote_version.as_deref().ok_or_else(missing)?,
            local_kex_init: self.kex.local_kex_init.as_deref().ok_or_else(missing)?,
            remote_kex_init: self.kex.remote_kex_init.as_deref().ok_or_else(missing)?,
            host_key,
            gex_bits: self.config.gex_bits,
            gex_old_style: self.config.gex_old_style,
        })
    }

    fn parse_kex_packet(&mut self, ptype: u8, m: &mut Message) -> KestrelResult<()> {
        let mut engine = self.kex.engine.take().ok_or_else(|| {
            KestrelError::Protocol(format!("Kex packet {} with no exchange in progress", ptype))
        })?;
        let step = self
            .kex_context()
            .and_then(|ctx| engine.parse_next(&ctx, ptype, m));
        self.kex.engine = Some(engine);
        self.apply_kex_step(step?)
    }

    fn apply_kex_step(&mut self, step: KexStep) -> KestrelResult<()> {
        // kex packets bypass the user gate
        for msg in &step.outbound {
            self.packetizer.send_message(msg)?;
        }
        self.kex.expected = step.expect;
        if let Some(result) = step.result {
            if self.session_id.is_none() {
                self.session_id = Some(result.h.clone());
            }
            if !self.server_mode {
                self.verify_host_key(&result)?;
            }
            self.kex.result = Some(result);
            self.activate_outbound()?;
        }
        Ok(())
    }

    fn verify_host_key(&mut self, result: &KexResult) -> KestrelResult<()> {
        let key = PublicKey::from_blob(&result.host_key)
            .map_err(|_| KestrelError::Security("Unknown host key type".to_string()))?;
        if self.host_key_type.as_deref() != Some(key.name()) {
            return Err(KestrelError::Security("Unknown host key type".to_string()));
        }
        let sig = result.signature.as_deref().unwrap_or_default();
        if !key.verify_ssh_sig(&result.h, sig)? {
            return Err(KestrelError::Security(format!(
                "Signature verification ({}) failed.",
                key.name()
            )));
        }
        if self.pinned_key.as_ref().is_some_and(|pinned| pinned != &key) {
            return Err(KestrelError::Security("Bad host key from server".to_string()));
        }
        if let Some(verifier) = self.host_key_verifier.as_mut() {
            if !verifier(&key) {
                return Err(KestrelError::Security("Bad host key from server".to_string()));
            }
        }
        debug!("Server host key: {}", key.fingerprint());
        self.host_key = Some(key);
        Ok(())
    }

    /// Derives `(cipher, mac)` for one direction from the finished exchange.
    fn derive_direction(
        &self,
        cipher_name: &str,
        mac_name: &str,
        letters: [u8; 3],
        direction: CipherDirection,
    ) -> KestrelResult<(PacketCipher, MacKey)> {
        let result = self
            .kex
            .result
            .as_ref()
            .ok_or_else(|| KestrelError::Protocol("No key exchange result".to_string()))?;
        let hash = self.kex.hash.unwrap_or(HashAlgorithm::Sha1);
        let session_id = self.session_id.as_deref().unwrap_or(result.h.as_slice());

        let cipher = CipherAlgorithm::from_name(cipher_name)
            .ok_or_else(|| KestrelError::Protocol(format!("Unknown cipher {}", cipher_name)))?;
        let mac = MacAlgorithm::from_name(mac_name)
            .ok_or_else(|| KestrelError::Protocol(format!("Unknown mac {}", mac_name)))?;

        let [iv_letter, key_letter, mac_letter] = letters;
        let iv = derive_key(hash, &result.k, &result.h, iv_letter, session_id, cipher.iv_size());
        let key = derive_key(hash, &result.k, &result.h, key_letter, session_id, cipher.key_size());
        let mac_key = derive_key(hash, &result.k, &result.h, mac_letter, session_id, mac.key_size());

        Ok((
            PacketCipher::new(cipher, &key, &iv, direction)?,
            MacKey::new(mac, &mac_key)?,
        ))
    }

    fn activate_outbound(&mut self) -> KestrelResult<()> {
        self.packetizer
            .send_message(&Message::with_type(MessageType::NewKeys))?;

        let agreed = self
            .kex
            .agreed
            .clone()
            .ok_or_else(|| KestrelError::Protocol("No negotiated algorithms".to_string()))?;
        let (cipher, mac, compression, letters) = if self.server_mode {
            (
                &agreed.cipher_server_to_client,
                &agreed.mac_server_to_client,
                &agreed.compression_server_to_client,
                [b'B', b'D', b'F'],
            )
        } else {
            (
                &agreed.cipher_client_to_server,
                &agreed.mac_client_to_server,
                &agreed.compression_client_to_server,
                [b'A', b'C', b'E'],
            )
        };
        let (cipher, mac) = self.derive_direction(cipher, mac, letters, CipherDirection::Encrypt)?;
        self.packetizer.set_outbound_cipher(cipher, mac);

        let comp = CompressionAlgorithm::from_name(compression).unwrap_or(CompressionAlgorithm::None);
        if comp.is_enabled() && (!comp.is_delayed() || self.login_sent()) {
            debug!("Switching on outbound compression ...");
            self.packetizer.set_outbound_compressor(ZlibCompressor::new());
        }
        self.local_compression = comp;

        if !self.packetizer.need_rekey() {
            self.kex.in_kex = false;
        }
        self.kex.expected = vec![MessageType::NewKeys as u8];
        Ok(())
    }

    fn activate_inbound(&mut self) -> KestrelResult<()> {
        let agreed = self
            .kex
            .agreed
            .clone()
            .ok_or_else(|| KestrelError::Protocol("No negotiated algorithms".to_string()))?;
        let (cipher, mac, compression, letters) = if self.server_mode {
            (
                &agreed.cipher_client_to_server,
                &agreed.mac_client_to_server,
                &agreed.compression_client_to_server,
                [b'A', b'C', b'E'],
            )
        } else {
            (
                &agreed.cipher_server_to_client,
                &agreed.mac_server_to_client,
                &agreed.compression_server_to_client,
                [b'B', b'D', b'F'],
            )
        };
        let (cipher, mac) = self.derive_direction(cipher, mac, letters, CipherDirection::Decrypt)?;
        self.packetizer.set_inbound_cipher(cipher, mac);

        let comp = CompressionAlgorithm::from_name(compression).unwrap_or(CompressionAlgorithm::None);
        if comp.is_enabled() && (!comp.is_delayed() || self.login_sent()) {
            debug!("Switching on inbound compression ...");
            self.packetizer.set_inbound_compressor(ZlibDecompressor::new());
        }
        self.remote_compression = comp;
        Ok(())
    }

    fn parse_newkeys(&mut self) -> KestrelResult<()> {
        debug!("Switch to new keys ...");
        self.activate_inbound()?;
        self.kex.reset();
        if !self.kex.initial_done {
            self.kex.initial_done = true;
        }
        if !self.packetizer.need_rekey() {
            self.kex.in_kex = false;
        }
        self.clear_to_send = true;
        while let Some(msg) = self.pending_user.pop_front() {
            self.packetizer.send_message(&msg)?;
            if self.auth_trigger_pending
                && msg.as_bytes().first() == Some(&(MessageType::UserauthSuccess as u8))
            {
                self.auth_trigger_pending = false;
                self.auth_trigger();
            }
        }
        Ok(())
    }

    /// Starts a new key exchange; traffic continues once it completes.
    pub fn renegotiate_keys(&mut self) -> KestrelResult<()> {
        if !self.active {
            return Err(KestrelError::Closed("SSH session not active".to_string()));
        }
        if self.kex.in_kex {
            return Ok(());
        }
        self.send_kex_init()
    }

    // authentication

    fn start_auth(&mut self, username: &str, method: AuthMethod) -> KestrelResult<()> {
        if !self.active || !self.kex.initial_done {
            return Err(KestrelError::Closed("No existing session".to_string()));
        }
        let m = self.auth.start(username, method);
        self.send_user_message(m)
    }

    /// Asks for the `none` method, mainly to learn the allowed list.
    pub fn auth_none(&mut self, username: &str) -> KestrelResult<()> {
        self.start_auth(username, AuthMethod::None)
    }

    /// Authenticates with a password.
    pub fn auth_password(&mut self, username: &str, password: &str) -> KestrelResult<()> {
        self.start_auth(username, AuthMethod::Password(password.to_string()))
    }

    /// Authenticates with a private key.
    pub fn auth_publickey(&mut self, username: &str, key: Arc<dyn Signable>) -> KestrelResult<()> {
        self.start_auth(username, AuthMethod::PublicKey(key))
    }

    /// Authenticates with keyboard-interactive prompts.
    pub fn auth_interactive(
        &mut self,
        username: &str,
        handler: InteractiveHandler,
        submethods: &str,
    ) -> KestrelResult<()> {
        self.start_auth(
            username,
            AuthMethod::Interactive {
                handler,
                submethods: submethods.to_string(),
            },
        )
    }

    fn dispatch_auth(&mut self, ptype: u8, m: &mut Message) -> KestrelResult<()> {
        let session_id = self.session_id.clone().unwrap_or_default();
        let outcome = {
            let mut ctx = AuthContext {
                session_id: &session_id,
                server: self.server.as_deref_mut(),
            };
            self.auth.handle(ptype, m, &mut ctx)?
        };
        if let Some((code, reason)) = outcome.disconnect {
            // the final reply goes out even while a rekey holds user traffic
            while let Some(msg) = self.pending_user.pop_front() {
                self.packetizer.send_message(&msg)?;
            }
            for msg in &outcome.outbound {
                self.packetizer.send_message(msg)?;
            }
            info!("Disconnecting (code {}): {}", code, reason);
            self.send_disconnect(code, &reason)?;
            self.shutdown();
            return Ok(());
        }
        for msg in outcome.outbound {
            self.send_user_message(msg)?;
        }
        if outcome.authenticated {
            if self.clear_to_send {
                self.auth_trigger();
            } else {
                // SUCCESS is still queued; compress only what follows it
                self.auth_trigger_pending = true;
            }
        }
        Ok(())
    }

    /// True once USERAUTH_SUCCESS has been exchanged on the wire.
    fn login_sent(&self) -> bool {
        self.auth.is_authenticated() && !self.auth_trigger_pending
    }

    /// Turns on delayed compression once the login has succeeded.
    fn auth_trigger(&mut self) {
        if self.local_compression.is_delayed() {
            debug!("Switching on outbound compression ...");
            self.packetizer.set_outbound_compressor(ZlibCompressor::new());
        }
        if self.remote_compression.is_delayed() {
            debug!("Switching on inbound compression ...");
            self.packetizer.set_inbound_compressor(ZlibDecompressor::new());
        }
    }

    // global requests

    /// Sends a global request. With `wait`, the reply is stored for
    /// [`Transport::take_global_response`].
    pub fn global_request(&mut self, kind: &str, data: &[u8], wait: bool) -> KestrelResult<()> {
        if !self.active {
            return Err(KestrelError::Closed("SSH session not active".to_string()));
        }
        if wait {
            self.global_response = None;
        }
        let mut m = Message::with_type(MessageType::GlobalRequest);
        m.add_string(kind).add_boolean(wait).add_bytes(data);
        debug!("Sending global request \"{}\"", kind);
        self.send_user_message(m)
    }

    /// Takes the reply to the last global request, if it has arrived.
    pub fn take_global_response(&mut self) -> Option<GlobalResponse> {
        self.global_response.take()
    }

    /// Asks the server to forward `address:port` back to us.
    ///
    /// Incoming `forwarded-tcpip` channels are accepted from then on.
    pub fn request_port_forward(&mut self, address: &str, port: u32) -> KestrelResult<()> {
        let mut data = Message::new();
        data.add_string(address).add_int(port);
        self.global_request("tcpip-forward", data.as_bytes(), true)?;
        self.tcp_forwards.push((address.to_string(), port));
        Ok(())
    }

    /// Stops a forward set up by [`Transport::request_port_forward`].
    pub fn cancel_port_forward(&mut self, address: &str, port: u32) -> KestrelResult<()> {
        self.tcp_forwards.retain(|(a, p)| !(a == address && *p == port));
        let mut data = Message::new();
        data.add_string(address).add_int(port);
        self.global_request("cancel-tcpip-forward", data.as_bytes(), false)
    }

    fn parse_global_request(&mut self, m: &mut Message) -> KestrelResult<()> {
        let kind = m.get_text()?;
        let want_reply = m.get_boolean()?;
        let ok = match self.server.as_deref_mut() {
            Some(server) => server.check_global_request(&kind, m),
            None => {
                debug!("Rejecting \"{}\" global request from server.", kind);
                false
            }
        };
        if want_reply {
            let mt = if ok {
                MessageType::RequestSuccess
            } else {
                MessageType::RequestFailure
            };
            self.send_user_message(Message::with_type(mt))?;
        }
        Ok(())
    }

    /// Sends an IGNORE of `len` random bytes (10 to 40 when `None`).
    pub fn send_ignore(&mut self, len: Option<usize>) -> KestrelResult<()> {
        let mut rng = rand::thread_rng();
        let len = len.unwrap_or_else(|| rng.gen_range(10..41));
        let mut junk = vec![0u8; len];
        rng.fill_bytes(&mut junk);
        let mut m = Message::with_type(MessageType::Ignore);
        m.add_string(&junk);
        self.send_user_message(m)
    }

    /// Sends a keepalive after `interval` of outbound silence; `None` disables.
    pub fn set_keepalive(&mut self, interval: Option<Duration>) {
        self.config.keepalive_interval = interval;
        self.packetizer.set_keepalive(interval);
    }

    /// Sends the keepalive if one is due.
    pub fn check_keepalive(&mut self) -> KestrelResult<()> {
        if self.active && self.packetizer.check_keepalive() {
            self.global_request(KEEPALIVE_REQUEST, &[], false)?;
        }
        Ok(())
    }

    /// Offers compression from the next key exchange on.
    pub fn use_compression(&mut self, compress: bool) {
        self.config.use_compression = compress;
    }

    // channels

    /// Opens a `session` channel; returns its id.
    pub fn open_session(&mut self) -> KestrelResult<u32> {
        self.open_channel("session", None, None)
    }

    /// Opens an `x11` channel from `src` (server side).
    pub fn open_x11_channel(&mut self, src: (&str, u32)) -> KestrelResult<u32> {
        self.open_channel("x11", None, Some(src))
    }

    /// Opens a `forwarded-tcpip` channel (server side).
    pub fn open_forwarded_tcpip_channel(
        &mut self,
        src: (&str, u32),
        dest: (&str, u32),
    ) -> KestrelResult<u32> {
        self.open_channel("forwarded-tcpip", Some(dest), Some(src))
    }

    /// Opens a channel of any kind.
    ///
    /// `dest` and `src` are `(address, port)` pairs required by the
    /// tcpip kinds; `x11` takes only `src`.
    pub fn open_channel(
        &mut self,
        kind: &str,
        dest: Option<(&str, u32)>,
        src: Option<(&str, u32)>,
    ) -> KestrelResult<u32> {
        if !self.active {
            return Err(KestrelError::Closed("SSH session not active".to_string()));
        }
        let chanid = self.channels.next_channel();
        let mut m = Message::with_type(MessageType::ChannelOpen);
        m.add_string(kind)
            .add_int(chanid)
            .add_int(self.config.window_size)
            .add_int(self.config.max_packet_size);
        if kind == "forwarded-tcpip" || kind == "direct-tcpip" {
            let (dest, src) = dest.zip(src).ok_or_else(|| {
                KestrelError::Config(format!("{} needs source and destination", kind))
            })?;
            m.add_string(dest.0).add_int(dest.1).add_string(src.0).add_int(src.1);
        } else if kind == "x11" {
            let src = src.ok_or_else(|| KestrelError::Config("x11 needs a source".to_string()))?;
            m.add_string(src.0).add_int(src.1);
        }

        let mut chan = Channel::new(chanid, kind);
        chan.set_window(self.config.window_size, self.config.max_packet_size);
        self.channels.insert(chan);
        self.send_user_message(m)?;
        Ok(chanid)
    }

    /// Borrows a channel, including one the peer already closed.
    pub fn channel(&self, chanid: u32) -> Option<&Channel> {
        self.channels.get(chanid)
    }

    /// Mutably borrows a channel. Call [`Transport::flush`] afterwards.
    pub fn channel_mut(&mut self, chanid: u32) -> Option<&mut Channel> {
        self.channels.get_mut(chanid)
    }

    /// Forgets a channel so its id can be reused.
    ///
    /// Channels the peer closed leave the live table on their own and stay
    /// collectable here until released or aged out.
    pub fn release_channel(&mut self, chanid: u32) -> Option<Channel> {
        self.channels.release(chanid)
    }

    /// Next channel the peer opened to us, if any.
    pub fn accept(&mut self) -> Option<u32> {
        self.accept_queue.pop_front()
    }

    fn parse_channel_open(&mut self, m: &mut Message) -> KestrelResult<()> {
        let kind = m.get_text()?;
        let remote_chanid = m.get_int()?;
        let window_size = m.get_int()?;
        let max_packet_size = m.get_int()?;

        let mut origin = None;
        let (chanid, code) = if kind == "x11" && self.x11_forwarding {
            origin = Some((m.get_text()?, m.get_int()?));
            (self.channels.next_channel(), OPEN_SUCCEEDED)
        } else if kind == "forwarded-tcpip" && !self.tcp_forwards.is_empty() {
            let _server_addr = m.get_text()?;
            let _server_port = m.get_int()?;
            origin = Some((m.get_text()?, m.get_int()?));
            (self.channels.next_channel(), OPEN_SUCCEEDED)
        } else if let Some(server) = self.server.as_deref_mut() {
            if self.auth.is_authenticated() {
                let chanid = self.channels.next_channel();
                (chanid, server.check_channel_request(&kind, chanid))
            } else {
                (0, open_failure::ADMINISTRATIVELY_PROHIBITED)
            }
        } else {
            debug!("Rejecting \"{}\" channel request from server.", kind);
            (0, open_failure::ADMINISTRATIVELY_PROHIBITED)
        };

        if code != OPEN_SUCCEEDED {
            let mut reject = Message::with_type(MessageType::ChannelOpenFailure);
            reject
                .add_int(remote_chanid)
                .add_int(code)
                .add_string("")
                .add_string("en");
            return self.send_user_message(reject);
        }

        let mut chan = Channel::new(chanid, &kind);
        chan.set_window(self.config.window_size, self.config.max_packet_size);
        chan.set_remote_channel(remote_chanid, window_size, max_packet_size);
        if let Some((addr, port)) = &origin {
            chan.set_origin_addr(addr, *port);
        }
        self.channels.insert(chan);

        let mut confirm = Message::with_type(MessageType::ChannelOpenConfirmation);
        confirm
            .add_int(remote_chanid)
            .add_int(chanid)
            .add_int(self.config.window_size)
            .add_int(self.config.max_packet_size);
        self.send_user_message(confirm)?;
        info!(chanid, "Secsh channel {} ({}) opened.", chanid, kind);
        self.accept_queue.push_back(chanid);
        Ok(())
    }

    fn parse_channel_open_success(&mut self, m: &mut Message) -> KestrelResult<()> {
        let chanid = m.get_int()?;
        let server_chanid = m.get_int()?;
        let window_size = m.get_int()?;
        let max_packet_size = m.get_int()?;
        match self.channels.live_mut(chanid) {
            Some(chan) => {
                chan.set_remote_channel(server_chanid, window_size, max_packet_size);
                info!(chanid, "Secsh channel {} opened.", chanid);
            }
            None => warn!(chanid, "Success for unrequested channel! [??]"),
        }
        Ok(())
    }

    fn parse_channel_open_failure(&mut self, m: &mut Message) -> KestrelResult<()> {
        let chanid = m.get_int()?;
        let code = m.get_int()?;
        let mut reason = m.get_text()?;
        let _lang = m.get_string()?;
        if reason.is_empty() {
            reason = open_failure::reason_text(code).to_string();
        }
        info!(chanid, "Secsh channel {} open FAILED: {}", chanid, reason);
        if let Some(chan) = self.channels.live_mut(chanid) {
            chan.open_failed(code, &reason);
        }
        Ok(())
    }

    fn dispatch_channel(&mut self, mt: MessageType, m: &mut Message) -> KestrelResult<()> {
        let chanid = m.get_int()?;
        let Some(chan) = self.channels.live_mut(chanid) else {
            if self.channels.was_seen(chanid) {
                debug!(chanid, "Ignoring message for dead channel {}", chanid);
                return Ok(());
            }
            error!(chanid, "Channel request for unknown channel {}", chanid);
            return Err(KestrelError::Protocol(format!(
                "Channel request for unknown channel {}",
                chanid
            )));
        };

        match mt {
            MessageType::ChannelWindowAdjust => chan.window_adjust(m)?,
            MessageType::ChannelData => chan.feed(m)?,
            MessageType::ChannelExtendedData => chan.feed_extended(m)?,
            MessageType::ChannelEof => chan.handle_eof(),
            MessageType::ChannelClose => {
                chan.handle_close();
                // our CLOSE must go out before the channel leaves the live table
                let reply = chan.take_outbox();
                for msg in reply {
                    self.send_user_message(msg)?;
                }
                self.channels.retire(chanid);
            }
            MessageType::ChannelRequest => chan.handle_request(m, self.server.as_deref_mut())?,
            MessageType::ChannelSuccess => chan.request_success(),
            MessageType::ChannelFailure => chan.request_failed(),
            _ => {}
        }
        Ok(())
    }
}

impl<S: ByteStream> std::fmt::Debug for Transport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("server_mode", &self.server_mode)
            .field("active", &self.active)
            .field("remote_version", &self.remote_version)
            .field("in_kex", &self.kex.in_kex)
            .field("authenticated", &self.auth.is_authenticated())
            .field("channels", &self.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::MAX_AUTH_FAILURES;
    use crate::ssh::hostkey::Ed25519Key;
    use crate::ssh::packet::BufferedStream;
    use crate::ssh::server::AuthResult;

    fn shuttle(a: &mut Transport<BufferedStream>, b: &mut Transport<BufferedStream>) {
        for _ in 0..50 {
            let ab = a.stream_mut().take_written();
            let ba = b.stream_mut().take_written();
            if ab.is_empty() && ba.is_empty() {
                return;
            }
            b.stream_mut().feed(&ab);
            a.stream_mut().feed(&ba);
            a.run().unwrap();
            b.run().unwrap();
        }
    }

    struct Nothing;
    impl ServerInterface for Nothing {}

    struct PasswordOk;
    impl ServerInterface for PasswordOk {
        fn check_auth_password(&mut self, _username: &str, password: &str) -> AuthResult {
            if password == "foo" {
                AuthResult::Successful
            } else {
                AuthResult::Failed
            }
        }

        fn check_channel_request(&mut self, kind: &str, _chanid: u32) -> u32 {
            if kind == "session" {
                OPEN_SUCCEEDED
            } else {
                open_failure::ADMINISTRATIVELY_PROHIBITED
            }
        }
    }

    fn pair_with(
        client_cfg: TransportConfig,
        server_cfg: TransportConfig,
        policy: Box<dyn ServerInterface>,
    ) -> (Transport<BufferedStream>, Transport<BufferedStream>) {
        let mut client = Transport::new(BufferedStream::new(), client_cfg);
        let mut server = Transport::new(BufferedStream::new(), server_cfg);
        server.add_server_key(Arc::new(Ed25519Key::generate()));
        client.start_client().unwrap();
        server.start_server(policy).unwrap();
        (client, server)
    }

    /// Moves whatever `from` has written into `to` and runs `to` once.
    fn deliver(from: &mut Transport<BufferedStream>, to: &mut Transport<BufferedStream>) {
        let bytes = from.stream_mut().take_written();
        to.stream_mut().feed(&bytes);
        to.run().unwrap();
    }

    fn pair(client_cfg: TransportConfig) -> (Transport<BufferedStream>, Transport<BufferedStream>) {
        let mut client = Transport::new(BufferedStream::new(), client_cfg);
        let mut server = Transport::new(BufferedStream::new(), TransportConfig::new(false));
        server.add_server_key(Arc::new(Ed25519Key::generate()));
        client.start_client().unwrap();
        server.start_server(Box::new(Nothing)).unwrap();
        (client, server)
    }

    #[test]
    fn test_banner_then_kexinit() {
        let mut t = Transport::new(BufferedStream::new(), TransportConfig::new(true));
        t.start_client().unwrap();
        let banner = t.stream_mut().take_written();
        assert!(banner.starts_with(b"SSH-2.0-Kestrel_"));
        assert!(banner.ends_with(b"\r\n"));

        t.stream_mut().feed(b"hello there\r\nSSH-2.0-OpenSSH_8.9\r\n");
        t.run().unwrap();
        assert_eq!(t.remote_version(), Some("SSH-2.0-OpenSSH_8.9"));
        assert!(t.kex_in_progress());
        assert!(!t.stream_mut().take_written().is_empty());
    }

    #[test]
    fn test_bad_banner_is_fatal() {
        let mut t = Transport::new(BufferedStream::new(), TransportConfig::new(true));
        t.start_client().unwrap();
        t.stream_mut().feed(b"SSH-1.5-Ancient\r\n");
        assert!(t.run().is_err());
        assert!(!t.is_active());
    }

    #[test]
    fn test_server_requires_host_key() {
        let mut t = Transport::new(BufferedStream::new(), TransportConfig::new(false));
        assert!(matches!(
            t.start_server(Box::new(Nothing)),
            Err(KestrelError::Config(_))
        ));
        let mut t = Transport::new(BufferedStream::new(), TransportConfig::new(true));
        assert!(t.start_server(Box::new(Nothing)).is_err());
    }

    #[test]
    fn test_handshake_and_auth_gate() {
        let (mut client, mut server) = pair(TransportConfig::new(true));
        assert!(matches!(
            client.auth_password("u", "p"),
            Err(KestrelError::Closed(_))
        ));

        shuttle(&mut client, &mut server);
        assert!(client.initial_kex_done());
        assert!(server.initial_kex_done());
        assert_eq!(client.session_id(), server.session_id());
        assert!(client.packetizer().is_encrypting());
        assert_eq!(
            client.get_remote_server_key().map(|k| k.name()),
            Some("ssh-ed25519")
        );

        // the default server policy refuses everything
        client.auth_password("u", "p").unwrap();
        shuttle(&mut client, &mut server);
        assert!(matches!(client.auth_status(), AuthStatus::Failed));
    }

    #[test]
    fn test_pinned_key_mismatch_fails() {
        let mut cfg = TransportConfig::new(true);
        cfg.kex_algorithms = vec!["diffie-hellman-group14-sha1".to_string()];
        let (mut client, mut server) = pair(cfg);
        client.pin_host_key(Ed25519Key::generate().public_key());

        let mut failed = false;
        for _ in 0..10 {
            let to_server = client.stream_mut().take_written();
            let to_client = server.stream_mut().take_written();
            server.stream_mut().feed(&to_server);
            client.stream_mut().feed(&to_client);
            let _ = server.run();
            if let Err(e) = client.run() {
                assert!(matches!(e, KestrelError::Security(_)));
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert!(!client.is_active());
        assert!(client.session_id().is_some());
        assert!(client.get_remote_server_key().is_none());
    }

    #[test]
    fn test_client_rejects_inbound_session_open() {
        let (mut client, mut server) = pair(TransportConfig::new(true));
        shuttle(&mut client, &mut server);
        // server side cannot open sessions toward a client
        let chanid = server.open_session().unwrap();
        shuttle(&mut client, &mut server);
        let chan = server.channel(chanid).unwrap();
        assert_eq!(chan.open_error().map(|(c, _)| c), Some(1));
        assert!(client.accept().is_none());
    }

    #[test]
    fn test_unknown_channel_is_fatal() {
        let (mut client, mut server) = pair(TransportConfig::new(true));
        shuttle(&mut client, &mut server);
        let mut m = Message::with_type(MessageType::ChannelData);
        m.add_int(42).add_string("x");
        server.send_user_message(m).unwrap();
        let bytes = server.stream_mut().take_written();
        client.stream_mut().feed(&bytes);
        assert!(client.run().is_err());
    }

    #[test]
    fn test_global_request_declined_by_client() {
        let (mut client, mut server) = pair(TransportConfig::new(true));
        shuttle(&mut client, &mut server);
        server.global_request("bogus@example.com", &[], true).unwrap();
        shuttle(&mut client, &mut server);
        assert_eq!(server.take_global_response(), Some(GlobalResponse::Failure));
    }

    #[test]
    fn test_send_ignore_is_skipped() {
        let (mut client, mut server) = pair(TransportConfig::new(true));
        shuttle(&mut client, &mut server);
        client.send_ignore(None).unwrap();
        client.send_ignore(Some(3)).unwrap();
        shuttle(&mut client, &mut server);
        assert!(server.is_active());
    }

    #[test]
    fn test_close_sends_disconnect() {
        let (mut client, mut server) = pair(TransportConfig::new(true));
        shuttle(&mut client, &mut server);
        client.close();
        assert!(!client.is_active());
        let bytes = client.stream_mut().take_written();
        server.stream_mut().feed(&bytes);
        server.run().unwrap();
        assert!(!server.is_active());
        assert_eq!(
            server.remote_disconnect(),
            Some((disconnect::BY_APPLICATION, "Closed by application"))
        );

        // closing again is a no-op
        client.close();
        assert!(client.stream_mut().take_written().is_empty());
    }

    #[test]
    fn test_tenth_auth_failure_sent_during_rekey() {
        let (mut client, mut server) = pair(TransportConfig::new(true));
        shuttle(&mut client, &mut server);

        server.renegotiate_keys().unwrap();
        let before = server.packetizer().state().sequence_out();
        for _ in 0..MAX_AUTH_FAILURES {
            let mut req = Message::with_type(MessageType::UserauthRequest);
            req.add_string("robey")
                .add_string("ssh-connection")
                .add_string("password")
                .add_boolean(false)
                .add_string("wrong");
            client.send_user_message(req).unwrap();
        }
        deliver(&mut client, &mut server);

        assert!(!server.is_active());
        // every failure reply plus the DISCONNECT reached the wire
        assert_eq!(
            server.packetizer().state().sequence_out() - before,
            MAX_AUTH_FAILURES + 1
        );
    }

    #[test]
    fn test_delayed_compression_waits_for_queued_success() {
        let mut client_cfg = TransportConfig::new(true);
        client_cfg.use_compression = true;
        let mut server_cfg = TransportConfig::new(false);
        server_cfg.use_compression = true;
        let (mut client, mut server) = pair_with(client_cfg, server_cfg, Box::new(PasswordOk));
        shuttle(&mut client, &mut server);
        assert_eq!(
            client
                .agreed_algorithms()
                .map(|a| a.compression_server_to_client.as_str()),
            Some("zlib@openssh.com")
        );

        // service request and accept, leaving the USERAUTH_REQUEST unsent
        client.auth_password("robey", "foo").unwrap();
        deliver(&mut client, &mut server);
        deliver(&mut server, &mut client);

        server.renegotiate_keys().unwrap();
        deliver(&mut client, &mut server);
        assert!(server.is_authenticated());
        assert!(!server.login_sent());

        shuttle(&mut client, &mut server);
        assert!(client.is_authenticated());
        assert!(server.login_sent());

        // compressed traffic decodes in both directions
        server.global_request("bogus@example.com", &[], true).unwrap();
        shuttle(&mut client, &mut server);
        assert_eq!(server.take_global_response(), Some(GlobalResponse::Failure));
        assert!(client.is_active());
        assert!(server.is_active());
    }

    #[test]
    fn test_mac_failure_reports_mac_error() {
        let (mut client, mut server) = pair(TransportConfig::new(true));
        shuttle(&mut client, &mut server);

        client.send_ignore(Some(4)).unwrap();
        let mut bytes = client.stream_mut().take_written();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        server.stream_mut().feed(&bytes);
        assert!(matches!(server.run(), Err(KestrelError::MacMismatch)));
        assert!(!server.is_active());

        deliver(&mut server, &mut client);
        assert!(!client.is_active());
        assert_eq!(
            client.remote_disconnect().map(|(code, _)| code),
            Some(disconnect::MAC_ERROR)
        );
    }
    #[test]
    fn test_exit_status_after_local_close() {
        let (mut client, mut server) = pair_with(
            TransportConfig::new(true),
            TransportConfig::new(false),
            Box::new(PasswordOk),
        );
        shuttle(&mut client, &mut server);
        client.auth_password("robey", "foo").unwrap();
        shuttle(&mut client, &mut server);
        assert!(client.is_authenticated());

        let chanid = client.open_session().unwrap();
        shuttle(&mut client, &mut server);
        let server_chan = server.accept().unwrap();

        // our CLOSE is queued but the peer has not seen it yet
        client.channel_mut(chanid).unwrap().close();
        client.flush().unwrap();
        server
            .channel_mut(server_chan)
            .unwrap()
            .send_exit_status(7)
            .unwrap();
        server.flush().unwrap();
        deliver(&mut server, &mut client);

        let chan = client.channel(chanid).unwrap();
        assert!(chan.is_closed());
        assert!(!chan.is_unlinked());
        assert_eq!(chan.recv_exit_status(), 7);

        // the peer's CLOSE takes both ends out of the live tables
        shuttle(&mut client, &mut server);
        assert!(client.channels.is_empty());
        assert!(server.channels.is_empty());
        let chan = client.channel(chanid).unwrap();
        assert!(chan.is_unlinked());
        assert_eq!(chan.recv_exit_status(), 7);
        assert!(client.release_channel(chanid).is_some());
        assert!(client.channel(chanid).is_none());
    }
}
