//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  padding (n2 = padding_length)
//! byte[m]   mac
//! ```
//!
//! [`Packet`] is the plaintext frame. [`Packetizer`] owns the byte stream
//! and wraps frames in the negotiated cipher, MAC and compression, keeping
//! sequence numbers and rekey accounting in a [`PacketizerState`].
//!
//! # Resumable reads
//!
//! [`Packetizer::read_message`] returns [`KestrelError::WouldBlock`] when the
//! stream does not yet hold a whole packet. The first cipher block is
//! decrypted once and cached, so a retry after more bytes arrive continues
//! where the previous call stopped.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::message::Message;
//! use kestrel_proto::ssh::packet::{BufferedStream, ByteStream, Packetizer};
//!
//! let mut writer = Packetizer::new(BufferedStream::new());
//! let mut m = Message::new();
//! m.add_byte(2).add_string("padding");
//! writer.send_message(&m).unwrap();
//!
//! let wire = writer.stream_mut().take_written();
//! let mut reader = Packetizer::new(BufferedStream::new());
//! reader.stream_mut().feed(&wire);
//! let (ptype, mut body) = reader.read_message().unwrap();
//! assert_eq!(ptype, 2);
//! assert_eq!(body.get_text().unwrap(), "padding");
//! ```

use crate::ssh::crypto::{MacKey, PacketCipher, ZlibCompressor, ZlibDecompressor};
use crate::ssh::message::Message;
use bytes::{Buf, BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};
use rand::RngCore;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Largest `packet_length` accepted from a peer.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Block size used before any cipher is installed.
pub const DEFAULT_BLOCK_SIZE: usize = 8;

/// Packets in one direction before a rekey is requested.
pub const REKEY_PACKETS: u64 = 1 << 29;

/// Bytes in one direction before a rekey is requested.
pub const REKEY_BYTES: u64 = 1 << 29;

/// Packets accepted after a rekey request before giving up on the peer.
pub const REKEY_PACKETS_OVERFLOW_MAX: u64 = 1 << 29;

/// Bytes accepted after a rekey request before giving up on the peer.
pub const REKEY_BYTES_OVERFLOW_MAX: u64 = 1 << 29;

/// Longest identification line buffered while looking for a newline.
const MAX_LINE_LENGTH: usize = 1024;

/// A byte-oriented, non-blocking duplex stream.
///
/// Readers look at what is buffered and consume it explicitly, so a
/// short read never loses bytes.
pub trait ByteStream {
    /// Bytes received and not yet consumed.
    fn readable(&self) -> &[u8];

    /// Drops `n` bytes from the front of the readable buffer.
    fn consume(&mut self, n: usize);

    /// Queues bytes for the peer.
    fn write_all(&mut self, data: &[u8]) -> KestrelResult<()>;

    /// True once the peer will send nothing more.
    fn is_eof(&self) -> bool;

    /// Stops accepting writes.
    fn close(&mut self);

    /// Takes exactly `n` bytes, or signals why it cannot.
    ///
    /// Returns [`KestrelError::WouldBlock`] if fewer than `n` bytes are
    /// buffered and more may come, or an I/O error at end of stream.
    fn read_exact(&mut self, n: usize) -> KestrelResult<Vec<u8>> {
        let available = self.readable().len();
        if available < n {
            if self.is_eof() {
                return Err(KestrelError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Stream closed with {} of {} bytes", available, n),
                )));
            }
            return Err(KestrelError::WouldBlock);
        }
        let out = self.readable()[..n].to_vec();
        self.consume(n);
        Ok(out)
    }

    /// Takes one `\n`-terminated line, stripping the line ending.
    fn read_line(&mut self) -> KestrelResult<String> {
        match self.readable().iter().position(|&b| b == b'\n') {
            Some(i) => {
                let mut line = self.readable()[..i].to_vec();
                self.consume(i + 1);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(String::from_utf8_lossy(&line).into_owned())
            }
            None if self.readable().len() > MAX_LINE_LENGTH => Err(KestrelError::Protocol(
                "Identification line too long".to_string(),
            )),
            None if self.is_eof() => Err(KestrelError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Stream closed before end of line",
            ))),
            None => Err(KestrelError::WouldBlock),
        }
    }
}

/// In-memory [`ByteStream`] with separate inbound and outbound buffers.
///
/// Async drivers feed received bytes in and drain written bytes out.
#[derive(Debug, Default)]
pub struct BufferedStream {
    inbound: BytesMut,
    outbound: Vec<u8>,
    eof: bool,
    closed: bool,
}

impl BufferedStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes received from the peer.
    pub fn feed(&mut self, data: &[u8]) {
        self.inbound.put_slice(data);
    }

    /// Drains everything written so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    /// True if written bytes are waiting to be drained.
    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Marks the inbound side as finished.
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// True after [`ByteStream::close`].
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ByteStream for BufferedStream {
    fn readable(&self) -> &[u8] {
        &self.inbound
    }

    fn consume(&mut self, n: usize) {
        self.inbound.advance(n);
    }

    fn write_all(&mut self, data: &[u8]) -> KestrelResult<()> {
        if self.closed {
            return Err(KestrelError::Closed("Stream is closed".to_string()));
        }
        self.outbound.extend_from_slice(data);
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Plaintext SSH binary packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Frames `payload` for an 8-byte block with zero padding.
    ///
    /// ```rust
    /// use kestrel_proto::ssh::packet::Packet;
    ///
    /// let packet = Packet::new(b"test".to_vec());
    /// assert_eq!(packet.to_bytes().len() % 8, 0);
    /// ```
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_block_size(payload, DEFAULT_BLOCK_SIZE, false)
    }

    /// Frames `payload` so the whole packet is a multiple of `block_size`.
    ///
    /// Padding is random when `random_padding` is set and zero otherwise.
    pub fn with_block_size(payload: Vec<u8>, block_size: usize, random_padding: bool) -> Self {
        let pad_len = Self::padding_len(payload.len(), block_size);
        let mut padding = vec![0u8; pad_len];
        if random_padding {
            rand::thread_rng().fill_bytes(&mut padding);
        }
        Self { payload, padding }
    }

    /// Padding for a payload of `len` bytes: always 4 to `block_size + 3`.
    pub fn padding_len(len: usize, block_size: usize) -> usize {
        3 + block_size - ((len + 8) % block_size)
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Consumes the packet, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serializes to `u32 length | u8 pad_len | payload | padding`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses one plaintext frame with no trailing MAC.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] when the frame is shorter than its
    /// declared length, larger than [`MAX_PACKET_SIZE`], or its padding is
    /// shorter than 4 bytes or longer than the packet.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        if data.len() < 5 {
            return Err(KestrelError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;

        if packet_length > MAX_PACKET_SIZE {
            return Err(KestrelError::Protocol(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }
        if buf.len() != packet_length {
            return Err(KestrelError::Protocol(format!(
                "Frame length mismatch: declared {} bytes, got {}",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;
        if padding_length < MIN_PADDING_LEN {
            return Err(KestrelError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }
        if padding_length >= packet_length {
            return Err(KestrelError::Protocol(format!(
                "Invalid padding length {} for packet of {} bytes",
                padding_length, packet_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;
        Ok(Self {
            payload: buf[..payload_length].to_vec(),
            padding: buf[payload_length..].to_vec(),
        })
    }
}

/// Rekey thresholds, per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyLimits {
    /// Packets before a rekey is requested
    pub packets: u64,
    /// Bytes before a rekey is requested
    pub bytes: u64,
    /// Inbound packets tolerated after the request
    pub packets_overflow_max: u64,
    /// Inbound bytes tolerated after the request
    pub bytes_overflow_max: u64,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            packets: REKEY_PACKETS,
            bytes: REKEY_BYTES,
            packets_overflow_max: REKEY_PACKETS_OVERFLOW_MAX,
            bytes_overflow_max: REKEY_BYTES_OVERFLOW_MAX,
        }
    }
}

/// Per-direction crypto envelope and counters.
///
/// Nothing is installed initially; traffic is clear until the transport
/// activates keys after NEWKEYS.
#[derive(Debug)]
pub struct PacketizerState {
    block_size_out: usize,
    block_size_in: usize,
    cipher_out: Option<PacketCipher>,
    cipher_in: Option<PacketCipher>,
    mac_out: Option<MacKey>,
    mac_in: Option<MacKey>,
    compress_out: Option<ZlibCompressor>,
    compress_in: Option<ZlibDecompressor>,
    seq_out: u32,
    seq_in: u32,

    sent_bytes: u64,
    sent_packets: u64,
    received_bytes: u64,
    received_packets: u64,
    received_bytes_overflow: u64,
    received_packets_overflow: u64,
    need_rekey: bool,
    // bit 0: outbound keys swapped, bit 1: inbound keys swapped
    init_count: u8,
    limits: RekeyLimits,

    decrypted_header: Option<Vec<u8>>,

    keepalive_interval: Option<Duration>,
    keepalive_last: Instant,

    hexdump: bool,
    closed: bool,
}

impl Default for PacketizerState {
    fn default() -> Self {
        Self {
            block_size_out: DEFAULT_BLOCK_SIZE,
            block_size_in: DEFAULT_BLOCK_SIZE,
            cipher_out: None,
            cipher_in: None,
            mac_out: None,
            mac_in: None,
            compress_out: None,
            compress_in: None,
            seq_out: 0,
            seq_in: 0,
            sent_bytes: 0,
            sent_packets: 0,
            received_bytes: 0,
            received_packets: 0,
            received_bytes_overflow: 0,
            received_packets_overflow: 0,
            need_rekey: false,
            init_count: 0,
            limits: RekeyLimits::default(),
            decrypted_header: None,
            keepalive_interval: None,
            keepalive_last: Instant::now(),
            hexdump: false,
            closed: false,
        }
    }
}

impl PacketizerState {
    fn swap_done(&mut self, bit: u8) {
        self.init_count |= bit;
        if self.init_count == 3 {
            self.init_count = 0;
            self.need_rekey = false;
        }
    }

    fn trigger_rekey(&mut self, direction: &str, packets: u64, bytes: u64) {
        debug!(direction, packets, bytes, "Rekeying");
        self.received_bytes_overflow = 0;
        self.received_packets_overflow = 0;
        self.need_rekey = true;
    }
}

/// Frames, encrypts and authenticates SSH packets over a [`ByteStream`].
#[derive(Debug)]
pub struct Packetizer<S> {
    stream: S,
    state: PacketizerState,
}

impl<S: ByteStream> Packetizer<S> {
    /// Wraps a stream; no cipher is installed.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: PacketizerState::default(),
        }
    }

    /// Borrows the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Mutably borrows the underlying stream.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Read-only view of the counters and installed keys.
    pub fn state(&self) -> &PacketizerState {
        &self.state
    }

    /// Overrides the default rekey thresholds.
    pub fn set_rekey_limits(&mut self, limits: RekeyLimits) {
        self.state.limits = limits;
    }

    /// Installs the outbound cipher and MAC.
    ///
    /// Outbound counters restart; the rekey flag clears once both
    /// directions have been swapped.
    pub fn set_outbound_cipher(&mut self, cipher: PacketCipher, mac: MacKey) {
        let st = &mut self.state;
        st.block_size_out = cipher.block_size();
        st.cipher_out = Some(cipher);
        st.mac_out = Some(mac);
        st.sent_bytes = 0;
        st.sent_packets = 0;
        st.swap_done(1);
    }

    /// Installs the inbound cipher and MAC.
    pub fn set_inbound_cipher(&mut self, cipher: PacketCipher, mac: MacKey) {
        let st = &mut self.state;
        st.block_size_in = cipher.block_size();
        st.cipher_in = Some(cipher);
        st.mac_in = Some(mac);
        st.received_bytes = 0;
        st.received_packets = 0;
        st.swap_done(2);
    }

    /// Starts compressing outbound payloads.
    pub fn set_outbound_compressor(&mut self, compressor: ZlibCompressor) {
        self.state.compress_out = Some(compressor);
    }

    /// Starts inflating inbound payloads.
    pub fn set_inbound_compressor(&mut self, decompressor: ZlibDecompressor) {
        self.state.compress_in = Some(decompressor);
    }

    /// True if new keys should be negotiated.
    pub fn need_rekey(&self) -> bool {
        self.state.need_rekey
    }

    /// True once an outbound cipher is active.
    pub fn is_encrypting(&self) -> bool {
        self.state.cipher_out.is_some()
    }

    /// Logs every packet in hex at trace level.
    pub fn set_hexdump(&mut self, on: bool) {
        self.state.hexdump = on;
    }

    /// Arms the outbound-silence keepalive timer.
    pub fn set_keepalive(&mut self, interval: Option<Duration>) {
        self.state.keepalive_interval = interval.filter(|d| !d.is_zero());
        self.state.keepalive_last = Instant::now();
    }

    /// True if a keepalive is due now.
    pub fn check_keepalive(&mut self) -> bool {
        self.check_keepalive_at(Instant::now())
    }

    /// True if a keepalive is due at `now`; the timer restarts when it fires.
    ///
    /// Only fires while encrypting and not waiting on a rekey.
    pub fn check_keepalive_at(&mut self, now: Instant) -> bool {
        let st = &mut self.state;
        let Some(interval) = st.keepalive_interval else {
            return false;
        };
        if st.cipher_out.is_none() || st.need_rekey {
            return false;
        }
        if now.saturating_duration_since(st.keepalive_last) > interval {
            st.keepalive_last = now;
            return true;
        }
        false
    }

    /// Stops all further reads and writes.
    pub fn close(&mut self) {
        self.state.closed = true;
        self.stream.close();
    }

    /// True after [`Packetizer::close`].
    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    /// Writes raw bytes, bypassing framing (used for the banner).
    pub fn write_all(&mut self, data: &[u8]) -> KestrelResult<()> {
        if self.state.closed {
            return Err(KestrelError::Closed("Packetizer is closed".to_string()));
        }
        self.state.keepalive_last = Instant::now();
        self.stream.write_all(data)
    }

    /// Reads one identification line.
    pub fn read_line(&mut self) -> KestrelResult<String> {
        self.stream.read_line()
    }

    /// Frames, compresses, encrypts and MACs one message.
    pub fn send_message(&mut self, msg: &Message) -> KestrelResult<()> {
        let data = msg.as_bytes();
        let ptype = data.first().copied().unwrap_or(0);

        let st = &mut self.state;
        let data = match st.compress_out.as_mut() {
            Some(c) => c.compress(data)?,
            None => data.to_vec(),
        };

        let encrypting = st.cipher_out.is_some();
        let frame = Packet::with_block_size(data, st.block_size_out, encrypting).to_bytes();
        if st.hexdump {
            trace!(ptype, len = msg.len(), frame = %hex::encode(&frame), "OUT");
        }

        let mut out = frame.clone();
        if let Some(cipher) = st.cipher_out.as_mut() {
            cipher.process(&mut out)?;
            if let Some(mac) = st.mac_out.as_ref() {
                out.extend_from_slice(&mac.compute(st.seq_out, &frame)?);
            }
        }
        st.seq_out = st.seq_out.wrapping_add(1);

        self.write_all(&out)?;

        let st = &mut self.state;
        st.sent_bytes += out.len() as u64;
        st.sent_packets += 1;
        if (st.sent_packets >= st.limits.packets || st.sent_bytes >= st.limits.bytes)
            && !st.need_rekey
        {
            let (packets, bytes) = (st.sent_packets, st.sent_bytes);
            st.trigger_rekey("sent", packets, bytes);
        }
        Ok(())
    }

    /// Reads, verifies and decodes one message.
    ///
    /// Returns the message type and a [`Message`] positioned after it.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::WouldBlock`]: a whole packet is not buffered yet;
    ///   call again after feeding more bytes.
    /// - [`KestrelError::Security`]: MAC mismatch.
    /// - [`KestrelError::Protocol`]: bad blocking, size or padding.
    /// - [`KestrelError::ResourceExhausted`]: the peer ignored a rekey.
    pub fn read_message(&mut self) -> KestrelResult<(u8, Message)> {
        if self.state.closed {
            return Err(KestrelError::Closed("Packetizer is closed".to_string()));
        }

        let bs = self.state.block_size_in;
        let header = match self.state.decrypted_header.take() {
            Some(h) => h,
            None => {
                let mut h = self.stream.read_exact(bs)?;
                if let Some(cipher) = self.state.cipher_in.as_mut() {
                    cipher.process(&mut h)?;
                }
                h
            }
        };

        let packet_size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let leftover_len = header.len() - 4;
        if packet_size > MAX_PACKET_SIZE {
            return Err(KestrelError::Protocol(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_size, MAX_PACKET_SIZE
            )));
        }
        let remaining = match packet_size.checked_sub(leftover_len) {
            Some(r) if r % bs == 0 => r,
            _ => return Err(KestrelError::Protocol("Invalid packet blocking".to_string())),
        };

        let mac_size = self.state.mac_in.as_ref().map_or(0, |m| m.mac_size());
        let mut buf = match self.stream.read_exact(remaining + mac_size) {
            Ok(buf) => buf,
            Err(KestrelError::WouldBlock) => {
                self.state.decrypted_header = Some(header);
                return Err(KestrelError::WouldBlock);
            }
            Err(e) => return Err(e),
        };

        let st = &mut self.state;
        let received_mac = buf.split_off(remaining);
        if let Some(cipher) = st.cipher_in.as_mut() {
            if !buf.is_empty() {
                cipher.process(&mut buf)?;
            }
        }

        let mut frame = header;
        frame.extend_from_slice(&buf);
        if st.hexdump {
            trace!(frame = %hex::encode(&frame), "IN");
        }

        if let Some(mac) = st.mac_in.as_ref() {
            if !mac.verify(st.seq_in, &frame, &received_mac)? {
                return Err(KestrelError::MacMismatch);
            }
        }

        let mut payload = Packet::from_bytes(&frame)?.into_payload();
        if let Some(d) = st.compress_in.as_mut() {
            payload = d.decompress(&payload)?;
        }
        if payload.is_empty() {
            return Err(KestrelError::Protocol("Empty packet payload".to_string()));
        }

        let ptype = payload[0];
        let mut msg = Message::from_bytes(&payload[1..]);
        msg.set_seqno(st.seq_in);
        st.seq_in = st.seq_in.wrapping_add(1);

        let raw_packet_size = (packet_size + mac_size + 4) as u64;
        st.received_bytes += raw_packet_size;
        st.received_packets += 1;
        if st.need_rekey {
            // Give the peer some room to comply before dropping the link
            st.received_bytes_overflow += raw_packet_size;
            st.received_packets_overflow += 1;
            if st.received_packets_overflow >= st.limits.packets_overflow_max
                || st.received_bytes_overflow >= st.limits.bytes_overflow_max
            {
                return Err(KestrelError::ResourceExhausted(
                    "Remote transport is ignoring rekey requests".to_string(),
                ));
            }
        } else if st.received_packets >= st.limits.packets || st.received_bytes >= st.limits.bytes
        {
            let (packets, bytes) = (st.received_packets, st.received_bytes);
            st.trigger_rekey("received", packets, bytes);
        }

        if st.hexdump {
            trace!(ptype, len = payload.len(), "Read packet");
        }
        Ok((ptype, msg))
    }
}

impl PacketizerState {
    /// Next outbound sequence number.
    pub fn sequence_out(&self) -> u32 {
        self.seq_out
    }

    /// Next inbound sequence number.
    pub fn sequence_in(&self) -> u32 {
        self.seq_in
    }

    /// Packets sent since the outbound keys were installed.
    pub fn sent_packets(&self) -> u64 {
        self.sent_packets
    }

    /// Packets received since the inbound keys were installed.
    pub fn received_packets(&self) -> u64 {
        self.received_packets
    }

    /// Current MAC tag sizes `(in, out)`.
    pub fn mac_sizes(&self) -> (usize, usize) {
        (
            self.mac_in.as_ref().map_or(0, |m| m.mac_size()),
            self.mac_out.as_ref().map_or(0, |m| m.mac_size()),
        )
    }
}
