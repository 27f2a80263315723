//! SSH protocol message types and the positional wire codec (RFC 4251, RFC 4253).
//!
//! [`MessageType`] names every message number the engine produces or
//! consumes. [`Message`] is an ordered byte buffer with a read cursor that
//! encodes and decodes the SSH data types of RFC 4251 Section 5.
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Channel management
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::message::{Message, MessageType};
//!
//! let mut m = Message::new();
//! m.add_byte(MessageType::ServiceRequest as u8);
//! m.add_string("ssh-userauth");
//!
//! let mut r = Message::from_bytes(m.as_bytes());
//! assert_eq!(r.get_byte().unwrap(), 5);
//! assert_eq!(r.get_text().unwrap(), "ssh-userauth");
//! assert!(r.get_byte().is_err());
//! ```

use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};
use num_bigint::{BigInt, BigUint, Sign};

/// SSH message types as defined in RFC 4253 Section 12 and RFC 4419.
///
/// Key-exchange numbers 30 and 31 are shared between the fixed-group and
/// group-exchange methods; keyboard-interactive reuses 60 for
/// `SSH_MSG_USERAUTH_INFO_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// DH init, or the old-style group-exchange request.
    KexdhInit = 30,
    /// DH reply, or the group-exchange group proposal.
    KexdhReply = 31,
    /// Group-exchange init (client public value).
    KexGexInit = 32,
    /// Group-exchange reply (server public value and signature).
    KexGexReply = 33,
    /// Group-exchange request with min/preferred/max bits.
    KexGexRequest = 34,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key OK, or keyboard-interactive info request.
    UserauthPkOk = 60,
    /// Keyboard-interactive info response.
    UserauthInfoResponse = 61,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

/// Keyboard-interactive info request shares its number with PK_OK.
pub const USERAUTH_INFO_REQUEST: u8 = MessageType::UserauthPkOk as u8;

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kestrel_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            32 => Some(MessageType::KexGexInit),
            33 => Some(MessageType::KexGexReply),
            34 => Some(MessageType::KexGexRequest),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kestrel_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::KexInit.name(), "SSH_MSG_KEXINIT");
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::KexGexInit => "SSH_MSG_KEX_DH_GEX_INIT",
            MessageType::KexGexReply => "SSH_MSG_KEX_DH_GEX_REPLY",
            MessageType::KexGexRequest => "SSH_MSG_KEX_DH_GEX_REQUEST",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
pub mod disconnect {
    /// Protocol error.
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Key exchange failed.
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// MAC error.
    pub const MAC_ERROR: u32 = 5;
    /// Service not available.
    pub const SERVICE_NOT_AVAILABLE: u32 = 7;
    /// By application.
    pub const BY_APPLICATION: u32 = 11;
    /// No more auth methods available.
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
}

/// Positional reader/writer for SSH wire data.
///
/// Writes append to the buffer; reads advance a cursor monotonically.
/// Reading past the end fails with [`KestrelError::Truncated`] instead of
/// returning garbage.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Message {
    buf: BytesMut,
    pos: usize,
    seqno: u32,
}

impl Message {
    /// Creates an empty message for writing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message positioned at the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
            pos: 0,
            seqno: 0,
        }
    }

    /// Starts a message with its type byte.
    pub fn with_type(msg_type: MessageType) -> Self {
        let mut m = Self::new();
        m.add_byte(msg_type as u8);
        m
    }

    /// Sequence number of the packet this message arrived in.
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub(crate) fn set_seqno(&mut self, seqno: u32) {
        self.seqno = seqno;
    }

    /// Returns the whole buffer, independent of the cursor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the message, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Moves the cursor back to the start.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    // Writers

    /// Appends one byte.
    pub fn add_byte(&mut self, b: u8) -> &mut Self {
        self.buf.put_u8(b);
        self
    }

    /// Appends raw bytes with no length prefix.
    pub fn add_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    /// Appends a big-endian `uint32`.
    pub fn add_int(&mut self, n: u32) -> &mut Self {
        self.buf.put_u32(n);
        self
    }

    /// Appends a big-endian `uint64`.
    pub fn add_int64(&mut self, n: u64) -> &mut Self {
        self.buf.put_u64(n);
        self
    }

    /// Appends a boolean as a single byte.
    pub fn add_boolean(&mut self, b: bool) -> &mut Self {
        self.buf.put_u8(u8::from(b));
        self
    }

    /// Appends a length-prefixed string.
    pub fn add_string(&mut self, s: impl AsRef<[u8]>) -> &mut Self {
        let s = s.as_ref();
        self.buf.put_u32(s.len() as u32);
        self.buf.put_slice(s);
        self
    }

    /// Appends a non-negative multi-precision integer.
    ///
    /// Zero encodes as an empty string; a leading zero byte is added when
    /// the high bit would otherwise mark the value negative.
    pub fn add_mpint(&mut self, n: &BigUint) -> &mut Self {
        let encoded = mpint_bytes(n);
        self.add_string(&encoded)
    }

    /// Appends a signed multi-precision integer in minimal two's complement.
    ///
    /// The first byte's high bit carries the sign, so `0x80` gains a
    /// `0x00` prefix and `-129` encodes as `ff 7f`.
    pub fn add_mpint_signed(&mut self, n: &BigInt) -> &mut Self {
        if n.sign() == Sign::NoSign {
            return self.add_string(Vec::<u8>::new());
        }
        let encoded = n.to_signed_bytes_be();
        self.add_string(&encoded)
    }

    /// Appends a comma-joined name-list.
    pub fn add_list<S: AsRef<str>>(&mut self, names: &[S]) -> &mut Self {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.add_string(joined.as_bytes())
    }

    // Readers

    fn take(&mut self, n: usize) -> KestrelResult<&[u8]> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(KestrelError::Truncated {
                needed: n,
                available,
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    /// Reads one byte.
    pub fn get_byte(&mut self) -> KestrelResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads `n` raw bytes.
    pub fn get_bytes(&mut self, n: usize) -> KestrelResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Reads a big-endian `uint32`.
    pub fn get_int(&mut self) -> KestrelResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian `uint64`.
    pub fn get_int64(&mut self) -> KestrelResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// Reads a boolean; any non-zero byte is true.
    pub fn get_boolean(&mut self) -> KestrelResult<bool> {
        Ok(self.get_byte()? != 0)
    }

    /// Reads a length-prefixed string as raw bytes.
    pub fn get_string(&mut self) -> KestrelResult<Vec<u8>> {
        let len = self.get_int()? as usize;
        self.get_bytes(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_text(&mut self) -> KestrelResult<String> {
        let raw = self.get_string()?;
        String::from_utf8(raw)
            .map_err(|_| KestrelError::Protocol("String is not valid UTF-8".to_string()))
    }

    /// Reads a non-negative multi-precision integer.
    ///
    /// A leading zero byte is accepted; negative values are rejected.
    pub fn get_mpint(&mut self) -> KestrelResult<BigUint> {
        let raw = self.get_string()?;
        if raw.first().is_some_and(|b| b & 0x80 != 0) {
            return Err(KestrelError::Protocol(
                "Negative mpint where a non-negative value was expected".to_string(),
            ));
        }
        Ok(BigUint::from_bytes_be(&raw))
    }

    /// Reads a signed multi-precision integer.
    pub fn get_mpint_signed(&mut self) -> KestrelResult<BigInt> {
        let raw = self.get_string()?;
        Ok(BigInt::from_signed_bytes_be(&raw))
    }

    /// Reads a comma-separated name-list.
    pub fn get_list(&mut self) -> KestrelResult<Vec<String>> {
        let text = self.get_text()?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.split(',').map(String::from).collect())
    }

    /// Returns everything after the cursor and moves the cursor to the end.
    pub fn get_remainder(&mut self) -> Vec<u8> {
        let rest = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        rest
    }

    /// Returns everything before the cursor.
    pub fn get_so_far(&self) -> Vec<u8> {
        self.buf[..self.pos].to_vec()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.buf.len())
            .field("pos", &self.pos)
            .field("seqno", &self.seqno)
            .finish()
    }
}

/// Encodes the body of an mpint (without its length prefix).
pub fn mpint_bytes(n: &BigUint) -> Vec<u8> {
    if n.bits() == 0 {
        return Vec::new();
    }
    let mut bytes = n.to_bytes_be();
    if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(34), Some(MessageType::KexGexRequest));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
        assert_eq!(USERAUTH_INFO_REQUEST, 60);
    }

    #[test]
    fn test_scalar_encoding() {
        let mut m = Message::new();
        m.add_byte(7)
            .add_int(0xdead_beef)
            .add_int64(1 << 40)
            .add_boolean(true)
            .add_boolean(false);
        assert_eq!(
            m.as_bytes(),
            &[7, 0xde, 0xad, 0xbe, 0xef, 0, 0, 1, 0, 0, 0, 0, 0, 1, 0]
        );

        let mut r = Message::from_bytes(m.as_bytes());
        assert_eq!(r.get_byte().unwrap(), 7);
        assert_eq!(r.get_int().unwrap(), 0xdead_beef);
        assert_eq!(r.get_int64().unwrap(), 1 << 40);
        assert!(r.get_boolean().unwrap());
        assert!(!r.get_boolean().unwrap());
    }

    #[test]
    fn test_mpint_encoding() {
        let mut m = Message::new();
        m.add_mpint(&BigUint::from(0u32));
        m.add_mpint(&BigUint::from(0x1234u32));
        m.add_mpint(&BigUint::from(0x8000u32));
        assert_eq!(
            m.as_bytes(),
            &[0, 0, 0, 0, 0, 0, 0, 2, 0x12, 0x34, 0, 0, 0, 3, 0, 0x80, 0x00]
        );

        let mut r = Message::from_bytes(m.as_bytes());
        assert_eq!(r.get_mpint().unwrap(), BigUint::from(0u32));
        assert_eq!(r.get_mpint().unwrap(), BigUint::from(0x1234u32));
        assert_eq!(r.get_mpint().unwrap(), BigUint::from(0x8000u32));
    }

    #[test]
    fn test_signed_mpint_encoding() {
        let cases: [(i64, &[u8]); 6] = [
            (0, &[]),
            (-1, &[0xff]),
            (-128, &[0x80]),
            (-129, &[0xff, 0x7f]),
            (0x80, &[0x00, 0x80]),
            (-0x1234, &[0xed, 0xcc]),
        ];
        for (value, body) in cases {
            let mut m = Message::new();
            m.add_mpint_signed(&BigInt::from(value));
            let mut expected = (body.len() as u32).to_be_bytes().to_vec();
            expected.extend_from_slice(body);
            assert_eq!(m.as_bytes(), expected.as_slice(), "encoding {}", value);

            let mut r = Message::from_bytes(m.as_bytes());
            assert_eq!(r.get_mpint_signed().unwrap(), BigInt::from(value));
        }
    }

    #[test]
    fn test_signed_and_unsigned_agree_on_positive_values() {
        let mut m = Message::new();
        m.add_mpint(&BigUint::from(0x8000u32));
        let mut r = Message::from_bytes(m.as_bytes());
        assert_eq!(r.get_mpint_signed().unwrap(), BigInt::from(0x8000));
    }

    #[test]
    fn test_negative_mpint_rejected() {
        let mut r = Message::from_bytes(&[0, 0, 0, 1, 0xff]);
        assert!(matches!(r.get_mpint(), Err(KestrelError::Protocol(_))));
    }

    #[test]
    fn test_name_list() {
        let mut m = Message::new();
        m.add_list(&["aes128-ctr", "aes256-ctr"]);
        m.add_list::<&str>(&[]);

        let mut r = Message::from_bytes(m.as_bytes());
        assert_eq!(r.get_list().unwrap(), vec!["aes128-ctr", "aes256-ctr"]);
        assert!(r.get_list().unwrap().is_empty());
    }

    #[test]
    fn test_read_past_end_is_truncated() {
        let mut r = Message::from_bytes(&[0, 0, 0, 10, b'a', b'b']);
        match r.get_string() {
            Err(KestrelError::Truncated { needed, available }) => {
                assert_eq!(needed, 10);
                assert_eq!(available, 2);
            }
            other => panic!("Expected Truncated, got {:?}", other),
        }

        let mut empty = Message::new();
        assert!(matches!(
            empty.get_int(),
            Err(KestrelError::Truncated { needed: 4, available: 0 })
        ));
    }

    #[test]
    fn test_so_far_and_remainder() {
        let mut r = Message::from_bytes(&[1, 2, 3, 4, 5]);
        r.get_bytes(2).unwrap();
        assert_eq!(r.get_so_far(), vec![1, 2]);
        assert_eq!(r.get_remainder(), vec![3, 4, 5]);
        assert_eq!(r.position(), 5);
        assert!(r.get_byte().is_err());
    }
}
