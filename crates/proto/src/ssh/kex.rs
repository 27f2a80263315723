//! SSH key exchange (RFC 4253 Section 7).
//!
//! This module holds the pieces shared by every key-exchange method:
//! - the SSH_MSG_KEXINIT message and algorithm negotiation
//! - the [`KexEngine`] trait the transport drives
//! - session key derivation (RFC 4253 Section 7.2)
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports)
//! 3. The negotiated engine exchanges its method-specific packets (30-49)
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches keys when its NEWKEYS is sent or received
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::kex::negotiate_algorithm;
//!
//! let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! assert_eq!(negotiate_algorithm(&client, &server), Some("aes256-ctr".to_string()));
//! ```

use crate::ssh::crypto::HashAlgorithm;
use crate::ssh::hostkey::Signable;
use crate::ssh::kex_dh::KexGroup;
use crate::ssh::kex_gex::KexGex;
use crate::ssh::message::{Message, MessageType};
use kestrel_platform::{KestrelError, KestrelResult};
use num_bigint::BigUint;
use rand::RngCore;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    pub cookie: [u8; 16],
    /// Key exchange algorithms
    pub kex_algorithms: Vec<String>,
    /// Server host key algorithms
    pub server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    pub encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    pub encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    pub mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    pub mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    pub compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    pub compression_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    pub languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    pub languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    pub first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie, advertising the same
    /// cipher, MAC and compression lists in both directions.
    pub fn new(
        kex: &[String],
        host_keys: &[String],
        ciphers: &[String],
        macs: &[String],
        compression: &[String],
    ) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: kex.to_vec(),
            server_host_key_algorithms: host_keys.to_vec(),
            encryption_client_to_server: ciphers.to_vec(),
            encryption_server_to_client: ciphers.to_vec(),
            mac_client_to_server: macs.to_vec(),
            mac_server_to_client: macs.to_vec(),
            compression_client_to_server: compression.to_vec(),
            compression_server_to_client: compression.to_vec(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Encodes the full message, type byte included.
    pub fn to_message(&self) -> Message {
        let mut m = Message::with_type(MessageType::KexInit);
        m.add_bytes(&self.cookie)
            .add_list(&self.kex_algorithms)
            .add_list(&self.server_host_key_algorithms)
            .add_list(&self.encryption_client_to_server)
            .add_list(&self.encryption_server_to_client)
            .add_list(&self.mac_client_to_server)
            .add_list(&self.mac_server_to_client)
            .add_list(&self.compression_client_to_server)
            .add_list(&self.compression_server_to_client)
            .add_list(&self.languages_client_to_server)
            .add_list(&self.languages_server_to_client)
            .add_boolean(self.first_kex_packet_follows)
            .add_int(0);
        m
    }

    /// Decodes the body that follows the type byte.
    ///
    /// Trailing bytes some peers append are left unread, so
    /// `m.get_so_far()` afterwards is exactly the hashed portion.
    pub fn from_message(m: &mut Message) -> KestrelResult<Self> {
        let raw = m.get_bytes(16)?;
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&raw);

        let init = Self {
            cookie,
            kex_algorithms: m.get_list()?,
            server_host_key_algorithms: m.get_list()?,
            encryption_client_to_server: m.get_list()?,
            encryption_server_to_client: m.get_list()?,
            mac_client_to_server: m.get_list()?,
            mac_server_to_client: m.get_list()?,
            compression_client_to_server: m.get_list()?,
            compression_server_to_client: m.get_list()?,
            languages_client_to_server: m.get_list()?,
            languages_server_to_client: m.get_list()?,
            first_kex_packet_follows: m.get_boolean()?,
        };
        let _reserved = m.get_int()?;
        Ok(init)
    }
}

/// Returns the first entry of `client_list` that `server_list` contains.
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> Option<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
}

/// Algorithms both sides agreed on for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: String,
    /// Server host key type
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: String,
    /// Cipher server to client
    pub cipher_server_to_client: String,
    /// MAC client to server
    pub mac_client_to_server: String,
    /// MAC server to client
    pub mac_server_to_client: String,
    /// Compression client to server
    pub compression_client_to_server: String,
    /// Compression server to client
    pub compression_server_to_client: String,
}

impl NegotiatedAlgorithms {
    /// Negotiates every slot; the client's ordering decides.
    ///
    /// # Errors
    ///
    /// [`KestrelError::Protocol`] naming the first slot with no overlap.
    pub fn negotiate(client: &KexInit, server: &KexInit) -> KestrelResult<Self> {
        let pick = |c: &[String], s: &[String], what: &str| {
            negotiate_algorithm(c, s).ok_or_else(|| {
                KestrelError::Protocol(format!("Incompatible ssh peer (no acceptable {})", what))
            })
        };

        Ok(Self {
            kex: pick(&client.kex_algorithms, &server.kex_algorithms, "kex algorithm")?,
            host_key: pick(
                &client.server_host_key_algorithms,
                &server.server_host_key_algorithms,
                "host key",
            )?,
            cipher_client_to_server: pick(
                &client.encryption_client_to_server,
                &server.encryption_client_to_server,
                "ciphers",
            )?,
            cipher_server_to_client: pick(
                &client.encryption_server_to_client,
                &server.encryption_server_to_client,
                "ciphers",
            )?,
            mac_client_to_server: pick(
                &client.mac_client_to_server,
                &server.mac_client_to_server,
                "macs",
            )?,
            mac_server_to_client: pick(
                &client.mac_server_to_client,
                &server.mac_server_to_client,
                "macs",
            )?,
            compression_client_to_server: pick(
                &client.compression_client_to_server,
                &server.compression_client_to_server,
                "compression",
            )?,
            compression_server_to_client: pick(
                &client.compression_server_to_client,
                &server.compression_server_to_client,
                "compression",
            )?,
        })
    }
}

/// Group-exchange modulus size request, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GexBits {
    /// Smallest acceptable modulus
    pub min: u32,
    /// Preferred modulus
    pub preferred: u32,
    /// Largest acceptable modulus
    pub max: u32,
}

impl Default for GexBits {
    fn default() -> Self {
        Self {
            min: 1024,
            preferred: 2048,
            max: 8192,
        }
    }
}

/// Everything an engine needs from the transport for one exchange.
pub struct KexContext<'a> {
    /// True on the server side
    pub server_mode: bool,
    /// Our identification line, without CR LF
    pub local_version: &'a str,
    /// Peer identification line, without CR LF
    pub remote_version: &'a str,
    /// Our KEXINIT payload, type byte included
    pub local_kex_init: &'a [u8],
    /// Peer KEXINIT payload, type byte included
    pub remote_kex_init: &'a [u8],
    /// Host key to sign with (server only)
    pub host_key: Option<&'a dyn Signable>,
    /// Modulus sizes a group-exchange client asks for
    pub gex_bits: GexBits,
    /// Send the pre-RFC 4419 request carrying only the preferred size
    pub gex_old_style: bool,
}

impl<'a> KexContext<'a> {
    /// `(V_C, V_S)` as hashed into H.
    pub fn versions(&self) -> (&'a str, &'a str) {
        if self.server_mode {
            (self.remote_version, self.local_version)
        } else {
            (self.local_version, self.remote_version)
        }
    }

    /// `(I_C, I_S)` as hashed into H.
    pub fn kex_inits(&self) -> (&'a [u8], &'a [u8]) {
        if self.server_mode {
            (self.remote_kex_init, self.local_kex_init)
        } else {
            (self.local_kex_init, self.remote_kex_init)
        }
    }

    /// Starts the exchange-hash input with `V_C, V_S, I_C, I_S, K_S`.
    pub fn hash_prefix(&self, host_key_blob: &[u8]) -> Message {
        let (v_c, v_s) = self.versions();
        let (i_c, i_s) = self.kex_inits();
        let mut hm = Message::new();
        hm.add_string(v_c)
            .add_string(v_s)
            .add_string(i_c)
            .add_string(i_s)
            .add_string(host_key_blob);
        hm
    }

    /// The server host key, or an error when none is configured.
    pub fn require_host_key(&self) -> KestrelResult<&'a dyn Signable> {
        self.host_key
            .ok_or_else(|| KestrelError::Config("Server mode requires a host key".to_string()))
    }
}

/// Outcome of a finished exchange.
#[derive(Debug, Clone)]
pub struct KexResult {
    /// Shared secret K
    pub k: BigUint,
    /// Exchange hash H
    pub h: Vec<u8>,
    /// Server host key blob K_S
    pub host_key: Vec<u8>,
    /// Server signature over H; set only on the client, which must verify it
    pub signature: Option<Vec<u8>>,
}

/// What the transport must do after feeding an engine.
#[derive(Debug, Default)]
pub struct KexStep {
    /// Messages to send, in order
    pub outbound: Vec<Message>,
    /// Packet types acceptable next
    pub expect: Vec<u8>,
    /// Set once K and H are known
    pub result: Option<KexResult>,
}

impl KexStep {
    /// Sends `msg` and waits for one of `expect`.
    pub fn send_and_expect(msg: Message, expect: &[u8]) -> Self {
        Self {
            outbound: vec![msg],
            expect: expect.to_vec(),
            result: None,
        }
    }

    /// Waits for one of `expect` without sending.
    pub fn expect(expect: &[u8]) -> Self {
        Self {
            outbound: vec![],
            expect: expect.to_vec(),
            result: None,
        }
    }
}

/// A key-exchange method.
///
/// The transport calls [`KexEngine::start_kex`] right after negotiation and
/// hands every packet numbered 30 to 49 to [`KexEngine::parse_next`].
pub trait KexEngine: Send {
    /// Method name as negotiated.
    fn name(&self) -> &'static str;

    /// Hash for H and key derivation.
    fn hash_algorithm(&self) -> HashAlgorithm;

    /// Emits the first message (client) or arms the first expected packet.
    fn start_kex(&mut self, ctx: &KexContext<'_>) -> KestrelResult<KexStep>;

    /// Consumes the next method packet.
    fn parse_next(
        &mut self,
        ctx: &KexContext<'_>,
        ptype: u8,
        m: &mut Message,
    ) -> KestrelResult<KexStep>;
}

/// Key exchange methods offered by default, most preferred first.
pub const SUPPORTED_KEX: &[&str] = &[
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group-exchange-sha1",
    "diffie-hellman-group1-sha1",
];

/// Creates the engine for a negotiated method name.
pub fn engine_for(name: &str) -> Option<Box<dyn KexEngine>> {
    match name {
        "diffie-hellman-group1-sha1" => Some(Box::new(KexGroup::group1())),
        "diffie-hellman-group14-sha1" => Some(Box::new(KexGroup::group14())),
        "diffie-hellman-group-exchange-sha1" => Some(Box::new(KexGex::sha1())),
        "diffie-hellman-group-exchange-sha256" => Some(Box::new(KexGex::sha256())),
        _ => None,
    }
}

/// Derives `nbytes` of key material for `letter` (RFC 4253 Section 7.2).
///
/// `HASH(K || H || letter || session_id)`, extended with
/// `HASH(K || H || everything so far)` until long enough.
pub fn derive_key(
    hash: HashAlgorithm,
    k: &BigUint,
    h: &[u8],
    letter: u8,
    session_id: &[u8],
    nbytes: usize,
) -> Vec<u8> {
    let mut k_enc = Message::new();
    k_enc.add_mpint(k);
    let k_enc = k_enc.as_bytes();

    let mut out = hash.digest(&[k_enc, h, &[letter], session_id]);
    while out.len() < nbytes {
        let next = hash.digest(&[k_enc, h, &out]);
        out.extend_from_slice(&next);
    }
    out.truncate(nbytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn sample_init() -> KexInit {
        KexInit::new(
            &names(&["diffie-hellman-group14-sha1"]),
            &names(&["ssh-ed25519", "ssh-rsa"]),
            &names(&["aes128-ctr", "aes256-ctr"]),
            &names(&["hmac-sha2-256"]),
            &names(&["none"]),
        )
    }

    #[test]
    fn test_kexinit_wire_layout() {
        let init = sample_init();
        let m = init.to_message();
        let bytes = m.as_bytes();
        assert_eq!(bytes[0], 20);
        assert_eq!(&bytes[1..17], &init.cookie);
        // first_kex_packet_follows + reserved uint32
        assert_eq!(&bytes[bytes.len() - 5..], &[0, 0, 0, 0, 0]);

        let mut body = Message::from_bytes(&bytes[1..]);
        let parsed = KexInit::from_message(&mut body).unwrap();
        assert_eq!(parsed, init);
    }

    #[test]
    fn test_kexinit_trailing_bytes_not_consumed() {
        let mut raw = sample_init().to_message().into_bytes();
        let hashed_len = raw.len() - 1;
        raw.push(0);

        let mut body = Message::from_bytes(&raw[1..]);
        KexInit::from_message(&mut body).unwrap();
        assert_eq!(body.get_so_far().len(), hashed_len);
    }

    #[test]
    fn test_negotiate_prefers_client_order() {
        let client = names(&["aes256-ctr", "aes128-ctr"]);
        let server = names(&["aes128-ctr", "aes256-ctr"]);
        assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "aes256-ctr");
        assert!(negotiate_algorithm(&client, &names(&["3des-cbc"])).is_none());
    }

    #[test]
    fn test_negotiation_failure_messages() {
        let client = sample_init();
        let mut server = sample_init();
        server.kex_algorithms = names(&["curve25519-sha256"]);
        match NegotiatedAlgorithms::negotiate(&client, &server) {
            Err(KestrelError::Protocol(msg)) => {
                assert_eq!(msg, "Incompatible ssh peer (no acceptable kex algorithm)")
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }

        let mut server = sample_init();
        server.mac_server_to_client = names(&["hmac-md5"]);
        match NegotiatedAlgorithms::negotiate(&client, &server) {
            Err(KestrelError::Protocol(msg)) => {
                assert_eq!(msg, "Incompatible ssh peer (no acceptable macs)")
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiate_per_direction() {
        let client = sample_init();
        let mut server = sample_init();
        server.encryption_server_to_client = names(&["aes256-ctr"]);
        let agreed = NegotiatedAlgorithms::negotiate(&client, &server).unwrap();
        assert_eq!(agreed.cipher_client_to_server, "aes128-ctr");
        assert_eq!(agreed.cipher_server_to_client, "aes256-ctr");
        assert_eq!(agreed.host_key, "ssh-ed25519");
    }

    #[test]
    fn test_derive_key_extends_with_everything_so_far() {
        let k = BigUint::from(0x1234_5678u32);
        let h = vec![0xaa; 20];
        let sid = vec![0xbb; 20];
        let key = derive_key(HashAlgorithm::Sha1, &k, &h, b'C', &sid, 48);
        assert_eq!(key.len(), 48);

        let mut k_enc = Message::new();
        k_enc.add_mpint(&k);
        let k1 = HashAlgorithm::Sha1.digest(&[k_enc.as_bytes(), &h, b"C", &sid]);
        let k2 = HashAlgorithm::Sha1.digest(&[k_enc.as_bytes(), &h, &k1]);
        let mut k12 = k1.clone();
        k12.extend_from_slice(&k2);
        let k3 = HashAlgorithm::Sha1.digest(&[k_enc.as_bytes(), &h, &k12]);

        assert_eq!(&key[..20], &k1[..]);
        assert_eq!(&key[20..40], &k2[..]);
        assert_eq!(&key[40..], &k3[..8]);
    }

    #[test]
    fn test_engine_for_names() {
        for name in SUPPORTED_KEX {
            let engine = engine_for(name).unwrap();
            assert_eq!(engine.name(), *name);
        }
        assert_eq!(
            engine_for("diffie-hellman-group-exchange-sha256")
                .unwrap()
                .hash_algorithm(),
            HashAlgorithm::Sha256
        );
        assert!(engine_for("curve25519-sha256").is_none());
    }
}
