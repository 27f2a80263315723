//! SSH (Secure Shell) protocol implementation.
//!
//! # Architecture
//!
//! The implementation is layered, bottom-up:
//!
//! 1. **Messages** ([`message`]) - SSH wire types: byte, uint32, uint64,
//!    string, mpint, name-list
//! 2. **Packets** ([`packet`]) - binary packet protocol with cipher, MAC,
//!    compression and rekey accounting (RFC 4253 Section 6)
//! 3. **Key exchange** ([`kex`], [`kex_dh`], [`kex_gex`]) - algorithm
//!    negotiation and the Diffie-Hellman engines
//! 4. **Authentication** ([`auth`]) - RFC 4252 client and server state
//!    machine, with policy supplied by [`server::ServerInterface`]
//! 5. **Channels** ([`channel`]) - RFC 4254 channels with windowing
//! 6. **Transport** ([`transport`]) - ties the layers together over one
//!    byte stream
//! 7. **Async driver** ([`session`], [`client`]) - tokio socket plumbing
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::{BufferedStream, Transport, TransportConfig};
//!
//! let mut transport = Transport::new(BufferedStream::new(), TransportConfig::new(true));
//! transport.start_client().unwrap();
//!
//! let banner = transport.stream_mut().take_written();
//! assert!(banner.starts_with(b"SSH-2.0-Kestrel_"));
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod kex_gex;
pub mod message;
pub mod packet;
pub mod server;
pub mod session;
pub mod transport;
pub mod version;

// Re-export main types
pub use auth::{AuthHandler, AuthMethod, AuthStatus, InteractiveHandler};
pub use channel::Channel;
pub use client::{ExecOutput, SshClient, SshClientConfig};
pub use crypto::{CipherAlgorithm, CompressionAlgorithm, HashAlgorithm, MacAlgorithm};
pub use hostkey::{DssKey, Ed25519Key, PublicKey, RsaKey, Signable, Verifiable};
pub use kex::{negotiate_algorithm, GexBits, KexEngine, KexInit, NegotiatedAlgorithms};
pub use kex_dh::KexGroup;
pub use kex_gex::KexGex;
pub use message::{Message, MessageType};
pub use packet::{BufferedStream, ByteStream, Packetizer};
pub use server::{AuthResult, InteractiveAuth, InteractiveQuery, ServerInterface};
pub use session::Session;
pub use transport::{GlobalResponse, Transport, TransportConfig};
pub use version::Version;
