//! SSH2 protocol engine for the Kestrel project.
//!
//! This crate implements the client and server sides of SSH2:
//!
//! - **Transport** (RFC 4253) - banner exchange, algorithm negotiation,
//!   Diffie-Hellman key exchange (fixed groups and group exchange),
//!   encryption, MACs, compression and rekeying
//! - **Authentication** (RFC 4252, RFC 4256) - none, password, publickey
//!   and keyboard-interactive
//! - **Connection** (RFC 4254) - channels with flow control, channel
//!   requests and global requests
//!
//! The engine is sans-IO: [`ssh::transport::Transport`] works on any
//! [`ssh::packet::ByteStream`], and [`ssh::session::Session`] drives it
//! over a tokio socket.
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support (client + server)
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::Message;
//! use kestrel_proto::ssh::MessageType;
//!
//! let mut m = Message::with_type(MessageType::ServiceRequest);
//! m.add_string("ssh-userauth");
//!
//! let mut parsed = Message::from_bytes(m.as_bytes());
//! assert_eq!(parsed.get_byte().unwrap(), MessageType::ServiceRequest as u8);
//! assert_eq!(parsed.get_text().unwrap(), "ssh-userauth");
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted crates (`ring`, `dalek`,
//!   RustCrypto)
//! - MACs are compared in constant time
//! - Passwords and session keys are zeroized on drop
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 4419](https://datatracker.ietf.org/doc/html/rfc4419) - Diffie-Hellman Group Exchange

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
