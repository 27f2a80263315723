//! Error types for Kestrel

use std::fmt;

/// Unified error type for all Kestrel operations
#[derive(Debug)]
pub enum KestrelError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed frame, bad banner, unexpected packet)
    Protocol(String),

    /// Security error (MAC mismatch, bad key material, bad host signature)
    Security(String),

    /// An inbound packet failed its MAC check
    MacMismatch,

    /// Authentication failure that the caller may recover from
    Auth(String),

    /// Not enough buffered data or window space to finish the operation yet.
    ///
    /// This is a control-flow signal: retry the same call once more bytes
    /// arrive or the peer grants more window.
    WouldBlock,

    /// The peer kept sending after a rekey was requested
    ResourceExhausted(String),

    /// A channel open was rejected by the peer
    Channel {
        /// Reason code from the wire
        code: u32,
        /// Human readable reason
        reason: String,
    },

    /// A decode ran past the end of the buffer
    Truncated {
        /// Bytes the read needed
        needed: usize,
        /// Bytes that were left
        available: usize,
    },

    /// The session or channel is closed
    Closed(String),

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl KestrelError {
    /// Returns true for the resumable "try again later" signal.
    pub fn is_would_block(&self) -> bool {
        matches!(self, KestrelError::WouldBlock)
    }

    /// Returns true if the error must tear down the whole transport.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KestrelError::Io(_)
                | KestrelError::Protocol(_)
                | KestrelError::Security(_)
                | KestrelError::MacMismatch
                | KestrelError::ResourceExhausted(_)
                | KestrelError::Truncated { .. }
        )
    }
}

impl fmt::Display for KestrelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KestrelError::Io(e) => write!(f, "IO error: {}", e),
            KestrelError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KestrelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KestrelError::Security(msg) => write!(f, "Security error: {}", msg),
            KestrelError::MacMismatch => write!(f, "Security error: Mismatched MAC"),
            KestrelError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            KestrelError::WouldBlock => write!(f, "Operation would block"),
            KestrelError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            KestrelError::Channel { code, reason } => {
                write!(f, "Channel error ({}): {}", code, reason)
            }
            KestrelError::Truncated { needed, available } => write!(
                f,
                "Truncated message: needed {} bytes, {} available",
                needed, available
            ),
            KestrelError::Closed(msg) => write!(f, "Closed: {}", msg),
            KestrelError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            KestrelError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for KestrelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KestrelError::Io(e) => Some(e),
            KestrelError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KestrelError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            KestrelError::WouldBlock
        } else {
            KestrelError::Io(err)
        }
    }
}

/// Result type for Kestrel operations
pub type KestrelResult<T> = Result<T, KestrelError>;
