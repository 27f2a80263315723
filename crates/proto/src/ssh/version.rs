//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both endpoints send an identification line before any binary packet:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The full line (without CR LF, comment included) is kept verbatim because
//! it is hashed into the key exchange as `V_C` / `V_S`.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::version::Version;
//!
//! let version = Version::new("Kestrel_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Kestrel_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! assert_eq!(parsed.comments(), Some("Ubuntu"));
//! ```

use kestrel_platform::{KestrelError, KestrelResult};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// SSH protocol identification line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version ("2.0" or "1.99")
    proto_version: String,
    /// Software version (e.g., "OpenSSH_8.9")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a protocol 2.0 identification for `software`.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Identification used when no software version is configured.
    ///
    /// ```rust
    /// use kestrel_proto::ssh::version::Version;
    ///
    /// assert!(Version::default_kestrel().to_string().starts_with("SSH-2.0-Kestrel_"));
    /// ```
    pub fn default_kestrel() -> Self {
        Self::new(&format!("Kestrel_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses a peer banner line.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] when the line does not start with
    /// `SSH-`, has fewer than three dash-separated segments, names a
    /// protocol other than 2.0/1.99, is over 255 bytes, or contains NUL.
    pub fn parse(line: &str) -> KestrelResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if !line.starts_with("SSH-") {
            return Err(KestrelError::Protocol(format!(
                "Indecipherable protocol version \"{}\"",
                line
            )));
        }

        if line.len() > MAX_VERSION_LENGTH {
            return Err(KestrelError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(KestrelError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        // The comment is everything after the first space
        let (ident, comments) = match line.find(' ') {
            Some(i) => (&line[..i], Some(line[i + 1..].to_string())),
            None => (line, None),
        };

        let segs: Vec<&str> = ident.splitn(3, '-').collect();
        if segs.len() < 3 {
            return Err(KestrelError::Protocol("Invalid SSH banner".to_string()));
        }

        let proto_version = segs[1];
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(KestrelError::Protocol(format!(
                "Incompatible version ({} instead of 2.0)",
                proto_version
            )));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version: segs[2].to_string(),
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol_msg(result: KestrelResult<Version>) -> String {
        match result {
            Err(KestrelError::Protocol(msg)) => msg,
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_version_display() {
        let version = Version::new("Kestrel_0.1.0", Some("test comment"));
        assert_eq!(version.to_string(), "SSH-2.0-Kestrel_0.1.0 test comment");
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Kestrel_0.1.0 test comment\r\n");
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_version_parse_accepts_1_99() {
        let version = Version::parse("SSH-1.99-Legacy").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_indecipherable() {
        let msg = protocol_msg(Version::parse("HTTP/1.1 400 Bad Request"));
        assert_eq!(msg, "Indecipherable protocol version \"HTTP/1.1 400 Bad Request\"");
    }

    #[test]
    fn test_version_parse_too_few_segments() {
        let msg = protocol_msg(Version::parse("SSH-2.0 comment-with-dashes"));
        assert_eq!(msg, "Invalid SSH banner");
    }

    #[test]
    fn test_version_parse_incompatible() {
        let msg = protocol_msg(Version::parse("SSH-1.5-OldClient"));
        assert_eq!(msg, "Incompatible version (1.5 instead of 2.0)");
    }

    #[test]
    fn test_version_parse_limits() {
        let long_string = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long_string).is_err());
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
    }
}
