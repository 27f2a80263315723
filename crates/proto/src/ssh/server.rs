//! Server-side policy hooks.
//!
//! A transport started with [`Transport::start_server`] consults a
//! [`ServerInterface`] for every decision that belongs to the application:
//! which users may log in and how, which channels may be opened, and which
//! channel requests (pty, shell, exec, ...) are granted.
//!
//! Every method has a conservative default that refuses, so an
//! implementation only overrides what it supports.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::server::{AuthResult, ServerInterface, OPEN_SUCCEEDED};
//!
//! struct PasswordOnly;
//!
//! impl ServerInterface for PasswordOnly {
//!     fn check_channel_request(&mut self, kind: &str, _chanid: u32) -> u32 {
//!         if kind == "session" { OPEN_SUCCEEDED } else { 1 }
//!     }
//!
//!     fn check_auth_password(&mut self, username: &str, password: &str) -> AuthResult {
//!         if username == "robey" && password == "foo" {
//!             AuthResult::Successful
//!         } else {
//!             AuthResult::Failed
//!         }
//!     }
//! }
//! ```
//!
//! [`Transport::start_server`]: crate::ssh::transport::Transport::start_server

use crate::ssh::hostkey::PublicKey;
use crate::ssh::message::Message;

/// Channel open accepted.
pub const OPEN_SUCCEEDED: u32 = 0;

/// Channel open failure reason codes (RFC 4254 Section 5.1).
pub mod open_failure {
    /// The peer's policy forbids this channel.
    pub const ADMINISTRATIVELY_PROHIBITED: u32 = 1;
    /// The forwarding target could not be reached.
    pub const CONNECT_FAILED: u32 = 2;
    /// Channel type not supported.
    pub const UNKNOWN_CHANNEL_TYPE: u32 = 3;
    /// Out of resources.
    pub const RESOURCE_SHORTAGE: u32 = 4;

    /// Human readable text for a reason code.
    pub fn reason_text(code: u32) -> &'static str {
        match code {
            ADMINISTRATIVELY_PROHIBITED => "Administratively prohibited",
            CONNECT_FAILED => "Connect failed",
            UNKNOWN_CHANNEL_TYPE => "Unknown channel type",
            RESOURCE_SHORTAGE => "Resource shortage",
            _ => "(unknown code)",
        }
    }
}

/// Outcome of one authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// The user is fully authenticated.
    Successful,
    /// This method passed, but another is still required.
    PartiallySuccessful,
    /// The credentials were wrong.
    Failed,
}

/// A keyboard-interactive challenge to send to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractiveQuery {
    /// Dialog title
    pub name: String,
    /// Instructions shown above the prompts
    pub instructions: String,
    /// `(prompt, echo)` pairs
    pub prompts: Vec<(String, bool)>,
}

impl InteractiveQuery {
    /// Creates a query with no prompts.
    pub fn new(name: &str, instructions: &str) -> Self {
        Self {
            name: name.to_string(),
            instructions: instructions.to_string(),
            prompts: Vec::new(),
        }
    }

    /// Appends a prompt; `echo` controls whether the answer is shown.
    pub fn add_prompt(&mut self, prompt: &str, echo: bool) -> &mut Self {
        self.prompts.push((prompt.to_string(), echo));
        self
    }
}

/// Keyboard-interactive step: ask (more) questions, or decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveAuth {
    /// Send an INFO_REQUEST and wait for the answers.
    Query(InteractiveQuery),
    /// Finish with this result.
    Done(AuthResult),
}

/// Parameters of a `pty-req` channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal type, e.g. `vt100`
    pub term: String,
    /// Width in characters
    pub width: u32,
    /// Height in characters
    pub height: u32,
    /// Width in pixels
    pub pixel_width: u32,
    /// Height in pixels
    pub pixel_height: u32,
    /// Encoded terminal modes
    pub modes: Vec<u8>,
}

/// Parameters of an `x11-req` channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Request {
    /// Forward only one connection
    pub single_connection: bool,
    /// Authentication protocol name
    pub auth_protocol: String,
    /// Hex authentication cookie
    pub auth_cookie: String,
    /// X11 screen number
    pub screen_number: u32,
}

/// Application policy for a server-mode transport.
pub trait ServerInterface: Send {
    /// Decides whether an inbound channel of `kind` may open as `chanid`.
    ///
    /// Returns [`OPEN_SUCCEEDED`] or an [`open_failure`] reason code.
    fn check_channel_request(&mut self, _kind: &str, _chanid: u32) -> u32 {
        open_failure::ADMINISTRATIVELY_PROHIBITED
    }

    /// Comma-separated methods `username` may try next.
    fn get_allowed_auths(&mut self, _username: &str) -> String {
        "password".to_string()
    }

    /// Called for the `none` method and for unknown methods.
    fn check_auth_none(&mut self, _username: &str) -> AuthResult {
        AuthResult::Failed
    }

    /// Checks a password.
    fn check_auth_password(&mut self, _username: &str, _password: &str) -> AuthResult {
        AuthResult::Failed
    }

    /// Decides whether `key` is acceptable for `username`.
    ///
    /// Only the key is checked here; the transport verifies the signature
    /// itself before granting access.
    fn check_auth_publickey(&mut self, _username: &str, _key: &PublicKey) -> AuthResult {
        AuthResult::Failed
    }

    /// Starts keyboard-interactive authentication.
    fn check_auth_interactive(&mut self, _username: &str, _submethods: &str) -> InteractiveAuth {
        InteractiveAuth::Done(AuthResult::Failed)
    }

    /// Checks the answers to the last [`InteractiveQuery`].
    fn check_auth_interactive_response(&mut self, _responses: &[String]) -> InteractiveAuth {
        InteractiveAuth::Done(AuthResult::Failed)
    }

    /// Banner sent right after the userauth service is accepted.
    fn get_banner(&mut self) -> Option<String> {
        None
    }

    /// Handles a global request; `m` is positioned at its type-specific data.
    fn check_global_request(&mut self, _kind: &str, _m: &mut Message) -> bool {
        false
    }

    /// Grants or refuses a pseudo-terminal.
    fn check_channel_pty_request(&mut self, _chanid: u32, _pty: &PtyRequest) -> bool {
        false
    }

    /// Grants or refuses a shell.
    fn check_channel_shell_request(&mut self, _chanid: u32) -> bool {
        false
    }

    /// Grants or refuses running `command`.
    fn check_channel_exec_request(&mut self, _chanid: u32, _command: &[u8]) -> bool {
        false
    }

    /// Grants or refuses a subsystem such as `sftp`.
    fn check_channel_subsystem_request(&mut self, _chanid: u32, _name: &str) -> bool {
        false
    }

    /// Handles a terminal resize.
    fn check_channel_window_change_request(
        &mut self,
        _chanid: u32,
        _width: u32,
        _height: u32,
        _pixel_width: u32,
        _pixel_height: u32,
    ) -> bool {
        false
    }

    /// Grants or refuses X11 forwarding.
    fn check_channel_x11_request(&mut self, _chanid: u32, _request: &X11Request) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl ServerInterface for Nothing {}

    #[test]
    fn test_defaults_refuse() {
        let mut s = Nothing;
        assert_eq!(
            s.check_channel_request("session", 1),
            open_failure::ADMINISTRATIVELY_PROHIBITED
        );
        assert_eq!(s.check_auth_password("u", "p"), AuthResult::Failed);
        assert_eq!(
            s.check_auth_interactive("u", ""),
            InteractiveAuth::Done(AuthResult::Failed)
        );
        assert!(!s.check_channel_exec_request(1, b"ls"));
        assert_eq!(s.get_allowed_auths("u"), "password");
    }

    #[test]
    fn test_interactive_query_builder() {
        let mut q = InteractiveQuery::new("login", "answer please");
        q.add_prompt("Password: ", false).add_prompt("Token: ", true);
        assert_eq!(q.prompts.len(), 2);
        assert!(!q.prompts[0].1);
        assert!(q.prompts[1].1);
    }

    #[test]
    fn test_reason_text() {
        assert_eq!(open_failure::reason_text(2), "Connect failed");
        assert_eq!(open_failure::reason_text(99), "(unknown code)");
    }
}
