//! SSH user authentication (RFC 4252, RFC 4256).
//!
//! [`AuthHandler`] runs both halves of the userauth sub-protocol:
//!
//! - **Client**: `start` picks a method and asks for the `ssh-userauth`
//!   service; the request itself goes out once the server accepts it.
//! - **Server**: requests are checked against a [`ServerInterface`]; the
//!   handler verifies publickey signatures itself and enforces the failure
//!   cap.
//!
//! The handler never writes to the wire. Each call returns an
//! [`AuthOutcome`] listing the messages to send and whether the session
//! just became authenticated or must be disconnected.
//!
//! # Supported Methods
//!
//! - `none`
//! - `password`
//! - `publickey` (with the unsigned `PK_OK` query on the server side)
//! - `keyboard-interactive`

use crate::ssh::hostkey::{PublicKey, Signable, Verifiable};
use crate::ssh::message::{disconnect, Message, MessageType, USERAUTH_INFO_REQUEST};
use crate::ssh::server::{AuthResult, InteractiveAuth, InteractiveQuery, ServerInterface};
use kestrel_platform::{KestrelError, KestrelResult};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Service carrying the userauth exchange.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service requested once authenticated.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Failed attempts tolerated before the server hangs up.
pub const MAX_AUTH_FAILURES: u32 = 10;

/// Answers keyboard-interactive prompts: `(title, instructions, prompts)`
/// where each prompt is `(text, echo)`.
pub type InteractiveHandler =
    Box<dyn FnMut(&str, &str, &[(String, bool)]) -> Vec<String> + Send>;

/// Client-side authentication method.
pub enum AuthMethod {
    /// Probe with no credentials
    None,
    /// Password (zeroized on drop)
    Password(String),
    /// Key pair; the private half signs the session blob
    PublicKey(Arc<dyn Signable>),
    /// Keyboard-interactive with a prompt handler and submethod hint
    Interactive {
        /// Prompt handler
        handler: InteractiveHandler,
        /// Comma-separated submethods, usually empty
        submethods: String,
    },
}

impl AuthMethod {
    /// Wire name of the method.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::Interactive { .. } => "keyboard-interactive",
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::PublicKey(key) => write!(f, "PublicKey({})", key.name()),
            other => write!(f, "{}", other.name()),
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut pw) = self {
            pw.zeroize();
        }
    }
}

/// Where client-side authentication stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    /// Nothing attempted yet
    NotStarted,
    /// Waiting for the server
    Pending,
    /// Fully authenticated
    Success,
    /// The method worked but more are required; lists what may follow
    Partial(Vec<String>),
    /// The method is not allowed here; lists what is
    BadMethod(Vec<String>),
    /// The credentials were rejected
    Failed,
}

/// Per-call inputs owned by the transport.
pub struct AuthContext<'a> {
    /// Session identifier, bound into publickey signatures
    pub session_id: &'a [u8],
    /// Application policy; present only in server mode
    pub server: Option<&'a mut (dyn ServerInterface + 'static)>,
}

/// What the transport must do after a call into the handler.
#[derive(Debug, Default)]
pub struct AuthOutcome {
    /// Messages to send, in order
    pub outbound: Vec<Message>,
    /// Authentication completed during this call
    pub authenticated: bool,
    /// Send DISCONNECT with this `(code, reason)` and close
    pub disconnect: Option<(u32, String)>,
}

impl AuthOutcome {
    fn send(msg: Message) -> Self {
        Self {
            outbound: vec![msg],
            ..Self::default()
        }
    }

    fn disconnect(code: u32, reason: &str) -> Self {
        Self {
            disconnect: Some((code, reason.to_string())),
            ..Self::default()
        }
    }
}

/// Builds the blob a publickey signature covers (RFC 4252 Section 7).
pub fn userauth_signature_data(
    session_id: &[u8],
    username: &str,
    service: &str,
    key_type: &str,
    key_blob: &[u8],
) -> Vec<u8> {
    let mut m = Message::new();
    m.add_string(session_id)
        .add_byte(MessageType::UserauthRequest as u8)
        .add_string(username)
        .add_string(service)
        .add_string("publickey")
        .add_boolean(true)
        .add_string(key_type)
        .add_string(key_blob);
    m.into_bytes()
}

/// Userauth state machine for one transport.
pub struct AuthHandler {
    server_mode: bool,
    authenticated: bool,
    username: Option<String>,

    // client
    method: Option<AuthMethod>,
    status: AuthStatus,
    banner: Option<String>,

    // server
    fail_count: u32,
    interactive_pending: bool,
}

impl AuthHandler {
    /// Creates a handler for the given side.
    pub fn new(server_mode: bool) -> Self {
        Self {
            server_mode,
            authenticated: false,
            username: None,
            method: None,
            status: AuthStatus::NotStarted,
            banner: None,
            fail_count: 0,
            interactive_pending: false,
        }
    }

    /// True once the server has accepted us (or we accepted the client).
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Username bound to the session, if any.
    pub fn get_username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Client-side progress.
    pub fn status(&self) -> &AuthStatus {
        &self.status
    }

    /// Banner sent by the server, if any.
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Failed attempts seen so far (server side).
    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    /// True if this handler consumes `ptype` on this side.
    pub fn handles(&self, ptype: u8) -> bool {
        let Some(mt) = MessageType::from_u8(ptype) else {
            return false;
        };
        if self.server_mode {
            matches!(
                mt,
                MessageType::ServiceRequest
                    | MessageType::UserauthRequest
                    | MessageType::UserauthInfoResponse
            )
        } else {
            matches!(
                mt,
                MessageType::ServiceAccept
                    | MessageType::UserauthFailure
                    | MessageType::UserauthSuccess
                    | MessageType::UserauthBanner
                    | MessageType::UserauthPkOk
            )
        }
    }

    /// Starts a client attempt; returns the SERVICE_REQUEST to send.
    pub fn start(&mut self, username: &str, method: AuthMethod) -> Message {
        debug!("Starting {} auth for {}", method.name(), username);
        self.username = Some(username.to_string());
        self.method = Some(method);
        self.status = AuthStatus::Pending;
        self.authenticated = false;

        let mut m = Message::with_type(MessageType::ServiceRequest);
        m.add_string(USERAUTH_SERVICE);
        m
    }

    /// Handles one inbound userauth message.
    pub fn handle(
        &mut self,
        ptype: u8,
        m: &mut Message,
        ctx: &mut AuthContext<'_>,
    ) -> KestrelResult<AuthOutcome> {
        let mt = MessageType::from_u8(ptype)
            .ok_or_else(|| KestrelError::Protocol(format!("Unknown auth message {}", ptype)))?;
        match (self.server_mode, mt) {
            (true, MessageType::ServiceRequest) => self.parse_service_request(m, ctx),
            (true, MessageType::UserauthRequest) => self.parse_userauth_request(m, ctx),
            (true, MessageType::UserauthInfoResponse) => self.parse_info_response(m, ctx),
            (false, MessageType::ServiceAccept) => self.parse_service_accept(m, ctx),
            (false, MessageType::UserauthFailure) => self.parse_userauth_failure(m),
            (false, MessageType::UserauthSuccess) => self.parse_userauth_success(),
            (false, MessageType::UserauthBanner) => self.parse_userauth_banner(m),
            // 60 doubles as INFO_REQUEST; PK_OK never reaches a client that signs up front
            (false, MessageType::UserauthPkOk) => self.parse_info_request(m),
            _ => Err(KestrelError::Protocol(format!(
                "Unexpected auth message {}",
                mt.name()
            ))),
        }
    }

    // client

    fn parse_service_accept(
        &mut self,
        m: &mut Message,
        ctx: &AuthContext<'_>,
    ) -> KestrelResult<AuthOutcome> {
        let service = m.get_text()?;
        if service != USERAUTH_SERVICE {
            debug!("Service request \"{}\" accepted (?)", service);
            return Ok(AuthOutcome::default());
        }
        debug!("userauth is OK");

        let username = self.username.clone().unwrap_or_default();
        let method = self
            .method
            .as_ref()
            .ok_or_else(|| KestrelError::Protocol("Service accepted with no auth pending".into()))?;

        let mut req = Message::with_type(MessageType::UserauthRequest);
        req.add_string(&username)
            .add_string(CONNECTION_SERVICE)
            .add_string(method.name());
        match method {
            AuthMethod::None => {}
            AuthMethod::Password(pw) => {
                req.add_boolean(false).add_string(pw);
            }
            AuthMethod::PublicKey(key) => {
                let blob = key.public_blob();
                let data = userauth_signature_data(
                    ctx.session_id,
                    &username,
                    CONNECTION_SERVICE,
                    key.name(),
                    &blob,
                );
                let sig = key.sign_ssh_data(&data)?;
                req.add_boolean(true)
                    .add_string(key.name())
                    .add_string(&blob)
                    .add_string(&sig);
            }
            AuthMethod::Interactive { submethods, .. } => {
                req.add_string("").add_string(submethods);
            }
        }
        Ok(AuthOutcome::send(req))
    }

    fn parse_userauth_failure(&mut self, m: &mut Message) -> KestrelResult<AuthOutcome> {
        let authlist = m.get_list()?;
        let partial = m.get_boolean()?;
        let method = self.method.as_ref().map(AuthMethod::name).unwrap_or("none");

        if partial {
            info!("Authentication continues...");
            debug!("Methods: {:?}", authlist);
            self.status = AuthStatus::Partial(authlist);
        } else if !authlist.iter().any(|a| a == method) {
            debug!("Authentication type ({}) not permitted.", method);
            debug!("Allowed methods: {:?}", authlist);
            self.status = AuthStatus::BadMethod(authlist);
        } else {
            info!("Authentication ({}) failed.", method);
            self.status = AuthStatus::Failed;
            self.username = None;
        }
        self.authenticated = false;
        self.method = None;
        Ok(AuthOutcome::default())
    }

    fn parse_userauth_success(&mut self) -> KestrelResult<AuthOutcome> {
        let method = self.method.as_ref().map(AuthMethod::name).unwrap_or("none");
        info!("Authentication ({}) successful!", method);
        self.authenticated = true;
        self.status = AuthStatus::Success;
        self.method = None;
        Ok(AuthOutcome {
            authenticated: true,
            ..AuthOutcome::default()
        })
    }

    fn parse_userauth_banner(&mut self, m: &mut Message) -> KestrelResult<AuthOutcome> {
        let banner = m.get_text()?;
        let _lang = m.get_string()?;
        info!("Auth banner: {}", banner);
        self.banner = Some(banner);
        Ok(AuthOutcome::default())
    }

    fn parse_info_request(&mut self, m: &mut Message) -> KestrelResult<AuthOutcome> {
        let Some(AuthMethod::Interactive { handler, .. }) = self.method.as_mut() else {
            return Err(KestrelError::Protocol(
                "Illegal info request from server".to_string(),
            ));
        };
        let title = m.get_text()?;
        let instructions = m.get_text()?;
        let _lang = m.get_string()?;
        let count = m.get_int()?;
        let mut prompts = Vec::new();
        for _ in 0..count {
            let text = m.get_text()?;
            let echo = m.get_boolean()?;
            prompts.push((text, echo));
        }

        let responses = handler(&title, &instructions, &prompts);
        let mut reply = Message::with_type(MessageType::UserauthInfoResponse);
        reply.add_int(responses.len() as u32);
        for r in &responses {
            reply.add_string(r);
        }
        Ok(AuthOutcome::send(reply))
    }

    // server

    fn parse_service_request(
        &mut self,
        m: &mut Message,
        ctx: &mut AuthContext<'_>,
    ) -> KestrelResult<AuthOutcome> {
        let service = m.get_text()?;
        if service != USERAUTH_SERVICE {
            warn!("Client requested unknown service \"{}\"", service);
            return Ok(AuthOutcome::disconnect(
                disconnect::SERVICE_NOT_AVAILABLE,
                "Service not available",
            ));
        }

        let mut accept = Message::with_type(MessageType::ServiceAccept);
        accept.add_string(&service);
        let mut out = AuthOutcome::send(accept);

        if let Some(text) = ctx.server.as_deref_mut().and_then(|s| s.get_banner()) {
            let mut banner = Message::with_type(MessageType::UserauthBanner);
            banner.add_string(text).add_string("en");
            out.outbound.push(banner);
        }
        Ok(out)
    }

    fn parse_userauth_request(
        &mut self,
        m: &mut Message,
        ctx: &mut AuthContext<'_>,
    ) -> KestrelResult<AuthOutcome> {
        if self.authenticated {
            // a client that keeps asking after success is ignored
            return Ok(AuthOutcome::default());
        }
        let username = m.get_text()?;
        let service = m.get_text()?;
        let method = m.get_text()?;
        debug!("Auth request (type={}) service={}, username={}", method, service, username);

        if service != CONNECTION_SERVICE {
            return Ok(AuthOutcome::disconnect(
                disconnect::SERVICE_NOT_AVAILABLE,
                "Service not available",
            ));
        }
        if self.username.as_deref().is_some_and(|u| u != username) {
            warn!("Auth rejected because the client attempted to change username in mid-flight");
            return Ok(AuthOutcome::disconnect(
                disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
                "No more auth methods available",
            ));
        }
        self.username = Some(username.clone());

        let server = ctx
            .server
            .as_deref_mut()
            .ok_or_else(|| KestrelError::Config("Server mode requires a ServerInterface".into()))?;

        let result = match method.as_str() {
            "password" => {
                let change = m.get_boolean()?;
                let mut password = m.get_text()?;
                let result = if change {
                    // password changes are not supported
                    let mut new_password = m.get_text()?;
                    new_password.zeroize();
                    debug!("Auth request to change passwords (rejected)");
                    AuthResult::Failed
                } else {
                    server.check_auth_password(&username, &password)
                };
                password.zeroize();
                result
            }
            "publickey" => {
                let signed = m.get_boolean()?;
                let key_type = m.get_text()?;
                let key_blob = m.get_string()?;
                let key = match PublicKey::from_blob(&key_blob) {
                    Ok(key) => key,
                    Err(e) => {
                        info!("Auth rejected: public key: {}", e);
                        return Ok(AuthOutcome::disconnect(
                            disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
                            "No more auth methods available",
                        ));
                    }
                };
                if !key_type_matches(&key_type, &key) {
                    info!("Auth rejected: key type {} does not match {} blob", key_type, key.name());
                    AuthResult::Failed
                } else if !signed {
                    // tell the client whether signing is worth it
                    let result = server.check_auth_publickey(&username, &key);
                    if result != AuthResult::Failed {
                        let mut ok = Message::with_type(MessageType::UserauthPkOk);
                        ok.add_string(&key_type).add_string(&key_blob);
                        return Ok(AuthOutcome::send(ok));
                    }
                    result
                } else {
                    let sig = m.get_string()?;
                    match server.check_auth_publickey(&username, &key) {
                        AuthResult::Failed => AuthResult::Failed,
                        result => {
                            let data = userauth_signature_data(
                                ctx.session_id,
                                &username,
                                &service,
                                &key_type,
                                &key_blob,
                            );
                            if key.verify_ssh_sig(&data, &sig).unwrap_or(false) {
                                result
                            } else {
                                info!("Auth rejected: invalid signature");
                                AuthResult::Failed
                            }
                        }
                    }
                }
            }
            "keyboard-interactive" => {
                let _lang = m.get_string()?;
                let submethods = m.get_text()?;
                match server.check_auth_interactive(&username, &submethods) {
                    InteractiveAuth::Query(q) => {
                        self.interactive_pending = true;
                        return Ok(AuthOutcome::send(info_request(&q)));
                    }
                    InteractiveAuth::Done(result) => result,
                }
            }
            _ => server.check_auth_none(&username),
        };

        Ok(self.send_auth_result(server, &username, &method, result))
    }

    fn parse_info_response(
        &mut self,
        m: &mut Message,
        ctx: &mut AuthContext<'_>,
    ) -> KestrelResult<AuthOutcome> {
        if !self.interactive_pending {
            return Err(KestrelError::Protocol("Unexpected info response".to_string()));
        }
        let count = m.get_int()?;
        let mut responses = Vec::new();
        for _ in 0..count {
            responses.push(m.get_text()?);
        }

        let server = ctx
            .server
            .as_deref_mut()
            .ok_or_else(|| KestrelError::Config("Server mode requires a ServerInterface".into()))?;
        let result = match server.check_auth_interactive_response(&responses) {
            InteractiveAuth::Query(q) => return Ok(AuthOutcome::send(info_request(&q))),
            InteractiveAuth::Done(result) => result,
        };
        responses.iter_mut().for_each(Zeroize::zeroize);
        self.interactive_pending = false;

        let username = self.username.clone().unwrap_or_default();
        Ok(self.send_auth_result(server, &username, "keyboard-interactive", result))
    }

    fn send_auth_result(
        &mut self,
        server: &mut dyn ServerInterface,
        username: &str,
        method: &str,
        result: AuthResult,
    ) -> AuthOutcome {
        if result == AuthResult::Successful {
            info!("Auth granted ({}).", method);
            self.authenticated = true;
            return AuthOutcome {
                outbound: vec![Message::with_type(MessageType::UserauthSuccess)],
                authenticated: true,
                disconnect: None,
            };
        }

        info!("Auth rejected ({}).", method);
        let mut fail = Message::with_type(MessageType::UserauthFailure);
        fail.add_string(server.get_allowed_auths(username))
            .add_boolean(result == AuthResult::PartiallySuccessful);
        if result == AuthResult::Failed {
            self.fail_count += 1;
        }

        let mut out = AuthOutcome::send(fail);
        if self.fail_count >= MAX_AUTH_FAILURES {
            out.disconnect = Some((
                disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
                "No more auth methods available".to_string(),
            ));
        }
        out
    }
}

impl std::fmt::Debug for AuthHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHandler")
            .field("server_mode", &self.server_mode)
            .field("authenticated", &self.authenticated)
            .field("username", &self.username)
            .field("status", &self.status)
            .field("fail_count", &self.fail_count)
            .finish()
    }
}

/// The algorithm named in a publickey request must fit the key blob.
///
/// RSA keys may be offered under the SHA-2 signature names (RFC 8332).
fn key_type_matches(key_type: &str, key: &PublicKey) -> bool {
    match key {
        PublicKey::Rsa { .. } => matches!(key_type, "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512"),
        _ => key_type == key.name(),
    }
}

fn info_request(q: &InteractiveQuery) -> Message {
    let mut m = Message::new();
    m.add_byte(USERAUTH_INFO_REQUEST)
        .add_string(&q.name)
        .add_string(&q.instructions)
        .add_string(b"")
        .add_int(q.prompts.len() as u32);
    for (prompt, echo) in &q.prompts {
        m.add_string(prompt).add_boolean(*echo);
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519Key;

    const SESSION_ID: &[u8] = b"0123456789abcdef0123";

    struct TestServer {
        key: Option<PublicKey>,
    }

    impl ServerInterface for TestServer {
        fn get_allowed_auths(&mut self, _username: &str) -> String {
            "password,publickey,keyboard-interactive".to_string()
        }

        fn check_auth_password(&mut self, username: &str, password: &str) -> AuthResult {
            if username == "robey" && password == "foo" {
                AuthResult::Successful
            } else {
                AuthResult::Failed
            }
        }

        fn check_auth_publickey(&mut self, _username: &str, key: &PublicKey) -> AuthResult {
            if self.key.as_ref() == Some(key) {
                AuthResult::Successful
            } else {
                AuthResult::Failed
            }
        }

        fn check_auth_interactive(&mut self, _username: &str, _submethods: &str) -> InteractiveAuth {
            let mut q = InteractiveQuery::new("login", "");
            q.add_prompt("Password: ", false);
            InteractiveAuth::Query(q)
        }

        fn check_auth_interactive_response(&mut self, responses: &[String]) -> InteractiveAuth {
            if responses == ["cat"] {
                InteractiveAuth::Done(AuthResult::Successful)
            } else {
                InteractiveAuth::Done(AuthResult::Failed)
            }
        }

        fn get_banner(&mut self) -> Option<String> {
            Some("Welcome".to_string())
        }
    }

    /// Splits an outbound message into its type byte and body.
    fn split(msg: &Message) -> (u8, Message) {
        let bytes = msg.as_bytes();
        (bytes[0], Message::from_bytes(&bytes[1..]))
    }

    /// Runs one client attempt against `server` and returns the client.
    fn run(method: AuthMethod, username: &str, server: &mut TestServer) -> AuthHandler {
        let mut client = AuthHandler::new(false);
        let mut srv = AuthHandler::new(true);
        let mut queue = vec![client.start(username, method)];
        let mut from_client = true;

        while !queue.is_empty() {
            let mut next = Vec::new();
            for msg in queue {
                let (ptype, mut body) = split(&msg);
                let out = if from_client {
                    let mut ctx = AuthContext {
                        session_id: SESSION_ID,
                        server: Some(&mut *server),
                    };
                    srv.handle(ptype, &mut body, &mut ctx).unwrap()
                } else {
                    let mut ctx = AuthContext {
                        session_id: SESSION_ID,
                        server: None,
                    };
                    client.handle(ptype, &mut body, &mut ctx).unwrap()
                };
                next.extend(out.outbound);
            }
            queue = next;
            from_client = !from_client;
        }
        client
    }

    #[test]
    fn test_password_success() {
        let mut server = TestServer { key: None };
        let client = run(AuthMethod::Password("foo".into()), "robey", &mut server);
        assert!(client.is_authenticated());
        assert_eq!(client.status(), &AuthStatus::Success);
        assert_eq!(client.banner(), Some("Welcome"));
    }

    #[test]
    fn test_password_failure_clears_username() {
        let mut server = TestServer { key: None };
        let client = run(AuthMethod::Password("bar".into()), "robey", &mut server);
        assert!(!client.is_authenticated());
        assert_eq!(client.status(), &AuthStatus::Failed);
        assert_eq!(client.get_username(), None);
    }

    #[test]
    fn test_method_not_allowed_surfaces_list() {
        let mut server = TestServer { key: None };
        let client = run(AuthMethod::None, "robey", &mut server);
        match client.status() {
            AuthStatus::BadMethod(list) => assert!(list.contains(&"password".to_string())),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_publickey_signature() {
        let key = Arc::new(Ed25519Key::generate());
        let mut server = TestServer {
            key: Some(key.public_key()),
        };
        let client = run(AuthMethod::PublicKey(key), "robey", &mut server);
        assert!(client.is_authenticated());

        let other = Arc::new(Ed25519Key::generate());
        let client = run(AuthMethod::PublicKey(other), "robey", &mut server);
        assert_eq!(client.status(), &AuthStatus::Failed);
    }

    #[test]
    fn test_keyboard_interactive() {
        let mut server = TestServer { key: None };
        let handler: InteractiveHandler = Box::new(|title, _instr, prompts| {
            assert_eq!(title, "login");
            assert_eq!(prompts, &[("Password: ".to_string(), false)]);
            vec!["cat".to_string()]
        });
        let method = AuthMethod::Interactive {
            handler,
            submethods: String::new(),
        };
        let client = run(method, "robey", &mut server);
        assert!(client.is_authenticated());
    }

    fn userauth_request(username: &str, service: &str, method: &str) -> Message {
        let mut m = Message::new();
        m.add_string(username).add_string(service).add_string(method);
        m
    }

    #[test]
    fn test_publickey_query_gets_pk_ok() {
        let key = Ed25519Key::generate();
        let mut server = TestServer {
            key: Some(key.public_key()),
        };
        let mut srv = AuthHandler::new(true);
        let mut req = userauth_request("robey", CONNECTION_SERVICE, "publickey");
        req.add_boolean(false)
            .add_string(key.name())
            .add_string(key.public_blob());

        let mut ctx = AuthContext {
            session_id: SESSION_ID,
            server: Some(&mut server),
        };
        let out = srv
            .handle(
                MessageType::UserauthRequest as u8,
                &mut Message::from_bytes(req.as_bytes()),
                &mut ctx,
            )
            .unwrap();
        let (ptype, mut body) = split(&out.outbound[0]);
        assert_eq!(ptype, MessageType::UserauthPkOk as u8);
        assert_eq!(body.get_text().unwrap(), "ssh-ed25519");
        assert_eq!(srv.fail_count(), 0);
        assert!(!srv.is_authenticated());
    }

    /// Accepts one key and counts how often the policy was consulted.
    struct CountingServer {
        key: PublicKey,
        checks: u32,
    }

    impl ServerInterface for CountingServer {
        fn check_auth_publickey(&mut self, _username: &str, key: &PublicKey) -> AuthResult {
            self.checks += 1;
            if *key == self.key {
                AuthResult::Successful
            } else {
                AuthResult::Failed
            }
        }
    }

    fn signed_request(key_type: &str, blob: &[u8], sig: &[u8]) -> Message {
        let mut req = userauth_request("robey", CONNECTION_SERVICE, "publickey");
        req.add_boolean(true)
            .add_string(key_type)
            .add_string(blob)
            .add_string(sig);
        req
    }

    fn handle_request(
        srv: &mut AuthHandler,
        server: &mut (dyn ServerInterface + 'static),
        req: &Message,
    ) -> AuthOutcome {
        let mut ctx = AuthContext {
            session_id: SESSION_ID,
            server: Some(server),
        };
        srv.handle(
            MessageType::UserauthRequest as u8,
            &mut Message::from_bytes(req.as_bytes()),
            &mut ctx,
        )
        .unwrap()
    }

    #[test]
    fn test_publickey_type_must_match_blob() {
        let key = Ed25519Key::generate();
        let mut server = CountingServer {
            key: key.public_key(),
            checks: 0,
        };
        let mut srv = AuthHandler::new(true);
        let data = userauth_signature_data(
            SESSION_ID,
            "robey",
            CONNECTION_SERVICE,
            "ssh-rsa",
            &key.public_blob(),
        );
        let sig = key.sign_ssh_data(&data).unwrap();

        let req = signed_request("ssh-rsa", &key.public_blob(), &sig);
        let out = handle_request(&mut srv, &mut server, &req);
        assert_eq!(out.outbound[0].as_bytes()[0], MessageType::UserauthFailure as u8);
        assert!(!srv.is_authenticated());
        assert_eq!(srv.fail_count(), 1);
        assert_eq!(server.checks, 0);
    }

    #[test]
    fn test_publickey_policy_consulted_before_signature() {
        let accepted = Ed25519Key::generate();
        let stranger = Ed25519Key::generate();
        let mut server = CountingServer {
            key: accepted.public_key(),
            checks: 0,
        };
        let mut srv = AuthHandler::new(true);

        // an unacceptable key is refused on policy alone
        let junk = encode_sig_for_test(&[0u8; 64]);
        let out = handle_request(
            &mut srv,
            &mut server,
            &signed_request("ssh-ed25519", &stranger.public_blob(), &junk),
        );
        assert_eq!(out.outbound[0].as_bytes()[0], MessageType::UserauthFailure as u8);
        assert_eq!(server.checks, 1);

        // an acceptable key still needs a valid signature
        let out = handle_request(
            &mut srv,
            &mut server,
            &signed_request("ssh-ed25519", &accepted.public_blob(), &junk),
        );
        assert_eq!(out.outbound[0].as_bytes()[0], MessageType::UserauthFailure as u8);
        assert_eq!(server.checks, 2);
        assert!(!srv.is_authenticated());

        let data = userauth_signature_data(
            SESSION_ID,
            "robey",
            CONNECTION_SERVICE,
            "ssh-ed25519",
            &accepted.public_blob(),
        );
        let sig = accepted.sign_ssh_data(&data).unwrap();
        let out = handle_request(
            &mut srv,
            &mut server,
            &signed_request("ssh-ed25519", &accepted.public_blob(), &sig),
        );
        assert!(out.authenticated);
        assert!(srv.is_authenticated());
    }

    fn encode_sig_for_test(raw: &[u8]) -> Vec<u8> {
        let mut m = Message::new();
        m.add_string("ssh-ed25519").add_string(raw);
        m.into_bytes()
    }

    #[test]
    fn test_tenth_failure_disconnects_after_reply() {
        let mut server = TestServer { key: None };
        let mut srv = AuthHandler::new(true);

        for attempt in 1..=MAX_AUTH_FAILURES {
            let mut req = userauth_request("robey", CONNECTION_SERVICE, "password");
            req.add_boolean(false).add_string("wrong");
            let mut ctx = AuthContext {
                session_id: SESSION_ID,
                server: Some(&mut server),
            };
            let out = srv
                .handle(
                    MessageType::UserauthRequest as u8,
                    &mut Message::from_bytes(req.as_bytes()),
                    &mut ctx,
                )
                .unwrap();
            assert_eq!(out.outbound.len(), 1);
            assert_eq!(
                out.outbound[0].as_bytes()[0],
                MessageType::UserauthFailure as u8
            );
            if attempt < MAX_AUTH_FAILURES {
                assert!(out.disconnect.is_none());
            } else {
                let (code, _) = out.disconnect.unwrap();
                assert_eq!(code, disconnect::NO_MORE_AUTH_METHODS_AVAILABLE);
            }
        }
    }

    #[test]
    fn test_username_change_disconnects() {
        let mut server = TestServer { key: None };
        let mut srv = AuthHandler::new(true);
        for (name, expect_disconnect) in [("robey", false), ("mallory", true)] {
            let mut req = userauth_request(name, CONNECTION_SERVICE, "password");
            req.add_boolean(false).add_string("wrong");
            let mut ctx = AuthContext {
                session_id: SESSION_ID,
                server: Some(&mut server),
            };
            let out = srv
                .handle(
                    MessageType::UserauthRequest as u8,
                    &mut Message::from_bytes(req.as_bytes()),
                    &mut ctx,
                )
                .unwrap();
            assert_eq!(out.disconnect.is_some(), expect_disconnect);
        }
    }

    #[test]
    fn test_wrong_service_disconnects() {
        let mut server = TestServer { key: None };
        let mut srv = AuthHandler::new(true);
        let mut req = Message::new();
        req.add_string("ssh-bogus");
        let mut ctx = AuthContext {
            session_id: SESSION_ID,
            server: Some(&mut server),
        };
        let out = srv
            .handle(
                MessageType::ServiceRequest as u8,
                &mut Message::from_bytes(req.as_bytes()),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            out.disconnect.map(|(code, _)| code),
            Some(disconnect::SERVICE_NOT_AVAILABLE)
        );
    }

    #[test]
    fn test_info_request_without_interactive_is_error() {
        let mut client = AuthHandler::new(false);
        client.start("robey", AuthMethod::Password("foo".into()));
        let mut ctx = AuthContext {
            session_id: SESSION_ID,
            server: None,
        };
        let mut body = Message::new();
        body.add_string("t").add_string("i").add_string("").add_int(0);
        let err = client
            .handle(
                USERAUTH_INFO_REQUEST,
                &mut Message::from_bytes(body.as_bytes()),
                &mut ctx,
            )
            .unwrap_err();
        assert!(matches!(err, KestrelError::Protocol(_)));
    }

    #[test]
    fn test_signature_data_layout() {
        let data = userauth_signature_data(b"sid", "u", "ssh-connection", "ssh-ed25519", b"blob");
        let mut m = Message::from_bytes(&data);
        assert_eq!(m.get_string().unwrap(), b"sid");
        assert_eq!(m.get_byte().unwrap(), 50);
        assert_eq!(m.get_text().unwrap(), "u");
        assert_eq!(m.get_text().unwrap(), "ssh-connection");
        assert_eq!(m.get_text().unwrap(), "publickey");
        assert!(m.get_boolean().unwrap());
    }
}
