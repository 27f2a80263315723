//! Simple SSH Server Example
//!
//! This example demonstrates how to:
//! - Serve SSH with a generated Ed25519 host key
//! - Authenticate users with a password
//! - Answer `exec` requests on session channels
//!
//! Usage:
//!   cargo run --example simple_server [bind_address]
//!
//! Then connect with:
//!   cargo run --example execute_command 127.0.0.1:2222 testuser testpass "whoami"

use kestrel_proto::ssh::hostkey::{Ed25519Key, Verifiable};
use kestrel_proto::ssh::packet::BufferedStream;
use kestrel_proto::ssh::server::{AuthResult, ServerInterface, OPEN_SUCCEEDED};
use kestrel_proto::ssh::session::Session;
use kestrel_proto::ssh::transport::{Transport, TransportConfig};
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Commands = Arc<Mutex<HashMap<u32, String>>>;

/// Accepts `testuser`/`testpass` and records exec requests per channel
struct ExampleServer {
    commands: Commands,
}

impl ServerInterface for ExampleServer {
    fn check_channel_request(&mut self, kind: &str, _chanid: u32) -> u32 {
        if kind == "session" {
            OPEN_SUCCEEDED
        } else {
            1
        }
    }

    fn check_auth_password(&mut self, username: &str, password: &str) -> AuthResult {
        if username == "testuser" && password == "testpass" {
            AuthResult::Successful
        } else {
            AuthResult::Failed
        }
    }

    fn get_banner(&mut self) -> Option<String> {
        Some("Kestrel example server\r\n".to_string())
    }

    fn check_channel_exec_request(&mut self, chanid: u32, command: &[u8]) -> bool {
        match self.commands.lock() {
            Ok(mut commands) => {
                commands.insert(chanid, String::from_utf8_lossy(command).into_owned());
                true
            }
            Err(_) => false,
        }
    }
}

fn run_command(command: &str) -> (String, u32) {
    match command.trim() {
        "whoami" => ("testuser\n".to_string(), 0),
        "pwd" => ("/home/testuser\n".to_string(), 0),
        "hostname" => ("kestrel-example\n".to_string(), 0),
        cmd if cmd.starts_with("echo ") => (format!("{}\n", &cmd[5..]), 0),
        cmd => (format!("{}: command not found\n", cmd), 127),
    }
}

async fn serve(stream: TcpStream, host_key: Arc<Ed25519Key>) -> Result<(), Box<dyn std::error::Error>> {
    let commands = Commands::default();
    let mut transport = Transport::new(BufferedStream::new(), TransportConfig::new(false));
    transport.add_server_key(host_key);

    let mut session = Session::new(stream, transport);
    session
        .start_server(Box::new(ExampleServer {
            commands: Arc::clone(&commands),
        }))
        .await?;

    loop {
        let chanid = session.accept().await?;
        session
            .drive_until(|_| commands.lock().map(|c| c.contains_key(&chanid)).unwrap_or(true))
            .await?;
        let command = commands
            .lock()
            .ok()
            .and_then(|mut c| c.remove(&chanid))
            .unwrap_or_default();
        info!(chanid, "exec {:?}", command);

        let (output, status) = run_command(&command);
        session.send_all(chanid, output.as_bytes()).await?;
        if let Some(chan) = session.transport_mut().channel_mut(chanid) {
            chan.send_exit_status(status)?;
        }
        session.close_channel(chanid).await?;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bind_addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:2222".to_string());

    // In production, load a persistent host key instead
    let host_key = Arc::new(Ed25519Key::generate());
    println!("Host key: {}", host_key.public_key().fingerprint());

    let listener = TcpListener::bind(&bind_addr).await?;
    println!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        let host_key = Arc::clone(&host_key);
        tokio::spawn(async move {
            info!("Connection from {}", peer);
            if let Err(e) = serve(stream, host_key).await {
                warn!("Session with {} ended: {}", peer, e);
            }
        });
    }
}
