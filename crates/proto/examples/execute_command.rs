//! Non-Interactive Command Execution Example
//!
//! Runs commands on a remote SSH server, similar to `ssh user@host command`.
//!
//! Usage:
//!   cargo run --example execute_command <host:port> <username> <password> <command1> [command2] [...]
//!
//! Example:
//!   cargo run --example execute_command 127.0.0.1:2222 admin secret "whoami" "pwd" "hostname"
//!
//! Set `RUST_LOG=kestrel_proto=debug` to watch the protocol.

use kestrel_proto::ssh::client::SshClient;
use kestrel_proto::ssh::hostkey::Verifiable;
use std::env;
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

/// Execute a single command and display the result
async fn execute_command(
    client: &mut SshClient,
    command: &str,
) -> Result<i32, Box<dyn std::error::Error>> {
    println!("$ {}", command);

    let output = timeout(Duration::from_secs(10), client.exec(command))
        .await
        .map_err(|_| "Command timeout")??;

    print!("{}", String::from_utf8_lossy(&output.stdout));
    eprint!("{}", String::from_utf8_lossy(&output.stderr));
    if output.exit_status != 0 {
        println!("[exit status {}]", output.exit_status);
    }
    Ok(output.exit_status)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        eprintln!(
            "Usage: {} <host:port> <username> <password> <command1> [command2] [...]",
            args[0]
        );
        std::process::exit(1);
    }

    let server_addr = &args[1];
    let username = &args[2];
    let password = &args[3];
    let commands = &args[4..];

    println!("Connecting to {}...", server_addr);
    let mut client = SshClient::connect(server_addr).await?;
    if let Some(key) = client.server_host_key() {
        println!("  Host key: {} {}", key.name(), key.fingerprint());
    }

    println!("Authenticating as '{}'...", username);
    client.authenticate_password(username, password).await?;
    println!();

    let mut failures = 0;
    for command in commands {
        match execute_command(&mut client, command).await {
            Ok(0) => {}
            Ok(_) => failures += 1,
            Err(e) => {
                eprintln!("Error executing command: {}", e);
                failures += 1;
            }
        }
    }

    client.disconnect().await?;

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
