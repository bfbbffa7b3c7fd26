//! # Transact Peer
//!
//! Runs one end of a transact channel as a ping-pong peer. The initiator
//! sends `--rounds` requests carrying an `i64`; the acceptor answers each
//! with the value plus one until the initiator closes the channel.
//!
//! # Usage
//!
//! ```bash
//! # Terminal 1
//! transact_peer --role acceptor --channel demo --arena demo
//!
//! # Terminal 2
//! transact_peer --role initiator --channel demo --arena demo --rounds 1000
//!
//! # Settings from a config file, verbose logging
//! transact_peer --role initiator --config transact.toml -v
//! ```

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{debug, error, info};
use transact::config::{ConfigLoader, LogLevel, TransactConfig};
use transact_shm::{Interface, Role, ShmError, ShmResult};

/// Transact Peer - ping-pong over a shared-memory rendezvous channel
#[derive(Parser, Debug)]
#[command(name = "transact_peer")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Ping-pong peer for transact channels")]
#[command(long_about = None)]
struct Args {
    /// Which end of the channel to run
    #[arg(short, long, value_enum)]
    role: PeerRole,

    /// Session name shared by both peers
    #[arg(long, default_value = "transact")]
    channel: String,

    /// Arena name shared by both peers
    #[arg(long, default_value = "transact")]
    arena: String,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for session and arena files (overrides the config file)
    #[arg(long, value_name = "DIR")]
    shm_dir: Option<PathBuf>,

    /// Handshake token (overrides the config file)
    #[arg(long)]
    token: Option<u64>,

    /// Requests the initiator sends before closing
    #[arg(short = 'n', long, default_value_t = 10)]
    rounds: u32,

    /// Exit with status 0 as soon as the peer is gone
    #[arg(long)]
    exit_on_peer_death: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PeerRole {
    Initiator,
    Acceptor,
}

impl From<PeerRole> for Role {
    fn from(role: PeerRole) -> Self {
        match role {
            PeerRole::Initiator => Role::Initiator,
            PeerRole::Acceptor => Role::Acceptor,
        }
    }
}

fn main() {
    if let Err(e) = run() {
        error!("peer failed: {e}");
        eprintln!("transact_peer: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = build_config(&args)?;
    transact_shm::init_tracing_with_level(config.log_level);

    let role = Role::from(args.role);
    info!(
        "transact_peer v{} starting as {role}",
        env!("CARGO_PKG_VERSION")
    );

    let iface = Interface::open_with_config(role, &args.channel, &args.arena, &config)?;
    let canceller = iface.canceller();
    ctrlc::set_handler(move || canceller.cancel())?;

    match role {
        Role::Initiator => run_initiator(&iface, args.rounds)?,
        Role::Acceptor => run_acceptor(&iface, args.exit_on_peer_death)?,
    }

    iface.close();
    info!("transact_peer shutdown complete");
    Ok(())
}

/// Config file (or defaults) with command line overrides applied
fn build_config(args: &Args) -> Result<TransactConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => TransactConfig::load(path)?,
        None => TransactConfig::default(),
    };
    if let Some(dir) = &args.shm_dir {
        config.shm_dir = dir.clone();
    }
    if let Some(token) = args.token {
        config.handshake_token = token;
    }
    if args.verbose {
        config.log_level = LogLevel::Debug;
    }
    config.validate()?;
    Ok(config)
}

fn run_initiator(iface: &Interface, rounds: u32) -> ShmResult<()> {
    for round in 0..rounds {
        let mut request = iface.allocate(round, 8)?;
        request.write_i64(i64::from(round))?;

        let mut reply = match iface.send(request, false, false) {
            Ok(reply) => reply,
            Err(ShmError::Interrupted) => {
                info!(round, "interrupted, closing");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let value = reply.read_i64()?;
        if value != i64::from(round) + 1 {
            return Err(ShmError::InvalidState("reply does not match request"));
        }
        debug!(round, value, "reply received");
    }

    println!("completed {rounds} rounds");
    Ok(())
}

fn run_acceptor(iface: &Interface, exit_on_peer_death: bool) -> ShmResult<()> {
    let mut served: u64 = 0;
    let mut request = iface.receive()?;
    loop {
        let value = request.read_i64()?;
        let mut reply = iface.allocate(request.message_id(), 8)?;
        reply.write_i64(value + 1)?;
        served += 1;

        match iface.send(reply, exit_on_peer_death, false) {
            Ok(next) => request = next,
            Err(ShmError::PeerDied) => {
                info!(served, "initiator closed the channel");
                break;
            }
            Err(ShmError::Interrupted) => {
                info!(served, "interrupted, closing");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    println!("served {served} requests");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_defaults() {
        let args = Args::parse_from([
            "transact_peer",
            "--role",
            "acceptor",
            "--shm-dir",
            "/tmp/peers",
            "--token",
            "77",
            "-v",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.shm_dir, PathBuf::from("/tmp/peers"));
        assert_eq!(config.handshake_token, 77);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(matches!(args.role, PeerRole::Acceptor));
        assert_eq!(args.rounds, 10);
    }

    #[test]
    fn test_missing_config_file_fails() {
        let args = Args::parse_from([
            "transact_peer",
            "--role",
            "initiator",
            "--config",
            "/nonexistent/transact.toml",
        ]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_role_conversion() {
        assert_eq!(Role::from(PeerRole::Initiator), Role::Initiator);
        assert_eq!(Role::from(PeerRole::Acceptor), Role::Acceptor);
    }
}
