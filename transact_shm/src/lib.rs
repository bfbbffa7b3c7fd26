//! # Transact: two-peer shared-memory message channel
//!
//! Synchronous, zero-copy exchange between exactly two cooperating processes
//! on the same host. Two pieces work together:
//!
//! - a **rendezvous channel** that passes a single turn back and forth, so at
//!   most one peer runs at a time, and reports a departed peer as
//!   [`ShmError::PeerDied`];
//! - a **message arena**, a block allocator over a shared mapping that carries
//!   payloads across each handoff without copying.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  session file (64 B)   ┌──────────────┐
//! │  Initiator   │◄──── turn / futex ────►│   Acceptor   │
//! │              │                        │              │
//! │  Interface   │    arena file (N×64 B) │  Interface   │
//! │  (owner)     ├───►[hdr|run|run|...]◄──┤              │
//! └──────────────┘                        └──────────────┘
//! ```
//!
//! The session block lives in a small file mapped by both peers. It holds
//! the turn, the termination flag, the handshake state and the pids of both
//! peers; a futex-backed lock protects it and a futex sequence word wakes
//! blocked peers. The arena's block 0 is its header; messages are runs of
//! 64-byte blocks tracked on two size-class chains.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transact_shm::{Interface, Role};
//!
//! # fn main() -> Result<(), transact_shm::ShmError> {
//! let iface = Interface::open(Role::Initiator, "calc", "calc", 64 * 1024)?;
//! let mut request = iface.allocate(7, 4)?;
//! request.write_i32(42)?;
//! let mut reply = iface.send(request, false, false)?;
//! println!("reply: {}", reply.read_i32()?);
//! iface.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - **Channel**: one thread per process; [`WaitCanceller`] may be sent to
//!   other threads to interrupt a blocked wait
//! - **Arena**: `Send` but not `Sync`; the turn serializes both peers
//! - **Message**: borrows its arena and shares its constraints

#![warn(clippy::all)]

pub mod arena;
pub mod error;
pub mod interface;
pub mod message;
pub mod platform;
pub mod protocol;
pub mod rendezvous;

pub use arena::{Arena, ArenaStats, BlockRef, SizeClass};
pub use error::{ShmError, ShmResult};
pub use interface::Interface;
pub use message::Message;
pub use protocol::{PeerDeathPolicy, PendingSend};
pub use rendezvous::{Channel, ChannelOptions, HandshakeState, Role, SessionState, WaitCanceller};

/// Install a global `tracing` subscriber filtered by `RUST_LOG`.
///
/// A second call, or a subscriber installed elsewhere, is left in place.
pub fn init_tracing() {
    install_subscriber(tracing_subscriber::EnvFilter::from_default_env());
}

/// Like [`init_tracing`], falling back to `level` when `RUST_LOG` is unset
pub fn init_tracing_with_level(level: transact::config::LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    install_subscriber(filter);
}

fn install_subscriber(filter: tracing_subscriber::EnvFilter) {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
