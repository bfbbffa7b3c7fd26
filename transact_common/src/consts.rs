//! Wire constants for the transact arena and session formats.
//!
//! Single source of truth for the byte-exact layout both peers must agree
//! on. These are a compatibility contract between processes, not tunables:
//! changing any of them breaks every peer built against the old values.

use static_assertions::const_assert;

/// Size of one arena block in bytes.
///
/// Every arena offset is expressed in units of this size. Block 0 of an
/// arena holds the arena header.
pub const BLOCK_SIZE: usize = 64;

/// Bytes at the start of each allocated run reserved for the block header
/// (`prev_in_free_chain`, `length_in_blocks`, `free`, `message_id`).
pub const BLOCK_HEADER_SIZE: usize = 32;

/// Payload bytes available inline in a single-block (small) message.
pub const SMALL_PAYLOAD_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Sentinel block index meaning "none" (empty free list, nothing published).
pub const NO_BLOCK: u64 = u64::MAX;

/// Index of the first allocatable block. Block 0 is the arena header.
pub const FIRST_DATA_BLOCK: u64 = 1;

/// Smallest usable arena: the header block plus one data block.
pub const MIN_ARENA_BLOCKS: usize = 2;

/// Largest arena accepted by configuration validation (1GB).
pub const SHM_MAX_SIZE: usize = 1_073_741_824;

/// Bit of the handshake value that selects the role. It is masked off before
/// tokens are compared.
pub const ROLE_SELECTOR_MASK: u64 = 1;

/// Size of the mapped session block shared by the two peers.
pub const SESSION_BLOCK_SIZE: usize = 64;

/// Magic value stamped into an initialized session block: `"TRNSACT\0"`.
pub const SESSION_MAGIC: u64 = u64::from_le_bytes(*b"TRNSACT\0");

/// Default directory for session and arena files.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// File name prefix for session and arena files created from bare names.
pub const SHM_FILE_PREFIX: &str = "transact_";

/// Default arena size (1 MiB).
pub const DEFAULT_ARENA_SIZE: usize = 1 << 20;

/// Default interval at which a blocked peer checks whether its partner is alive.
pub const DEFAULT_LIVENESS_POLL_MS: u64 = 100;

const_assert!(BLOCK_HEADER_SIZE < BLOCK_SIZE);
const_assert!(BLOCK_SIZE.is_power_of_two());
const_assert!(SHM_MAX_SIZE % BLOCK_SIZE == 0);
