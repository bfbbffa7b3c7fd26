//! Embedding boundary: one handle bundling a channel and its arena
//!
//! Bindings hold an [`Interface`] per peer. The Initiator owns the arena: it
//! creates and sizes the backing file after the handshake and removes it on
//! close. The Acceptor maps the existing file once its `open` returns, which
//! happens only after the Initiator's first handoff.

use crate::arena::Arena;
use crate::error::{ShmError, ShmResult};
use crate::message::Message;
use crate::platform::{attach_region_mmap, create_region_mmap, shm_path};
use crate::protocol::{self, PeerDeathPolicy, PendingSend};
use crate::rendezvous::{Channel, ChannelOptions, Role, WaitCanceller};
use std::cell::Cell;
use std::path::PathBuf;
use transact::config::TransactConfig;
use transact::consts::{BLOCK_SIZE, MIN_ARENA_BLOCKS};

/// A peer's end of a channel plus its view of the shared arena
#[derive(Debug)]
pub struct Interface {
    channel: Channel,
    arena: Arena,
    arena_path: PathBuf,
    /// Request handed to the peer whose reply was not collected yet
    pending: Cell<Option<PendingSend>>,
}

impl Interface {
    /// Open with default settings and an arena of `arena_size_bytes`
    pub fn open(
        role: Role,
        channel_name: &str,
        arena_name: &str,
        arena_size_bytes: usize,
    ) -> ShmResult<Self> {
        let config = TransactConfig {
            arena_size_bytes,
            ..TransactConfig::default()
        };
        Self::open_with_config(role, channel_name, arena_name, &config)
    }

    /// Open using directory, token, timeouts and arena size from `config`
    pub fn open_with_config(
        role: Role,
        channel_name: &str,
        arena_name: &str,
        config: &TransactConfig,
    ) -> ShmResult<Self> {
        let size = config.arena_size_bytes;
        if size % BLOCK_SIZE != 0 || size / BLOCK_SIZE < MIN_ARENA_BLOCKS {
            return Err(ShmError::InvalidSize { size });
        }
        let total_blocks = (size / BLOCK_SIZE) as u64;
        let arena_path = shm_path(&config.shm_dir, arena_name, "arena");

        let channel = Channel::open(role, channel_name, &ChannelOptions::from(config))?;
        let region = if role.is_owner() {
            create_region_mmap(&arena_path, size)?
        } else {
            attach_region_mmap(&arena_path, size)?
        };
        let arena = Arena::attach(region, total_blocks, role.is_owner())?;

        tracing::info!(
            %role,
            channel = channel_name,
            arena = %arena_path.display(),
            total_blocks,
            "interface open"
        );
        Ok(Self {
            channel,
            arena,
            arena_path,
            pending: Cell::new(None),
        })
    }

    /// Allocate a message with room for `size_bytes` of payload
    pub fn allocate(&self, message_id: u32, size_bytes: usize) -> ShmResult<Message<'_>> {
        protocol::begin(&self.arena, message_id, size_bytes)
    }

    /// Send `message` and wait for the reply.
    ///
    /// With `no_return_on_peer_death` the process exits with status 0 if the
    /// peer is gone. With `keep_request_alive` the request run is not freed.
    /// After `Interrupted` or `TimedOut` the request stays pending; finish it
    /// with [`Interface::resume_send`].
    pub fn send<'a>(
        &'a self,
        message: Message<'a>,
        no_return_on_peer_death: bool,
        keep_request_alive: bool,
    ) -> ShmResult<Message<'a>> {
        if self.pending.get().is_some() {
            return Err(ShmError::InvalidState("previous send still awaits its reply"));
        }
        let pending = protocol::post(&self.channel, message, keep_request_alive);
        self.pending.set(Some(pending));
        self.finish_send(pending, no_return_on_peer_death)
    }

    /// Keep waiting for the reply to an interrupted or timed out `send`
    pub fn resume_send(&self, no_return_on_peer_death: bool) -> ShmResult<Message<'_>> {
        let pending = self
            .pending
            .get()
            .ok_or(ShmError::InvalidState("no send awaits a reply"))?;
        self.finish_send(pending, no_return_on_peer_death)
    }

    /// Request whose reply has not been collected, if any
    pub fn pending_send(&self) -> Option<PendingSend> {
        self.pending.get()
    }

    fn finish_send(
        &self,
        pending: PendingSend,
        no_return_on_peer_death: bool,
    ) -> ShmResult<Message<'_>> {
        let result = protocol::complete(
            &self.channel,
            &self.arena,
            pending,
            PeerDeathPolicy::from_no_return(no_return_on_peer_death),
        );
        match &result {
            Err(ShmError::Interrupted | ShmError::TimedOut { .. }) => {
                tracing::debug!(offset = pending.request().index(), "send left pending");
            }
            _ => self.pending.set(None),
        }
        result
    }

    /// The message the peer handed over with the turn
    pub fn receive(&self) -> ShmResult<Message<'_>> {
        protocol::receive(&self.arena)
    }

    /// Hand the turn back without publishing a new message.
    ///
    /// Also completes a pending `send`: its request is freed (unless kept)
    /// once the turn comes back, and `receive` yields the reply.
    pub fn yield_and_wait(&self) -> ShmResult<()> {
        match self.channel.yield_and_wait() {
            Ok(()) => {
                if let Some(pending) = self.pending.take() {
                    protocol::settle(&self.arena, pending);
                }
                Ok(())
            }
            Err(e @ (ShmError::Interrupted | ShmError::TimedOut { .. })) => Err(e),
            Err(e) => {
                self.pending.set(None);
                Err(e)
            }
        }
    }

    pub fn canceller(&self) -> WaitCanceller {
        self.channel.canceller()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn role(&self) -> Role {
        self.channel.role()
    }

    /// Terminate the session, detach, and remove the arena file if owned
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        if self.channel.role().is_owner() {
            match std::fs::remove_file(&self.arena_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    arena = %self.arena_path.display(),
                    error = %e,
                    "failed to remove arena file"
                ),
            }
        }
    }
}
