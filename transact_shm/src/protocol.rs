//! Request/response exchange over a channel and its arena

use crate::arena::{Arena, BlockRef};
use crate::error::{ShmError, ShmResult};
use crate::message::Message;
use crate::rendezvous::Channel;

/// What `send` does when the peer is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerDeathPolicy {
    /// Exit the calling process with status 0
    AbortProcess,
    /// Return `ShmError::PeerDied`
    #[default]
    ReturnError,
}

impl PeerDeathPolicy {
    pub const fn from_no_return(no_return_on_peer_death: bool) -> Self {
        if no_return_on_peer_death {
            Self::AbortProcess
        } else {
            Self::ReturnError
        }
    }
}

/// Allocate a message run with room for `size_hint` payload bytes
pub fn begin(arena: &Arena, message_id: u32, size_hint: usize) -> ShmResult<Message<'_>> {
    let block = arena.allocate(message_id, size_hint)?;
    Ok(Message::new(arena, block))
}

/// A request handed to the peer whose reply has not been collected yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSend {
    request: BlockRef,
    keep_alive: bool,
}

impl PendingSend {
    /// Run holding the request
    pub fn request(&self) -> BlockRef {
        self.request
    }

    /// Whether the request run survives the reply
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

/// Publish `message`, hand the turn to the peer and return its reply.
///
/// Unless `keep_alive` is set the request run is freed once the reply
/// arrives. An `Interrupted` or `TimedOut` wait leaves the request in use;
/// callers that need to resume use [`post`] and [`complete`] instead.
pub fn send<'a>(
    channel: &Channel,
    message: Message<'a>,
    on_peer_death: PeerDeathPolicy,
    keep_alive: bool,
) -> ShmResult<Message<'a>> {
    let arena = message.arena();
    let pending = post(channel, message, keep_alive);
    complete(channel, arena, pending, on_peer_death)
}

/// Make `message` the current message without handing over the turn
pub fn post(channel: &Channel, message: Message<'_>, keep_alive: bool) -> PendingSend {
    let request = message.block();
    message.arena().publish(&request);
    tracing::debug!(
        role = %channel.role(),
        offset = request.index(),
        message_id = message.message_id(),
        "sending message"
    );
    PendingSend {
        request,
        keep_alive,
    }
}

/// Hand the turn over for `pending` (or keep waiting for it) and return the
/// reply.
///
/// After `Interrupted` or `TimedOut` the turn stays with the peer and the
/// same `pending` can be completed again.
pub fn complete<'a>(
    channel: &Channel,
    arena: &'a Arena,
    pending: PendingSend,
    on_peer_death: PeerDeathPolicy,
) -> ShmResult<Message<'a>> {
    match channel.yield_and_wait() {
        Ok(()) => {}
        Err(ShmError::PeerDied) if on_peer_death == PeerDeathPolicy::AbortProcess => {
            tracing::info!(session = channel.name(), "peer is gone, exiting");
            std::process::exit(0);
        }
        Err(e) => return Err(e),
    }

    settle(arena, pending);
    receive(arena)
}

/// Apply the free-on-reply rule to a request whose reply has arrived
pub(crate) fn settle(arena: &Arena, pending: PendingSend) {
    if !pending.keep_alive {
        arena.mark_free(&pending.request);
    }
}

/// View the message the peer published before handing over the turn
pub fn receive(arena: &Arena) -> ShmResult<Message<'_>> {
    let block = arena.resolve(arena.current())?;
    Ok(Message::new(arena, block))
}
