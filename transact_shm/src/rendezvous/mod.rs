//! Two-party rendezvous channel
//!
//! Exactly two peers, an Initiator and an Acceptor, open the same named
//! session. Once the handshake settles, the turn alternates between them via
//! [`Channel::yield_and_wait`]; at most one peer holds it at any time. A peer
//! that closes its end, or whose process disappears, terminates the session
//! and the survivor observes [`ShmError::PeerDied`].
//!
//! # Open ordering
//!
//! - The Initiator's `open` returns once the Acceptor has accepted its token,
//!   holding the first turn.
//! - The Acceptor's `open` returns once the Initiator has yielded for the
//!   first time, so neither peer can run ahead and exit before its partner
//!   attached.

mod handshake;
mod session;

pub use handshake::{HandshakeState, handshake_value, token_bits, tokens_match};
pub use session::{SessionBlock, SessionState};

use crate::error::{ShmError, ShmResult};
use crate::platform::{WaitOutcome, get_current_pid, shm_path};
use session::{AttachOutcome, SessionGuard, SessionMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::time::{Duration, Instant};
use transact::config::TransactConfig;
use transact::consts::{DEFAULT_LIVENESS_POLL_MS, DEFAULT_SHM_DIR};

/// Which end of the session a peer holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Role {
    /// Opens first in the usual flow, owns the arena, holds the first turn
    Initiator = 1,
    /// Waits to be invoked
    Acceptor = 2,
}

impl Role {
    /// Decode a session turn value; 0 and unknown values are no role
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Initiator),
            2 => Some(Self::Acceptor),
            _ => None,
        }
    }

    /// The other end
    pub const fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Acceptor,
            Self::Acceptor => Self::Initiator,
        }
    }

    /// Whether this role creates and sizes the arena
    pub const fn is_owner(self) -> bool {
        matches!(self, Self::Initiator)
    }

    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::Initiator => 0,
            Self::Acceptor => 1,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Parameters for [`Channel::open`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Directory for session files opened by bare name
    pub dir: PathBuf,
    /// Handshake token; the role selector bit is ignored
    pub token: u64,
    /// Bound on the waits performed during open
    pub timeout: Option<Duration>,
    /// Interval at which a blocked peer probes its partner's process
    pub liveness_poll: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_SHM_DIR),
            token: 0,
            timeout: None,
            liveness_poll: Duration::from_millis(DEFAULT_LIVENESS_POLL_MS),
        }
    }
}

impl From<&TransactConfig> for ChannelOptions {
    fn from(config: &TransactConfig) -> Self {
        Self {
            dir: config.shm_dir.clone(),
            token: config.handshake_token,
            timeout: config.open_timeout(),
            liveness_poll: config.liveness_poll(),
        }
    }
}

/// One peer's end of a rendezvous session
pub struct Channel {
    role: Role,
    name: String,
    pid: u32,
    session: Arc<SessionMap>,
    cancel: Arc<AtomicBool>,
    liveness_poll: Duration,
    detached: bool,
}

impl Channel {
    /// Attach to the session `session_name` as `role` and run the handshake.
    ///
    /// # Errors
    ///
    /// - `SessionFull` if both slots are taken or the role is already attached
    /// - `HandshakeMismatch` if the peers' tokens differ
    /// - `PeerDied` if the partner departed before the handshake settled
    /// - `TimedOut` if `options.timeout` elapsed first
    pub fn open(role: Role, session_name: &str, options: &ChannelOptions) -> ShmResult<Self> {
        let path = shm_path(&options.dir, session_name, "session");
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let poll = options.liveness_poll.max(Duration::from_millis(1));
        let pid = get_current_pid();

        let session = loop {
            let session = Arc::new(SessionMap::open(&path)?);
            let block = session.block();
            let guard = block.lock(poll);
            if !session.is_current()? {
                // Last peer of an older session unlinked the file under us.
                continue;
            }

            match guard.try_attach(role, pid) {
                AttachOutcome::Attached => break Arc::clone(&session),
                AttachOutcome::Full => {
                    tracing::warn!(session = session_name, %role, "session is full");
                    return Err(ShmError::SessionFull {
                        name: session_name.to_string(),
                    });
                }
                AttachOutcome::Foreign => {
                    return Err(ShmError::InvalidState("file does not hold a session block"));
                }
                AttachOutcome::Draining => {
                    let seen = guard.seq();
                    drop(guard);
                    tracing::debug!(session = session_name, "waiting for rejected session to drain");
                    let slice = remaining_slice(deadline, poll, "open")?;
                    if block.wait_change(seen, Some(slice)) == WaitOutcome::Interrupted {
                        return Err(ShmError::Interrupted);
                    }
                }
            }
        };

        let channel = Self {
            role,
            name: session_name.to_string(),
            pid,
            session,
            cancel: Arc::new(AtomicBool::new(false)),
            liveness_poll: poll,
            detached: false,
        };
        tracing::info!(
            session = session_name,
            %role,
            path = %channel.session.path().display(),
            "attached to session"
        );

        // Dropping the channel on any error below detaches it again.
        match role {
            Role::Initiator => channel.initiator_handshake(options.token, deadline)?,
            Role::Acceptor => channel.acceptor_handshake(options.token, deadline)?,
        }
        tracing::info!(session = session_name, %role, "handshake complete");
        Ok(channel)
    }

    fn initiator_handshake(&self, token: u64, deadline: Option<Instant>) -> ShmResult<()> {
        self.lock()
            .post_token(handshake_value(Role::Initiator, token));

        self.wait_for(deadline, "open", |session| match session.handshake() {
            HandshakeState::Ready => Some(Ok(())),
            HandshakeState::Rejected => Some(Err(self.mismatch())),
            _ if session.is_terminated() => Some(Err(ShmError::PeerDied)),
            _ => None,
        })
    }

    fn acceptor_handshake(&self, token: u64, deadline: Option<Instant>) -> ShmResult<()> {
        let ours = handshake_value(Role::Acceptor, token);
        let matched = self.wait_for(deadline, "open", |session| {
            if session.is_terminated() {
                return Some(Err(ShmError::PeerDied));
            }
            if session.handshake() != HandshakeState::WaitingForPeerToken {
                return None;
            }
            let matched = tokens_match(session.token(), ours);
            session.settle_handshake(matched);
            Some(Ok(matched))
        })?;

        if !matched {
            tracing::warn!(session = %self.name, "handshake token mismatch");
            return Err(self.mismatch());
        }

        // Hold back until the Initiator yields its first turn.
        self.wait_for(deadline, "open", |session| self.turn_returned(session))?;
        fence(Ordering::Acquire);
        Ok(())
    }

    /// Hand the turn to the peer and block until it comes back.
    ///
    /// # Errors
    ///
    /// - `PeerDied` if the session is, or becomes, terminated
    /// - `Interrupted` if cancelled or hit by a signal; the turn stays with
    ///   the peer and calling again resumes the wait
    /// - `InvalidState` before the handshake completed
    pub fn yield_and_wait(&self) -> ShmResult<()> {
        self.yield_and_wait_timeout(None)
    }

    /// [`yield_and_wait`](Self::yield_and_wait) with a bound on the wait.
    ///
    /// On `TimedOut` the turn stays with the peer; calling again resumes the
    /// wait.
    pub fn yield_and_wait_timeout(&self, timeout: Option<Duration>) -> ShmResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let session = self.lock();
            if session.is_terminated() {
                return Err(ShmError::PeerDied);
            }
            if session.handshake() != HandshakeState::Ready {
                return Err(ShmError::InvalidState("handshake not complete"));
            }
            match session.turn() {
                Some(holder) if holder == self.role => {
                    // Publish our arena writes before the peer can run.
                    fence(Ordering::Release);
                    session.hand_turn(self.role);
                    tracing::trace!(role = %self.role, "yielded turn");
                }
                // Resuming after an interrupted or timed out wait.
                Some(_) => {}
                None => return Err(ShmError::InvalidState("no turn to yield")),
            }
        }

        self.wait_for(deadline, "yield_and_wait", |session| {
            self.turn_returned(session)
        })?;
        fence(Ordering::Acquire);
        tracing::trace!(role = %self.role, "regained turn");
        Ok(())
    }

    /// Handle that interrupts this channel's blocked waits from elsewhere
    pub fn canceller(&self) -> WaitCanceller {
        WaitCanceller {
            session: Arc::clone(&self.session),
            flag: Arc::clone(&self.cancel),
        }
    }

    /// Terminate the session and detach from it
    pub fn close(mut self) {
        self.detach();
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifecycle state as currently visible in the shared block
    pub fn session_state(&self) -> SessionState {
        self.session.block().state()
    }

    /// Whether this peer currently holds the turn of a live session
    pub fn has_turn(&self) -> bool {
        let block = self.session.block();
        !block.is_terminated() && block.turn() == Some(self.role)
    }

    fn lock(&self) -> SessionGuard<'_> {
        self.session.block().lock(self.liveness_poll)
    }

    fn mismatch(&self) -> ShmError {
        ShmError::HandshakeMismatch {
            name: self.name.clone(),
        }
    }

    fn turn_returned(&self, session: &SessionGuard<'_>) -> Option<ShmResult<()>> {
        if session.is_terminated() {
            Some(Err(ShmError::PeerDied))
        } else if session.turn() == Some(self.role) {
            Some(Ok(()))
        } else {
            None
        }
    }

    /// Block until `check` yields a result.
    ///
    /// `check` runs under the session lock. The state sequence is sampled
    /// under the same lock, so a change made after the check always wakes
    /// the following futex wait. Wait slices are capped at the liveness poll
    /// interval; a slice that times out probes the peer's process.
    fn wait_for<T>(
        &self,
        deadline: Option<Instant>,
        operation: &'static str,
        mut check: impl FnMut(&SessionGuard<'_>) -> Option<ShmResult<T>>,
    ) -> ShmResult<T> {
        let block = self.session.block();
        loop {
            let seen = {
                let session = self.lock();
                if let Some(result) = check(&session) {
                    return result;
                }
                session.seq()
            };

            if self.cancel.swap(false, Ordering::AcqRel) {
                tracing::debug!(role = %self.role, operation, "wait cancelled");
                return Err(ShmError::Interrupted);
            }
            let slice = remaining_slice(deadline, self.liveness_poll, operation)?;

            match block.wait_change(seen, Some(slice)) {
                WaitOutcome::Woken => {}
                WaitOutcome::Interrupted => return Err(ShmError::Interrupted),
                WaitOutcome::TimedOut => {
                    self.lock().reap_peer_of(self.role);
                }
            }
        }
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        let session = self.lock();
        if session.detach(self.role, self.pid) {
            session.invalidate();
            if let Err(e) = self.session.unlink() {
                tracing::warn!(session = %self.name, error = %e, "failed to remove session file");
            }
        }
        tracing::info!(session = %self.name, role = %self.role, "detached from session");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.role)
            .field("name", &self.name)
            .field("state", &self.session_state())
            .finish()
    }
}

/// Interrupts a channel's pending or next wait with [`ShmError::Interrupted`].
///
/// Cloneable and sendable to other threads, e.g. a signal handling thread.
#[derive(Clone)]
pub struct WaitCanceller {
    session: Arc<SessionMap>,
    flag: Arc<AtomicBool>,
}

impl WaitCanceller {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.session.block().wake_all();
    }
}

/// Length of the next wait slice, or `TimedOut` once the deadline passed
fn remaining_slice(
    deadline: Option<Instant>,
    poll: Duration,
    operation: &'static str,
) -> ShmResult<Duration> {
    match deadline {
        None => Ok(poll),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(ShmError::TimedOut { operation })
            } else {
                Ok((deadline - now).min(poll))
            }
        }
    }
}
