//! Process-shared session block
//!
//! One 64-byte block, mapped from the session file by both peers. All fields
//! are atomics so they can be read without the lock; every mutation happens
//! under the embedded lock and is followed by a bump of `state_seq`, the
//! futex word blocked peers sleep on.
//!
//! An all-zero block is a valid empty session, so racing creators of the
//! backing file need no extra coordination.

use super::Role;
use super::handshake::HandshakeState;
use crate::error::ShmResult;
use crate::platform::{
    futex_wait, futex_wake, get_current_pid, is_process_alive, is_same_file, open_session_mmap,
};
use memmap2::MmapMut;
use static_assertions::const_assert_eq;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use transact::consts::{SESSION_BLOCK_SIZE, SESSION_MAGIC};

/// Nobody holds the turn
pub(crate) const TURN_NONE: u32 = 0;

/// Shared session layout
#[repr(C, align(64))]
pub struct SessionBlock {
    /// `SESSION_MAGIC` once initialized, 0 when fresh or destroyed
    magic: AtomicU64,
    /// 0 when free, otherwise the pid of the holder
    lock: AtomicU32,
    /// Bumped after every state change; futex word for waiters
    state_seq: AtomicU32,
    /// `TURN_NONE` or the `Role` value holding the turn
    turn: AtomicU32,
    /// Non-zero once a peer has departed
    terminated: AtomicU32,
    /// Number of attached peers (0, 1 or 2)
    attached: AtomicU32,
    /// `HandshakeState` value
    handshake: AtomicU32,
    /// Initiator handshake value
    token: AtomicU64,
    /// Pid of the attached peer per role slot, 0 when empty
    peer_pids: [AtomicU32; 2],
    _padding: [u8; 16],
}

const_assert_eq!(core::mem::size_of::<SessionBlock>(), SESSION_BLOCK_SIZE);
const_assert_eq!(core::mem::align_of::<SessionBlock>(), 64);

/// Observable lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No peer attached
    Empty,
    /// One peer attached
    OneAttached,
    /// Both peers attached
    BothAttached,
    /// A peer has departed; the rendezvous is uncontested
    Terminated,
}

/// Result of an attach attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachOutcome {
    /// Slot claimed
    Attached,
    /// Both slots taken, the role is in use, or the session already ended
    Full,
    /// A rejected handshake is being torn down; retry once it is gone
    Draining,
    /// The file does not hold a session block
    Foreign,
}

impl SessionBlock {
    /// Current turn holder
    pub fn turn(&self) -> Option<Role> {
        Role::from_u32(self.turn.load(Ordering::Acquire))
    }

    /// Whether a peer has departed
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire) != 0
    }

    /// Handshake progress
    pub fn handshake(&self) -> HandshakeState {
        HandshakeState::from_u32(self.handshake.load(Ordering::Acquire))
    }

    /// Number of attached peers
    pub fn attached(&self) -> u32 {
        self.attached.load(Ordering::Acquire)
    }

    /// Initiator's posted handshake value
    pub fn token(&self) -> u64 {
        self.token.load(Ordering::Acquire)
    }

    /// Lifecycle state derived from the attach count and termination flag
    pub fn state(&self) -> SessionState {
        if self.is_terminated() {
            return SessionState::Terminated;
        }
        match self.attached() {
            0 => SessionState::Empty,
            1 => SessionState::OneAttached,
            _ => SessionState::BothAttached,
        }
    }

    /// Snapshot of the futex word, taken before checking a wait condition
    pub(crate) fn seq(&self) -> u32 {
        self.state_seq.load(Ordering::Acquire)
    }

    /// Sleep until `state_seq` moves past `seen`, or `timeout` elapses
    pub(crate) fn wait_change(
        &self,
        seen: u32,
        timeout: Option<Duration>,
    ) -> crate::platform::WaitOutcome {
        futex_wait(&self.state_seq, seen, timeout)
    }

    /// Bump the state sequence and wake every waiter
    pub(crate) fn wake_all(&self) {
        self.state_seq.fetch_add(1, Ordering::AcqRel);
        futex_wake(&self.state_seq);
    }

    /// Take the session lock.
    ///
    /// A lock left behind by a dead process is taken over.
    pub(crate) fn lock(&self, poll: Duration) -> SessionGuard<'_> {
        let me = get_current_pid();
        loop {
            match self
                .lock
                .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return SessionGuard { block: self },
                Err(holder) => {
                    if !is_process_alive(holder)
                        && self
                            .lock
                            .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                    {
                        tracing::warn!(holder, "took over session lock from dead process");
                        return SessionGuard { block: self };
                    }
                    futex_wait(&self.lock, holder, Some(poll));
                }
            }
        }
    }
}

/// Exclusive access to a session block; releases the lock on drop
pub(crate) struct SessionGuard<'a> {
    block: &'a SessionBlock,
}

impl Deref for SessionGuard<'_> {
    type Target = SessionBlock;

    fn deref(&self) -> &SessionBlock {
        self.block
    }
}

impl SessionGuard<'_> {
    /// Return the block to the fresh, empty state
    fn reset(&self) {
        let b = self.block;
        b.turn.store(TURN_NONE, Ordering::Release);
        b.terminated.store(0, Ordering::Release);
        b.attached.store(0, Ordering::Release);
        b.handshake
            .store(HandshakeState::Unattached as u32, Ordering::Release);
        b.token.store(0, Ordering::Release);
        for pid in &b.peer_pids {
            pid.store(0, Ordering::Release);
        }
        b.magic.store(SESSION_MAGIC, Ordering::Release);
    }

    /// Mark the block destroyed so stale mappings start over
    pub(crate) fn invalidate(&self) {
        self.reset();
        self.block.magic.store(0, Ordering::Release);
    }

    /// Clear slots whose process no longer exists
    fn reap_dead_slots(&self) {
        for role in [Role::Initiator, Role::Acceptor] {
            let pid = self.block.peer_pids[role.slot()].load(Ordering::Acquire);
            if pid != 0 && !is_process_alive(pid) {
                tracing::warn!(?role, pid, "reaping session slot of dead process");
                self.release_slot(role);
                self.block.terminated.store(1, Ordering::Release);
            }
        }
    }

    fn release_slot(&self, role: Role) {
        let b = self.block;
        b.peer_pids[role.slot()].store(0, Ordering::Release);
        let attached = b.attached.load(Ordering::Acquire);
        b.attached
            .store(attached.saturating_sub(1), Ordering::Release);
    }

    /// Claim the slot for `role`
    pub(crate) fn try_attach(&self, role: Role, pid: u32) -> AttachOutcome {
        let b = self.block;
        match b.magic.load(Ordering::Acquire) {
            0 => self.reset(),
            SESSION_MAGIC => {}
            _ => return AttachOutcome::Foreign,
        }

        self.reap_dead_slots();
        if b.attached() == 0 {
            // Nobody left: whatever happened before is over.
            self.reset();
        }

        if b.handshake() == HandshakeState::Rejected {
            return AttachOutcome::Draining;
        }
        if b.is_terminated() || b.attached() >= 2 {
            return AttachOutcome::Full;
        }
        if b.peer_pids[role.slot()].load(Ordering::Acquire) != 0 {
            return AttachOutcome::Full;
        }

        b.peer_pids[role.slot()].store(pid, Ordering::Release);
        b.attached.store(b.attached() + 1, Ordering::Release);
        self.notify();
        AttachOutcome::Attached
    }

    /// Release the slot for `role`, terminating the session.
    ///
    /// Returns true when this was the last attached peer.
    pub(crate) fn detach(&self, role: Role, pid: u32) -> bool {
        let b = self.block;
        if b.peer_pids[role.slot()].load(Ordering::Acquire) == pid {
            self.release_slot(role);
        }
        if !b.is_terminated() {
            b.terminated.store(1, Ordering::Release);
            // The survivor is uncontested from now on.
            b.turn.store(role.peer() as u32, Ordering::Release);
        }
        self.notify();
        b.attached() == 0
    }

    /// Initiator side of the handshake: publish the token
    pub(crate) fn post_token(&self, value: u64) {
        self.block.token.store(value, Ordering::Release);
        self.block
            .handshake
            .store(HandshakeState::WaitingForPeerToken as u32, Ordering::Release);
        self.notify();
    }

    /// Acceptor side of the handshake: settle the outcome.
    ///
    /// On success the Initiator receives the turn.
    pub(crate) fn settle_handshake(&self, matched: bool) {
        let b = self.block;
        if matched {
            b.turn.store(Role::Initiator as u32, Ordering::Release);
            b.handshake
                .store(HandshakeState::Ready as u32, Ordering::Release);
        } else {
            b.handshake
                .store(HandshakeState::Rejected as u32, Ordering::Release);
        }
        self.notify();
    }

    /// Give the turn to the peer of `role`
    pub(crate) fn hand_turn(&self, role: Role) {
        self.block
            .turn
            .store(role.peer() as u32, Ordering::Release);
        self.notify();
    }

    /// Terminate the session if the peer of `role` has died.
    ///
    /// Returns true when the peer was found dead.
    pub(crate) fn reap_peer_of(&self, role: Role) -> bool {
        let b = self.block;
        let peer = role.peer();
        let pid = b.peer_pids[peer.slot()].load(Ordering::Acquire);
        if pid == 0 || is_process_alive(pid) {
            return false;
        }

        tracing::warn!(?peer, pid, "peer process died without closing");
        self.release_slot(peer);
        if !b.is_terminated() {
            b.terminated.store(1, Ordering::Release);
            b.turn.store(role as u32, Ordering::Release);
        }
        self.notify();
        true
    }

    /// Publish a state change to waiters
    pub(crate) fn notify(&self) {
        self.block.wake_all();
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.block.lock.store(0, Ordering::Release);
        futex_wake(&self.block.lock);
    }
}

/// A peer's mapping of the session file
pub(crate) struct SessionMap {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl SessionMap {
    /// Open or create the session file at `path` and map its block
    pub(crate) fn open(path: &Path) -> ShmResult<Self> {
        let (file, map) = open_session_mmap(path, SESSION_BLOCK_SIZE)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
        })
    }

    pub(crate) fn block(&self) -> &SessionBlock {
        // SAFETY: the mapping is page aligned, at least SESSION_BLOCK_SIZE
        // long and lives as long as `self`. Every field is an atomic or
        // padding, so any bit pattern is a valid block.
        unsafe { &*self.map.as_ptr().cast::<SessionBlock>() }
    }

    /// Whether the path still names the file this mapping belongs to
    pub(crate) fn is_current(&self) -> ShmResult<bool> {
        is_same_file(&self.file, &self.path)
    }

    /// Remove the session file, if it is still ours
    pub(crate) fn unlink(&self) -> ShmResult<()> {
        if self.is_current()? {
            std::fs::remove_file(&self.path)?;
            tracing::debug!(path = %self.path.display(), "removed session file");
        }
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_block() -> Box<SessionBlock> {
        // All-zero is the documented empty state.
        Box::new(unsafe { core::mem::zeroed() })
    }

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn test_block_layout() {
        assert_eq!(core::mem::size_of::<SessionBlock>(), 64);
        assert_eq!(core::mem::align_of::<SessionBlock>(), 64);
    }

    #[test]
    fn test_zeroed_block_is_empty() {
        let block = fresh_block();
        assert_eq!(block.state(), SessionState::Empty);
        assert_eq!(block.turn(), None);
        assert_eq!(block.handshake(), HandshakeState::Unattached);
    }

    #[test]
    fn test_attach_sequence() {
        let block = fresh_block();
        let pid = get_current_pid();
        let guard = block.lock(POLL);

        assert_eq!(guard.try_attach(Role::Initiator, pid), AttachOutcome::Attached);
        assert_eq!(guard.state(), SessionState::OneAttached);
        assert_eq!(guard.try_attach(Role::Acceptor, pid), AttachOutcome::Attached);
        assert_eq!(guard.state(), SessionState::BothAttached);
        assert_eq!(guard.try_attach(Role::Acceptor, pid), AttachOutcome::Full);
    }

    #[test]
    fn test_role_slot_is_exclusive() {
        let block = fresh_block();
        let pid = get_current_pid();
        let guard = block.lock(POLL);

        assert_eq!(guard.try_attach(Role::Initiator, pid), AttachOutcome::Attached);
        assert_eq!(guard.try_attach(Role::Initiator, pid), AttachOutcome::Full);
    }

    #[test]
    fn test_detach_terminates_and_hands_turn() {
        let block = fresh_block();
        let pid = get_current_pid();
        let guard = block.lock(POLL);
        guard.try_attach(Role::Initiator, pid);
        guard.try_attach(Role::Acceptor, pid);

        assert!(!guard.detach(Role::Initiator, pid));
        assert_eq!(guard.state(), SessionState::Terminated);
        assert_eq!(guard.turn(), Some(Role::Acceptor));

        assert!(guard.detach(Role::Acceptor, pid));
        assert_eq!(guard.attached(), 0);
    }

    #[test]
    fn test_terminated_session_rejects_new_peer() {
        let block = fresh_block();
        let pid = get_current_pid();
        let guard = block.lock(POLL);
        guard.try_attach(Role::Initiator, pid);
        guard.try_attach(Role::Acceptor, pid);
        guard.detach(Role::Acceptor, pid);

        assert_eq!(guard.try_attach(Role::Acceptor, pid), AttachOutcome::Full);
    }

    #[test]
    fn test_rejected_handshake_drains() {
        let block = fresh_block();
        let pid = get_current_pid();
        let guard = block.lock(POLL);
        guard.try_attach(Role::Initiator, pid);
        guard.try_attach(Role::Acceptor, pid);
        guard.settle_handshake(false);
        guard.detach(Role::Acceptor, pid);

        assert_eq!(guard.try_attach(Role::Acceptor, pid), AttachOutcome::Draining);

        // Once the last peer is gone the block starts over.
        guard.detach(Role::Initiator, pid);
        assert_eq!(guard.try_attach(Role::Acceptor, pid), AttachOutcome::Attached);
        assert_eq!(guard.handshake(), HandshakeState::Unattached);
    }

    #[test]
    fn test_foreign_magic() {
        let block = fresh_block();
        block.magic.store(0xDEAD_BEEF, Ordering::Release);
        let guard = block.lock(POLL);
        assert_eq!(
            guard.try_attach(Role::Initiator, get_current_pid()),
            AttachOutcome::Foreign
        );
    }

    #[test]
    fn test_handshake_settles_turn() {
        let block = fresh_block();
        let guard = block.lock(POLL);
        guard.post_token(0x41);
        assert_eq!(guard.handshake(), HandshakeState::WaitingForPeerToken);
        assert_eq!(guard.token(), 0x41);

        guard.settle_handshake(true);
        assert_eq!(guard.handshake(), HandshakeState::Ready);
        assert_eq!(guard.turn(), Some(Role::Initiator));

        guard.hand_turn(Role::Initiator);
        assert_eq!(guard.turn(), Some(Role::Acceptor));
    }

    #[test]
    fn test_state_change_bumps_sequence() {
        let block = fresh_block();
        let before = block.seq();
        block.lock(POLL).post_token(0);
        assert_ne!(block.seq(), before);
    }
}
