//! Handshake state machine and token encoding
//!
//! The session moves `Unattached -> WaitingForPeerToken -> Ready` (or
//! `Rejected`). The Initiator posts its token; the Acceptor compares its own
//! token against it and settles the outcome for both peers.

use super::Role;
use transact::consts::ROLE_SELECTOR_MASK;

/// Session-wide handshake progress, stored in the session block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HandshakeState {
    /// No Initiator token posted yet
    Unattached = 0,
    /// Initiator token posted, Acceptor has not compared yet
    WaitingForPeerToken = 1,
    /// Tokens matched; turn passing is allowed
    Ready = 2,
    /// Tokens differed; both opens fail and the session drains
    Rejected = 3,
}

impl HandshakeState {
    /// Decode a raw session value. Unknown values read as `Rejected`.
    pub const fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Unattached,
            1 => Self::WaitingForPeerToken,
            2 => Self::Ready,
            _ => Self::Rejected,
        }
    }
}

/// Value a peer presents during the handshake: the token with the role
/// selector bit set for the Initiator and cleared for the Acceptor.
pub const fn handshake_value(role: Role, token: u64) -> u64 {
    match role {
        Role::Initiator => token | ROLE_SELECTOR_MASK,
        Role::Acceptor => token & !ROLE_SELECTOR_MASK,
    }
}

/// Token bits of a handshake value, with the role selector masked off
pub const fn token_bits(value: u64) -> u64 {
    value & !ROLE_SELECTOR_MASK
}

/// Whether two handshake values carry the same token
pub const fn tokens_match(a: u64, b: u64) -> bool {
    token_bits(a) == token_bits(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            HandshakeState::Unattached,
            HandshakeState::WaitingForPeerToken,
            HandshakeState::Ready,
            HandshakeState::Rejected,
        ] {
            assert_eq!(HandshakeState::from_u32(state as u32), state);
        }
        assert_eq!(HandshakeState::from_u32(99), HandshakeState::Rejected);
    }

    #[test]
    fn test_role_bit_is_ignored() {
        let initiator = handshake_value(Role::Initiator, 0x1234);
        let acceptor = handshake_value(Role::Acceptor, 0x1234);
        assert_ne!(initiator, acceptor);
        assert!(tokens_match(initiator, acceptor));
    }

    #[test]
    fn test_different_tokens_mismatch() {
        let initiator = handshake_value(Role::Initiator, 0x1000);
        let acceptor = handshake_value(Role::Acceptor, 0x2000);
        assert!(!tokens_match(initiator, acceptor));
    }

    #[test]
    fn test_tokens_differing_only_in_role_bit_match() {
        // 0x11 and 0x10 collapse to the same token.
        assert!(tokens_match(0x11, 0x10));
    }
}
