//! Quorum
//!
//! Whether this member's view of the collective is authoritative.

use super::Role;
use crate::error::{Error, Result};

/// Inputs to the quorum check
#[derive(Debug, Clone, Copy)]
pub struct QuorumView {
    pub role: Role,
    /// Size of the member table
    pub members: usize,
    /// Members following us (while leading)
    pub followers: usize,
    /// Our follower task is alive (while following)
    pub following: bool,
}

/// Check for quorum
///
/// A leader needs a strict majority of the member table counting itself.
/// A follower has quorum as long as its stream to the leader is alive.
/// Members outside a collective (fewer than two members) always pass.
pub fn check_quorum(view: &QuorumView) -> Result<()> {
    if view.members < 2 {
        return Ok(());
    }

    let ok = match view.role {
        Role::Leader => (view.followers + 1) * 2 > view.members,
        Role::Follower => view.following,
        Role::Connecting | Role::Uninitialized => false,
    };

    if ok {
        Ok(())
    } else {
        Err(Error::DegradedCollective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leader(members: usize, followers: usize) -> QuorumView {
        QuorumView {
            role: Role::Leader,
            members,
            followers,
            following: false,
        }
    }

    #[test]
    fn test_leader_needs_strict_majority() {
        assert!(check_quorum(&leader(3, 1)).is_ok());
        assert!(check_quorum(&leader(3, 0)).is_err());
        assert!(check_quorum(&leader(4, 1)).is_err());
        assert!(check_quorum(&leader(4, 2)).is_ok());
        assert!(check_quorum(&leader(2, 0)).is_err());
        assert!(check_quorum(&leader(5, 2)).is_ok());
    }

    #[test]
    fn test_follower_quorum_tracks_stream() {
        let mut view = QuorumView {
            role: Role::Follower,
            members: 3,
            followers: 0,
            following: true,
        };
        assert!(check_quorum(&view).is_ok());

        view.following = false;
        assert!(check_quorum(&view).unwrap_err().is_degraded());
    }

    #[test]
    fn test_connecting_is_degraded() {
        let view = QuorumView {
            role: Role::Connecting,
            members: 3,
            followers: 0,
            following: false,
        };
        assert!(check_quorum(&view).is_err());
    }

    #[test]
    fn test_standalone_always_passes() {
        let view = QuorumView {
            role: Role::Uninitialized,
            members: 1,
            followers: 0,
            following: false,
        };
        assert!(check_quorum(&view).is_ok());
    }
}
