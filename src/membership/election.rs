//! Leader election state.
//!
//! A node is `main` when it believes it leads the ring. `doubt` marks a
//! possible rival leader until a merge settles it. A pending `MainClaim` is the
//! quorum round a node runs when it finds itself first in the list without
//! being main: it becomes main once every other member has deferred.

use super::types::NodeId;

use std::collections::HashSet;
use std::time::{Duration, Instant};

/// The rival-leader tie-break: the larger membership wins, and on equal size
/// the lower node id wins. Both sides of a dispute evaluate this same function.
pub fn outranks(size: usize, node: &NodeId, other_size: usize, other: &NodeId) -> bool {
    size > other_size || (size == other_size && node < other)
}

#[derive(Debug, Clone)]
pub struct MainClaim {
    pub started: Instant,
    pub pending: HashSet<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimProgress {
    /// No claim in flight, the response is stale.
    Idle,
    Waiting,
    Granted,
    Refused,
}

#[derive(Debug, Clone, Default)]
pub struct Election {
    pub main: bool,
    pub doubt: bool,
    pub claim: Option<MainClaim>,
}

impl Election {
    /// Main and not suspecting a rival: the only state allowed to admit members.
    pub fn is_confirmed_main(&self) -> bool {
        self.main && !self.doubt
    }

    pub fn is_claiming(&self) -> bool {
        self.claim.is_some()
    }

    pub fn promote(&mut self) {
        self.main = true;
        self.doubt = false;
        self.claim = None;
    }

    /// Returns whether the node was main before.
    pub fn demote(&mut self) -> bool {
        let was_main = self.main;
        self.main = false;
        self.doubt = false;
        self.claim = None;
        was_main
    }

    pub fn begin_claim(&mut self, pending: HashSet<NodeId>, now: Instant) {
        self.claim = Some(MainClaim {
            started: now,
            pending,
        });
    }

    /// Pending responders of a claim older than `window`, restarting its clock.
    pub fn stale_claim(&mut self, window: Duration, now: Instant) -> Option<Vec<NodeId>> {
        let claim = self.claim.as_mut()?;
        if now.saturating_duration_since(claim.started) <= window {
            return None;
        }
        claim.started = now;
        Some(claim.pending.iter().cloned().collect())
    }

    pub fn record_response(&mut self, from: &NodeId, defer: bool) -> ClaimProgress {
        let Some(claim) = self.claim.as_mut() else {
            return ClaimProgress::Idle;
        };
        if !defer {
            self.claim = None;
            return ClaimProgress::Refused;
        }
        claim.pending.remove(from);
        if claim.pending.is_empty() {
            ClaimProgress::Granted
        } else {
            ClaimProgress::Waiting
        }
    }

    /// A member left; it will never answer. Returns `Granted` if it was the last one awaited.
    pub fn forget(&mut self, node: &NodeId) -> ClaimProgress {
        let Some(claim) = self.claim.as_mut() else {
            return ClaimProgress::Idle;
        };
        if claim.pending.remove(node) && claim.pending.is_empty() {
            ClaimProgress::Granted
        } else {
            ClaimProgress::Waiting
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeId {
        NodeId::new(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            false,
            vec![],
        )
    }

    #[test]
    fn test_larger_membership_outranks() {
        assert!(outranks(3, &node(9), 2, &node(1)));
        assert!(!outranks(2, &node(1), 3, &node(9)));
    }

    #[test]
    fn test_equal_size_lower_id_outranks() {
        assert!(outranks(2, &node(1), 2, &node(2)));
        assert!(!outranks(2, &node(2), 2, &node(1)));
    }

    #[test]
    fn test_tie_break_is_antisymmetric() {
        let pairs = [(1, 1, 1, 2), (3, 5, 3, 4), (2, 7, 5, 1), (4, 1, 4, 1)];
        for (sa, a, sb, b) in pairs {
            let ab = outranks(sa, &node(a), sb, &node(b));
            let ba = outranks(sb, &node(b), sa, &node(a));
            assert!(!(ab && ba), "both sides won for {:?}", (sa, a, sb, b));
        }
        assert!(!outranks(2, &node(1), 2, &node(1)));
    }

    #[test]
    fn test_claim_granted_after_all_defer() {
        let mut election = Election::default();
        election.begin_claim([node(2), node(3)].into_iter().collect(), Instant::now());

        assert_eq!(election.record_response(&node(2), true), ClaimProgress::Waiting);
        assert_eq!(election.record_response(&node(3), true), ClaimProgress::Granted);
    }

    #[test]
    fn test_claim_refusal_aborts() {
        let mut election = Election::default();
        election.begin_claim([node(2), node(3)].into_iter().collect(), Instant::now());

        assert_eq!(election.record_response(&node(2), false), ClaimProgress::Refused);
        assert!(!election.is_claiming());
        assert_eq!(election.record_response(&node(3), true), ClaimProgress::Idle);
    }

    #[test]
    fn test_departed_responder_completes_claim() {
        let mut election = Election::default();
        election.begin_claim([node(2), node(3)].into_iter().collect(), Instant::now());
        election.record_response(&node(2), true);

        assert_eq!(election.forget(&node(3)), ClaimProgress::Granted);
    }

    #[test]
    fn test_stale_claim_restarts_clock() {
        let mut election = Election::default();
        let start = Instant::now();
        election.begin_claim([node(2)].into_iter().collect(), start);

        let window = Duration::from_millis(100);
        assert!(election.stale_claim(window, start + window / 2).is_none());
        assert_eq!(
            election.stale_claim(window, start + window * 2),
            Some(vec![node(2)])
        );
        assert!(election.stale_claim(window, start + window * 2).is_none());
    }
}
