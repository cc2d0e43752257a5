//! Buffer for remote ICE candidates that arrive before the remote description.

use std::collections::VecDeque;

use tracing::{debug, warn};

use duet_common::IceCandidate;

use crate::error::PeerError;
use crate::peer::PeerConnection;

#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
    ready: bool,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Whether the remote description is set and candidates may be applied
    /// directly.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Forget everything and wait for the next remote description.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.ready = false;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply every queued candidate in arrival order. The batch is taken
    /// before the first await; anything enqueued meanwhile waits for the next
    /// flush. Returns how many candidates were accepted.
    pub async fn flush(&mut self, peer: &dyn PeerConnection) -> usize {
        let batch = std::mem::take(&mut self.pending);
        let total = batch.len();
        let mut applied = 0;
        for candidate in batch {
            match peer.add_ice_candidate(&candidate).await {
                Ok(()) => applied += 1,
                Err(PeerError::StaleCandidate) => {
                    debug!("discarding candidate from a previous negotiation round");
                }
                Err(e) => warn!("failed to apply queued ICE candidate: {}", e),
            }
        }
        if total > 0 {
            debug!("flushed {}/{} queued ICE candidate(s)", applied, total);
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePeer;

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn test_flush_applies_fifo_exactly_once() {
        let peer = FakePeer::default();
        let mut queue = IceCandidateQueue::new();
        for n in 1..=5 {
            queue.enqueue(candidate(n));
        }
        assert_eq!(queue.flush(&peer).await, 5);
        assert!(queue.is_empty());
        assert_eq!(queue.flush(&peer).await, 0);

        let applied = peer.applied_candidates();
        let expected: Vec<_> = (1..=5).map(|n| candidate(n).candidate).collect();
        assert_eq!(applied, expected);
    }

    #[tokio::test]
    async fn test_late_candidate_waits_for_next_flush() {
        let peer = FakePeer::default();
        let mut queue = IceCandidateQueue::new();
        queue.enqueue(candidate(1));
        queue.enqueue(candidate(2));
        assert_eq!(queue.flush(&peer).await, 2);

        queue.enqueue(candidate(3));
        assert_eq!(queue.len(), 1);
        assert_eq!(peer.applied_candidates().len(), 2);

        assert_eq!(queue.flush(&peer).await, 1);
        let expected: Vec<_> = (1..=3).map(|n| candidate(n).candidate).collect();
        assert_eq!(peer.applied_candidates(), expected);
    }

    #[tokio::test]
    async fn test_stale_candidates_are_swallowed() {
        let peer = FakePeer::default();
        peer.set_remote_ufrag("current");
        let mut queue = IceCandidateQueue::new();
        let mut stale = candidate(1);
        stale.username_fragment = Some("old".into());
        queue.enqueue(stale);
        queue.enqueue(candidate(2));

        assert_eq!(queue.flush(&peer).await, 1);
        assert_eq!(peer.applied_candidates(), vec![candidate(2).candidate]);
    }

    #[test]
    fn test_clear_resets_readiness() {
        let mut queue = IceCandidateQueue::new();
        queue.enqueue(candidate(1));
        queue.mark_ready();
        assert!(queue.is_ready());
        queue.clear();
        assert!(!queue.is_ready());
        assert_eq!(queue.len(), 0);
    }
}
