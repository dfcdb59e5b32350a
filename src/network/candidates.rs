// Remote ICE candidate handling
// Candidates that arrive before a remote description are held here and
// replayed, in arrival order, once the description is set

use super::protocol::IceCandidateInit;

const CANDIDATE_PREFIX: &str = "candidate:";

/// Ensure the candidate line carries the `candidate:` prefix.
/// The signaling server is allowed to relay only the bare body.
pub fn normalize_candidate(mut init: IceCandidateInit) -> IceCandidateInit {
    if !init.candidate.starts_with(CANDIDATE_PREFIX) {
        init.candidate = format!("{}{}", CANDIDATE_PREFIX, init.candidate);
    }
    init
}

/// FIFO of candidates waiting for a remote description
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: Vec<IceCandidateInit>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidateInit) {
        self.pending.push(candidate);
    }

    /// Take every queued candidate in arrival order, leaving the queue empty
    pub fn drain(&mut self) -> Vec<IceCandidateInit> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_candidate_gets_prefix() {
        let init = normalize_candidate(IceCandidateInit::new("1 1 udp 2122260223 10.0.0.2 5000 typ host"));
        assert_eq!(init.candidate, "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host");
    }

    #[test]
    fn test_prefixed_candidate_unchanged() {
        let line = "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host";
        let mut init = IceCandidateInit::new(line);
        init.sdp_mid = Some("0".to_string());

        let normalized = normalize_candidate(init.clone());
        assert_eq!(normalized, init);
    }

    #[test]
    fn test_drain_preserves_order_and_empties() {
        let mut queue = IceCandidateQueue::new();
        for i in 0..3 {
            queue.push(IceCandidateInit::new(format!("candidate:{}", i)));
        }
        assert_eq!(queue.len(), 3);

        let drained: Vec<String> = queue.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["candidate:0", "candidate:1", "candidate:2"]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
