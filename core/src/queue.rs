//! Per-peer holding areas for negotiation messages that arrive early.

use std::collections::{HashMap, VecDeque};

use crate::signaling::{IceCandidate, SessionDescription};

/// Candidates received before the peer has a remote description.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    queues: HashMap<String, VecDeque<IceCandidate>>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, peer_id: &str, candidate: IceCandidate) {
        self.queues
            .entry(peer_id.to_string())
            .or_default()
            .push_back(candidate);
    }

    /// Remove and return everything queued for the peer, oldest first.
    pub fn take(&mut self, peer_id: &str) -> Vec<IceCandidate> {
        self.queues
            .remove(peer_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn len(&self, peer_id: &str) -> usize {
        self.queues.get(peer_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn remove(&mut self, peer_id: &str) {
        self.queues.remove(peer_id);
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// An answer that raced ahead of our own `set_local_description`.
#[derive(Debug, Default)]
pub struct PendingAnswerBuffer {
    answers: HashMap<String, SessionDescription>,
}

impl PendingAnswerBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the answer. Returns false if one was already held; the first
    /// answer wins and duplicates are dropped.
    pub fn store(&mut self, peer_id: &str, answer: SessionDescription) -> bool {
        if self.answers.contains_key(peer_id) {
            return false;
        }
        self.answers.insert(peer_id.to_string(), answer);
        true
    }

    pub fn take(&mut self, peer_id: &str) -> Option<SessionDescription> {
        self.answers.remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.answers.contains_key(peer_id)
    }

    pub fn remove(&mut self, peer_id: &str) {
        self.answers.remove(peer_id);
    }

    pub fn clear(&mut self) {
        self.answers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_queue_is_fifo_and_drains_once() {
        let mut queue = IceCandidateQueue::new();
        queue.push("bob", IceCandidate::new("c1"));
        queue.push("bob", IceCandidate::new("c2"));
        queue.push("carol", IceCandidate::new("x"));

        let drained: Vec<String> = queue.take("bob").into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["c1", "c2"]);
        assert!(queue.take("bob").is_empty());
        assert_eq!(queue.len("carol"), 1);
    }

    #[test]
    fn test_pending_answer_first_wins() {
        let mut buffer = PendingAnswerBuffer::new();
        assert!(buffer.store("bob", SessionDescription::answer("first")));
        assert!(!buffer.store("bob", SessionDescription::answer("second")));

        assert_eq!(buffer.take("bob").unwrap().sdp, "first");
        assert!(buffer.take("bob").is_none());
        assert!(buffer.is_empty());
    }
}
