//! The fixed queue set a session is composed of.

use std::fmt;

/// The five queue kinds, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueType {
    /// Resolve symbolic source refs to concrete ones.
    Track,
    /// Make pinned source content locally present.
    Fetch,
    /// Populate the local artifact cache from remotes.
    Pull,
    /// Stage, assemble and commit.
    Build,
    /// Replicate local artifacts to push remotes.
    Push,
}

impl QueueType {
    /// The action name used in log file names.
    pub fn action_name(self) -> &'static str {
        match self {
            QueueType::Track => "track",
            QueueType::Fetch => "fetch",
            QueueType::Pull => "pull",
            QueueType::Build => "build",
            QueueType::Push => "push",
        }
    }

    /// Whether failures in this queue may be retried over the network
    /// retry budget.
    pub fn retryable(self) -> bool {
        matches!(self, QueueType::Track | QueueType::Fetch)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action_name())
    }
}

/// What a queue has to say about an element right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    /// Nothing to do here; pass the element to the next queue.
    Skip,
    /// Preconditions not met yet; ask again after the next state change.
    Wait,
    /// A job may be dispatched now.
    Ready,
}

/// One queue of a running session: its type, concurrency cap and counters.
#[derive(Debug)]
pub struct Queue {
    pub queue_type: QueueType,
    /// Maximum concurrently active jobs.
    pub cap: usize,
    pub active: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Queue {
    pub fn new(queue_type: QueueType, cap: usize) -> Self {
        Self { queue_type, cap: cap.max(1), active: 0, processed: 0, skipped: 0, failed: 0 }
    }

    pub fn has_capacity(&self) -> bool {
        self.active < self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_are_never_zero() {
        assert_eq!(Queue::new(QueueType::Build, 0).cap, 1);
    }

    #[test]
    fn only_network_queues_retry() {
        assert!(QueueType::Track.retryable());
        assert!(QueueType::Fetch.retryable());
        assert!(!QueueType::Build.retryable());
        assert!(!QueueType::Pull.retryable());
        assert!(!QueueType::Push.retryable());
    }
}
