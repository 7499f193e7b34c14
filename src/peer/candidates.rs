use crate::signaling::CandidateInit;

/// Remote path candidates received before the remote description is known.
///
/// A candidate cannot be validated against an absent remote description, so
/// early arrivals queue here instead of being dropped or applied blind. The
/// buffer is a pre-condition gate, not a store: once the remote description
/// lands the queue drains exactly once, and every later candidate bypasses
/// the buffer entirely.
#[derive(Default)]
pub(crate) struct CandidateBuffer {
    queue: Vec<CandidateInit>,
    ready: bool,
}

impl CandidateBuffer {
    /// Appends a candidate, unconditionally.
    pub fn enqueue(&mut self, candidate: CandidateInit) {
        self.queue.push(candidate);
    }

    /// Whether the remote description has been applied and candidates may be
    /// handed to the connection directly.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Flips the buffer into pass-through mode and drains everything queued
    /// so far, in arrival order.
    pub fn mark_ready(&mut self) -> Vec<CandidateInit> {
        self.ready = true;
        std::mem::take(&mut self.queue)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
