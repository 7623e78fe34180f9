// swarm/peer/selection.rs
#![forbid(unsafe_code)]

use crate::swarm::common::ProcessId;

/// Picks the least-loaded source among the swarm members that hold a segment.
///
/// Answers are fed in query order. An idle source (load 0) ends the search at
/// once; otherwise the strictly smallest load wins, so ties go to the member
/// that answered first.
#[derive(Debug, Default)]
pub struct SourceSelector {
    best: Option<(ProcessId, u32)>,
    idle: bool,
}

impl SourceSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one answer; `None` means the member lacks the segment.
    /// Returns true when the choice is final and no more members need asking.
    pub fn observe(&mut self, peer: ProcessId, load: Option<u32>) -> bool {
        if self.idle {
            return true;
        }
        let Some(load) = load else {
            return false;
        };
        if load == 0 {
            self.best = Some((peer, 0));
            self.idle = true;
            return true;
        }
        match self.best {
            Some((_, best_load)) if best_load <= load => {}
            _ => self.best = Some((peer, load)),
        }
        false
    }

    pub fn is_settled(&self) -> bool {
        self.idle
    }

    /// The chosen source, or `None` when nobody had the segment
    pub fn finish(self) -> Option<ProcessId> {
        self.best.map(|(peer, _)| peer)
    }
}
