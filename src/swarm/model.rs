// swarm/model.rs
#![forbid(unsafe_code)]

use std::collections::HashMap;

use crate::swarm::common::{ProcessId, SegmentHash};

/// One piece of a file. Two segments are the same piece iff hash and index match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub hash: SegmentHash,
    pub index: u32,
}

impl Segment {
    pub fn new(hash: SegmentHash, index: u32) -> Self {
        Self { hash, index }
    }
}

/// Membership of one file: seeds hold the whole file, peers are still leeching.
///
/// A process id lives in at most one of the two lists, and never leaves `seeds`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Swarm {
    seeds: Vec<ProcessId>,
    peers: Vec<ProcessId>,
}

impl Swarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id` as a seed, dropping it from the leechers if present
    pub fn add_seed(&mut self, id: ProcessId) {
        self.peers.retain(|p| *p != id);
        if !self.seeds.contains(&id) {
            self.seeds.push(id);
        }
    }

    /// Records `id` as a leecher unless it is already a member
    pub fn add_peer(&mut self, id: ProcessId) {
        if !self.contains(id) {
            self.peers.push(id);
        }
    }

    /// Moves `id` into the seeds. Safe to repeat.
    pub fn promote(&mut self, id: ProcessId) {
        self.add_seed(id);
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.seeds.contains(&id) || self.peers.contains(&id)
    }

    pub fn is_seed(&self, id: ProcessId) -> bool {
        self.seeds.contains(&id)
    }

    pub fn seeds(&self) -> &[ProcessId] {
        &self.seeds
    }

    pub fn peers(&self) -> &[ProcessId] {
        &self.peers
    }

    /// Seeds first, then leechers
    pub fn members(&self) -> Vec<ProcessId> {
        self.seeds.iter().chain(self.peers.iter()).copied().collect()
    }

    pub fn size(&self) -> usize {
        self.seeds.len() + self.peers.len()
    }
}

/// What a peer brings to the swarm at start-up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerManifest {
    /// Files held in full, each with its segments in index order
    pub owned: Vec<(String, Vec<Segment>)>,
    /// Files to acquire, in download order
    pub wanted: Vec<String>,
}

/// Segments a peer currently holds, per file, in acquisition order
#[derive(Debug, Clone, Default)]
pub struct OwnedSegments {
    files: HashMap<String, Vec<Segment>>,
}

impl OwnedSegments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_manifest(manifest: &PeerManifest) -> Self {
        let mut owned = Self::new();
        for (file, segments) in &manifest.owned {
            for segment in segments {
                owned.insert(file, *segment);
            }
        }
        owned
    }

    pub fn has(&self, file: &str, index: u32) -> bool {
        self.get(file, index).is_some()
    }

    pub fn get(&self, file: &str, index: u32) -> Option<&Segment> {
        self.files
            .get(file)
            .and_then(|segments| segments.iter().find(|s| s.index == index))
    }

    /// Returns false when the segment was already present
    pub fn insert(&mut self, file: &str, segment: Segment) -> bool {
        let segments = self.files.entry(file.to_string()).or_default();
        if segments.contains(&segment) {
            return false;
        }
        segments.push(segment);
        true
    }

    pub fn segments(&self, file: &str) -> &[Segment] {
        self.files.get(file).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when every manifest segment is held
    pub fn is_complete(&self, file: &str, manifest: &[Segment]) -> bool {
        let held = self.segments(file);
        manifest.iter().all(|s| held.contains(s))
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &Vec<Segment>)> {
        self.files.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::common::HASH_SIZE;

    fn hash(tag: u8) -> SegmentHash {
        SegmentHash([b'a' + tag; HASH_SIZE])
    }

    #[test]
    fn test_swarm_seed_and_peer_are_disjoint() {
        let mut swarm = Swarm::new();
        swarm.add_peer(2);
        swarm.add_seed(1);
        swarm.add_seed(2);

        assert_eq!(swarm.seeds(), &[1, 2]);
        assert!(swarm.peers().is_empty());
        assert_eq!(swarm.size(), 2);
    }

    #[test]
    fn test_swarm_seed_never_reverts() {
        let mut swarm = Swarm::new();
        swarm.add_seed(3);
        swarm.add_peer(3);
        assert!(swarm.is_seed(3));
        assert!(swarm.peers().is_empty());

        swarm.promote(3);
        assert_eq!(swarm.seeds(), &[3]);
    }

    #[test]
    fn test_swarm_members_lists_seeds_first() {
        let mut swarm = Swarm::new();
        swarm.add_peer(5);
        swarm.add_seed(1);
        swarm.add_peer(4);
        assert_eq!(swarm.members(), vec![1, 5, 4]);

        swarm.promote(5);
        assert_eq!(swarm.members(), vec![1, 5, 4]);
        assert_eq!(swarm.peers(), &[4]);
    }

    #[test]
    fn test_owned_segments_ignores_duplicates() {
        let mut owned = OwnedSegments::new();
        assert!(owned.insert("f", Segment::new(hash(0), 0)));
        assert!(!owned.insert("f", Segment::new(hash(0), 0)));
        assert!(owned.insert("f", Segment::new(hash(1), 1)));

        assert_eq!(owned.segments("f").len(), 2);
        assert!(owned.has("f", 1));
        assert!(!owned.has("f", 2));
        assert!(!owned.has("g", 0));
    }

    #[test]
    fn test_owned_segments_completeness() {
        let manifest = vec![Segment::new(hash(0), 0), Segment::new(hash(1), 1)];
        let mut owned = OwnedSegments::new();
        owned.insert("f", manifest[1]);
        assert!(!owned.is_complete("f", &manifest));
        owned.insert("f", manifest[0]);
        assert!(owned.is_complete("f", &manifest));
    }
}
