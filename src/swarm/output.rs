// swarm/output.rs
#![forbid(unsafe_code)]

use std::path::PathBuf;

use tracing::debug;

use crate::swarm::common::{ProcessId, SwarmError};
use crate::swarm::model::Segment;

/// Receives a file once a peer holds all of its segments
#[cfg_attr(test, mockall::automock)]
pub trait SegmentSink: Send + Sync {
    fn store(&self, owner: ProcessId, file: &str, segments: &[Segment]) -> Result<(), SwarmError>;
}

/// Writes `client<rank>_<file>` into a directory: one hash per line in
/// index order, no trailing newline.
#[derive(Debug, Clone)]
pub struct OutputDirSink {
    dir: PathBuf,
}

impl OutputDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, owner: ProcessId, file: &str) -> PathBuf {
        self.dir.join(format!("client{}_{}", owner, file))
    }
}

pub fn render_hashes(segments: &[Segment]) -> String {
    let mut ordered = segments.to_vec();
    ordered.sort_by_key(|s| s.index);
    ordered
        .iter()
        .map(|s| s.hash.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl SegmentSink for OutputDirSink {
    fn store(&self, owner: ProcessId, file: &str, segments: &[Segment]) -> Result<(), SwarmError> {
        let path = self.path_for(owner, file);
        std::fs::write(&path, render_hashes(segments))?;
        debug!(owner, %file, path = %path.display(), "file saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::common::{SegmentHash, HASH_SIZE};

    fn segment(tag: u8, index: u32) -> Segment {
        Segment::new(SegmentHash([tag; HASH_SIZE]), index)
    }

    #[test]
    fn test_hashes_are_written_in_index_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = OutputDirSink::new(dir.path());
        sink.store(3, "file2", &[segment(b'b', 1), segment(b'a', 0)])
            .expect("store");

        let written = std::fs::read_to_string(dir.path().join("client3_file2")).expect("read");
        assert_eq!(written, format!("{}\n{}", "a".repeat(HASH_SIZE), "b".repeat(HASH_SIZE)));
    }

    #[test]
    fn test_missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = OutputDirSink::new(dir.path().join("absent"));
        assert!(matches!(sink.store(1, "f", &[]), Err(SwarmError::Io(_))));
    }
}
