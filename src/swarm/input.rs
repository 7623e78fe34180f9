// swarm/input.rs
#![forbid(unsafe_code)]

use std::path::PathBuf;

use crate::swarm::common::{validate_file_name, ProcessId, SegmentHash, SwarmError, MAX_FILES, MAX_SEGMENTS};
use crate::swarm::model::{PeerManifest, Segment};

/// Supplies the owned/wanted manifest of a peer at start-up
#[cfg_attr(test, mockall::automock)]
pub trait ManifestSource {
    fn load(&self, rank: ProcessId) -> Result<PeerManifest, SwarmError>;
}

/// Reads `in<rank>.txt` files from a directory
#[derive(Debug, Clone)]
pub struct InputDirSource {
    dir: PathBuf,
}

impl InputDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, rank: ProcessId) -> PathBuf {
        self.dir.join(format!("in{}.txt", rank))
    }
}

impl ManifestSource for InputDirSource {
    fn load(&self, rank: ProcessId) -> Result<PeerManifest, SwarmError> {
        let path = self.path_for(rank);
        let raw = std::fs::read_to_string(&path)?;
        parse_manifest(&raw)
            .map_err(|e| SwarmError::InvalidInput(format!("{}: {}", path.display(), e)))
    }
}

/// Manifests of peers 1..=peer_count, in rank order
pub fn load_all(
    source: &dyn ManifestSource,
    peer_count: usize,
) -> Result<Vec<PeerManifest>, SwarmError> {
    (1..=peer_count as ProcessId).map(|rank| source.load(rank)).collect()
}

struct Tokens<'a> {
    inner: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn next(&mut self, what: &str) -> Result<&'a str, SwarmError> {
        self.inner
            .next()
            .ok_or_else(|| SwarmError::InvalidInput(format!("missing {}", what)))
    }

    fn count(&mut self, what: &str, max: usize) -> Result<usize, SwarmError> {
        let raw = self.next(what)?;
        let count: usize = raw
            .parse()
            .map_err(|_| SwarmError::InvalidInput(format!("{} is not a count: {:?}", what, raw)))?;
        if count > max {
            return Err(SwarmError::InvalidInput(format!(
                "{} of {} exceeds the limit of {}",
                what, count, max
            )));
        }
        Ok(count)
    }

    fn file_name(&mut self) -> Result<String, SwarmError> {
        let name = self.next("file name")?;
        validate_file_name(name)?;
        Ok(name.to_string())
    }
}

/// Parses the whitespace-separated manifest format:
///
/// ```text
/// <owned count>
/// <name> <segment count>
/// <hash>...
/// <wanted count>
/// <name>...
/// ```
///
/// Segment indices follow the order of the hashes.
pub fn parse_manifest(raw: &str) -> Result<PeerManifest, SwarmError> {
    let mut tokens = Tokens { inner: raw.split_whitespace() };
    let mut manifest = PeerManifest::default();

    let owned = tokens.count("owned file count", MAX_FILES)?;
    for _ in 0..owned {
        let name = tokens.file_name()?;
        let segment_count = tokens.count("segment count", MAX_SEGMENTS)?;
        let mut segments = Vec::with_capacity(segment_count);
        for index in 0..segment_count {
            let hash: SegmentHash = tokens.next("segment hash")?.parse()?;
            segments.push(Segment::new(hash, index as u32));
        }
        manifest.owned.push((name, segments));
    }

    let wanted = tokens.count("wanted file count", MAX_FILES)?;
    for _ in 0..wanted {
        manifest.wanted.push(tokens.file_name()?);
    }
    Ok(manifest)
}
