// swarm/peer/mod.rs

pub mod selection;
pub mod downloader;
pub mod uploader;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::config::SimConfig;
use crate::swarm::common::{ProcessId, SwarmError, TRACKER_ID};
use crate::swarm::message::BootstrapMessage;
use crate::swarm::model::{OwnedSegments, PeerManifest, Segment};
use crate::swarm::output::SegmentSink;
use crate::swarm::transport::Mailboxes;

pub use downloader::{DownloadStats, Downloader};
pub use uploader::{UploadStats, Uploader};

/// State shared by the downloader and uploader of one peer.
///
/// Every accessor takes the lock for a single lookup or append and releases
/// it before returning, so it is never held across an `.await`.
#[derive(Debug)]
pub struct PeerShared {
    id: ProcessId,
    owned: Mutex<OwnedSegments>,
    load: AtomicU32,
}

impl PeerShared {
    pub fn new(id: ProcessId, owned: OwnedSegments) -> Self {
        Self { id, owned: Mutex::new(owned), load: AtomicU32::new(0) }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    fn lock(&self) -> Result<MutexGuard<'_, OwnedSegments>, SwarmError> {
        self.owned
            .lock()
            .map_err(|_| SwarmError::Internal("owned-segment lock poisoned".into()))
    }

    pub fn has_segment(&self, file: &str, index: u32) -> Result<bool, SwarmError> {
        Ok(self.lock()?.has(file, index))
    }

    pub fn segment(&self, file: &str, index: u32) -> Result<Option<Segment>, SwarmError> {
        Ok(self.lock()?.get(file, index).copied())
    }

    pub fn add_segment(&self, file: &str, segment: Segment) -> Result<bool, SwarmError> {
        Ok(self.lock()?.insert(file, segment))
    }

    pub fn is_complete(&self, file: &str, manifest: &[Segment]) -> Result<bool, SwarmError> {
        Ok(self.lock()?.is_complete(file, manifest))
    }

    pub fn segments(&self, file: &str) -> Result<Vec<Segment>, SwarmError> {
        Ok(self.lock()?.segments(file).to_vec())
    }

    pub fn snapshot(&self) -> Result<BTreeMap<String, Vec<Segment>>, SwarmError> {
        let owned = self.lock()?;
        Ok(owned.files().map(|(f, s)| (f.clone(), s.clone())).collect())
    }

    /// Current number of in-flight segment serves
    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Acquire)
    }

    /// Counts one serve until the returned guard is dropped
    pub fn begin_serve(self: &Arc<Self>) -> LoadGuard {
        self.load.fetch_add(1, Ordering::AcqRel);
        LoadGuard { shared: Arc::clone(self) }
    }
}

pub struct LoadGuard {
    shared: Arc<PeerShared>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.shared.load.fetch_sub(1, Ordering::AcqRel);
    }
}

/// What a peer did over its lifetime
#[derive(Debug)]
pub struct PeerReport {
    pub id: ProcessId,
    pub completed: Vec<String>,
    pub failed: Vec<(String, SwarmError)>,
    pub owned: BTreeMap<String, Vec<Segment>>,
    pub download: DownloadStats,
    pub upload: UploadStats,
}

/// A peer process: registers with the tracker, then downloads and uploads
/// concurrently until the tracker says stop.
pub struct Peer {
    mailboxes: Mailboxes,
    manifest: PeerManifest,
    config: SimConfig,
    sink: Arc<dyn SegmentSink>,
}

impl Peer {
    pub fn new(
        mailboxes: Mailboxes,
        manifest: PeerManifest,
        config: SimConfig,
        sink: Arc<dyn SegmentSink>,
    ) -> Result<Self, SwarmError> {
        if mailboxes.id() == TRACKER_ID {
            return Err(SwarmError::Config(format!(
                "process {} is reserved for the tracker",
                TRACKER_ID
            )));
        }
        Ok(Self { mailboxes, manifest, config, sink })
    }

    pub async fn run(self) -> Result<PeerReport, SwarmError> {
        let Peer { mailboxes, manifest, config, sink } = self;
        let Mailboxes { postman, mut bootstrap, upload, download, .. } = mailboxes;
        let id = postman.id();

        postman.send(TRACKER_ID, &BootstrapMessage::register(&manifest)).await?;
        match bootstrap.recv_from(TRACKER_ID).await {
            Ok(BootstrapMessage::Ack) => {}
            Ok(other) => {
                return Err(SwarmError::Bootstrap(format!(
                    "peer {} expected an ack, got {:?}",
                    id, other
                )));
            }
            Err(e) => {
                return Err(SwarmError::Bootstrap(format!(
                    "peer {} got no ack from the tracker: {}",
                    id, e
                )));
            }
        }
        info!(rank = id, owned = manifest.owned.len(), wanted = manifest.wanted.len(), "peer initialized");

        let shared = Arc::new(PeerShared::new(id, OwnedSegments::from_manifest(&manifest)));
        let uploader = Uploader::new(Arc::clone(&shared), postman.clone(), upload, &config);
        let downloader = Downloader::new(
            Arc::clone(&shared),
            postman,
            download,
            manifest.wanted,
            config,
            sink,
        );

        let upload_task = tokio::spawn(uploader.run());
        let download_task = tokio::spawn(downloader.run());

        let outcome = match download_task.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                upload_task.abort();
                return Err(e);
            }
            Err(e) => {
                upload_task.abort();
                return Err(e.into());
            }
        };
        let upload_stats = upload_task.await??;

        if !outcome.failed.is_empty() {
            warn!(rank = id, failed = outcome.failed.len(), "peer finished with failed files");
        }
        info!(rank = id, "peer finished");

        Ok(PeerReport {
            id,
            completed: outcome.completed,
            failed: outcome.failed,
            owned: shared.snapshot()?,
            download: outcome.stats,
            upload: upload_stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::common::{SegmentHash, HASH_SIZE};

    fn segment(index: u32) -> Segment {
        Segment::new(SegmentHash([b'q'; HASH_SIZE]), index)
    }

    #[test]
    fn test_load_guard_tracks_in_flight_serves() {
        let shared = Arc::new(PeerShared::new(1, OwnedSegments::new()));
        assert_eq!(shared.load(), 0);
        let first = shared.begin_serve();
        let second = shared.begin_serve();
        assert_eq!(shared.load(), 2);
        drop(first);
        assert_eq!(shared.load(), 1);
        drop(second);
        assert_eq!(shared.load(), 0);
    }

    #[test]
    fn test_shared_segments_from_many_threads() {
        let shared = Arc::new(PeerShared::new(1, OwnedSegments::new()));
        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        shared.add_segment("f", segment(t * 25 + i)).expect("add");
                        let _ = shared.has_segment("f", i).expect("read");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }
        assert_eq!(shared.segments("f").expect("segments").len(), 100);
        assert!(shared.segment("f", 99).expect("lookup").is_some());
    }

    #[test]
    fn test_tracker_id_is_not_a_peer() {
        let mut boxes = crate::swarm::transport::build_network(2, &Default::default()).expect("network");
        let sink: Arc<dyn SegmentSink> = Arc::new(crate::swarm::output::MockSegmentSink::new());
        assert!(Peer::new(boxes.remove(0), PeerManifest::default(), SimConfig::default(), sink).is_err());
    }
}
