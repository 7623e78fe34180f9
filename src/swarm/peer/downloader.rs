// swarm/peer/downloader.rs
#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SimConfig;
use crate::swarm::common::{Channel, ProcessId, SwarmError, TRACKER_ID};
use crate::swarm::message::{DownloadReply, TrackerRequest, UploadRequest};
use crate::swarm::model::Segment;
use crate::swarm::output::SegmentSink;
use crate::swarm::peer::selection::SourceSelector;
use crate::swarm::peer::PeerShared;
use crate::swarm::transport::{backoff_delay, Inbox, Postman};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadStats {
    pub discovers: u64,
    pub refreshes: u64,
    pub has_queries: u64,
    pub fetches: u64,
    pub retries: u64,
}

#[derive(Debug)]
pub struct DownloadOutcome {
    pub completed: Vec<String>,
    pub failed: Vec<(String, SwarmError)>,
    pub stats: DownloadStats,
}

/// Errors that give up one file but leave the rest of the peer running
fn is_file_level(err: &SwarmError) -> bool {
    matches!(
        err,
        SwarmError::UnknownFile(_) | SwarmError::NoSource { .. } | SwarmError::HashMismatch { .. }
    )
}

/// Acquires every wanted file in order, one file at a time
pub struct Downloader {
    shared: Arc<PeerShared>,
    postman: Postman,
    replies: Inbox<DownloadReply>,
    wanted: Vec<String>,
    config: SimConfig,
    sink: Arc<dyn SegmentSink>,
    stats: DownloadStats,
}

impl Downloader {
    pub fn new(
        shared: Arc<PeerShared>,
        postman: Postman,
        replies: Inbox<DownloadReply>,
        wanted: Vec<String>,
        config: SimConfig,
        sink: Arc<dyn SegmentSink>,
    ) -> Self {
        Self { shared, postman, replies, wanted, config, sink, stats: DownloadStats::default() }
    }

    fn id(&self) -> ProcessId {
        self.shared.id()
    }

    pub async fn run(mut self) -> Result<DownloadOutcome, SwarmError> {
        debug!(rank = self.id(), "download task started");
        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for file in std::mem::take(&mut self.wanted) {
            match self.download_file(&file).await {
                Ok(()) => {
                    info!(rank = self.id(), %file, "file downloaded");
                    completed.push(file);
                }
                Err(e) if is_file_level(&e) => {
                    warn!(rank = self.id(), %file, error = %e, "giving up on file");
                    failed.push((file, e));
                }
                Err(e) => return Err(e),
            }
        }

        self.postman.send(TRACKER_ID, &TrackerRequest::AllComplete).await?;
        Ok(DownloadOutcome { completed, failed, stats: self.stats })
    }

    async fn download_file(&mut self, file: &str) -> Result<(), SwarmError> {
        let (mut swarm, manifest) = self.discover(file).await?;
        debug!(rank = self.id(), %file, swarm = ?swarm, segments = manifest.len(), "file details received");

        for (position, segment) in manifest.iter().enumerate() {
            if position > 0 && position % self.config.refresh_interval == 0 {
                swarm = self.refresh(file).await?;
            }
            if self.shared.has_segment(file, segment.index)? {
                continue;
            }
            self.acquire(file, segment, &mut swarm).await?;
        }
        if !self.shared.is_complete(file, &manifest)? {
            return Err(SwarmError::Internal(format!("{} incomplete after download", file)));
        }

        self.postman
            .send(TRACKER_ID, &TrackerRequest::FileComplete { file: file.to_string() })
            .await?;

        let segments = self.shared.segments(file)?;
        self.sink.store(self.id(), file, &segments)?;
        Ok(())
    }

    /// Swarm snapshot without this peer: its own uploader never has what
    /// the downloader is missing.
    fn snapshot(&self, members: Vec<ProcessId>) -> Vec<ProcessId> {
        let me = self.id();
        members.into_iter().filter(|p| *p != me && *p != TRACKER_ID).collect()
    }

    async fn recv_tracker_reply(&mut self) -> Result<DownloadReply, SwarmError> {
        self.replies.recv_from(TRACKER_ID).await
    }

    async fn discover(&mut self, file: &str) -> Result<(Vec<ProcessId>, Vec<Segment>), SwarmError> {
        self.stats.discovers += 1;
        self.postman
            .send(TRACKER_ID, &TrackerRequest::Discover { file: file.to_string() })
            .await?;

        let members = match self.recv_tracker_reply().await? {
            DownloadReply::Swarm(members) => members,
            DownloadReply::UnknownFile => return Err(SwarmError::UnknownFile(file.to_string())),
            other => return Err(unexpected(&other)),
        };
        let manifest = match self.recv_tracker_reply().await? {
            DownloadReply::Manifest(segments) => segments,
            other => return Err(unexpected(&other)),
        };
        Ok((self.snapshot(members), manifest))
    }

    async fn refresh(&mut self, file: &str) -> Result<Vec<ProcessId>, SwarmError> {
        self.stats.refreshes += 1;
        self.postman
            .send(TRACKER_ID, &TrackerRequest::Refresh { file: file.to_string() })
            .await?;
        match self.recv_tracker_reply().await? {
            DownloadReply::Swarm(members) => {
                let swarm = self.snapshot(members);
                debug!(rank = self.id(), %file, swarm = ?swarm, "swarm refreshed");
                Ok(swarm)
            }
            DownloadReply::UnknownFile => Err(SwarmError::UnknownFile(file.to_string())),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetches one segment, refreshing the swarm and backing off between
    /// failed attempts.
    async fn acquire(
        &mut self,
        file: &str,
        segment: &Segment,
        swarm: &mut Vec<ProcessId>,
    ) -> Result<(), SwarmError> {
        let mut last_error = None;
        for attempt in 0..self.config.max_source_attempts {
            if attempt > 0 {
                self.stats.retries += 1;
                let delay = backoff_delay(self.config.source_retry_backoff(), attempt - 1);
                tokio::time::sleep(delay).await;
                *swarm = self.refresh(file).await?;
            }
            match self.try_acquire(file, segment, swarm).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(rank = self.id(), %file, index = segment.index, attempt, error = %e, "segment attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| SwarmError::NoSource {
            file: file.to_string(),
            index: segment.index,
        }))
    }

    async fn try_acquire(
        &mut self,
        file: &str,
        segment: &Segment,
        swarm: &[ProcessId],
    ) -> Result<(), SwarmError> {
        let no_source = || SwarmError::NoSource { file: file.to_string(), index: segment.index };
        let source = self.select_source(file, segment.index, swarm).await?.ok_or_else(no_source)?;

        self.stats.fetches += 1;
        self.postman
            .send(source, &UploadRequest::GetSegment { file: file.to_string(), index: segment.index })
            .await?;
        match self.replies.recv_from(source).await? {
            DownloadReply::Segment(hash) => {
                if self.config.verify_hashes && hash != segment.hash {
                    return Err(SwarmError::HashMismatch { file: file.to_string(), index: segment.index });
                }
            }
            DownloadReply::NotPresent => return Err(no_source()),
            other => return Err(unexpected(&other)),
        }

        self.shared.add_segment(file, *segment)?;
        debug!(rank = self.id(), %file, index = segment.index, source, "segment acquired");
        Ok(())
    }

    /// Asks swarm members in order whether they hold the segment and picks
    /// the least loaded one. Stops asking at the first idle member.
    async fn select_source(
        &mut self,
        file: &str,
        index: u32,
        swarm: &[ProcessId],
    ) -> Result<Option<ProcessId>, SwarmError> {
        let mut selector = SourceSelector::new();
        for &member in swarm {
            if selector.is_settled() {
                break;
            }
            self.stats.has_queries += 1;
            self.postman
                .send(member, &UploadRequest::HasSegment { file: file.to_string(), index })
                .await?;
            let load = match self.replies.recv_from(member).await? {
                DownloadReply::Load(load) => Some(load),
                DownloadReply::NotPresent => None,
                other => return Err(unexpected(&other)),
            };
            selector.observe(member, load);
        }
        Ok(selector.finish())
    }
}

fn unexpected(reply: &DownloadReply) -> SwarmError {
    SwarmError::UnexpectedMessage {
        channel: Channel::Download,
        message: format!("{} reply", reply.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::swarm::common::{SegmentHash, HASH_SIZE};
    use crate::swarm::model::OwnedSegments;
    use crate::swarm::output::MockSegmentSink;
    use crate::swarm::transport::{build_network, Mailboxes};

    fn segment(tag: u8, index: u32) -> Segment {
        Segment::new(SegmentHash([tag; HASH_SIZE]), index)
    }

    struct Harness {
        downloader: Downloader,
        tracker: Mailboxes,
        source: Mailboxes,
    }

    /// Process 1 downloads; 0 plays the tracker and 2 a source, both scripted
    fn harness(wanted: &[&str], config: SimConfig, sink: MockSegmentSink) -> Harness {
        let mut boxes = build_network(3, &TransportConfig::default()).expect("network");
        let source = boxes.pop().expect("source");
        let me = boxes.pop().expect("downloader");
        let tracker = boxes.pop().expect("tracker");
        let shared = Arc::new(PeerShared::new(1, OwnedSegments::new()));
        let downloader = Downloader::new(
            shared,
            me.postman,
            me.download,
            wanted.iter().map(|w| w.to_string()).collect(),
            config,
            Arc::new(sink),
        );
        Harness { downloader, tracker, source }
    }

    /// Serves has/get queries from its own owned list, answering get with `served`
    fn spawn_source(mut source: Mailboxes, owned: Vec<Segment>, served: SegmentHash) {
        tokio::spawn(async move {
            while let Ok((from, request)) = source.upload.recv().await {
                let reply = match request {
                    UploadRequest::HasSegment { index, .. } => {
                        if owned.iter().any(|s| s.index == index) {
                            DownloadReply::Load(0)
                        } else {
                            DownloadReply::NotPresent
                        }
                    }
                    UploadRequest::GetSegment { .. } => DownloadReply::Segment(served),
                    UploadRequest::Stop => break,
                };
                if source.postman.send(from, &reply).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Answers discover/refresh with `swarm` and `manifest`; returns the requests seen
    fn spawn_tracker(
        mut tracker: Mailboxes,
        swarm: Vec<ProcessId>,
        manifest: Vec<Segment>,
    ) -> tokio::task::JoinHandle<Vec<TrackerRequest>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok((from, request)) = tracker.tracker.recv().await {
                seen.push(request.clone());
                match request {
                    TrackerRequest::Discover { file } if file == "f" => {
                        tracker.postman.send(from, &DownloadReply::Swarm(swarm.clone())).await.expect("swarm");
                        tracker
                            .postman
                            .send(from, &DownloadReply::Manifest(manifest.clone()))
                            .await
                            .expect("manifest");
                    }
                    TrackerRequest::Discover { .. } => {
                        tracker.postman.send(from, &DownloadReply::UnknownFile).await.expect("unknown");
                    }
                    TrackerRequest::Refresh { .. } => {
                        tracker.postman.send(from, &DownloadReply::Swarm(swarm.clone())).await.expect("swarm");
                    }
                    TrackerRequest::FileComplete { .. } => {}
                    TrackerRequest::AllComplete => break,
                }
            }
            seen
        })
    }

    fn count_refreshes(seen: &[TrackerRequest]) -> usize {
        seen.iter().filter(|r| matches!(r, TrackerRequest::Refresh { .. })).count()
    }

    #[tokio::test]
    async fn test_refresh_cadence_over_25_segments() {
        let manifest: Vec<_> = (0..25).map(|i| segment(b'a', i)).collect();
        let mut sink = MockSegmentSink::new();
        sink.expect_store()
            .times(1)
            .withf(|owner, file, segments| *owner == 1 && file == "f" && segments.len() == 25)
            .returning(|_, _, _| Ok(()));

        let h = harness(&["f"], SimConfig::default(), sink);
        spawn_source(h.source, manifest.clone(), SegmentHash([b'a'; HASH_SIZE]));
        let tracker = spawn_tracker(h.tracker, vec![2], manifest.clone());

        let outcome = h.downloader.run().await.expect("download");
        let seen = tracker.await.expect("tracker task");

        assert_eq!(outcome.completed, vec!["f".to_string()]);
        assert_eq!(outcome.stats.refreshes, 2);
        assert_eq!(count_refreshes(&seen), 2);
        assert_eq!(outcome.stats.fetches, 25);
        assert!(matches!(seen.last(), Some(TrackerRequest::AllComplete)));
        assert!(seen.contains(&TrackerRequest::FileComplete { file: "f".into() }));
    }

    #[tokio::test]
    async fn test_refresh_count_follows_interval() {
        for (segments, interval, expected) in [(10u32, 10usize, 0u64), (11, 10, 1), (25, 5, 4), (3, 1, 2)] {
            let manifest: Vec<_> = (0..segments).map(|i| segment(b'a', i)).collect();
            let mut sink = MockSegmentSink::new();
            sink.expect_store().returning(|_, _, _| Ok(()));

            let h = harness(&["f"], SimConfig::default().with_refresh_interval(interval), sink);
            spawn_source(h.source, manifest.clone(), SegmentHash([b'a'; HASH_SIZE]));
            let tracker = spawn_tracker(h.tracker, vec![2], manifest);

            let outcome = h.downloader.run().await.expect("download");
            tracker.await.expect("tracker task");
            assert_eq!(outcome.stats.refreshes, expected, "{} segments every {}", segments, interval);
        }
    }

    #[tokio::test]
    async fn test_hash_mismatch_gives_up_after_retries() {
        let manifest = vec![segment(b'a', 0)];
        let mut sink = MockSegmentSink::new();
        sink.expect_store().never();

        let mut config = SimConfig::default();
        config.max_source_attempts = 2;
        config.source_retry_backoff_ms = 1;
        let h = harness(&["f"], config, sink);
        spawn_source(h.source, manifest.clone(), SegmentHash([b'x'; HASH_SIZE]));
        let tracker = spawn_tracker(h.tracker, vec![2], manifest);

        let outcome = h.downloader.run().await.expect("download");
        let seen = tracker.await.expect("tracker task");

        assert!(outcome.completed.is_empty());
        assert!(matches!(outcome.failed[0].1, SwarmError::HashMismatch { index: 0, .. }));
        assert_eq!(outcome.stats.retries, 1);
        assert_eq!(count_refreshes(&seen), 1);
        assert!(!seen.iter().any(|r| matches!(r, TrackerRequest::FileComplete { .. })));
        assert!(matches!(seen.last(), Some(TrackerRequest::AllComplete)));
    }

    #[tokio::test]
    async fn test_segment_nobody_has_fails_the_file() {
        let manifest = vec![segment(b'a', 0), segment(b'a', 1)];
        let mut sink = MockSegmentSink::new();
        sink.expect_store().never();

        let mut config = SimConfig::default();
        config.max_source_attempts = 3;
        config.source_retry_backoff_ms = 1;
        let h = harness(&["f"], config, sink);
        // The source only holds segment 0
        spawn_source(h.source, vec![manifest[0]], SegmentHash([b'a'; HASH_SIZE]));
        let tracker = spawn_tracker(h.tracker, vec![2], manifest);

        let outcome = h.downloader.run().await.expect("download");
        tracker.await.expect("tracker task");

        assert!(matches!(outcome.failed[0].1, SwarmError::NoSource { index: 1, .. }));
        assert_eq!(outcome.stats.retries, 2);
        assert_eq!(outcome.stats.fetches, 1);
    }

    #[tokio::test]
    async fn test_unknown_file_is_skipped() {
        let manifest = vec![segment(b'a', 0)];
        let mut sink = MockSegmentSink::new();
        sink.expect_store().times(1).returning(|_, _, _| Ok(()));

        let h = harness(&["ghost", "f"], SimConfig::default(), sink);
        spawn_source(h.source, manifest.clone(), SegmentHash([b'a'; HASH_SIZE]));
        let tracker = spawn_tracker(h.tracker, vec![2], manifest);

        let outcome = h.downloader.run().await.expect("download");
        tracker.await.expect("tracker task");

        assert_eq!(outcome.completed, vec!["f".to_string()]);
        assert!(matches!(&outcome.failed[0], (name, SwarmError::UnknownFile(_)) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_sink_failure_is_fatal() {
        let manifest = vec![segment(b'a', 0)];
        let mut sink = MockSegmentSink::new();
        sink.expect_store()
            .returning(|_, _, _| Err(SwarmError::Io(std::io::Error::other("disk full"))));

        let h = harness(&["f"], SimConfig::default(), sink);
        spawn_source(h.source, manifest.clone(), SegmentHash([b'a'; HASH_SIZE]));
        let _tracker = spawn_tracker(h.tracker, vec![2], manifest);

        assert!(matches!(h.downloader.run().await, Err(SwarmError::Io(_))));
    }
}
