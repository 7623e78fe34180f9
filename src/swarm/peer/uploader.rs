// swarm/peer/uploader.rs
#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::config::SimConfig;
use crate::swarm::common::{Channel, ProcessId, SegmentHash, SwarmError, TRACKER_ID};
use crate::swarm::message::{DownloadReply, UploadRequest};
use crate::swarm::peer::PeerShared;
use crate::swarm::transport::{Inbox, Postman};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadStats {
    pub has_queries: u64,
    pub get_queries: u64,
    pub served: u64,
    pub not_present: u64,
}

/// Answers other peers' queries until the tracker sends stop. Never
/// initiates a request of its own.
pub struct Uploader {
    shared: Arc<PeerShared>,
    postman: Postman,
    requests: Inbox<UploadRequest>,
    serve_delay: Duration,
    stats: UploadStats,
}

impl Uploader {
    pub fn new(
        shared: Arc<PeerShared>,
        postman: Postman,
        requests: Inbox<UploadRequest>,
        config: &SimConfig,
    ) -> Self {
        Self {
            shared,
            postman,
            requests,
            serve_delay: config.serve_delay(),
            stats: UploadStats::default(),
        }
    }

    pub async fn run(mut self) -> Result<UploadStats, SwarmError> {
        let id = self.shared.id();
        debug!(rank = id, "upload task started");
        let mut in_flight: JoinSet<Result<(), SwarmError>> = JoinSet::new();

        loop {
            while let Some(done) = in_flight.try_join_next() {
                done??;
            }

            let (from, request) = self.requests.recv().await?;
            match request {
                UploadRequest::HasSegment { file, index } => {
                    self.stats.has_queries += 1;
                    let reply = if self.shared.has_segment(&file, index)? {
                        DownloadReply::Load(self.shared.load())
                    } else {
                        DownloadReply::NotPresent
                    };
                    trace!(rank = id, peer = from, %file, index, reply = reply.kind(), "has-segment answered");
                    self.postman.send(from, &reply).await?;
                }
                UploadRequest::GetSegment { file, index } => {
                    self.stats.get_queries += 1;
                    match self.shared.segment(&file, index)? {
                        Some(segment) => {
                            self.stats.served += 1;
                            self.serve(&mut in_flight, from, segment.hash);
                        }
                        None => {
                            self.stats.not_present += 1;
                            self.postman.send(from, &DownloadReply::NotPresent).await?;
                        }
                    }
                }
                UploadRequest::Stop => {
                    if from != TRACKER_ID {
                        return Err(SwarmError::UnexpectedMessage {
                            channel: Channel::Upload,
                            message: format!("stop from peer {}", from),
                        });
                    }
                    break;
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            done??;
        }
        debug!(rank = id, stats = ?self.stats, "upload task stopped");
        Ok(self.stats)
    }

    /// Hands a segment to `to` in the background. The load counts the serve
    /// until just before the reply is queued.
    fn serve(
        &self,
        in_flight: &mut JoinSet<Result<(), SwarmError>>,
        to: ProcessId,
        hash: SegmentHash,
    ) {
        let guard = self.shared.begin_serve();
        let postman = self.postman.clone();
        let delay = self.serve_delay;
        in_flight.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            drop(guard);
            postman.send(to, &DownloadReply::Segment(hash)).await
        });
    }
}
