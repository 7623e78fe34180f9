// swarm/session.rs
#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::SimConfig;
use crate::swarm::common::SwarmError;
use crate::swarm::model::PeerManifest;
use crate::swarm::output::SegmentSink;
use crate::swarm::peer::{Peer, PeerReport};
use crate::swarm::tracker::{Tracker, TrackerReport};
use crate::swarm::transport::build_network;

#[derive(Debug)]
pub struct SessionReport {
    pub tracker: TrackerReport,
    /// Sorted by process id
    pub peers: Vec<PeerReport>,
}

impl SessionReport {
    #[cfg(test)]
    pub fn peer(&self, id: u32) -> Option<&PeerReport> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn failed_files(&self) -> usize {
        self.peers.iter().map(|p| p.failed.len()).sum()
    }
}

enum Finished {
    Tracker(TrackerReport),
    Peer(PeerReport),
}

/// Runs one tracker and a peer per manifest (peer `i` is process `i + 1`)
/// until the tracker has stopped every peer. The first failing process
/// aborts the rest.
pub async fn run_session(
    config: SimConfig,
    manifests: Vec<PeerManifest>,
    sink: Arc<dyn SegmentSink>,
) -> Result<SessionReport, SwarmError> {
    config.validate()?;
    let mut mailboxes = build_network(manifests.len() + 1, &config.transport)?.into_iter();
    let tracker_boxes = mailboxes
        .next()
        .ok_or_else(|| SwarmError::Internal("network has no tracker".into()))?;

    let tracker = Tracker::new(tracker_boxes)?;
    let mut peers = Vec::with_capacity(manifests.len());
    for (boxes, manifest) in mailboxes.zip(manifests) {
        peers.push(Peer::new(boxes, manifest, config.clone(), Arc::clone(&sink))?);
    }

    info!(peers = peers.len(), "session starting");
    let mut tasks = JoinSet::new();
    tasks.spawn(async move { tracker.run().await.map(Finished::Tracker) });
    for peer in peers {
        tasks.spawn(async move { peer.run().await.map(Finished::Peer) });
    }

    let mut tracker_report = None;
    let mut peer_reports = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let finished = match joined {
            Ok(result) => result,
            Err(e) => Err(SwarmError::from(e)),
        };
        match finished {
            Ok(Finished::Tracker(report)) => tracker_report = Some(report),
            Ok(Finished::Peer(report)) => peer_reports.push(report),
            Err(e) => {
                error!(error = %e, "process failed, aborting session");
                tasks.abort_all();
                return Err(e);
            }
        }
    }

    let tracker = tracker_report
        .ok_or_else(|| SwarmError::Internal("tracker finished without a report".into()))?;
    peer_reports.sort_by_key(|p| p.id);
    info!(stats = ?tracker.stats, "session finished");
    Ok(SessionReport { tracker, peers: peer_reports })
}
