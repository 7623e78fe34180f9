// swarm/tracker.rs
#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;

use tracing::{debug, info, warn};

use crate::swarm::common::{Channel, ProcessId, SwarmError, TRACKER_ID};
use crate::swarm::message::{BootstrapMessage, DownloadReply, TrackerRequest, UploadRequest};
use crate::swarm::model::{Segment, Swarm};
use crate::swarm::transport::Mailboxes;

/// Counters of what the tracker has handled
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrackerStats {
    pub registrations: u64,
    pub discovers: u64,
    pub refreshes: u64,
    pub completions: u64,
    pub all_done: u64,
}

/// Final state of the tracker once every peer reported all files complete
#[derive(Debug, Clone)]
pub struct TrackerReport {
    pub stats: TrackerStats,
    pub swarms: BTreeMap<String, Swarm>,
}

/// Segment database and swarm membership, owned by the tracker task alone
#[derive(Debug)]
pub struct TrackerState {
    peer_count: usize,
    file_database: HashMap<String, Vec<Segment>>,
    file_to_swarm: HashMap<String, Swarm>,
    finished: HashSet<ProcessId>,
    stats: TrackerStats,
}

impl TrackerState {
    pub fn new(peer_count: usize) -> Self {
        Self {
            peer_count,
            file_database: HashMap::new(),
            file_to_swarm: HashMap::new(),
            finished: HashSet::new(),
            stats: TrackerStats::default(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count
    }

    /// Registers `peer` as a seed of every file it owns. The first segment
    /// list seen for a name wins; later ones only add membership.
    pub fn ingest(&mut self, peer: ProcessId, files: Vec<(String, Vec<Segment>)>) {
        for (file, mut segments) in files {
            self.file_to_swarm.entry(file.clone()).or_default().add_seed(peer);
            if !self.file_database.contains_key(&file) {
                segments.sort_by_key(|s| s.index);
                debug!(peer, %file, segments = segments.len(), "file registered");
                self.file_database.insert(file, segments);
            }
        }
        self.stats.registrations += 1;
    }

    /// Returns the swarm as it was before the call plus the manifest, then
    /// records `requester` as a leecher.
    pub fn handle_discover(
        &mut self,
        file: &str,
        requester: ProcessId,
    ) -> Result<(Vec<ProcessId>, Vec<Segment>), SwarmError> {
        let manifest = self
            .file_database
            .get(file)
            .cloned()
            .ok_or_else(|| SwarmError::UnknownFile(file.to_string()))?;
        let swarm = self.file_to_swarm.entry(file.to_string()).or_default();
        let members = swarm.members();
        swarm.add_peer(requester);
        debug!(%file, requester, swarm = swarm.size(), "requester joined swarm");
        self.stats.discovers += 1;
        Ok((members, manifest))
    }

    /// Current swarm of `file`; membership is left untouched
    pub fn handle_refresh(&mut self, file: &str) -> Result<Vec<ProcessId>, SwarmError> {
        let swarm = self
            .file_to_swarm
            .get(file)
            .ok_or_else(|| SwarmError::UnknownFile(file.to_string()))?;
        self.stats.refreshes += 1;
        Ok(swarm.members())
    }

    pub fn handle_complete(&mut self, file: &str, peer: ProcessId) -> Result<(), SwarmError> {
        let swarm = self
            .file_to_swarm
            .get_mut(file)
            .ok_or_else(|| SwarmError::UnknownFile(file.to_string()))?;
        if swarm.is_seed(peer) {
            warn!(peer, %file, "completion from a peer that already seeds the file");
        }
        swarm.promote(peer);
        self.stats.completions += 1;
        Ok(())
    }

    /// Records that `peer` has every wanted file. Returns true once all peers have.
    pub fn handle_all_done(&mut self, peer: ProcessId) -> bool {
        if self.finished.insert(peer) {
            self.stats.all_done += 1;
        } else {
            warn!(peer, "duplicate all-complete notice ignored");
        }
        self.all_done()
    }

    pub fn all_done(&self) -> bool {
        self.finished.len() >= self.peer_count
    }

    #[cfg(test)]
    pub fn swarm(&self, file: &str) -> Option<&Swarm> {
        self.file_to_swarm.get(file)
    }

    #[cfg(test)]
    pub fn manifest(&self, file: &str) -> Option<&[Segment]> {
        self.file_database.get(file).map(Vec::as_slice)
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    fn into_report(self) -> TrackerReport {
        TrackerReport {
            stats: self.stats,
            swarms: self.file_to_swarm.into_iter().collect(),
        }
    }
}

/// The coordinator process. Serves one request at a time.
pub struct Tracker {
    mailboxes: Mailboxes,
    state: TrackerState,
}

impl Tracker {
    pub fn new(mailboxes: Mailboxes) -> Result<Self, SwarmError> {
        if mailboxes.id() != TRACKER_ID {
            return Err(SwarmError::Config(format!(
                "tracker must run as process {}, not {}",
                TRACKER_ID,
                mailboxes.id()
            )));
        }
        let peer_count = mailboxes.postman.process_count() - 1;
        Ok(Self { mailboxes, state: TrackerState::new(peer_count) })
    }

    fn peers(&self) -> RangeInclusive<ProcessId> {
        1..=self.state.peer_count() as ProcessId
    }

    pub async fn run(mut self) -> Result<TrackerReport, SwarmError> {
        info!(peers = self.state.peer_count(), "tracker is running");
        self.initialize().await?;
        self.serve().await?;
        info!(stats = ?self.state.stats(), "tracker finished");
        Ok(self.state.into_report())
    }

    /// Registration barrier: one manifest from every peer, then an ack to each
    async fn initialize(&mut self) -> Result<(), SwarmError> {
        let mut registered = HashSet::new();
        while registered.len() < self.state.peer_count() {
            let (from, msg) = self.mailboxes.bootstrap.recv().await?;
            match msg {
                BootstrapMessage::Register(files) => {
                    if from == TRACKER_ID || !registered.insert(from) {
                        return Err(SwarmError::UnexpectedMessage {
                            channel: Channel::Bootstrap,
                            message: format!("duplicate registration from {}", from),
                        });
                    }
                    debug!(peer = from, files = files.len(), "manifest received");
                    self.state.ingest(from, files);
                }
                BootstrapMessage::Ack => {
                    return Err(SwarmError::UnexpectedMessage {
                        channel: Channel::Bootstrap,
                        message: format!("ack sent to the tracker by {}", from),
                    });
                }
            }
        }

        for peer in self.peers() {
            self.mailboxes.postman.send(peer, &BootstrapMessage::Ack).await?;
        }
        info!(files = self.state.file_database.len(), "all peers registered");
        Ok(())
    }

    async fn serve(&mut self) -> Result<(), SwarmError> {
        loop {
            let (from, request) = self.mailboxes.tracker.recv().await?;
            match request {
                TrackerRequest::Discover { file } => {
                    debug!(peer = from, %file, "discover");
                    match self.state.handle_discover(&file, from) {
                        Ok((members, manifest)) => {
                            let postman = &self.mailboxes.postman;
                            postman.send(from, &DownloadReply::Swarm(members)).await?;
                            postman.send(from, &DownloadReply::Manifest(manifest)).await?;
                        }
                        Err(e) => {
                            warn!(peer = from, %file, error = %e, "discover rejected");
                            self.mailboxes.postman.send(from, &DownloadReply::UnknownFile).await?;
                        }
                    }
                }
                TrackerRequest::Refresh { file } => {
                    debug!(peer = from, %file, "refresh");
                    let reply = match self.state.handle_refresh(&file) {
                        Ok(members) => DownloadReply::Swarm(members),
                        Err(e) => {
                            warn!(peer = from, %file, error = %e, "refresh rejected");
                            DownloadReply::UnknownFile
                        }
                    };
                    self.mailboxes.postman.send(from, &reply).await?;
                }
                TrackerRequest::FileComplete { file } => {
                    info!(peer = from, %file, "peer became a seed");
                    if let Err(e) = self.state.handle_complete(&file, from) {
                        warn!(peer = from, %file, error = %e, "completion for unknown file");
                    }
                }
                TrackerRequest::AllComplete => {
                    info!(peer = from, "peer finished all downloads");
                    if self.state.handle_all_done(from) {
                        for peer in self.peers() {
                            self.mailboxes.postman.send(peer, &UploadRequest::Stop).await?;
                        }
                        info!("stop broadcast to every peer");
                        return Ok(());
                    }
                }
            }
        }
    }
}
