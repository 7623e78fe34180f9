// swarm/common.rs
#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

/// Process id of the tracker; peers are numbered 1..=N
pub const TRACKER_ID: ProcessId = 0;

/// Longest file name accepted on the wire (bytes)
pub const MAX_FILENAME: usize = 15;
/// Width of a segment content digest (bytes)
pub const HASH_SIZE: usize = 32;
/// Upper bound on files a single peer may own or want
pub const MAX_FILES: usize = 10;
/// Upper bound on segments per file
pub const MAX_SEGMENTS: usize = 100;

/// Segments between two swarm refreshes during a download
pub const DEFAULT_REFRESH_INTERVAL: usize = 10;

pub type ProcessId = u32;

/// Logical channels multiplexed over the substrate.
///
/// Two tasks of the same process never receive on the same channel, so a
/// reply meant for the downloader can never be consumed by the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Peer -> tracker registration and the tracker's acknowledgment
    Bootstrap,
    /// Every other tracker-directed request
    Tracker,
    /// Peer -> peer queries served by the uploader, plus the tracker's stop
    Upload,
    /// Replies consumed by the downloader
    Download,
}

impl Channel {
    pub const COUNT: usize = 4;

    pub fn slot(self) -> usize {
        match self {
            Channel::Bootstrap => 0,
            Channel::Tracker => 1,
            Channel::Upload => 2,
            Channel::Download => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Bootstrap => "bootstrap",
            Channel::Tracker => "tracker",
            Channel::Upload => "upload",
            Channel::Download => "download",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("Task failed to complete: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
    #[error("Unknown opcode {opcode} on {channel} channel")]
    UnknownOpcode { channel: Channel, opcode: u8 },
    #[error("Truncated frame on {0} channel")]
    TruncatedFrame(Channel),
    #[error("{trailing} trailing bytes on {channel} channel")]
    TrailingBytes { channel: Channel, trailing: usize },
    #[error("Unexpected message on {channel} channel: {message}")]
    UnexpectedMessage { channel: Channel, message: String },
    #[error("Expected a reply from process {expected}, got one from {actual}")]
    UnexpectedSender { expected: ProcessId, actual: ProcessId },
    #[error("File unknown to the tracker: {0}")]
    UnknownFile(String),
    #[error("No source available for segment {index} of {file}")]
    NoSource { file: String, index: u32 },
    #[error("Hash mismatch for segment {index} of {file}")]
    HashMismatch { file: String, index: u32 },
    #[error("Channel {channel} of process {process} is closed")]
    ChannelClosed { process: ProcessId, channel: Channel },
    #[error("Send to process {process} on {channel} channel timed out")]
    SendTimeout { process: ProcessId, channel: Channel },
    #[error("Receive on {0} channel timed out")]
    RecvTimeout(Channel),
    #[error("Unknown process {0}")]
    UnknownProcess(ProcessId),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Failures a downloader may recover from by refreshing its swarm
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwarmError::NoSource { .. } | SwarmError::HashMismatch { .. }
        )
    }
}

/// Rejects names the wire format cannot carry
pub fn validate_file_name(name: &str) -> Result<(), SwarmError> {
    if name.is_empty() {
        return Err(SwarmError::InvalidInput("empty file name".into()));
    }
    if name.len() > MAX_FILENAME {
        return Err(SwarmError::InvalidInput(format!(
            "file name {:?} is longer than {} bytes",
            name, MAX_FILENAME
        )));
    }
    Ok(())
}

/// Opaque content digest of one segment. Only compared and copied.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentHash(pub [u8; HASH_SIZE]);

impl SegmentHash {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SwarmError> {
        let raw: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| {
            SwarmError::InvalidInput(format!(
                "segment hash must be {} bytes, got {}",
                HASH_SIZE,
                bytes.len()
            ))
        })?;
        Ok(SegmentHash(raw))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl FromStr for SegmentHash {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SegmentHash::from_slice(s.as_bytes())
    }
}

impl fmt::Display for SegmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for SegmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentHash({})", self)
    }
}
