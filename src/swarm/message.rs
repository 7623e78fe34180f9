// swarm/message.rs
#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::swarm::common::{
    validate_file_name, Channel, ProcessId, SegmentHash, SwarmError, HASH_SIZE,
};
use crate::swarm::model::{PeerManifest, Segment};

// Opcodes, one closed set per channel.
// Bootstrap
pub const OP_REGISTER: u8 = 1;
pub const OP_ACK: u8 = 42;

// Tracker
pub const OP_DISCOVER: u8 = 1;
pub const OP_REFRESH: u8 = 2;
pub const OP_FILE_COMPLETE: u8 = 3;
pub const OP_ALL_COMPLETE: u8 = 4;

// Upload
pub const OP_HAS_SEGMENT: u8 = 1;
pub const OP_GET_SEGMENT: u8 = 2;
pub const OP_STOP: u8 = 3;

// Download
pub const OP_SWARM: u8 = 1;
pub const OP_MANIFEST: u8 = 2;
pub const OP_UNKNOWN_FILE: u8 = 3;
pub const OP_NOT_PRESENT: u8 = 4;
pub const OP_LOAD: u8 = 5;
pub const OP_SEGMENT: u8 = 6;

/// A message type bound to exactly one logical channel
pub trait WireMessage: Sized + Send + 'static {
    const CHANNEL: Channel;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), SwarmError>;

    fn decode(buf: &mut Bytes) -> Result<Self, SwarmError>;

    fn to_frame(&self) -> Result<Bytes, SwarmError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes a whole frame; leftover bytes are a protocol violation
    fn from_frame(mut frame: Bytes) -> Result<Self, SwarmError> {
        let msg = Self::decode(&mut frame)?;
        if frame.has_remaining() {
            return Err(SwarmError::TrailingBytes {
                channel: Self::CHANNEL,
                trailing: frame.remaining(),
            });
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapMessage {
    /// Peer -> tracker: every file the peer owns
    Register(Vec<(String, Vec<Segment>)>),
    /// Tracker -> peer: the whole population has registered
    Ack,
}

impl BootstrapMessage {
    pub fn register(manifest: &PeerManifest) -> Self {
        BootstrapMessage::Register(manifest.owned.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerRequest {
    Discover { file: String },
    Refresh { file: String },
    FileComplete { file: String },
    AllComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadRequest {
    HasSegment { file: String, index: u32 },
    GetSegment { file: String, index: u32 },
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadReply {
    /// Swarm members, seeds first
    Swarm(Vec<ProcessId>),
    /// Canonical segment list of a file
    Manifest(Vec<Segment>),
    UnknownFile,
    /// The queried peer lacks the segment
    NotPresent,
    /// The queried peer has the segment; carries its current load
    Load(u32),
    /// Hand-off of a segment's content
    Segment(SegmentHash),
}

impl DownloadReply {
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadReply::Swarm(_) => "swarm",
            DownloadReply::Manifest(_) => "manifest",
            DownloadReply::UnknownFile => "unknown-file",
            DownloadReply::NotPresent => "not-present",
            DownloadReply::Load(_) => "load",
            DownloadReply::Segment(_) => "segment",
        }
    }
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<(), SwarmError> {
    validate_file_name(name)?;
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn put_count(buf: &mut BytesMut, count: usize) -> Result<(), SwarmError> {
    let count = u32::try_from(count)
        .map_err(|_| SwarmError::Internal(format!("count {} does not fit the wire", count)))?;
    buf.put_u32(count);
    Ok(())
}

fn put_segments(buf: &mut BytesMut, segments: &[Segment]) -> Result<(), SwarmError> {
    put_count(buf, segments.len())?;
    for segment in segments {
        buf.put_slice(segment.hash.as_bytes());
        buf.put_u32(segment.index);
    }
    Ok(())
}

fn need(buf: &Bytes, len: usize, channel: Channel) -> Result<(), SwarmError> {
    if buf.remaining() < len {
        return Err(SwarmError::TruncatedFrame(channel));
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes, channel: Channel) -> Result<u8, SwarmError> {
    need(buf, 1, channel)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes, channel: Channel) -> Result<u32, SwarmError> {
    need(buf, 4, channel)?;
    Ok(buf.get_u32())
}

fn get_name(buf: &mut Bytes, channel: Channel) -> Result<String, SwarmError> {
    let len = get_u8(buf, channel)? as usize;
    need(buf, len, channel)?;
    let raw = buf.split_to(len);
    let name = String::from_utf8(raw.to_vec()).map_err(|_| SwarmError::UnexpectedMessage {
        channel,
        message: "file name is not UTF-8".into(),
    })?;
    validate_file_name(&name)?;
    Ok(name)
}

fn get_hash(buf: &mut Bytes, channel: Channel) -> Result<SegmentHash, SwarmError> {
    need(buf, HASH_SIZE, channel)?;
    let raw = buf.split_to(HASH_SIZE);
    SegmentHash::from_slice(&raw)
}

fn get_segments(buf: &mut Bytes, channel: Channel) -> Result<Vec<Segment>, SwarmError> {
    let count = get_u32(buf, channel)? as usize;
    // Bound the allocation by what the frame can actually hold
    need(buf, count.saturating_mul(HASH_SIZE + 4), channel)?;
    let mut segments = Vec::with_capacity(count);
    for _ in 0..count {
        let hash = get_hash(buf, channel)?;
        let index = get_u32(buf, channel)?;
        segments.push(Segment::new(hash, index));
    }
    Ok(segments)
}

impl WireMessage for BootstrapMessage {
    const CHANNEL: Channel = Channel::Bootstrap;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), SwarmError> {
        match self {
            BootstrapMessage::Register(files) => {
                buf.put_u8(OP_REGISTER);
                put_count(buf, files.len())?;
                for (name, segments) in files {
                    put_name(buf, name)?;
                    put_segments(buf, segments)?;
                }
            }
            BootstrapMessage::Ack => buf.put_u8(OP_ACK),
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, SwarmError> {
        let channel = Self::CHANNEL;
        match get_u8(buf, channel)? {
            OP_REGISTER => {
                let count = get_u32(buf, channel)? as usize;
                let mut files = Vec::new();
                for _ in 0..count {
                    let name = get_name(buf, channel)?;
                    let segments = get_segments(buf, channel)?;
                    files.push((name, segments));
                }
                Ok(BootstrapMessage::Register(files))
            }
            OP_ACK => Ok(BootstrapMessage::Ack),
            opcode => Err(SwarmError::UnknownOpcode { channel, opcode }),
        }
    }
}

impl WireMessage for TrackerRequest {
    const CHANNEL: Channel = Channel::Tracker;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), SwarmError> {
        match self {
            TrackerRequest::Discover { file } => {
                buf.put_u8(OP_DISCOVER);
                put_name(buf, file)?;
            }
            TrackerRequest::Refresh { file } => {
                buf.put_u8(OP_REFRESH);
                put_name(buf, file)?;
            }
            TrackerRequest::FileComplete { file } => {
                buf.put_u8(OP_FILE_COMPLETE);
                put_name(buf, file)?;
            }
            TrackerRequest::AllComplete => buf.put_u8(OP_ALL_COMPLETE),
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, SwarmError> {
        let channel = Self::CHANNEL;
        match get_u8(buf, channel)? {
            OP_DISCOVER => Ok(TrackerRequest::Discover { file: get_name(buf, channel)? }),
            OP_REFRESH => Ok(TrackerRequest::Refresh { file: get_name(buf, channel)? }),
            OP_FILE_COMPLETE => Ok(TrackerRequest::FileComplete { file: get_name(buf, channel)? }),
            OP_ALL_COMPLETE => Ok(TrackerRequest::AllComplete),
            opcode => Err(SwarmError::UnknownOpcode { channel, opcode }),
        }
    }
}

impl WireMessage for UploadRequest {
    const CHANNEL: Channel = Channel::Upload;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), SwarmError> {
        match self {
            UploadRequest::HasSegment { file, index } => {
                buf.put_u8(OP_HAS_SEGMENT);
                put_name(buf, file)?;
                buf.put_u32(*index);
            }
            UploadRequest::GetSegment { file, index } => {
                buf.put_u8(OP_GET_SEGMENT);
                put_name(buf, file)?;
                buf.put_u32(*index);
            }
            UploadRequest::Stop => buf.put_u8(OP_STOP),
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, SwarmError> {
        let channel = Self::CHANNEL;
        match get_u8(buf, channel)? {
            OP_HAS_SEGMENT => {
                let file = get_name(buf, channel)?;
                let index = get_u32(buf, channel)?;
                Ok(UploadRequest::HasSegment { file, index })
            }
            OP_GET_SEGMENT => {
                let file = get_name(buf, channel)?;
                let index = get_u32(buf, channel)?;
                Ok(UploadRequest::GetSegment { file, index })
            }
            OP_STOP => Ok(UploadRequest::Stop),
            opcode => Err(SwarmError::UnknownOpcode { channel, opcode }),
        }
    }
}

impl WireMessage for DownloadReply {
    const CHANNEL: Channel = Channel::Download;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), SwarmError> {
        match self {
            DownloadReply::Swarm(members) => {
                buf.put_u8(OP_SWARM);
                put_count(buf, members.len())?;
                for id in members {
                    buf.put_u32(*id);
                }
            }
            DownloadReply::Manifest(segments) => {
                buf.put_u8(OP_MANIFEST);
                put_segments(buf, segments)?;
            }
            DownloadReply::UnknownFile => buf.put_u8(OP_UNKNOWN_FILE),
            DownloadReply::NotPresent => buf.put_u8(OP_NOT_PRESENT),
            DownloadReply::Load(load) => {
                buf.put_u8(OP_LOAD);
                buf.put_u32(*load);
            }
            DownloadReply::Segment(hash) => {
                buf.put_u8(OP_SEGMENT);
                buf.put_slice(hash.as_bytes());
            }
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, SwarmError> {
        let channel = Self::CHANNEL;
        match get_u8(buf, channel)? {
            OP_SWARM => {
                let count = get_u32(buf, channel)? as usize;
                need(buf, count.saturating_mul(4), channel)?;
                let members = (0..count).map(|_| buf.get_u32()).collect();
                Ok(DownloadReply::Swarm(members))
            }
            OP_MANIFEST => Ok(DownloadReply::Manifest(get_segments(buf, channel)?)),
            OP_UNKNOWN_FILE => Ok(DownloadReply::UnknownFile),
            OP_NOT_PRESENT => Ok(DownloadReply::NotPresent),
            OP_LOAD => Ok(DownloadReply::Load(get_u32(buf, channel)?)),
            OP_SEGMENT => Ok(DownloadReply::Segment(get_hash(buf, channel)?)),
            opcode => Err(SwarmError::UnknownOpcode { channel, opcode }),
        }
    }
}
