// swarm/transport.rs
#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{trace, warn};

use crate::config::TransportConfig;
use crate::swarm::common::{Channel, ProcessId, SwarmError};
use crate::swarm::message::{BootstrapMessage, DownloadReply, TrackerRequest, UploadRequest, WireMessage};

/// One encoded message in flight, stamped with its sender
#[derive(Debug)]
pub struct Frame {
    pub from: ProcessId,
    pub payload: Bytes,
}

type Route = [mpsc::Sender<Frame>; Channel::COUNT];

/// Exponential backoff with up to 50% random jitter
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let scaled = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = if base_ms > 1 { rand::random_range(0..=base_ms / 2) } else { 0 };
    Duration::from_millis(scaled.saturating_add(jitter))
}

/// Sending half of a process: can address any channel of any process.
#[derive(Clone)]
pub struct Postman {
    me: ProcessId,
    routes: Arc<Vec<Route>>,
    config: TransportConfig,
}

impl Postman {
    pub fn id(&self) -> ProcessId {
        self.me
    }

    /// Processes in the topology, tracker included
    pub fn process_count(&self) -> usize {
        self.routes.len()
    }

    /// Encodes `msg` and queues it on `to`'s channel for `M`.
    ///
    /// A full channel is retried with backoff; a closed one fails at once.
    pub async fn send<M: WireMessage>(&self, to: ProcessId, msg: &M) -> Result<(), SwarmError> {
        let channel = M::CHANNEL;
        let route = self
            .routes
            .get(to as usize)
            .ok_or(SwarmError::UnknownProcess(to))?;
        let tx = &route[channel.slot()];

        let mut frame = Frame { from: self.me, payload: msg.to_frame()? };
        let mut attempt = 0;
        loop {
            match tx.send_timeout(frame, self.config.send_timeout()).await {
                Ok(()) => {
                    trace!(from = self.me, to, %channel, "frame queued");
                    return Ok(());
                }
                Err(SendTimeoutError::Closed(_)) => {
                    return Err(SwarmError::ChannelClosed { process: to, channel });
                }
                Err(SendTimeoutError::Timeout(returned)) => {
                    if attempt >= self.config.send_retries {
                        return Err(SwarmError::SendTimeout { process: to, channel });
                    }
                    let delay = backoff_delay(self.config.retry_backoff(), attempt);
                    warn!(from = self.me, to, %channel, attempt, ?delay, "send timed out, retrying");
                    tokio::time::sleep(delay).await;
                    frame = returned;
                    attempt += 1;
                }
            }
        }
    }
}

/// Receiving half of one logical channel, typed by what it carries
pub struct Inbox<M> {
    me: ProcessId,
    rx: mpsc::Receiver<Frame>,
    recv_timeout: Option<Duration>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: WireMessage> Inbox<M> {
    /// Blocks for the next message from any sender
    pub async fn recv(&mut self) -> Result<(ProcessId, M), SwarmError> {
        let channel = M::CHANNEL;
        let frame = match self.recv_timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx.recv())
                .await
                .map_err(|_| SwarmError::RecvTimeout(channel))?,
            None => self.rx.recv().await,
        };
        let frame = frame.ok_or(SwarmError::ChannelClosed { process: self.me, channel })?;
        let msg = M::from_frame(frame.payload)?;
        Ok((frame.from, msg))
    }

    /// Blocks for the next message and requires it to come from `expected`
    pub async fn recv_from(&mut self, expected: ProcessId) -> Result<M, SwarmError> {
        let (from, msg) = self.recv().await?;
        if from != expected {
            return Err(SwarmError::UnexpectedSender { expected, actual: from });
        }
        Ok(msg)
    }
}

/// Everything one process needs to talk to the rest of the topology
pub struct Mailboxes {
    pub postman: Postman,
    pub bootstrap: Inbox<BootstrapMessage>,
    pub tracker: Inbox<TrackerRequest>,
    pub upload: Inbox<UploadRequest>,
    pub download: Inbox<DownloadReply>,
}

impl Mailboxes {
    pub fn id(&self) -> ProcessId {
        self.postman.id()
    }
}

/// Builds the substrate for a fixed topology of `process_count` processes
/// and hands back one set of mailboxes per process, indexed by process id.
pub fn build_network(
    process_count: usize,
    config: &TransportConfig,
) -> Result<Vec<Mailboxes>, SwarmError> {
    config.validate()?;
    if process_count < 2 {
        return Err(SwarmError::Config(format!(
            "a swarm needs a tracker and at least one peer, got {} processes",
            process_count
        )));
    }

    let mut routes = Vec::with_capacity(process_count);
    let mut receivers = Vec::with_capacity(process_count);
    for _ in 0..process_count {
        let (bootstrap_tx, bootstrap_rx) = mpsc::channel(config.channel_capacity);
        let (tracker_tx, tracker_rx) = mpsc::channel(config.channel_capacity);
        let (upload_tx, upload_rx) = mpsc::channel(config.channel_capacity);
        let (download_tx, download_rx) = mpsc::channel(config.channel_capacity);
        routes.push([bootstrap_tx, tracker_tx, upload_tx, download_tx]);
        receivers.push((bootstrap_rx, tracker_rx, upload_rx, download_rx));
    }

    let routes = Arc::new(routes);
    // Only a requester waiting on a partner's reply gives up; the serving
    // loops sit idle between requests.
    let recv_timeout = config.recv_timeout();
    let mailboxes = receivers
        .into_iter()
        .enumerate()
        .map(|(id, (bootstrap, tracker, upload, download))| {
            let me = id as ProcessId;
            Mailboxes {
                postman: Postman { me, routes: Arc::clone(&routes), config: config.clone() },
                bootstrap: inbox(me, bootstrap, None),
                tracker: inbox(me, tracker, None),
                upload: inbox(me, upload, None),
                download: inbox(me, download, recv_timeout),
            }
        })
        .collect();
    Ok(mailboxes)
}

fn inbox<M>(me: ProcessId, rx: mpsc::Receiver<Frame>, recv_timeout: Option<Duration>) -> Inbox<M> {
    Inbox { me, rx, recv_timeout, _marker: PhantomData }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(count: usize) -> Vec<Mailboxes> {
        build_network(count, &TransportConfig::default()).expect("network")
    }

    #[tokio::test]
    async fn test_messages_land_on_their_own_channel() {
        let mut boxes = network(3);
        let postman = boxes[1].postman.clone();

        postman.send(2, &UploadRequest::Stop).await.expect("send upload");
        postman.send(2, &DownloadReply::Load(4)).await.expect("send download");

        let (from, reply) = boxes[2].download.recv().await.expect("download");
        assert_eq!(from, 1);
        assert_eq!(reply, DownloadReply::Load(4));

        let request = boxes[2].upload.recv_from(1).await.expect("upload");
        assert_eq!(request, UploadRequest::Stop);
    }

    #[tokio::test]
    async fn test_pairwise_order_is_preserved() {
        let mut boxes = network(2);
        let postman = boxes[0].postman.clone();
        for load in 0..20 {
            postman.send(1, &DownloadReply::Load(load)).await.expect("send");
        }
        for load in 0..20 {
            assert_eq!(boxes[1].download.recv_from(0).await.expect("recv"), DownloadReply::Load(load));
        }
    }

    #[tokio::test]
    async fn test_reply_from_wrong_sender_is_rejected() {
        let mut boxes = network(3);
        boxes[2].postman.send(1, &DownloadReply::NotPresent).await.expect("send");
        assert!(matches!(
            boxes[1].download.recv_from(0).await,
            Err(SwarmError::UnexpectedSender { expected: 0, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let boxes = network(2);
        assert!(matches!(
            boxes[0].postman.send(9, &UploadRequest::Stop).await,
            Err(SwarmError::UnknownProcess(9))
        ));
    }

    #[tokio::test]
    async fn test_send_to_dropped_inbox_is_closed() {
        let mut boxes = network(2);
        let target = boxes.pop().expect("peer mailboxes");
        let postman = boxes[0].postman.clone();
        drop(target.upload);
        assert!(matches!(
            postman.send(1, &UploadRequest::Stop).await,
            Err(SwarmError::ChannelClosed { process: 1, channel: Channel::Upload })
        ));
    }

    #[tokio::test]
    async fn test_full_channel_times_out_after_retries() {
        let config = TransportConfig {
            channel_capacity: 1,
            send_timeout_ms: 5,
            send_retries: 2,
            retry_backoff_ms: 1,
            recv_timeout_ms: None,
        };
        let boxes = build_network(2, &config).expect("network");
        let postman = boxes[0].postman.clone();
        postman.send(1, &UploadRequest::Stop).await.expect("first fits");
        assert!(matches!(
            postman.send(1, &UploadRequest::Stop).await,
            Err(SwarmError::SendTimeout { process: 1, channel: Channel::Upload })
        ));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let config = TransportConfig { recv_timeout_ms: Some(10), ..TransportConfig::default() };
        let mut boxes = build_network(2, &config).expect("network");
        assert!(matches!(
            boxes[1].download.recv().await,
            Err(SwarmError::RecvTimeout(Channel::Download))
        ));
    }

    #[tokio::test]
    async fn test_serving_inboxes_wait_past_recv_timeout() {
        let config = TransportConfig { recv_timeout_ms: Some(10), ..TransportConfig::default() };
        let mut boxes = build_network(2, &config).expect("network");
        let idle = Duration::from_millis(50);
        assert!(tokio::time::timeout(idle, boxes[0].tracker.recv()).await.is_err());
        assert!(tokio::time::timeout(idle, boxes[0].bootstrap.recv()).await.is_err());
        assert!(tokio::time::timeout(idle, boxes[1].upload.recv()).await.is_err());
    }

    #[test]
    fn test_topology_needs_a_peer() {
        assert!(build_network(1, &TransportConfig::default()).is_err());
    }

    #[test]
    fn test_backoff_grows() {
        let base = Duration::from_millis(10);
        assert!(backoff_delay(base, 0) >= base);
        assert!(backoff_delay(base, 0) <= Duration::from_millis(15));
        assert!(backoff_delay(base, 3) >= Duration::from_millis(80));
        assert_eq!(backoff_delay(Duration::ZERO, 5), Duration::ZERO);
    }
}
