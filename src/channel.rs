//! A tagged point-to-point channel used to send/receive values to/from one other party.
//!
//! Every value travels inside an [`Envelope`] that names the slot it belongs to. A background task
//! drains the transport into an inbound cache keyed by tag, so values may arrive in any order while
//! the protocol consumes them in a fixed order through [`Channel::recv`]. A second background task
//! owns the write half and serializes all outgoing frames, including acknowledgements.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, duplex},
    net::TcpStream,
    sync::{Notify, mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, timeout, timeout_at},
};
use tracing::{debug, trace, warn};

/// Frames larger than this are treated as a corrupt stream.
const MAX_FRAME_LEN: usize = 1 << 30;

/// Errors related to sending / receiving / (de-)serializing tagged values.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying transport failed or the connection was lost.
    #[error("transport error while {phase}: {reason}")]
    Transport {
        /// What the channel was doing when the error occurred.
        phase: String,
        /// The reason reported by the transport.
        reason: String,
    },
    /// No value with the given tag arrived in time.
    #[error("no value tagged `{tag}` arrived within {after:?}")]
    Timeout {
        /// The tag that was awaited.
        tag: String,
        /// How long the channel waited.
        after: Duration,
    },
    /// Two values with the same tag arrived before the first one was consumed.
    #[error("value tagged `{tag}` arrived twice before it was consumed")]
    TagCollision {
        /// The tag that was sent twice.
        tag: String,
    },
    /// A value could not be (de-)serialized.
    #[error("could not (de-)serialize value tagged `{tag}`: {reason}")]
    Serde {
        /// The tag of the value.
        tag: String,
        /// The reason reported by the serializer.
        reason: String,
    },
    /// The value is a Vec, but not of the expected length.
    #[error("value tagged `{tag}` has length {actual}, expected {expected}")]
    InvalidLength {
        /// The tag of the value.
        tag: String,
        /// The expected number of elements.
        expected: usize,
        /// The number of elements that were received.
        actual: usize,
    },
    /// The serialized value does not fit into a single frame.
    #[error("value tagged `{tag}` has {len} bytes, more than a frame can carry")]
    FrameTooLarge {
        /// The tag of the value.
        tag: String,
        /// The size of the serialized value.
        len: usize,
    },
    /// The channel was already shut down.
    #[error("the channel to {0} is closed")]
    Closed(String),
}

/// What to do when a value arrives under a tag whose previous value is still unconsumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagPolicy {
    /// Keep the newer value and log a warning (last-write-wins).
    #[default]
    Overwrite,
    /// Keep the newer value, but fail the next `recv` on that tag.
    Reject,
}

/// Options that control timeouts and cache behaviour of a [`Channel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// How long `send` waits for the peer to acknowledge a value.
    #[serde(with = "crate::config::duration_ms")]
    pub ack_timeout: Duration,
    /// How tag collisions in the inbound cache are handled.
    pub tag_policy: TagPolicy,
    /// Whether every sent envelope is kept for later inspection (see [`Channel::sent_log`]).
    pub record_traffic: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(60),
            tag_policy: TagPolicy::Overwrite,
            record_traffic: false,
        }
    }
}

/// A tagged value as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The slot this value belongs to, unique per (sender, purpose, iteration).
    pub tag: String,
    /// The bincode-serialized value.
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Data(Envelope),
    Ack(String),
}

#[derive(Debug)]
enum Outgoing {
    Frame(Frame),
    /// Flush everything queued so far, then release the write half.
    Close,
}

/// The length prefix of a frame with `len` bytes, if the peer will accept it.
fn frame_len(len: usize) -> std::io::Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|_| len <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the maximum frame size"),
            )
        })
}

/// Writes a single length-prefixed bincode frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &impl Serialize,
) -> std::io::Result<()> {
    let bytes = bincode::serialize(msg).map_err(std::io::Error::other)?;
    writer.write_all(&frame_len(bytes.len())?.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Reads a single length-prefixed bincode frame.
pub(crate) async fn read_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> std::io::Result<T> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the maximum frame size"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(std::io::Error::other)
}

#[derive(Debug, Default)]
struct Inbox {
    cache: HashMap<String, Vec<u8>>,
    poisoned: HashSet<String>,
    pending_acks: HashMap<String, VecDeque<oneshot::Sender<()>>>,
    connected: bool,
    overwritten: u64,
}

#[derive(Debug, Default)]
struct Shared {
    inbox: Mutex<Inbox>,
    arrived: Notify,
    sent: Mutex<Vec<Envelope>>,
}

impl Shared {
    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        // a poisoned lock only means that another task panicked while holding it, the cache
        // itself is still consistent
        self.inbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn disconnect(&self) {
        let mut inbox = self.inbox();
        inbox.connected = false;
        inbox.pending_acks.clear();
        drop(inbox);
        self.arrived.notify_waiters();
    }
}

/// A cheap, cloneable handle that can send values to the peer from any task.
#[derive(Debug, Clone)]
struct Outbox {
    peer: Arc<str>,
    frames: mpsc::UnboundedSender<Outgoing>,
    shared: Arc<Shared>,
    ack_timeout: Duration,
    record: bool,
}

impl Outbox {
    async fn deliver(self, envelope: Envelope) -> Result<(), Error> {
        let tag = envelope.tag.clone();
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut inbox = self.shared.inbox();
            if !inbox.connected {
                return Err(Error::Closed(self.peer.to_string()));
            }
            inbox
                .pending_acks
                .entry(tag.clone())
                .or_default()
                .push_back(ack_tx);
        }
        if self.record {
            self.shared
                .sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(envelope.clone());
        }
        let mb = envelope.payload.len() as f64 / 1024.0 / 1024.0;
        trace!("Sending `{tag}` to {} ({mb:.2}MB)...", self.peer);
        self.frames
            .send(Outgoing::Frame(Frame::Data(envelope)))
            .map_err(|_| Error::Transport {
                phase: format!("sending `{tag}`"),
                reason: "the writer task has stopped".into(),
            })?;
        match timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Transport {
                phase: format!("awaiting ack for `{tag}`"),
                reason: format!("connection to {} lost", self.peer),
            }),
            Err(_) => Err(Error::Timeout {
                tag: format!("ack for {tag}"),
                after: self.ack_timeout,
            }),
        }
    }
}

/// A tagged, acknowledged, point-to-point channel to a single peer.
pub struct Channel {
    outbox: Outbox,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    tag_policy: TagPolicy,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.outbox.peer)
            .field("tag_policy", &self.tag_policy)
            .field("open", &self.reader.is_some())
            .finish()
    }
}

impl Channel {
    /// Spawns the background receive and send loops on the given transport halves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        peer: impl Into<String>,
        options: ChannelOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let peer: Arc<str> = peer.into().into();
        let shared = Arc::new(Shared::default());
        shared.inbox().connected = true;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(send_loop(writer, frames_rx, Arc::clone(&shared), peer.clone()));
        let reader = tokio::spawn(receive_loop(
            reader,
            frames_tx.clone(),
            Arc::clone(&shared),
            peer.clone(),
            options.tag_policy,
        ));
        Self {
            outbox: Outbox {
                peer,
                frames: frames_tx,
                shared,
                ack_timeout: options.ack_timeout,
                record: options.record_traffic,
            },
            reader: Some(reader),
            writer: Some(writer),
            tag_policy: options.tag_policy,
        }
    }

    /// Wraps an established TCP connection.
    pub fn from_tcp(stream: TcpStream, peer: impl Into<String>, options: ChannelOptions) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not disable Nagle's algorithm: {e}");
        }
        let (r, w) = stream.into_split();
        Self::spawn(r, w, peer, options)
    }

    /// Creates two connected in-memory channels, mostly useful for tests and simulations.
    pub fn pair(
        a: impl Into<String>,
        b: impl Into<String>,
        options: ChannelOptions,
    ) -> (Channel, Channel) {
        let buffer_capacity = 1 << 20;
        let (a_end, b_end) = duplex(buffer_capacity);
        let (a_r, a_w) = tokio::io::split(a_end);
        let (b_r, b_w) = tokio::io::split(b_end);
        // each end is labelled with the party it talks to
        let to_b = Self::spawn(a_r, a_w, b, options.clone());
        let to_a = Self::spawn(b_r, b_w, a, options);
        (to_b, to_a)
    }

    /// The label of the peer at the other end of this channel.
    pub fn peer(&self) -> &str {
        &self.outbox.peer
    }

    /// Serializes a value and blocks until the peer has acknowledged it.
    pub async fn send(&self, tag: &str, value: &impl Serialize) -> Result<(), Error> {
        let envelope = self.envelope(tag, value)?;
        self.outbox.clone().deliver(envelope).await
    }

    /// Serializes a value and returns a handle that resolves once the peer has acknowledged it.
    pub fn send_nowait(
        &self,
        tag: &str,
        value: &impl Serialize,
    ) -> Result<JoinHandle<Result<(), Error>>, Error> {
        let envelope = self.envelope(tag, value)?;
        Ok(tokio::spawn(self.outbox.clone().deliver(envelope)))
    }

    fn envelope(&self, tag: &str, value: &impl Serialize) -> Result<Envelope, Error> {
        if self.reader.is_none() {
            return Err(Error::Closed(self.outbox.peer.to_string()));
        }
        let payload = bincode::serialize(value).map_err(|e| Error::Serde {
            tag: tag.to_string(),
            reason: format!("{e:?}"),
        })?;
        // leaves room for the tag and the frame header
        if frame_len(payload.len() + tag.len() + 64).is_err() {
            return Err(Error::FrameTooLarge {
                tag: tag.to_string(),
                len: payload.len(),
            });
        }
        Ok(Envelope {
            tag: tag.to_string(),
            payload,
        })
    }

    /// Waits until a value tagged `tag` is in the inbound cache, removes and deserializes it.
    ///
    /// If the connection is lost the cache can no longer fill up, so the call ends with
    /// [`Error::Timeout`] once `after` has elapsed, like any other missing value.
    pub async fn recv<T: DeserializeOwned>(&self, tag: &str, after: Duration) -> Result<T, Error> {
        let bytes = self.recv_bytes(tag, after).await?;
        bincode::deserialize(&bytes).map_err(|e| Error::Serde {
            tag: tag.to_string(),
            reason: format!("{e:?}"),
        })
    }

    /// Receives a Vec (while checking its length).
    pub async fn recv_vec<T: DeserializeOwned>(
        &self,
        tag: &str,
        len: usize,
        after: Duration,
    ) -> Result<Vec<T>, Error> {
        let v: Vec<T> = self.recv(tag, after).await?;
        if v.len() == len {
            Ok(v)
        } else {
            Err(Error::InvalidLength {
                tag: tag.to_string(),
                expected: len,
                actual: v.len(),
            })
        }
    }

    async fn recv_bytes(&self, tag: &str, after: Duration) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + after;
        let shared = &self.outbox.shared;
        loop {
            let arrived = shared.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();
            {
                let mut inbox = shared.inbox();
                if let Some(bytes) = inbox.cache.remove(tag) {
                    if inbox.poisoned.remove(tag) {
                        return Err(Error::TagCollision {
                            tag: tag.to_string(),
                        });
                    }
                    return Ok(bytes);
                }
            }
            if timeout_at(deadline, arrived).await.is_err() {
                warn!("Timed out after {after:?} waiting for `{tag}` from {}", self.peer());
                return Err(Error::Timeout {
                    tag: tag.to_string(),
                    after,
                });
            }
        }
    }

    /// Whether the receive loop is still connected to the peer.
    pub fn is_connected(&self) -> bool {
        self.outbox.shared.inbox().connected
    }

    /// How many cached values were replaced by a newer value with the same tag.
    pub fn overwritten_count(&self) -> u64 {
        self.outbox.shared.inbox().overwritten
    }

    /// All envelopes sent so far, if `record_traffic` was enabled.
    pub fn sent_log(&self) -> Vec<Envelope> {
        self.outbox
            .shared
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Shuts the channel down, returning the tags that were never consumed.
    ///
    /// Outstanding frames are flushed before the transport is released.
    pub async fn close(mut self) -> Vec<String> {
        let unconsumed = self.drain();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.outbox.shared.disconnect();
        if let Some(writer) = self.writer.take() {
            // the writer may already have stopped after a failed write
            let _ = self.outbox.frames.send(Outgoing::Close);
            if let Err(e) = writer.await {
                if !e.is_cancelled() {
                    warn!("writer task failed: {e}");
                }
            }
        }
        unconsumed
    }

    fn drain(&self) -> Vec<String> {
        let mut inbox = self.outbox.shared.inbox();
        let mut unconsumed: Vec<String> = inbox.cache.drain().map(|(tag, _)| tag).collect();
        unconsumed.sort();
        inbox.poisoned.clear();
        for tag in &unconsumed {
            warn!("Value tagged `{tag}` from {} was never consumed", self.peer());
        }
        unconsumed
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.drain();
            reader.abort();
            self.outbox.shared.disconnect();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn receive_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    frames: mpsc::UnboundedSender<Outgoing>,
    shared: Arc<Shared>,
    peer: Arc<str>,
    policy: TagPolicy,
) {
    loop {
        match read_frame::<_, Frame>(&mut reader).await {
            Ok(Frame::Data(Envelope { tag, payload })) => {
                {
                    let mut inbox = shared.inbox();
                    if inbox.cache.insert(tag.clone(), payload).is_some() {
                        inbox.overwritten += 1;
                        warn!("Value tagged `{tag}` from {peer} overwrote an unconsumed value");
                        if policy == TagPolicy::Reject {
                            inbox.poisoned.insert(tag.clone());
                        }
                    }
                }
                shared.arrived.notify_waiters();
                if frames.send(Outgoing::Frame(Frame::Ack(tag))).is_err() {
                    break;
                }
            }
            Ok(Frame::Ack(tag)) => {
                let mut inbox = shared.inbox();
                let ack = inbox.pending_acks.get_mut(&tag).and_then(|q| q.pop_front());
                if inbox.pending_acks.get(&tag).is_some_and(|q| q.is_empty()) {
                    inbox.pending_acks.remove(&tag);
                }
                drop(inbox);
                match ack {
                    // the sender may have timed out in the meantime
                    Some(ack) => {
                        let _ = ack.send(());
                    }
                    None => debug!("Unexpected ack for `{tag}` from {peer}"),
                }
            }
            Err(e) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    debug!("Connection to {peer} closed");
                } else {
                    warn!("Connection to {peer} lost: {e}");
                }
                break;
            }
        }
    }
    shared.disconnect();
}

async fn send_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<Shared>,
    peer: Arc<str>,
) {
    while let Some(Outgoing::Frame(frame)) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("Could not write to {peer}: {e}");
            shared.disconnect();
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Could not shut down the connection to {peer}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_arrive_in_any_order() -> Result<(), Error> {
        let (a, b) = Channel::pair("a", "b", ChannelOptions::default());
        a.send("first", &1u32).await?;
        a.send("second", &vec![2u32, 3]).await?;
        let second: Vec<u32> = b.recv_vec("second", 2, Duration::from_secs(1)).await?;
        let first: u32 = b.recv("first", Duration::from_secs(1)).await?;
        assert_eq!((first, second), (1, vec![2, 3]));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_length_is_rejected() -> Result<(), Error> {
        let (a, b) = Channel::pair("a", "b", ChannelOptions::default());
        a.send("v", &vec![1.0f64, 2.0]).await?;
        let err = b.recv_vec::<f64>("v", 3, Duration::from_secs(1)).await;
        assert!(matches!(err, Err(Error::InvalidLength { expected: 3, actual: 2, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn rejecting_policy_fails_on_collision() -> Result<(), Error> {
        let options = ChannelOptions {
            tag_policy: TagPolicy::Reject,
            ..Default::default()
        };
        let (a, b) = Channel::pair("a", "b", options);
        a.send("x", &1u8).await?;
        a.send("x", &2u8).await?;
        let err = b.recv::<u8>("x", Duration::from_secs(1)).await;
        assert!(matches!(err, Err(Error::TagCollision { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn close_reports_unconsumed_tags() -> Result<(), Error> {
        let (a, b) = Channel::pair("a", "b", ChannelOptions::default());
        a.send("never read", &()).await?;
        a.send("read", &()).await?;
        b.recv::<()>("read", Duration::from_secs(1)).await?;
        assert_eq!(b.close().await, vec!["never read".to_string()]);
        Ok(())
    }

    #[test]
    fn oversized_frames_are_refused() {
        assert_eq!(frame_len(10).ok(), Some(10));
        assert_eq!(frame_len(MAX_FRAME_LEN).ok(), Some(MAX_FRAME_LEN as u32));
        let err = frame_len(MAX_FRAME_LEN + 1).map_err(|e| e.kind());
        assert_eq!(err, Err(std::io::ErrorKind::InvalidData));
        assert!(frame_len(u32::MAX as usize + 1).is_err());
    }

    #[tokio::test]
    async fn lost_connections_end_in_timeouts() -> Result<(), Error> {
        let (a, b) = Channel::pair("a", "b", ChannelOptions::default());
        a.send("before", &1u8).await?;
        drop(a);
        let deadline = Instant::now() + Duration::from_secs(5);
        while b.is_connected() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!b.is_connected());
        // values that arrived before the loss can still be consumed
        let before: u8 = b.recv("before", Duration::from_millis(100)).await?;
        assert_eq!(before, 1);
        let err = b.recv::<u8>("after", Duration::from_millis(100)).await;
        assert!(matches!(err, Err(Error::Timeout { .. })));
        assert!(matches!(b.send("reply", &2u8).await, Err(Error::Closed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn nowait_send_resolves_on_ack() -> Result<(), Error> {
        let (a, b) = Channel::pair("a", "b", ChannelOptions::default());
        let pending = a.send_nowait("later", &42u64)?;
        let v: u64 = b.recv("later", Duration::from_secs(1)).await?;
        assert_eq!(v, 42);
        pending.await.map_err(|e| Error::Transport {
            phase: "joining".into(),
            reason: e.to_string(),
        })??;
        Ok(())
    }
}
