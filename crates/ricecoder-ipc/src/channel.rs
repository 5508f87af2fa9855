//! Duplex control channel over a single byte-stream handle
//!
//! A [`ControlChannel`] owns two background tasks:
//!
//! - a read loop that decodes frames until the channel disconnects,
//!   interprets internal control frames, and hands everything else to
//!   message listeners (or buffers it while nobody listens)
//! - a write loop that drains the outbox in order and settles each
//!   send's [`Delivery`]
//!
//! Nothing is delivered inline: messages reach listeners through their
//! [`MessageStream`], lifecycle changes through [`ChannelEvents`].

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{MessageCodec, SerializationMode, DEFAULT_MAX_FRAME_LENGTH};
use crate::error::{IpcError, Result};
use crate::keepalive::KeepAlive;
use crate::message::{Message, CLOSE_COMMAND};
use crate::refs::RefTracker;

/// Bytes queued for writing before `send` reports backpressure (64 KiB)
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Channel tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Queued bytes above which `send` returns "not within limits"
    pub high_water_mark: usize,
    /// Largest frame accepted from the peer
    pub max_frame_length: usize,
    /// Registry the channel handle is counted in (None = process-wide)
    #[serde(skip)]
    pub keep_alive: Option<KeepAlive>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            keep_alive: None,
        }
    }
}

impl ChannelConfig {
    /// Create config with default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Set backpressure threshold in bytes
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    /// Set largest accepted frame in bytes
    pub fn max_frame_length(mut self, bytes: usize) -> Self {
        self.max_frame_length = bytes;
        self
    }

    /// Count the channel handle in `registry`
    pub fn keep_alive(mut self, registry: KeepAlive) -> Self {
        self.keep_alive = Some(registry);
        self
    }
}

/// Which side ended the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOrigin {
    /// `disconnect()` was called on this end
    Local,
    /// The peer sent a close frame or closed its end
    Peer,
}

/// Lifecycle notifications of a channel
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel is no longer connected; emitted exactly once
    Disconnected(DisconnectOrigin),
    /// A runtime fault that did not come from the channel's own teardown
    Error(IpcError),
}

/// Receiver side of a channel's lifecycle notifications
#[derive(Debug)]
pub struct ChannelEvents {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelEvents {
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}

/// A message listener; dropping it detaches the listener
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessageStream {
    /// Next message, or `None` once the channel disconnected and the
    /// backlog is drained
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

/// Outcome of a successful `send` call
#[derive(Debug)]
pub struct Delivery {
    within_limits: bool,
    done: oneshot::Receiver<Result<()>>,
}

impl Delivery {
    /// `false` once the outbox is above the high-water mark; callers should
    /// pause until earlier deliveries complete
    pub fn within_limits(&self) -> bool {
        self.within_limits
    }

    /// Wait for the frame to be written
    pub async fn completed(self) -> Result<()> {
        self.done.await.unwrap_or(Err(IpcError::ChannelClosed))
    }
}

enum Outgoing {
    Frame {
        bytes: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    Close {
        notify_peer: bool,
    },
}

#[derive(Default)]
struct Dispatch {
    listeners: Vec<mpsc::UnboundedSender<Message>>,
    pending: VecDeque<Message>,
}

struct ChannelInner {
    mode: SerializationMode,
    high_water_mark: usize,
    connected: AtomicBool,
    encoder: Mutex<MessageCodec>,
    queued_bytes: Arc<AtomicUsize>,
    refs: Arc<Mutex<RefTracker>>,
    dispatch: Mutex<Dispatch>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

/// Framed message channel to a peer process
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<ChannelInner>,
}

impl ControlChannel {
    /// Open a channel over `io`, fixing the serialization mode for its lifetime
    ///
    /// Must be called from within a tokio runtime; the read and write loops
    /// are spawned immediately.
    pub fn open<T>(io: T, mode: SerializationMode, config: ChannelConfig) -> (Self, ChannelEvents)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let registry = config
            .keep_alive
            .clone()
            .unwrap_or_else(|| KeepAlive::global().clone());
        let refs = Arc::new(Mutex::new(RefTracker::new(registry.handle(false))));
        let queued_bytes = Arc::new(AtomicUsize::new(0));

        let mut encoder = MessageCodec::with_max_frame_length(mode, config.max_frame_length);
        let close_frame = encoder.encode_frame(&Message::control(CLOSE_COMMAND)).ok();

        let inner = Arc::new(ChannelInner {
            mode,
            high_water_mark: config.high_water_mark,
            connected: AtomicBool::new(true),
            encoder: Mutex::new(encoder),
            queued_bytes: Arc::clone(&queued_bytes),
            refs: Arc::clone(&refs),
            dispatch: Mutex::new(Dispatch::default()),
            outbox,
            shutdown: CancellationToken::new(),
            events: events_tx,
        });

        debug!(mode = %mode, "Opening control channel");

        tokio::spawn(write_loop(writer, outbox_rx, close_frame, queued_bytes, refs));
        tokio::spawn(read_loop(
            Arc::clone(&inner),
            FramedRead::new(
                reader,
                MessageCodec::with_max_frame_length(mode, config.max_frame_length),
            ),
        ));

        (Self { inner }, ChannelEvents { rx: events_rx })
    }

    pub fn mode(&self) -> SerializationMode {
        self.inner.mode
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Queue `message` for the peer
    ///
    /// Fails with [`IpcError::ChannelClosed`] before anything is written
    /// when the channel is disconnected, and with an encoding error when the
    /// value does not fit the serialization mode. The handle stays
    /// referenced until the write completes.
    pub fn send(&self, message: impl Into<Message>) -> Result<Delivery> {
        if !self.is_connected() {
            return Err(IpcError::ChannelClosed);
        }

        let message = message.into();
        let bytes = self.inner.encoder.lock().encode_frame(&message)?;
        let len = bytes.len();

        self.inner.refs.lock().ref_counted();
        let queued = self.inner.queued_bytes.fetch_add(len, Ordering::AcqRel) + len;

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .inner
            .outbox
            .send(Outgoing::Frame {
                bytes,
                done: done_tx,
            })
            .is_err()
        {
            self.inner.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            self.inner.refs.lock().unref_counted();
            return Err(IpcError::ChannelClosed);
        }

        trace!(bytes = len, queued, "Queued channel frame");

        Ok(Delivery {
            within_limits: queued <= self.inner.high_water_mark,
            done: done_rx,
        })
    }

    /// Attach a message listener
    ///
    /// Messages that arrived while no listener was attached are flushed into
    /// the new listener first, in arrival order.
    pub fn subscribe(&self) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut dispatch = self.inner.dispatch.lock();
        dispatch.listeners.retain(|listener| !listener.is_closed());

        if !dispatch.pending.is_empty() {
            debug!(
                count = dispatch.pending.len(),
                "Flushing buffered messages to new listener"
            );
            for message in dispatch.pending.drain(..) {
                let _ = tx.send(message);
            }
        }

        if self.is_connected() {
            dispatch.listeners.push(tx);
        }

        MessageStream { rx }
    }

    /// Number of messages waiting for a listener
    pub fn buffered(&self) -> usize {
        self.inner.dispatch.lock().pending.len()
    }

    /// Bytes accepted by `send` but not yet written
    pub fn queued_bytes(&self) -> usize {
        self.inner.queued_bytes.load(Ordering::Acquire)
    }

    /// Disconnect from the peer
    ///
    /// Fails with [`IpcError::NotConnected`] when already disconnected.
    /// Frames queued before the call are still written; the peer is then
    /// told the channel closed and the handle is shut down.
    pub fn disconnect(&self) -> Result<()> {
        self.inner.disconnect(DisconnectOrigin::Local)
    }

    /// Keep the handle referenced regardless of pending sends
    pub fn ref_handle(&self) {
        self.inner.refs.lock().pin(true);
    }

    /// Let the handle go unreferenced regardless of pending sends
    pub fn unref_handle(&self) {
        self.inner.refs.lock().pin(false);
    }

    pub fn is_referenced(&self) -> bool {
        self.inner.refs.lock().is_referenced()
    }

    /// Sends currently holding a counted reference
    pub fn pending_sends(&self) -> usize {
        self.inner.refs.lock().count()
    }
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("mode", &self.inner.mode)
            .field("connected", &self.is_connected())
            .field("queued_bytes", &self.queued_bytes())
            .finish()
    }
}

impl ChannelInner {
    fn disconnect(&self, origin: DisconnectOrigin) -> Result<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Err(IpcError::NotConnected);
        }

        debug!(?origin, "Control channel disconnected");

        self.refs.lock().release();
        self.dispatch.lock().listeners.clear();
        self.shutdown.cancel();
        let _ = self.outbox.send(Outgoing::Close {
            notify_peer: origin == DisconnectOrigin::Local,
        });
        let _ = self.events.send(ChannelEvent::Disconnected(origin));
        Ok(())
    }

    fn dispatch(&self, message: Message) {
        let mut dispatch = self.dispatch.lock();
        dispatch.listeners.retain(|listener| !listener.is_closed());

        if dispatch.listeners.is_empty() {
            dispatch.pending.push_back(message);
            return;
        }
        for listener in &dispatch.listeners {
            let _ = listener.send(message.clone());
        }
    }
}

async fn read_loop<T>(inner: Arc<ChannelInner>, mut frames: FramedRead<ReadHalf<T>, MessageCodec>)
where
    T: AsyncRead + Send,
{
    while inner.connected.load(Ordering::Acquire) {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                if message.internal_command() == Some(CLOSE_COMMAND) {
                    let _ = inner.disconnect(DisconnectOrigin::Peer);
                    break;
                }
                inner.dispatch(message);
            }
            Some(Err(err)) => {
                if err.is_teardown() {
                    debug!(error = %err, "Channel read ended during teardown");
                } else {
                    warn!(error = %err, "Channel read failed");
                    let _ = inner.events.send(ChannelEvent::Error(err));
                }
                let _ = inner.disconnect(DisconnectOrigin::Peer);
                break;
            }
            None => {
                debug!("Channel reached end of stream");
                let _ = inner.disconnect(DisconnectOrigin::Peer);
                break;
            }
        }
    }
}

async fn write_loop<T>(
    mut writer: WriteHalf<T>,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    close_frame: Option<Bytes>,
    queued_bytes: Arc<AtomicUsize>,
    refs: Arc<Mutex<RefTracker>>,
) where
    T: AsyncWrite + Send,
{
    while let Some(outgoing) = outbox.recv().await {
        match outgoing {
            Outgoing::Frame { bytes, done } => {
                let result = write_frame(&mut writer, &bytes).await;
                queued_bytes.fetch_sub(bytes.len(), Ordering::AcqRel);
                refs.lock().unref_counted();
                if let Err(ref e) = result {
                    debug!(error = %e, "Channel write failed");
                }
                let _ = done.send(result);
            }
            Outgoing::Close { notify_peer } => {
                if notify_peer {
                    if let Some(frame) = &close_frame {
                        let _ = write_frame(&mut writer, frame).await;
                    }
                }
                let _ = writer.shutdown().await;
                break;
            }
        }
    }

    // Anything still queued was cut off by the disconnect
    outbox.close();
    while let Ok(outgoing) = outbox.try_recv() {
        if let Outgoing::Frame { bytes, done } = outgoing {
            queued_bytes.fetch_sub(bytes.len(), Ordering::AcqRel);
            refs.lock().unref_counted();
            let _ = done.send(Err(IpcError::ChannelClosed));
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
