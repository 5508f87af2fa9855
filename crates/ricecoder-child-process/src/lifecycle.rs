//! Lifecycle tracking: ordered events from spawn to aggregate close
//!
//! One driver task per child waits for the exit status, then for every
//! readable stream and the control channel to report closed before emitting
//! the final [`ChildEvent::Close`]. Events travel through a queue, so a
//! consumer that starts listening after `spawn` returns still sees all of
//! them, in order.

use futures::Stream;
use parking_lot::Mutex;
use ricecoder_ipc::{ChannelEvent, ChannelEvents};
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::child::Shared;
use crate::error::ProcessError;
use crate::signal::KillSignal;
use crate::streams::{CloseNotice, StdioStream};

/// Where a child is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet created, or creation failed
    Spawning,
    Running,
    /// Exit status known; streams may still be open
    Exited,
    /// Aggregate close delivered
    Closed,
}

/// Notification from a child process
#[derive(Debug)]
pub enum ChildEvent {
    /// The process was created
    Spawn,
    /// The process terminated; exactly one of `code`/`signal` is set
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
    /// The process exited and every stream and the channel closed
    Close {
        code: Option<i32>,
        signal: Option<String>,
    },
    /// The control channel disconnected
    Disconnect,
    Error(ProcessError),
}

/// Single-consumer stream of a child's events
///
/// Ends after `Close`, or after the `Error` of a failed spawn.
#[derive(Debug)]
pub struct ChildEvents {
    rx: mpsc::UnboundedReceiver<ChildEvent>,
}

impl ChildEvents {
    pub async fn recv(&mut self) -> Option<ChildEvent> {
        self.rx.recv().await
    }
}

impl Stream for ChildEvents {
    type Item = ChildEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChildEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// Sending side of [`ChildEvents`]
pub(crate) struct Emitter {
    tx: Mutex<Option<mpsc::UnboundedSender<ChildEvent>>>,
}

impl Emitter {
    pub(crate) fn new() -> (Self, ChildEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            ChildEvents { rx },
        )
    }

    pub(crate) fn emit(&self, event: ChildEvent) {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => debug!(?event, "Dropping event emitted after close"),
        }
    }

    /// End the event stream
    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }
}

/// Counts closes toward the aggregate close
#[derive(Debug)]
pub(crate) struct CloseTracker {
    needed: usize,
    received: usize,
}

impl CloseTracker {
    /// `needed` counts the exit itself plus every tracked stream and channel
    pub(crate) fn new(needed: usize) -> Self {
        Self {
            needed,
            received: 0,
        }
    }

    pub(crate) fn record(&mut self) {
        if self.received < self.needed {
            self.received += 1;
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.received == self.needed
    }
}

/// Everything the driver task takes ownership of
pub(crate) struct Driver {
    pub(crate) shared: Arc<Shared>,
    pub(crate) child: Child,
    pub(crate) abort: CancellationToken,
    pub(crate) kill_requests: Option<mpsc::UnboundedReceiver<()>>,
    pub(crate) notices: mpsc::UnboundedReceiver<()>,
    pub(crate) closes_needed: usize,
}

impl Driver {
    pub(crate) async fn run(self) {
        let Driver {
            shared,
            mut child,
            abort,
            mut kill_requests,
            mut notices,
            closes_needed,
        } = self;
        let pid = shared.state.lock().pid;
        let mut aborted = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = abort.cancelled(), if !aborted => {
                    aborted = true;
                    debug!(?pid, "Abort requested, killing child");
                    match shared.kill(KillSignal::SIGKILL) {
                        Ok(true) => shared.emitter.emit(ChildEvent::Error(ProcessError::Aborted)),
                        Ok(false) => {}
                        Err(e) => shared.emitter.emit(ChildEvent::Error(e)),
                    }
                }
                _ = next_kill_request(&mut kill_requests) => {
                    if let Err(e) = child.start_kill() {
                        debug!(?pid, error = %e, "Terminate request failed");
                    }
                }
            }
        };

        let (code, signal) = match status {
            Ok(status) => exit_parts(status),
            Err(e) => {
                warn!(?pid, error = %e, "Failed to wait for child");
                shared.emitter.emit(ChildEvent::Error(ProcessError::Wait(e)));
                (None, None)
            }
        };

        let untaken: Vec<StdioStream> = {
            let mut state = shared.state.lock();
            state.exit_code = code;
            state.signal_code = signal.clone();
            state.lifecycle = LifecycleState::Exited;
            state
                .stdio
                .iter_mut()
                .skip(1)
                .filter(|slot| tracks_close(slot.as_ref()))
                .filter_map(Option::take)
                .collect()
        };

        info!(?pid, ?code, ?signal, "Child process exited");
        shared.emitter.emit(ChildEvent::Exit {
            code,
            signal: signal.clone(),
        });

        // Streams nobody took are read to the end so their close is observed
        for stream in untaken {
            tokio::spawn(stream.drain());
        }

        let mut tracker = CloseTracker::new(closes_needed);
        tracker.record();
        while !tracker.is_complete() {
            match notices.recv().await {
                Some(()) => tracker.record(),
                None => break,
            }
        }

        {
            let mut state = shared.state.lock();
            state.lifecycle = LifecycleState::Closed;
            state.keep_alive = None;
        }
        debug!(?pid, "Child process closed");
        shared.emitter.emit(ChildEvent::Close { code, signal });
        shared.emitter.close();
    }
}

fn tracks_close(slot: Option<&StdioStream>) -> bool {
    match slot {
        Some(StdioStream::Readable(_)) => true,
        #[cfg(unix)]
        Some(StdioStream::Pipe(_)) => true,
        _ => false,
    }
}

async fn next_kill_request(requests: &mut Option<mpsc::UnboundedReceiver<()>>) {
    let closed = match requests.as_mut() {
        Some(rx) => rx.recv().await.is_none(),
        None => true,
    };
    if closed {
        *requests = None;
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<String>) {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => (Some(code), None),
        None => (None, status.signal().map(crate::signal::signal_name)),
    }
}

#[cfg(not(unix))]
fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<String>) {
    (status.code(), None)
}

/// Relay channel events onto the child's event stream
///
/// The channel's disconnect counts toward the aggregate close, so `notice`
/// fires only after `Disconnect` was emitted.
pub(crate) async fn forward_channel_events(
    shared: Arc<Shared>,
    mut events: ChannelEvents,
    mut notice: CloseNotice,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Error(e) => shared.emitter.emit(ChildEvent::Error(e.into())),
            ChannelEvent::Disconnected(origin) => {
                shared.state.lock().channel = None;
                debug!(?origin, "Child channel disconnected");
                shared.emitter.emit(ChildEvent::Disconnect);
                break;
            }
        }
    }
    notice.fire();
}
