//! Handle to a spawned child process

use parking_lot::Mutex;
use ricecoder_ipc::{ControlChannel, IpcError, KeepAliveHandle, Message, MessageStream};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ProcessError, Result};
use crate::lifecycle::{ChildEvent, ChildEvents, Emitter, LifecycleState};
use crate::signal::KillSignal;
use crate::streams::{ChildReadable, ChildWritable, StdinCloser, StdioStream};

/// Completion callback of [`ChildProcess::send_with`]
pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

pub(crate) struct ChildState {
    pub(crate) lifecycle: LifecycleState,
    pub(crate) pid: Option<u32>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) signal_code: Option<String>,
    pub(crate) killed: bool,
    pub(crate) stdio: Vec<Option<StdioStream>>,
    pub(crate) stdin_closer: Option<StdinCloser>,
    pub(crate) channel: Option<ControlChannel>,
    pub(crate) keep_alive: Option<KeepAliveHandle>,
    pub(crate) events: Option<ChildEvents>,
    #[cfg(windows)]
    pub(crate) kill_requests: Option<tokio::sync::mpsc::UnboundedSender<()>>,
}

pub(crate) struct Shared {
    pub(crate) spawn_file: String,
    pub(crate) spawn_args: Vec<String>,
    pub(crate) state: Mutex<ChildState>,
    pub(crate) emitter: Emitter,
}

impl Shared {
    pub(crate) fn new(spawn_file: String, spawn_args: Vec<String>) -> Self {
        let (emitter, events) = Emitter::new();
        Self {
            spawn_file,
            spawn_args,
            state: Mutex::new(ChildState {
                lifecycle: LifecycleState::Spawning,
                pid: None,
                exit_code: None,
                signal_code: None,
                killed: false,
                stdio: Vec::new(),
                stdin_closer: None,
                channel: None,
                keep_alive: None,
                events: Some(events),
                #[cfg(windows)]
                kill_requests: None,
            }),
            emitter,
        }
    }

    /// Deliver `signal` once; later calls report the recorded flag
    ///
    /// Stdin is closed first and the channel is always disconnected, even
    /// when the process is already gone.
    pub(crate) fn kill(&self, signal: KillSignal) -> Result<bool> {
        let (pid, stdin, channel, running) = {
            let mut state = self.state.lock();
            if state.killed {
                return Ok(true);
            }
            let pid = match state.pid {
                Some(pid) => pid,
                None => return Ok(false),
            };
            state.killed = true;
            (
                pid,
                state.stdin_closer.take(),
                state.channel.clone(),
                state.lifecycle == LifecycleState::Running,
            )
        };

        debug!(pid = %pid, signal = %signal, "Killing child process");

        if let Some(stdin) = stdin {
            stdin.close();
        }

        let delivered = if running {
            self.deliver(pid, signal)
        } else {
            Ok(())
        };

        if let Some(channel) = channel {
            if let Err(e) = channel.disconnect() {
                debug!(pid = %pid, error = %e, "Channel already disconnected");
            }
        }

        delivered.map(|_| true)
    }

    #[cfg(unix)]
    fn deliver(&self, pid: u32, signal: KillSignal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), signal.as_nix()) {
            Ok(()) => Ok(()),
            // Already exited (or reaped and gone): nothing to kill
            Err(Errno::ESRCH) | Err(Errno::EPERM) => {
                debug!(pid = %pid, "Child already exited");
                Ok(())
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to signal child");
                Err(ProcessError::KillFailed(e.to_string()))
            }
        }
    }

    #[cfg(windows)]
    fn deliver(&self, pid: u32, signal: KillSignal) -> Result<()> {
        debug!(pid = %pid, signal = %signal, "Terminating child");
        if let Some(requests) = self.state.lock().kill_requests.as_ref() {
            let _ = requests.send(());
        }
        Ok(())
    }

    fn settle(&self, callback: Option<SendCallback>, outcome: Result<()>) {
        match (callback, outcome) {
            (Some(callback), outcome) => callback(outcome),
            (None, Err(e)) => self.emitter.emit(ChildEvent::Error(e)),
            (None, Ok(())) => {}
        }
    }
}

/// A spawned child process
///
/// Returned by [`crate::spawn`] even when creation fails; the failure then
/// arrives as [`ChildEvent::Error`] and `pid()` stays `None`. Methods that
/// report asynchronously must be called inside a tokio runtime.
pub struct ChildProcess {
    pub(crate) shared: Arc<Shared>,
}

impl ChildProcess {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Process ID, once spawned
    pub fn pid(&self) -> Option<u32> {
        self.shared.state.lock().pid
    }

    /// Exit code after a normal exit
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.state.lock().exit_code
    }

    /// Name of the signal that terminated the process
    pub fn signal_code(&self) -> Option<String> {
        self.shared.state.lock().signal_code.clone()
    }

    /// Whether `kill` was called
    pub fn killed(&self) -> bool {
        self.shared.state.lock().killed
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state.lock().lifecycle
    }

    /// Program handed to the OS
    pub fn spawn_file(&self) -> &str {
        &self.shared.spawn_file
    }

    /// Full argument vector, program first
    pub fn spawn_args(&self) -> &[String] {
        &self.shared.spawn_args
    }

    /// Event stream; `None` once taken
    pub fn take_events(&self) -> Option<ChildEvents> {
        self.shared.state.lock().events.take()
    }

    /// Take the stream in slot `index`
    pub fn take_stdio(&self, index: usize) -> Option<StdioStream> {
        self.shared
            .state
            .lock()
            .stdio
            .get_mut(index)
            .and_then(Option::take)
    }

    /// Take stdin; `None` if not piped or already taken
    pub fn take_stdin(&self) -> Option<ChildWritable> {
        self.take_slot(0, StdioStream::into_writable)
    }

    /// Take stdout; `None` if not piped or already taken
    pub fn take_stdout(&self) -> Option<ChildReadable> {
        self.take_slot(1, StdioStream::into_readable)
    }

    /// Take stderr; `None` if not piped or already taken
    pub fn take_stderr(&self) -> Option<ChildReadable> {
        self.take_slot(2, StdioStream::into_readable)
    }

    fn take_slot<T>(&self, index: usize, convert: fn(StdioStream) -> Option<T>) -> Option<T> {
        let mut state = self.shared.state.lock();
        let slot = state.stdio.get_mut(index)?;
        let matches = match slot.as_ref() {
            Some(StdioStream::Writable(_)) => index == 0,
            Some(StdioStream::Readable(_)) => index != 0,
            _ => false,
        };
        if !matches {
            return None;
        }
        slot.take().and_then(convert)
    }

    /// Send `SIGTERM`
    pub fn kill(&self) -> Result<bool> {
        self.shared.kill(KillSignal::default())
    }

    /// Send `signal` (a [`KillSignal`], name or number)
    ///
    /// Unknown signals fail before anything happens. A second call returns
    /// `true` without signalling again.
    pub fn kill_with<S>(&self, signal: S) -> Result<bool>
    where
        S: TryInto<KillSignal>,
        ProcessError: From<S::Error>,
    {
        let signal = signal.try_into()?;
        self.shared.kill(signal)
    }

    /// Keep the host alive until this child closes
    pub fn ref_handle(&self) {
        if let Some(handle) = self.shared.state.lock().keep_alive.as_mut() {
            handle.set_ref(true);
        }
    }

    /// Stop keeping the host alive for this child
    pub fn unref_handle(&self) {
        if let Some(handle) = self.shared.state.lock().keep_alive.as_mut() {
            handle.set_ref(false);
        }
    }

    /// Control channel, while connected
    pub fn channel(&self) -> Option<ControlChannel> {
        self.shared.state.lock().channel.clone()
    }

    pub fn connected(&self) -> bool {
        self.channel().map_or(false, |c| c.is_connected())
    }

    /// Listen for messages from the child
    ///
    /// Messages received before the first listener attached are delivered
    /// first, in order.
    pub fn messages(&self) -> Option<MessageStream> {
        self.channel().map(|c| c.subscribe())
    }

    /// Send a message to the child
    ///
    /// Returns `false` when the channel is over its high-water mark or the
    /// send failed; failures arrive as [`ChildEvent::Error`].
    pub fn send(&self, message: impl Into<Message>) -> bool {
        self.dispatch_send(message.into(), None)
    }

    /// Send a message and get its outcome through `callback`
    pub fn send_with<F>(&self, message: impl Into<Message>, callback: F) -> bool
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.dispatch_send(message.into(), Some(Box::new(callback)))
    }

    fn dispatch_send(&self, message: Message, callback: Option<SendCallback>) -> bool {
        let shared = Arc::clone(&self.shared);
        let sent = match self.channel() {
            Some(channel) => channel.send(message),
            None => Err(IpcError::ChannelClosed),
        };

        match sent {
            Ok(delivery) => {
                let within_limits = delivery.within_limits();
                tokio::spawn(async move {
                    let outcome = delivery.completed().await.map_err(ProcessError::from);
                    shared.settle(callback, outcome);
                });
                within_limits
            }
            Err(e) => {
                tokio::spawn(async move {
                    shared.settle(callback, Err(e.into()));
                });
                false
            }
        }
    }

    /// Close the control channel
    ///
    /// Emits [`ChildEvent::Error`] when there is no connected channel.
    pub fn disconnect(&self) {
        let result = match self.channel() {
            Some(channel) => channel.disconnect(),
            None => Err(IpcError::NotConnected),
        };
        if let Err(e) = result {
            self.shared.emitter.emit(ChildEvent::Error(e.into()));
        }
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ChildProcess")
            .field("spawn_file", &self.shared.spawn_file)
            .field("pid", &state.pid)
            .field("state", &state.lifecycle)
            .field("exit_code", &state.exit_code)
            .field("signal_code", &state.signal_code)
            .field("killed", &state.killed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_child() -> ChildProcess {
        ChildProcess::new(Arc::new(Shared::new("missing".into(), vec!["missing".into()])))
    }

    #[test]
    fn test_kill_before_spawn_is_a_no_op() {
        let child = failed_child();
        assert!(!child.kill().unwrap());
        assert!(!child.killed());
    }

    #[test]
    fn test_unknown_signal_fails_synchronously() {
        let child = failed_child();
        assert!(matches!(
            child.kill_with("SIGWHATEVER"),
            Err(ProcessError::UnknownSignal(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_channel_reports_through_callback() {
        let child = failed_child();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let within_limits = child.send_with("hello", move |result| {
            let _ = tx.send(result);
        });

        assert!(!within_limits);
        assert!(matches!(
            rx.await.unwrap(),
            Err(ProcessError::Ipc(IpcError::ChannelClosed))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_channel_emits_error() {
        let child = failed_child();
        let mut events = child.take_events().unwrap();
        child.disconnect();
        assert!(matches!(
            events.recv().await,
            Some(ChildEvent::Error(ProcessError::Ipc(IpcError::NotConnected)))
        ));
    }

    #[test]
    fn test_events_taken_once() {
        let child = failed_child();
        assert!(child.take_events().is_some());
        assert!(child.take_events().is_none());
    }
}
