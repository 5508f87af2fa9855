//! Process creation
//!
//! Resolves stdio, builds the final command, creates the process and hands
//! the lifecycle over to a driver task. Creation failures never surface from
//! `spawn` itself: the returned [`ChildProcess`] reports them as its first
//! event.

#![allow(unsafe_code)]

use ricecoder_ipc::{channel_env, ControlChannel};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::child::{ChildProcess, Shared};
use crate::command::{self, BuiltCommand, Platform};
use crate::config::SpawnOptions;
use crate::error::{ProcessError, Result};
use crate::lifecycle::{forward_channel_events, ChildEvent, Driver, LifecycleState};
use crate::stdio::{self, StdioDescriptor, STANDARD_SLOTS};
use crate::streams::{ChildReadable, ChildWritable, CloseNotice, StdioStream};

/// Spawns child processes for the current platform
#[derive(Debug, Clone)]
pub struct Spawner {
    platform: Platform,
}

impl Spawner {
    /// Create new spawner
    pub fn new() -> Self {
        Self {
            platform: Platform::current(),
        }
    }

    /// Spawn a child process
    ///
    /// Fails synchronously only for invalid stdio configuration. Everything
    /// that involves the OS is reported through the child's events, so the
    /// returned handle always exists; its first event is either
    /// [`ChildEvent::Spawn`] or [`ChildEvent::Error`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Examples
    /// ```no_run
    /// use ricecoder_child_process::{ChildEvent, SpawnOptions, Spawner};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let child = Spawner::new().spawn(SpawnOptions::new("echo").args(["hello"]))?;
    /// let mut events = child.take_events().unwrap();
    /// while let Some(event) = events.recv().await {
    ///     if let ChildEvent::Close { code, .. } = event {
    ///         println!("closed with {:?}", code);
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(&self, options: SpawnOptions) -> Result<ChildProcess> {
        let descriptors = stdio::resolve(&options.stdio, self.platform)?;
        let env = options.effective_env();

        let args = match &options.arg_translator {
            Some(translator) => translator.translate(&options.command, options.args.clone()),
            None => options.args.clone(),
        };
        let built = command::build(&options.command, &args, &options.shell, self.platform, &env);
        let file = &built.program;

        let mut spawn_args = Vec::with_capacity(built.args.len() + 1);
        spawn_args.push(file.clone());
        spawn_args.extend(built.args.iter().cloned());
        let shared = Arc::new(Shared::new(file.clone(), spawn_args));

        debug!(
            program = %file,
            args = ?built.args,
            stdio = ?descriptors,
            "Spawning child process"
        );

        if let Err(e) = start(&shared, &options, &descriptors, &built, env) {
            warn!(program = %file, error = %e, "Failed to spawn child process");
            shared.emitter.emit(ChildEvent::Error(e));
            shared.emitter.close();
        }

        Ok(ChildProcess::new(shared))
    }
}

impl Default for Spawner {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a child process with the default [`Spawner`]
pub fn spawn(options: SpawnOptions) -> Result<ChildProcess> {
    Spawner::new().spawn(options)
}

fn start(
    shared: &Arc<Shared>,
    options: &SpawnOptions,
    descriptors: &[StdioDescriptor],
    built: &BuiltCommand,
    mut env: HashMap<String, String>,
) -> Result<()> {
    let file = built.program.as_str();

    if let Some(slot) = stdio::ipc_slot(descriptors) {
        env.extend(channel_env(slot as i32, options.serialization));
    }

    let mut plumbing = Plumbing::new(descriptors, file)?;

    let mut cmd = Command::new(file);
    push_args(&mut cmd, built);
    cmd.env_clear().envs(&env);
    if let Some(ref dir) = options.cwd {
        cmd.current_dir(dir);
    }
    plumbing.configure(&mut cmd, options.detached);

    let spawned = cmd.spawn();
    // The parent's copies of the child ends go away with these two
    drop(cmd);
    let extra = plumbing.into_extra();
    let mut child = spawned.map_err(|e| ProcessError::spawn(file, e))?;
    let pid = child.id();

    let (notice_tx, notices) = mpsc::unbounded_channel();
    let mut closes_needed = 1;
    let mut streams: Vec<Option<StdioStream>> = (0..descriptors.len()).map(|_| None).collect();
    let mut stdin_closer = None;

    if let Some(stdin) = child.stdin.take() {
        let (writable, closer) = ChildWritable::new(stdin);
        streams[0] = Some(StdioStream::Writable(writable));
        stdin_closer = Some(closer);
    }
    if let Some(stdout) = child.stdout.take() {
        let notice = CloseNotice::new(notice_tx.clone());
        streams[1] = Some(StdioStream::Readable(ChildReadable::new(stdout, notice)));
        closes_needed += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        let notice = CloseNotice::new(notice_tx.clone());
        streams[2] = Some(StdioStream::Readable(ChildReadable::new(stderr, notice)));
        closes_needed += 1;
    }

    let mut channel = None;
    for (slot, descriptor, stream) in extra {
        match descriptor {
            StdioDescriptor::Ipc => {
                channel = Some(ControlChannel::open(
                    stream,
                    options.serialization,
                    options.channel.clone(),
                ));
            }
            _ => {
                streams[slot] = Some(extra_stream(stream, CloseNotice::new(notice_tx.clone())));
            }
        }
        closes_needed += 1;
    }

    #[cfg(windows)]
    let (kill_tx, kill_requests) = {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(rx))
    };
    #[cfg(not(windows))]
    let kill_requests = None;

    {
        let mut state = shared.state.lock();
        state.pid = pid;
        state.lifecycle = LifecycleState::Running;
        state.stdio = streams;
        state.stdin_closer = stdin_closer;
        state.channel = channel.as_ref().map(|(channel, _)| channel.clone());
        state.keep_alive = Some(options.registry().handle(true));
        #[cfg(windows)]
        {
            state.kill_requests = kill_tx;
        }
    }

    info!(pid = ?pid, program = %file, "Child process spawned");
    shared.emitter.emit(ChildEvent::Spawn);

    if let Some((_, events)) = channel {
        tokio::spawn(forward_channel_events(
            Arc::clone(shared),
            events,
            CloseNotice::new(notice_tx.clone()),
        ));
    }
    drop(notice_tx);

    let driver = Driver {
        shared: Arc::clone(shared),
        child,
        abort: options.abort.clone().unwrap_or_default(),
        kill_requests,
        notices,
        closes_needed,
    };
    tokio::spawn(driver.run());

    Ok(())
}

#[cfg(windows)]
fn push_args(cmd: &mut Command, built: &BuiltCommand) {
    if built.verbatim {
        for arg in &built.args {
            cmd.raw_arg(arg);
        }
    } else {
        cmd.args(&built.args);
    }
}

#[cfg(not(windows))]
fn push_args(cmd: &mut Command, built: &BuiltCommand) {
    cmd.args(&built.args);
}

#[cfg(unix)]
type ExtraStream = tokio::net::UnixStream;

#[cfg(unix)]
fn extra_stream(stream: ExtraStream, notice: CloseNotice) -> StdioStream {
    StdioStream::Pipe(crate::streams::ChildPipe::new(stream, notice))
}

#[cfg(not(unix))]
type ExtraStream = tokio::io::DuplexStream;

#[cfg(not(unix))]
fn extra_stream(stream: ExtraStream, notice: CloseNotice) -> StdioStream {
    StdioStream::Readable(ChildReadable::new(stream, notice))
}

/// OS-level wiring of every stdio slot
struct Plumbing {
    standard: Vec<Stdio>,
    /// `(parent descriptor, child slot)` pairs installed after fork
    #[cfg(unix)]
    mappings: Vec<(std::os::unix::io::RawFd, std::os::unix::io::RawFd)>,
    /// Sources of `mappings` owned by the parent until spawn returns
    #[cfg(unix)]
    child_ends: Vec<std::os::unix::io::OwnedFd>,
    /// Parent ends of extra pipes and the ipc slot
    extra: Vec<(usize, StdioDescriptor, ExtraStream)>,
}

impl Plumbing {
    fn into_extra(self) -> Vec<(usize, StdioDescriptor, ExtraStream)> {
        self.extra
    }
}

#[cfg(unix)]
impl Plumbing {
    fn new(descriptors: &[StdioDescriptor], program: &str) -> Result<Self> {
        use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd};

        let fail = |e: std::io::Error| ProcessError::spawn(program, e);
        let mut plumbing = Plumbing {
            standard: Vec::with_capacity(STANDARD_SLOTS),
            mappings: Vec::new(),
            child_ends: Vec::new(),
            extra: Vec::new(),
        };

        for (slot, descriptor) in descriptors.iter().enumerate() {
            if slot < STANDARD_SLOTS {
                let stdio = match *descriptor {
                    StdioDescriptor::Pipe => Stdio::piped(),
                    StdioDescriptor::Inherit => Stdio::inherit(),
                    StdioDescriptor::Ignore => Stdio::null(),
                    StdioDescriptor::ExternalHandle(fd) => {
                        // SAFETY: only borrowed long enough to duplicate; a closed fd fails the dup
                        let owned = unsafe { BorrowedFd::borrow_raw(fd) }
                            .try_clone_to_owned()
                            .map_err(fail)?;
                        Stdio::from(owned)
                    }
                    StdioDescriptor::Ipc => {
                        let (parent, child) = socket_pair().map_err(fail)?;
                        plumbing.extra.push((slot, *descriptor, parent));
                        Stdio::from(OwnedFd::from(child))
                    }
                };
                plumbing.standard.push(stdio);
                continue;
            }

            let target = slot as std::os::unix::io::RawFd;
            match *descriptor {
                StdioDescriptor::Pipe | StdioDescriptor::Ipc => {
                    let (parent, child) = socket_pair().map_err(fail)?;
                    plumbing.mappings.push((child.as_raw_fd(), target));
                    plumbing.child_ends.push(OwnedFd::from(child));
                    plumbing.extra.push((slot, *descriptor, parent));
                }
                StdioDescriptor::Inherit => plumbing.mappings.push((target, target)),
                StdioDescriptor::ExternalHandle(fd) => {
                    // Standard slots are rewired before the hook runs, so 0-2
                    // must be captured here rather than read after fork
                    // SAFETY: only borrowed long enough to duplicate
                    let owned = unsafe { BorrowedFd::borrow_raw(fd) }
                        .try_clone_to_owned()
                        .map_err(fail)?;
                    plumbing.mappings.push((owned.as_raw_fd(), target));
                    plumbing.child_ends.push(owned);
                }
                StdioDescriptor::Ignore => {}
            }
        }

        Ok(plumbing)
    }

    fn configure(&mut self, cmd: &mut Command, detached: bool) {
        let mut standard = self.standard.drain(..);
        if let (Some(stdin), Some(stdout), Some(stderr)) =
            (standard.next(), standard.next(), standard.next())
        {
            cmd.stdin(stdin).stdout(stdout).stderr(stderr);
        }

        if self.mappings.is_empty() && !detached {
            return;
        }

        let mappings = self.mappings.clone();
        let floor = mappings
            .iter()
            .map(|(_, target)| *target)
            .max()
            .unwrap_or(2)
            + 1;
        let mut scratch = Vec::with_capacity(mappings.len());

        // SAFETY: the hook runs between fork and exec and only calls
        // async-signal-safe functions; `scratch` never grows past its capacity
        unsafe {
            cmd.pre_exec(move || {
                if detached && libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                // Move every source above all targets first so no dup2 clobbers
                // a source that is still needed
                scratch.clear();
                for (source, _) in &mappings {
                    let moved = libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, floor);
                    if moved == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    scratch.push(moved);
                }
                for (moved, (_, target)) in scratch.iter().zip(&mappings) {
                    if libc::dup2(*moved, *target) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }
}

#[cfg(unix)]
fn socket_pair() -> std::io::Result<(tokio::net::UnixStream, std::os::unix::net::UnixStream)> {
    let (parent, child) = std::os::unix::net::UnixStream::pair()?;
    parent.set_nonblocking(true)?;
    Ok((tokio::net::UnixStream::from_std(parent)?, child))
}

#[cfg(not(unix))]
impl Plumbing {
    fn new(descriptors: &[StdioDescriptor], _program: &str) -> Result<Self> {
        let mut standard = Vec::with_capacity(STANDARD_SLOTS);
        for (slot, descriptor) in descriptors.iter().enumerate() {
            let supported = match *descriptor {
                StdioDescriptor::Pipe if slot < STANDARD_SLOTS => Some(Stdio::piped()),
                StdioDescriptor::Inherit if slot < STANDARD_SLOTS => Some(Stdio::inherit()),
                StdioDescriptor::Ignore if slot < STANDARD_SLOTS => Some(Stdio::null()),
                StdioDescriptor::Ignore => continue,
                _ => None,
            };
            match supported {
                Some(stdio) => standard.push(stdio),
                None => {
                    return Err(ProcessError::Unsupported(format!(
                        "stdio slot {} cannot be {:?}",
                        slot, descriptor
                    )))
                }
            }
        }
        Ok(Plumbing {
            standard,
            extra: Vec::new(),
        })
    }

    fn configure(&mut self, cmd: &mut Command, detached: bool) {
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

        let mut standard = self.standard.drain(..);
        if let (Some(stdin), Some(stdout), Some(stderr)) =
            (standard.next(), standard.next(), standard.next())
        {
            cmd.stdin(stdin).stdout(stdout).stderr(stderr);
        }
        if detached {
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }
    }
}
