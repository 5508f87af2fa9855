//! Spawn configuration

use ricecoder_ipc::{ChannelConfig, KeepAlive, SerializationMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::command::{ArgTranslator, ShellRequest};
use crate::stdio::StdioSpec;

/// Configuration for spawning a child process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    /// Executable command (a whole command line in shell mode)
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (None = current dir)
    pub cwd: Option<PathBuf>,
    /// Environment variables (merged over the parent env unless `clear_env`)
    pub env: HashMap<String, String>,
    /// Start from an empty environment instead of the parent's
    pub clear_env: bool,
    /// Stdio wiring
    pub stdio: StdioSpec,
    /// Run through a shell
    pub shell: ShellRequest,
    /// Put the child in its own session
    pub detached: bool,
    /// Wire format of the control channel, if an `ipc` slot is requested
    pub serialization: SerializationMode,
    /// Control channel tuning; its keep-alive registry also tracks the child
    pub channel: ChannelConfig,
    /// Kill the child with SIGKILL once this token is cancelled
    #[serde(skip)]
    pub abort: Option<CancellationToken>,
    /// Argument rewriting applied before command construction
    #[serde(skip)]
    pub arg_translator: Option<Arc<dyn ArgTranslator>>,
}

impl SpawnOptions {
    /// Create new spawn options
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set working directory
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Start from an empty environment instead of the parent's
    pub fn clear_env(mut self, clear: bool) -> Self {
        self.clear_env = clear;
        self
    }

    /// Set stdio wiring
    pub fn stdio(mut self, stdio: impl Into<StdioSpec>) -> Self {
        self.stdio = stdio.into();
        self
    }

    /// Run the command through a shell
    pub fn shell(mut self, shell: impl Into<ShellRequest>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Run the child in its own session or process group
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Set control channel serialization mode
    pub fn serialization(mut self, mode: SerializationMode) -> Self {
        self.serialization = mode;
        self
    }

    /// Set control channel limits
    pub fn channel(mut self, config: ChannelConfig) -> Self {
        self.channel = config;
        self
    }

    /// Track the child and its channel in `registry` instead of the global one
    pub fn keep_alive(mut self, registry: KeepAlive) -> Self {
        self.channel.keep_alive = Some(registry);
        self
    }

    /// Kill the child when `token` is cancelled
    pub fn abort(mut self, token: CancellationToken) -> Self {
        self.abort = Some(token);
        self
    }

    /// Set argument rewriting hook
    pub fn arg_translator(mut self, translator: Arc<dyn ArgTranslator>) -> Self {
        self.arg_translator = Some(translator);
        self
    }

    /// Environment the child will see
    pub fn effective_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = if self.clear_env {
            HashMap::new()
        } else {
            std::env::vars().collect()
        };
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Keep-alive registry the child is counted in
    pub(crate) fn registry(&self) -> KeepAlive {
        self.channel
            .keep_alive
            .clone()
            .unwrap_or_else(|| KeepAlive::global().clone())
    }
}
