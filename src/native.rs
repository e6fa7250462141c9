//! The boundary to the native client library.
//!
//! The engine never talks to the server itself. Everything protocol-related
//! goes through a [`NativeBoundary`], which wraps an opaque connection handle
//! and exposes blocking primitives plus per-channel callback registration.

use std::path::Path;
use std::sync::Arc;

use crate::{CommandId, ConnectionInfo, ErrorItem, InfoMessage, ResolveChoice, TaggedRecord};

/// Opaque handle to one native connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeHandle(u64);

impl NativeHandle {
    /// Wraps a raw native handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Parameters for [`NativeBoundary::connect`].
///
/// Strings are already marshaled; the first connect of a session is done
/// without credentials to learn the server's encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Server address (`host:port`).
    pub address: Vec<u8>,
    /// User name, if sent at connect time.
    pub user: Option<Vec<u8>>,
    /// Password, if sent at connect time.
    pub password: Option<Vec<u8>>,
    /// Workspace name, if sent at connect time.
    pub workspace: Option<Vec<u8>>,
}

/// Result of [`NativeBoundary::connect`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// The new handle, or `None` when the connection could not be made.
    pub handle: Option<NativeHandle>,
    /// Errors queued while connecting.
    pub errors: Vec<ErrorItem>,
}

/// A request from the native layer to split one command across sub-sessions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParallelTransfer {
    /// Command the sub-sessions should run.
    pub command: String,
    /// Arguments shared by every sub-session.
    pub args: Vec<String>,
    /// File batches, one per unit of work.
    pub batches: Vec<Vec<String>>,
    /// Requested number of sub-sessions.
    pub threads: usize,
}

/// Delivers one informational message.
pub type InfoCallback = Arc<dyn Fn(CommandId, InfoMessage) + Send + Sync>;
/// Delivers one field of a structured record, `key == None` closes the record.
pub type TaggedCallback = Arc<dyn Fn(CommandId, usize, Option<&str>, Option<&str>) + Send + Sync>;
/// Delivers one error entry.
pub type ErrorCallback = Arc<dyn Fn(CommandId, ErrorItem) + Send + Sync>;
/// Delivers a chunk of plain text.
pub type TextCallback = Arc<dyn Fn(CommandId, &str) + Send + Sync>;
/// Delivers a chunk of binary data.
pub type BinaryCallback = Arc<dyn Fn(CommandId, &[u8]) + Send + Sync>;
/// Answers an interactive prompt. `true` means the input should be echoed.
pub type PromptCallback = Arc<dyn Fn(CommandId, &str, bool) -> Option<String> + Send + Sync>;
/// Answers a merge-resolve prompt for one file.
pub type ResolveCallback = Arc<dyn Fn(CommandId, &str) -> ResolveChoice + Send + Sync>;
/// Asked periodically during a command; returning `false` abandons it.
pub type KeepAliveCallback = Arc<dyn Fn(CommandId) -> bool + Send + Sync>;
/// Runs a parallel transfer on behalf of a command; returns overall success.
pub type ParallelCallback = Arc<dyn Fn(CommandId, ParallelTransfer) -> bool + Send + Sync>;

/// The set of callbacks registered on a native handle.
///
/// `NativeCallbacks::default()` clears every registration.
#[derive(Clone, Default)]
pub struct NativeCallbacks {
    /// Informational messages.
    pub info: Option<InfoCallback>,
    /// Structured records.
    pub tagged: Option<TaggedCallback>,
    /// Errors and warnings.
    pub error: Option<ErrorCallback>,
    /// Plain text.
    pub text: Option<TextCallback>,
    /// Binary payloads.
    pub binary: Option<BinaryCallback>,
    /// Interactive prompts.
    pub prompt: Option<PromptCallback>,
    /// Merge-resolve prompts.
    pub resolve: Option<ResolveCallback>,
    /// Keep-alive polling.
    pub keep_alive: Option<KeepAliveCallback>,
    /// Parallel transfers.
    pub parallel: Option<ParallelCallback>,
}

impl NativeCallbacks {
    /// Returns `true` if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.info.is_none()
            && self.tagged.is_none()
            && self.error.is_none()
            && self.text.is_none()
            && self.binary.is_none()
            && self.prompt.is_none()
            && self.resolve.is_none()
            && self.keep_alive.is_none()
            && self.parallel.is_none()
    }
}

impl std::fmt::Debug for NativeCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeCallbacks")
            .field("info", &self.info.is_some())
            .field("tagged", &self.tagged.is_some())
            .field("error", &self.error.is_some())
            .field("text", &self.text.is_some())
            .field("binary", &self.binary.is_some())
            .field("prompt", &self.prompt.is_some())
            .field("resolve", &self.resolve.is_some())
            .field("keep_alive", &self.keep_alive.is_some())
            .field("parallel", &self.parallel.is_some())
            .finish()
    }
}

/// Primitives provided by the native client library.
///
/// Every method is blocking. `run_command` in particular returns only once the
/// server has finished (or the command was canceled), and may invoke the
/// registered callbacks from the calling thread while it runs.
pub trait NativeBoundary: Send + Sync {
    /// Opens a connection.
    fn connect(&self, request: &ConnectRequest) -> ConnectOutcome;

    /// Returns the library-wide "last connection error", if any.
    fn connection_error(&self) -> Option<ErrorItem>;

    /// Releases a connection handle.
    fn disconnect(&self, handle: NativeHandle);

    /// Returns `true` if the server behind `handle` is Unicode-enabled.
    fn is_unicode(&self, handle: NativeHandle) -> bool;

    /// Returns the protocol API level.
    fn api_level(&self, handle: NativeHandle) -> u32;

    /// Returns `true` if the server requires an explicit `login` command.
    fn requires_login(&self, handle: NativeHandle) -> bool;

    /// Pushes working directory, user and workspace onto the connection.
    fn set_connection(
        &self,
        handle: NativeHandle,
        cwd: Option<&[u8]>,
        user: Option<&[u8]>,
        workspace: Option<&[u8]>,
    );

    /// Pushes a password or ticket as connection state.
    fn set_password(&self, handle: NativeHandle, password: &[u8]);

    /// Pushes the program name and version reported to the server.
    fn set_program(&self, handle: NativeHandle, name: &[u8], version: &[u8]);

    /// Resolves connection info from config files found above `cwd`.
    fn resolve_connection_info(&self, cwd: &Path) -> ConnectionInfo;

    /// Runs a command. Returns `false` if the command failed.
    fn run_command(
        &self,
        handle: NativeHandle,
        command: &str,
        cmd_id: CommandId,
        tagged: bool,
        args: &[Vec<u8>],
    ) -> bool;

    /// Asks the library to interrupt a running command.
    fn cancel_command(&self, handle: NativeHandle, cmd_id: CommandId);

    /// Returns errors queued for `cmd_id`, or `None` if there are none.
    fn error_results(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<Vec<ErrorItem>>;

    /// Returns informational messages queued for `cmd_id`.
    fn info_results(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<Vec<InfoMessage>>;

    /// Returns structured records queued for `cmd_id`.
    fn tagged_output(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<Vec<TaggedRecord>>;

    /// Returns plain text queued for `cmd_id`.
    fn text_results(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<String>;

    /// Returns binary data queued for `cmd_id`.
    fn binary_results(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<Vec<u8>>;

    /// Frees any results still queued for `cmd_id`.
    fn release_results(&self, handle: NativeHandle, cmd_id: CommandId);

    /// Replaces the callbacks registered on `handle`.
    fn set_callbacks(&self, handle: NativeHandle, callbacks: NativeCallbacks);
}
