//! An in-memory [`NativeBoundary`] for tests and offline use.
//!
//! [`MockBoundary`] behaves like a small server: it hands out handles, knows a
//! few built-in commands (`info`, `login`, `logout`), can require login, and
//! lets callers script any other command with [`MockBoundary::on_command`].
//! Scripted commands talk back through [`MockCommand`], which streams output
//! through the registered callbacks or queues it for bulk retrieval.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::env::{P4CLIENT, P4PASSWD, P4PORT, P4USER};
use crate::error::RECEIVE_INTERRUPTED_CODE;
use crate::native::{
    ConnectOutcome, ConnectRequest, NativeBoundary, NativeCallbacks, NativeHandle,
    ParallelTransfer,
};
use crate::{
    CommandId, ConnectionInfo, ErrorItem, InfoMessage, ResolveChoice, ResultBundle, Severity,
    TaggedRecord,
};

/// Default name of the per-directory config file.
pub const DEFAULT_CONFIG_FILE: &str = ".p4config";

/// Error code used for "connect to server failed".
pub const CONNECT_FAILED_CODE: i32 = 7_001;
/// Error code used for unknown commands.
pub const UNKNOWN_COMMAND_CODE: i32 = 7_002;
/// Error code used for a missing or wrong password.
pub const PASSWORD_INVALID_CODE: i32 = 7_189;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Scripted behavior for one command name. Returns the native success flag.
pub type CommandHandler = Arc<dyn Fn(&mut MockCommand<'_>) -> bool + Send + Sync>;

/// One command as seen by the mock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCommand {
    /// Handle the command ran on.
    pub handle: NativeHandle,
    /// Command name.
    pub command: String,
    /// Command identifier.
    pub cmd_id: CommandId,
    /// Whether tagged output was requested.
    pub tagged: bool,
    /// Decoded arguments.
    pub args: Vec<String>,
}

#[derive(Default)]
struct MockConnection {
    address: String,
    user: Option<String>,
    workspace: Option<String>,
    cwd: Option<String>,
    password: Option<String>,
    program: Option<(String, String)>,
    callbacks: NativeCallbacks,
    running: HashSet<CommandId>,
    canceled: HashSet<CommandId>,
    queued: HashMap<CommandId, ResultBundle>,
}

struct MockState {
    next_handle: u64,
    connections: HashMap<NativeHandle, MockConnection>,
    unicode: bool,
    api_level: u32,
    requires_login: bool,
    reachable: bool,
    streaming: bool,
    connect_delay: Duration,
    config_file: String,
    passwords: HashMap<String, String>,
    tickets: HashSet<String>,
    connection_error: Option<ErrorItem>,
    handlers: HashMap<String, CommandHandler>,
    connects: usize,
    disconnects: usize,
    cancels: usize,
    commands: Vec<RecordedCommand>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            next_handle: 1,
            connections: HashMap::new(),
            unicode: false,
            api_level: 99,
            requires_login: false,
            reachable: true,
            streaming: true,
            connect_delay: Duration::ZERO,
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            passwords: HashMap::new(),
            tickets: HashSet::new(),
            connection_error: None,
            handlers: HashMap::new(),
            connects: 0,
            disconnects: 0,
            cancels: 0,
            commands: Vec::new(),
        }
    }
}

/// A scriptable in-memory native boundary.
#[derive(Default)]
pub struct MockBoundary {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl std::fmt::Debug for MockBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MockBoundary")
            .field("open_connections", &state.connections.len())
            .field("unicode", &state.unicode)
            .field("requires_login", &state.requires_login)
            .finish()
    }
}

impl MockBoundary {
    /// Creates a reachable, byte-oriented server that does not require login.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the server Unicode-enabled.
    #[must_use]
    pub fn with_unicode(self, unicode: bool) -> Self {
        self.state().unicode = unicode;
        self
    }

    /// Sets the reported API level.
    #[must_use]
    pub fn with_api_level(self, level: u32) -> Self {
        self.state().api_level = level;
        self
    }

    /// Requires login and registers `user` with `password`.
    #[must_use]
    pub fn with_login(self, user: &str, password: &str) -> Self {
        {
            let mut state = self.state();
            state.requires_login = true;
            state
                .passwords
                .insert(user.to_string(), password.to_string());
        }
        self
    }

    /// Chooses between streaming output through callbacks (the default) and
    /// queuing it for bulk retrieval.
    #[must_use]
    pub fn with_streaming(self, streaming: bool) -> Self {
        self.state().streaming = streaming;
        self
    }

    /// Makes every connect block for `delay` before answering.
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state().connect_delay = delay;
        self
    }

    /// Sets the config file name used for connection discovery.
    #[must_use]
    pub fn with_config_file(self, name: &str) -> Self {
        self.state().config_file = name.to_string();
        self
    }

    /// Makes connects succeed or fail from now on.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Registers the behavior of `command`, replacing any earlier one.
    pub fn on_command<F>(&self, command: &str, handler: F)
    where
        F: Fn(&mut MockCommand<'_>) -> bool + Send + Sync + 'static,
    {
        self.state()
            .handlers
            .insert(command.to_string(), Arc::new(handler));
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    /// Number of disconnects so far.
    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    /// Number of handles currently open.
    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// Number of cancel requests received.
    pub fn cancel_count(&self) -> usize {
        self.state().cancels
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state().commands.clone()
    }

    /// Names of the commands run so far, in order.
    pub fn command_names(&self) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    /// Commands currently inside `run_command`.
    pub fn running_commands(&self) -> Vec<CommandId> {
        self.state()
            .connections
            .values()
            .flat_map(|conn| conn.running.iter().copied())
            .collect()
    }

    /// Returns `true` if `handle` has any callback registered.
    pub fn has_callbacks(&self, handle: NativeHandle) -> bool {
        self.state()
            .connections
            .get(&handle)
            .is_some_and(|conn| !conn.callbacks.is_empty())
    }

    /// Returns `(user, workspace, cwd)` pushed onto `handle`.
    pub fn connection_identity(
        &self,
        handle: NativeHandle,
    ) -> Option<(Option<String>, Option<String>, Option<String>)> {
        self.state()
            .connections
            .get(&handle)
            .map(|conn| (conn.user.clone(), conn.workspace.clone(), conn.cwd.clone()))
    }

    /// Returns the password pushed onto `handle` as connection state.
    pub fn connection_password(&self, handle: NativeHandle) -> Option<String> {
        self.state()
            .connections
            .get(&handle)
            .and_then(|conn| conn.password.clone())
    }

    /// Returns the program name and version pushed onto `handle`.
    pub fn connection_program(&self, handle: NativeHandle) -> Option<(String, String)> {
        self.state()
            .connections
            .get(&handle)
            .and_then(|conn| conn.program.clone())
    }

    /// Returns `true` if `user` holds a login ticket.
    pub fn has_ticket(&self, user: &str) -> bool {
        self.state().tickets.contains(user)
    }

    fn is_canceled(&self, handle: NativeHandle, cmd_id: CommandId) -> bool {
        self.state()
            .connections
            .get(&handle)
            .is_none_or(|conn| conn.canceled.contains(&cmd_id))
    }

    fn decode(&self, bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

fn parse_config_file(contents: &str) -> ConnectionInfo {
    let mut info = ConnectionInfo::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let value = Some(value.trim().to_string());
        match name.trim() {
            P4PORT => info.address = value,
            P4USER => info.user = value,
            P4CLIENT => info.workspace = value,
            P4PASSWD => info.password = value,
            _ => {}
        }
    }
    info
}

impl NativeBoundary for MockBoundary {
    fn connect(&self, request: &ConnectRequest) -> ConnectOutcome {
        let delay = self.state().connect_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = self.state();
        if !state.reachable {
            let error = ErrorItem::new(
                Severity::Fatal,
                CONNECT_FAILED_CODE,
                format!(
                    "Connect to server failed; check $P4PORT.\nTCP connect to {} failed.",
                    self.decode(&request.address)
                ),
            );
            state.connection_error = Some(error.clone());
            return ConnectOutcome {
                handle: None,
                errors: vec![error],
            };
        }
        let handle = NativeHandle::from_raw(state.next_handle);
        state.next_handle += 1;
        state.connects += 1;
        state.connection_error = None;
        state.connections.insert(
            handle,
            MockConnection {
                address: self.decode(&request.address),
                user: request.user.as_deref().map(|u| self.decode(u)),
                workspace: request.workspace.as_deref().map(|w| self.decode(w)),
                password: request.password.as_deref().map(|p| self.decode(p)),
                ..MockConnection::default()
            },
        );
        ConnectOutcome {
            handle: Some(handle),
            errors: Vec::new(),
        }
    }

    fn connection_error(&self) -> Option<ErrorItem> {
        self.state().connection_error.clone()
    }

    fn disconnect(&self, handle: NativeHandle) {
        let mut state = self.state();
        // Commands still running on this handle see themselves canceled.
        if state.connections.remove(&handle).is_some() {
            state.disconnects += 1;
        }
        self.changed.notify_all();
    }

    fn is_unicode(&self, _handle: NativeHandle) -> bool {
        self.state().unicode
    }

    fn api_level(&self, _handle: NativeHandle) -> u32 {
        self.state().api_level
    }

    fn requires_login(&self, _handle: NativeHandle) -> bool {
        self.state().requires_login
    }

    fn set_connection(
        &self,
        handle: NativeHandle,
        cwd: Option<&[u8]>,
        user: Option<&[u8]>,
        workspace: Option<&[u8]>,
    ) {
        let cwd = cwd.map(|c| self.decode(c));
        let user = user.map(|u| self.decode(u));
        let workspace = workspace.map(|w| self.decode(w));
        if let Some(conn) = self.state().connections.get_mut(&handle) {
            conn.cwd = cwd;
            conn.user = user;
            conn.workspace = workspace;
        }
    }

    fn set_password(&self, handle: NativeHandle, password: &[u8]) {
        let password = self.decode(password);
        if let Some(conn) = self.state().connections.get_mut(&handle) {
            conn.password = Some(password);
        }
    }

    fn set_program(&self, handle: NativeHandle, name: &[u8], version: &[u8]) {
        let program = (self.decode(name), self.decode(version));
        if let Some(conn) = self.state().connections.get_mut(&handle) {
            conn.program = Some(program);
        }
    }

    fn resolve_connection_info(&self, cwd: &Path) -> ConnectionInfo {
        let config_file = self.state().config_file.clone();
        for dir in cwd.ancestors() {
            let path = dir.join(&config_file);
            match std::fs::read_to_string(&path) {
                Ok(contents) => return parse_config_file(&contents),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "failed to read config file; ignoring");
                }
            }
        }
        ConnectionInfo::default()
    }

    fn run_command(
        &self,
        handle: NativeHandle,
        command: &str,
        cmd_id: CommandId,
        tagged: bool,
        args: &[Vec<u8>],
    ) -> bool {
        let args: Vec<String> = args.iter().map(|a| self.decode(a)).collect();
        let (handler, mut cmd) = {
            let mut state = self.state();
            state.commands.push(RecordedCommand {
                handle,
                command: command.to_string(),
                cmd_id,
                tagged,
                args: args.clone(),
            });
            let requires_login = state.requires_login;
            let streaming = state.streaming;
            let handler = state.handlers.get(command).cloned();
            let passwords = state.passwords.clone();
            let tickets = state.tickets.clone();
            let Some(conn) = state.connections.get_mut(&handle) else {
                return false;
            };
            conn.running.insert(cmd_id);
            conn.canceled.remove(&cmd_id);
            conn.queued.remove(&cmd_id);

            let authenticated = !requires_login
                || conn.user.as_ref().is_some_and(|user| {
                    tickets.contains(user)
                        || (conn.password.is_some() && passwords.get(user) == conn.password.as_ref())
                });

            let cmd = MockCommand {
                mock: self,
                handle,
                cmd_id,
                command: command.to_string(),
                args,
                tagged,
                address: conn.address.clone(),
                user: conn.user.clone(),
                workspace: conn.workspace.clone(),
                callbacks: conn.callbacks.clone(),
                streaming,
                queued: ResultBundle {
                    cmd_id: Some(cmd_id),
                    command: command.to_string(),
                    ..ResultBundle::default()
                },
                record_index: 0,
            };
            let handler = match handler {
                Some(handler) => handler,
                None => builtin_handler(command),
            };
            let needs_auth = !matches!(command, "login" | "logout" | "info");
            if needs_auth && !authenticated {
                (Arc::new(password_required) as CommandHandler, cmd)
            } else {
                (handler, cmd)
            }
        };

        let ok = handler(&mut cmd);

        let queued = std::mem::take(&mut cmd.queued);
        let mut state = self.state();
        if let Some(conn) = state.connections.get_mut(&handle) {
            conn.running.remove(&cmd_id);
            conn.queued.insert(cmd_id, queued);
        }
        self.changed.notify_all();
        ok
    }

    fn cancel_command(&self, handle: NativeHandle, cmd_id: CommandId) {
        let mut state = self.state();
        state.cancels += 1;
        if let Some(conn) = state.connections.get_mut(&handle) {
            conn.canceled.insert(cmd_id);
        }
        self.changed.notify_all();
    }

    fn error_results(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<Vec<ErrorItem>> {
        self.state()
            .connections
            .get_mut(&handle)
            .and_then(|conn| conn.queued.get_mut(&cmd_id))
            .and_then(|bundle| bundle.errors.take())
    }

    fn info_results(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<Vec<InfoMessage>> {
        self.state()
            .connections
            .get_mut(&handle)
            .and_then(|conn| conn.queued.get_mut(&cmd_id))
            .and_then(|bundle| bundle.info.take())
    }

    fn tagged_output(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<Vec<TaggedRecord>> {
        self.state()
            .connections
            .get_mut(&handle)
            .and_then(|conn| conn.queued.get_mut(&cmd_id))
            .and_then(|bundle| bundle.tagged.take())
    }

    fn text_results(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<String> {
        self.state()
            .connections
            .get_mut(&handle)
            .and_then(|conn| conn.queued.get_mut(&cmd_id))
            .and_then(|bundle| bundle.text.take())
    }

    fn binary_results(&self, handle: NativeHandle, cmd_id: CommandId) -> Option<Vec<u8>> {
        self.state()
            .connections
            .get_mut(&handle)
            .and_then(|conn| conn.queued.get_mut(&cmd_id))
            .and_then(|bundle| bundle.binary.take())
    }

    fn release_results(&self, handle: NativeHandle, cmd_id: CommandId) {
        if let Some(conn) = self.state().connections.get_mut(&handle) {
            conn.queued.remove(&cmd_id);
            conn.canceled.remove(&cmd_id);
        }
    }

    fn set_callbacks(&self, handle: NativeHandle, callbacks: NativeCallbacks) {
        if let Some(conn) = self.state().connections.get_mut(&handle) {
            conn.callbacks = callbacks;
        }
    }
}

/// The view a scripted command has of the mock while it runs.
pub struct MockCommand<'a> {
    mock: &'a MockBoundary,
    handle: NativeHandle,
    cmd_id: CommandId,
    command: String,
    args: Vec<String>,
    tagged: bool,
    address: String,
    user: Option<String>,
    workspace: Option<String>,
    callbacks: NativeCallbacks,
    streaming: bool,
    queued: ResultBundle,
    record_index: usize,
}

impl std::fmt::Debug for MockCommand<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCommand")
            .field("cmd_id", &self.cmd_id)
            .field("command", &self.command)
            .field("args", &self.args)
            .finish()
    }
}

impl MockCommand<'_> {
    /// Command identifier.
    pub fn cmd_id(&self) -> CommandId {
        self.cmd_id
    }

    /// Command name.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Decoded arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether tagged output was requested.
    pub fn is_tagged(&self) -> bool {
        self.tagged
    }

    /// Server address the connection was opened with.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// User pushed onto the connection.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Workspace pushed onto the connection.
    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    /// Emits one complete structured record.
    pub fn tagged(&mut self, fields: &[(&str, &str)]) {
        let index = self.record_index;
        self.record_index += 1;
        match self.callbacks.tagged.clone().filter(|_| self.streaming) {
            Some(callback) => {
                for (key, value) in fields {
                    callback(self.cmd_id, index, Some(*key), Some(*value));
                }
                callback(self.cmd_id, index, None, None);
            }
            None => {
                let record: TaggedRecord = fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                self.queued.tagged.get_or_insert_with(Vec::new).push(record);
            }
        }
    }

    /// Emits the fields of a record without closing it.
    pub fn tagged_partial(&mut self, fields: &[(&str, &str)]) {
        let index = self.record_index;
        if let Some(callback) = self.callbacks.tagged.clone().filter(|_| self.streaming) {
            for (key, value) in fields {
                callback(self.cmd_id, index, Some(*key), Some(*value));
            }
        }
    }

    /// Emits an informational message.
    pub fn info(&mut self, level: u32, message: &str) {
        let message = InfoMessage::new(level, message);
        match self.callbacks.info.clone().filter(|_| self.streaming) {
            Some(callback) => callback(self.cmd_id, message),
            None => self.queued.info.get_or_insert_with(Vec::new).push(message),
        }
    }

    /// Emits an error or warning.
    pub fn error(&mut self, severity: Severity, code: i32, message: &str) {
        let error = ErrorItem::new(severity, code, message);
        match self.callbacks.error.clone().filter(|_| self.streaming) {
            Some(callback) => callback(self.cmd_id, error),
            None => self.queued.errors.get_or_insert_with(Vec::new).push(error),
        }
    }

    /// Emits plain text.
    pub fn text(&mut self, text: &str) {
        match self.callbacks.text.clone().filter(|_| self.streaming) {
            Some(callback) => callback(self.cmd_id, text),
            None => self
                .queued
                .text
                .get_or_insert_with(String::new)
                .push_str(text),
        }
    }

    /// Emits binary data.
    pub fn binary(&mut self, data: &[u8]) {
        match self.callbacks.binary.clone().filter(|_| self.streaming) {
            Some(callback) => callback(self.cmd_id, data),
            None => self
                .queued
                .binary
                .get_or_insert_with(Vec::new)
                .extend_from_slice(data),
        }
    }

    /// Emits the "receive interrupted by client" error and returns `false`.
    pub fn interrupted(&mut self) -> bool {
        self.error(
            Severity::Failed,
            RECEIVE_INTERRUPTED_CODE,
            "Receive interrupted by client.",
        );
        false
    }

    /// Asks the client for input.
    pub fn prompt(&self, message: &str, echo: bool) -> Option<String> {
        self.callbacks
            .prompt
            .as_ref()
            .and_then(|callback| callback(self.cmd_id, message, echo))
    }

    /// Asks the client how to resolve `path`.
    pub fn resolve(&self, path: &str) -> ResolveChoice {
        self.callbacks
            .resolve
            .as_ref()
            .map(|callback| callback(self.cmd_id, path))
            .unwrap_or_default()
    }

    /// Polls the client's keep-alive callback. `true` when none is registered.
    pub fn keep_alive(&self) -> bool {
        self.callbacks
            .keep_alive
            .as_ref()
            .is_none_or(|callback| callback(self.cmd_id))
    }

    /// Hands a transfer to the client's parallel callback.
    ///
    /// Returns `None` when the client did not register one.
    pub fn parallel(
        &self,
        command: &str,
        args: &[&str],
        batches: Vec<Vec<String>>,
        threads: usize,
    ) -> Option<bool> {
        let callback = self.callbacks.parallel.as_ref()?;
        Some(callback(
            self.cmd_id,
            ParallelTransfer {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                batches,
                threads,
            },
        ))
    }

    /// Returns `true` once a cancel was requested (or the handle was closed).
    pub fn is_canceled(&self) -> bool {
        self.mock.is_canceled(self.handle, self.cmd_id)
    }

    /// Blocks until the command is canceled, the keep-alive check fails, or
    /// `timeout` elapses. Returns `true` unless the timeout elapsed.
    pub fn wait_for_cancel(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_canceled() || !self.keep_alive() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let state = self.mock.state();
            let wait = POLL_INTERVAL.min(deadline - now);
            let _ = self
                .mock
                .changed
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn builtin_handler(command: &str) -> CommandHandler {
    match command {
        "info" => Arc::new(info_command),
        "login" => Arc::new(login_command),
        "logout" => Arc::new(logout_command),
        _ => Arc::new(unknown_command),
    }
}

fn info_command(cmd: &mut MockCommand<'_>) -> bool {
    let unicode = if cmd.mock.state().unicode {
        "enabled"
    } else {
        "disabled"
    };
    let address = cmd.address().to_string();
    let user = cmd.user().unwrap_or("*unknown*").to_string();
    let workspace = cmd.workspace().unwrap_or("*unknown*").to_string();
    if cmd.is_tagged() {
        cmd.tagged(&[
            ("serverAddress", address.as_str()),
            ("serverVersion", "P4D/MOCK/2024.1"),
            ("userName", user.as_str()),
            ("clientName", workspace.as_str()),
            ("unicode", unicode),
        ]);
    } else {
        cmd.info(0, &format!("User name: {user}"));
        cmd.info(0, &format!("Client name: {workspace}"));
        cmd.info(0, &format!("Server address: {address}"));
    }
    true
}

fn login_command(cmd: &mut MockCommand<'_>) -> bool {
    let Some(user) = cmd.user().map(str::to_string) else {
        cmd.error(Severity::Failed, PASSWORD_INVALID_CODE, "No user set.");
        return false;
    };
    let expected = cmd.mock.state().passwords.get(&user).cloned();
    let given = cmd.prompt("Enter password: ", false);
    match expected {
        Some(expected) if given.as_deref() != Some(expected.as_str()) => {
            cmd.error(Severity::Failed, PASSWORD_INVALID_CODE, "Password invalid.");
            false
        }
        _ => {
            cmd.mock.state().tickets.insert(user.clone());
            cmd.info(0, &format!("User {user} logged in."));
            true
        }
    }
}

fn logout_command(cmd: &mut MockCommand<'_>) -> bool {
    let user = cmd
        .args()
        .iter()
        .find(|a| !a.starts_with('-'))
        .cloned()
        .or_else(|| cmd.user().map(str::to_string));
    let Some(user) = user else {
        cmd.error(Severity::Failed, PASSWORD_INVALID_CODE, "No user set.");
        return false;
    };
    cmd.mock.state().tickets.remove(&user);
    cmd.info(0, &format!("User {user} logged out."));
    true
}

fn unknown_command(cmd: &mut MockCommand<'_>) -> bool {
    cmd.error(
        Severity::Failed,
        UNKNOWN_COMMAND_CODE,
        "Unknown command.  Try 'p4 help' for info.",
    );
    false
}

fn password_required(cmd: &mut MockCommand<'_>) -> bool {
    cmd.error(
        Severity::Failed,
        PASSWORD_INVALID_CODE,
        "Perforce password (P4PASSWD) invalid or unset.",
    );
    false
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::OwnerId;

    fn id(n: u32) -> CommandId {
        CommandId::compose(OwnerId::from_raw(5), n)
    }

    fn connect(mock: &MockBoundary) -> NativeHandle {
        mock.connect(&ConnectRequest {
            address: b"localhost:6666".to_vec(),
            ..ConnectRequest::default()
        })
        .handle
        .unwrap()
    }

    #[test]
    fn unreachable_server_sets_connection_error() {
        let mock = MockBoundary::new();
        mock.set_reachable(false);
        let outcome = mock.connect(&ConnectRequest::default());
        assert!(outcome.handle.is_none());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(mock.connection_error().unwrap().code, CONNECT_FAILED_CODE);
    }

    #[test]
    fn queued_results_are_fetched_once() {
        let mock = MockBoundary::new().with_streaming(false);
        let handle = connect(&mock);
        mock.set_connection(handle, None, Some(b"admin"), Some(b"ws"));
        assert!(mock.run_command(handle, "info", id(1), true, &[]));
        let records = mock.tagged_output(handle, id(1)).unwrap();
        assert_eq!(records[0].get("userName").map(String::as_str), Some("admin"));
        assert!(mock.tagged_output(handle, id(1)).is_none());
        assert!(mock.error_results(handle, id(1)).is_none());
    }

    #[test]
    fn unknown_command_fails_with_error() {
        let mock = MockBoundary::new().with_streaming(false);
        let handle = connect(&mock);
        assert!(!mock.run_command(handle, "frobnicate", id(2), false, &[]));
        let errors = mock.error_results(handle, id(2)).unwrap();
        assert_eq!(errors[0].code, UNKNOWN_COMMAND_CODE);
    }

    #[test]
    fn login_required_blocks_commands_until_password_is_set() {
        let mock = MockBoundary::new()
            .with_streaming(false)
            .with_login("admin", "secret");
        mock.on_command("depots", |cmd| {
            cmd.tagged(&[("name", "depot")]);
            true
        });
        let handle = connect(&mock);
        mock.set_connection(handle, None, Some(b"admin"), None);
        assert!(!mock.run_command(handle, "depots", id(3), true, &[]));
        mock.set_password(handle, b"secret");
        assert!(mock.run_command(handle, "depots", id(4), true, &[]));
    }

    #[test]
    fn config_file_discovery_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            "# comment\nP4PORT=localhost:6666\nP4USER=admin\nP4CLIENT=admin_space\n",
        )
        .unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let info = MockBoundary::new().resolve_connection_info(&nested);
        assert_eq!(info.address.as_deref(), Some("localhost:6666"));
        assert_eq!(info.user.as_deref(), Some("admin"));
        assert_eq!(info.workspace.as_deref(), Some("admin_space"));
    }

    #[test]
    fn cancel_wakes_waiting_command() {
        let mock = Arc::new(MockBoundary::new().with_streaming(false));
        mock.on_command("sync", |cmd| {
            if cmd.wait_for_cancel(Duration::from_secs(5)) {
                cmd.interrupted()
            } else {
                true
            }
        });
        let handle = connect(&mock);
        let runner = {
            let mock = mock.clone();
            std::thread::spawn(move || mock.run_command(handle, "sync", id(6), false, &[]))
        };
        while mock.running_commands().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
        mock.cancel_command(handle, id(6));
        assert!(!runner.join().unwrap());
        let errors = mock.error_results(handle, id(6)).unwrap();
        assert_eq!(errors[0].code, RECEIVE_INTERRUPTED_CODE);
    }
}
