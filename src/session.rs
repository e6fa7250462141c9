//! Session lifecycle: connect, reconnect, close, login and logout.
//!
//! A [`P4Session`] owns at most one native handle at a time. The handle is
//! created lazily, dropped by the idle timer or by a configuration change,
//! and transparently re-created by the next command.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::idle::{IdleDisconnectTimer, IdleTarget};
use crate::native::{
    BinaryCallback, ConnectRequest, ErrorCallback, InfoCallback, KeepAliveCallback,
    NativeBoundary, NativeCallbacks, NativeHandle, ParallelCallback, ParallelTransfer,
    PromptCallback, ResolveCallback, TaggedCallback, TextCallback,
};
use crate::parallel::ParallelCoordinator;
use crate::results::{RecentResults, ResultAggregator};
use crate::timing::CommandTimingTracker;
use crate::{
    CommandId, Encoding, ErrorItem, InfoMessage, OwnerId, P4Error, RecentResultsConfig,
    ResolveChoice, ServerError, ServerMetadata, SessionConfig,
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub(crate) struct ConnState {
    pub(crate) handle: Option<NativeHandle>,
    pub(crate) metadata: Option<ServerMetadata>,
    /// Connection parameters changed; reconnect before the next command.
    pub(crate) stale: bool,
    pub(crate) connection_error: Option<ServerError>,
}

#[derive(Default)]
pub(crate) struct Interactive {
    pub(crate) prompt: Option<PromptCallback>,
    pub(crate) resolve: Option<ResolveCallback>,
    /// Answer for the password prompt while `login` runs.
    pub(crate) login_password: Option<String>,
}

pub(crate) struct SessionInner {
    pub(crate) boundary: Arc<dyn NativeBoundary>,
    pub(crate) config: Mutex<SessionConfig>,
    pub(crate) conn: Mutex<ConnState>,
    pub(crate) run_lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) last_activity: Mutex<Instant>,
    pub(crate) last_run: Mutex<Option<Instant>>,
    pub(crate) current: Mutex<Option<CommandId>>,
    pub(crate) owner: Mutex<Option<OwnerId>>,
    pub(crate) disposed: AtomicBool,
    pub(crate) counter: AtomicU32,
    /// Session-local owner slot per caller, used for command-ID owner bits.
    pub(crate) owner_slots: Mutex<HashMap<OwnerId, OwnerId>>,
    pub(crate) timing: Arc<CommandTimingTracker>,
    pub(crate) results: Arc<ResultAggregator>,
    pub(crate) recent: Arc<RecentResults>,
    pub(crate) parallel: Arc<ParallelCoordinator>,
    pub(crate) interactive: Arc<Mutex<Interactive>>,
    pub(crate) idle: IdleDisconnectTimer,
}

impl SessionInner {
    pub(crate) fn check_owner(&self, caller: OwnerId) -> Result<(), P4Error> {
        if let Some(owner) = *lock(&self.owner)
            && owner != caller
        {
            return Err(P4Error::ThreadMismatch { owner, caller });
        }
        Ok(())
    }

    pub(crate) fn check_disposed(&self) -> Result<(), P4Error> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(P4Error::Disposed);
        }
        Ok(())
    }

    pub(crate) fn current_command(&self) -> Option<CommandId> {
        *lock(&self.current)
    }

    pub(crate) fn touch_activity(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn mark_stale(&self) {
        lock(&self.conn).stale = true;
    }

    /// Returns a live handle, connecting first if needed.
    pub(crate) fn ensure_connected(
        self: &Arc<Self>,
    ) -> Result<(NativeHandle, ServerMetadata), P4Error> {
        {
            let conn = lock(&self.conn);
            if let (Some(handle), Some(metadata), false) =
                (conn.handle, conn.metadata.as_ref(), conn.stale)
            {
                return Ok((handle, metadata.clone()));
            }
            if conn.handle.is_some() {
                debug!("connection parameters changed; reconnecting");
            }
        }
        self.establish()
    }

    /// Releases any existing handle and opens a new one.
    ///
    /// Never issues `login`: a ticket has to be resident already. The
    /// connection state is locked only to take the old handle and to store
    /// the new one, never across native calls. Callers hold the run-lock.
    pub(crate) fn establish(self: &Arc<Self>) -> Result<(NativeHandle, ServerMetadata), P4Error> {
        let previous = lock(&self.conn).handle.take();
        if let Some(handle) = previous {
            self.release(handle);
        }

        let (handle, metadata) = match self.open_handle() {
            Ok(opened) => opened,
            Err(err) => {
                if let P4Error::Connection(error) = &err {
                    lock(&self.conn).connection_error = Some(error.clone());
                }
                return Err(err);
            }
        };

        let mut conn = lock(&self.conn);
        if self.disposed.load(Ordering::SeqCst) {
            drop(conn);
            debug!(handle = handle.as_raw(), "session closed while connecting; releasing");
            self.release(handle);
            return Err(P4Error::Disposed);
        }
        conn.handle = Some(handle);
        conn.metadata = Some(metadata.clone());
        conn.stale = false;
        conn.connection_error = None;
        drop(conn);
        self.touch_activity();
        Ok((handle, metadata))
    }

    /// Connects, pushes identity and registers callbacks on a new handle.
    fn open_handle(self: &Arc<Self>) -> Result<(NativeHandle, ServerMetadata), P4Error> {
        let mut config = lock(&self.config).clone();
        if config.needs_discovery()
            && let Some(cwd) = config.cwd().map(Path::to_path_buf)
        {
            let info = self.boundary.resolve_connection_info(&cwd);
            debug!(cwd = %cwd.display(), found_address = info.address.is_some(), "resolved connection info");
            config.fill_missing(info.clone());
            lock(&self.config).fill_missing(info);
        }
        let Some(address) = config.address() else {
            return Err(P4Error::InvalidConfig("no server address configured".into()));
        };

        // Connect without credentials first to learn the server's encoding.
        let outcome = self.boundary.connect(&ConnectRequest {
            address: Encoding::Ascii.marshal(address),
            ..ConnectRequest::default()
        });
        let Some(handle) = outcome.handle else {
            let error = self
                .boundary
                .connection_error()
                .or_else(|| outcome.errors.into_iter().next())
                .map(|item| ServerError::new(vec![item]))
                .unwrap_or_else(|| ServerError::fatal("unknown error connecting to server"))
                .with_context(address);
            debug!(address, error = %error, "connect failed");
            return Err(P4Error::Connection(error));
        };

        let encoding = if self.boundary.is_unicode(handle) {
            Encoding::Unicode
        } else {
            Encoding::Ascii
        };
        let marshal = |value: Option<&str>| value.map(|v| encoding.marshal(v));
        let cwd = config
            .cwd()
            .map(|cwd| encoding.marshal(&cwd.to_string_lossy()));
        let user = marshal(config.user());
        let workspace = marshal(config.workspace());
        self.boundary.set_connection(
            handle,
            cwd.as_deref(),
            user.as_deref(),
            workspace.as_deref(),
        );
        self.boundary.set_program(
            handle,
            &encoding.marshal(config.program_name()),
            &encoding.marshal(config.program_version()),
        );

        let metadata = ServerMetadata {
            encoding,
            api_level: self.boundary.api_level(handle),
            requires_login: self.boundary.requires_login(handle),
        };
        if let Some(password) = config.password()
            && !metadata.requires_login
        {
            self.boundary
                .set_password(handle, &encoding.marshal(password));
        }
        self.boundary.set_callbacks(handle, self.callbacks(&config));

        debug!(
            address,
            ?encoding,
            api_level = metadata.api_level,
            requires_login = metadata.requires_login,
            "connected"
        );
        Ok((handle, metadata))
    }

    /// Clears every callback on `handle` and disconnects it.
    fn release(&self, handle: NativeHandle) {
        self.boundary
            .set_callbacks(handle, NativeCallbacks::default());
        self.boundary.disconnect(handle);
    }

    /// Drops the current handle, if any. The session stays usable.
    pub(crate) fn drop_connection(&self, reason: &str) {
        let handle = lock(&self.conn).handle.take();
        if let Some(handle) = handle {
            debug!(reason, handle = handle.as_raw(), "disconnecting");
            self.release(handle);
        }
    }

    /// Builds the callback set registered on every new handle.
    pub(crate) fn callbacks(self: &Arc<Self>, config: &SessionConfig) -> NativeCallbacks {
        let info: InfoCallback = {
            let (results, timing) = (self.results.clone(), self.timing.clone());
            Arc::new(move |cmd_id: CommandId, message: InfoMessage| {
                timing.touch(cmd_id);
                results.deliver_info(cmd_id, message);
            })
        };
        let tagged: TaggedCallback = {
            let (results, timing) = (self.results.clone(), self.timing.clone());
            Arc::new(
                move |cmd_id: CommandId, index: usize, key: Option<&str>, value: Option<&str>| {
                    timing.touch(cmd_id);
                    results.deliver_tagged(cmd_id, index, key, value);
                },
            )
        };
        let error: ErrorCallback = {
            let (results, timing) = (self.results.clone(), self.timing.clone());
            Arc::new(move |cmd_id: CommandId, error: ErrorItem| {
                timing.touch(cmd_id);
                results.deliver_error(cmd_id, error);
            })
        };
        let text: TextCallback = {
            let (results, timing) = (self.results.clone(), self.timing.clone());
            Arc::new(move |cmd_id: CommandId, text: &str| {
                timing.touch(cmd_id);
                results.deliver_text(cmd_id, text);
            })
        };
        let binary: BinaryCallback = {
            let (results, timing) = (self.results.clone(), self.timing.clone());
            Arc::new(move |cmd_id: CommandId, data: &[u8]| {
                timing.touch(cmd_id);
                results.deliver_binary(cmd_id, data);
            })
        };
        let prompt: PromptCallback = {
            let (interactive, timing) = (self.interactive.clone(), self.timing.clone());
            Arc::new(move |cmd_id: CommandId, message: &str, echo: bool| {
                timing.pause(cmd_id);
                let (password, handler) = {
                    let interactive = lock(&interactive);
                    (interactive.login_password.clone(), interactive.prompt.clone())
                };
                let answer = match password {
                    Some(password) => Some(password),
                    None => handler.and_then(|handler| handler(cmd_id, message, echo)),
                };
                timing.resume(cmd_id);
                answer
            })
        };
        let resolve: ResolveCallback = {
            let (interactive, timing) = (self.interactive.clone(), self.timing.clone());
            Arc::new(move |cmd_id: CommandId, path: &str| {
                timing.pause(cmd_id);
                let handler = lock(&interactive).resolve.clone();
                let choice = handler
                    .map(|handler| handler(cmd_id, path))
                    .unwrap_or(ResolveChoice::Skip);
                timing.resume(cmd_id);
                choice
            })
        };
        let keep_alive: KeepAliveCallback = {
            let timing = self.timing.clone();
            let run_timeout = config.run_timeout();
            Arc::new(move |cmd_id: CommandId| {
                let alive = !timing.overdue(cmd_id, run_timeout);
                if !alive {
                    warn!(%cmd_id, ?run_timeout, "command overdue; asking native layer to abandon it");
                }
                alive
            })
        };
        let parallel: Option<ParallelCallback> = config.parallel_transfers().then(|| {
            let session = Arc::downgrade(self);
            Arc::new(move |cmd_id: CommandId, transfer: ParallelTransfer| match session.upgrade() {
                Some(inner) => inner.parallel.run(&inner, cmd_id, transfer),
                None => false,
            }) as ParallelCallback
        });

        NativeCallbacks {
            info: Some(info),
            tagged: Some(tagged),
            error: Some(error),
            text: Some(text),
            binary: Some(binary),
            prompt: Some(prompt),
            resolve: Some(resolve),
            keep_alive: Some(keep_alive),
            parallel,
        }
    }
}

impl IdleTarget for SessionInner {
    fn run_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.run_lock
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    fn disconnect_idle(&self) {
        self.drop_connection("idle");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.idle.stop();
        let handle = lock(&self.conn).handle.take();
        if let Some(handle) = handle {
            debug!(handle = handle.as_raw(), "session dropped without close; releasing connection");
            self.release(handle);
        }
    }
}

/// Runs `f` on the blocking pool with a clone of the session internals.
pub(crate) async fn blocking<T, F>(inner: &Arc<SessionInner>, f: F) -> Result<T, P4Error>
where
    F: FnOnce(&Arc<SessionInner>) -> T + Send + 'static,
    T: Send + 'static,
{
    let inner = inner.clone();
    tokio::task::spawn_blocking(move || f(&inner))
        .await
        .map_err(|err| P4Error::Internal(format!("native call did not complete: {err}")))
}

/// One logical connection to the server.
///
/// Cloning a session is cheap and yields another reference to the same
/// connection. Operations that are scoped to a caller take that caller's
/// [`OwnerId`]; if the session is bound to an owner, any other caller is
/// rejected with [`P4Error::ThreadMismatch`].
#[derive(Clone)]
pub struct P4Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for P4Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P4Session")
            .field("address", &lock(&self.inner.config).address())
            .field("connected", &self.is_connected())
            .field("owner", &self.owner())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Builder for a [`P4Session`] with an owner or a shared results cache.
pub struct SessionBuilder {
    boundary: Arc<dyn NativeBoundary>,
    config: SessionConfig,
    owner: Option<OwnerId>,
    recent: Option<Arc<RecentResults>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("owner", &self.owner)
            .finish()
    }
}

impl SessionBuilder {
    /// Binds the session to `owner`.
    #[must_use]
    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Shares `recent` as the session's "last results" cache.
    #[must_use]
    pub fn recent_results(mut self, recent: Arc<RecentResults>) -> Self {
        self.recent = Some(recent);
        self
    }

    /// Creates the session without connecting.
    pub fn build(self) -> P4Session {
        let recent = self
            .recent
            .unwrap_or_else(|| Arc::new(RecentResults::new(RecentResultsConfig::default())));
        P4Session {
            inner: Arc::new(SessionInner {
                boundary: self.boundary,
                config: Mutex::new(self.config),
                conn: Mutex::new(ConnState::default()),
                run_lock: Arc::new(tokio::sync::Mutex::new(())),
                last_activity: Mutex::new(Instant::now()),
                last_run: Mutex::new(None),
                current: Mutex::new(None),
                owner: Mutex::new(self.owner),
                disposed: AtomicBool::new(false),
                counter: AtomicU32::new(0),
                owner_slots: Mutex::new(HashMap::new()),
                timing: Arc::new(CommandTimingTracker::new()),
                results: Arc::new(ResultAggregator::new()),
                recent,
                parallel: Arc::new(ParallelCoordinator::default()),
                interactive: Arc::new(Mutex::new(Interactive::default())),
                idle: IdleDisconnectTimer::new(),
            }),
        }
    }

    /// Creates the session and connects it.
    pub async fn open(self) -> Result<P4Session, P4Error> {
        let session = self.build();
        session.connect().await?;
        Ok(session)
    }
}

impl P4Session {
    /// Creates an unowned session. Nothing is contacted until the first command
    /// or an explicit [`connect`](Self::connect).
    pub fn new(boundary: Arc<dyn NativeBoundary>, config: SessionConfig) -> Self {
        Self::builder(boundary, config).build()
    }

    /// Starts building a session.
    pub fn builder(boundary: Arc<dyn NativeBoundary>, config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            boundary,
            config,
            owner: None,
            recent: None,
        }
    }

    /// Creates an unowned session and connects it.
    pub async fn open(
        boundary: Arc<dyn NativeBoundary>,
        config: SessionConfig,
    ) -> Result<Self, P4Error> {
        Self::builder(boundary, config).open().await
    }

    /// Connects if not already connected and returns what was learned.
    ///
    /// If the config has a working directory and lacks any of address, user
    /// or workspace, those are discovered from config files first.
    pub async fn connect(&self) -> Result<ServerMetadata, P4Error> {
        self.inner.check_disposed()?;
        let running = self.inner.run_lock.clone().lock_owned().await;
        self.inner.check_disposed()?;
        blocking(&self.inner, move |inner| {
            let connected = inner.ensure_connected();
            drop(running);
            connected
        })
        .await?
        .map(|(_, metadata)| metadata)
    }

    /// Drops the current handle (if any) and connects again with the last
    /// known parameters. Callbacks are registered anew; no login is issued.
    pub async fn reconnect(&self) -> Result<ServerMetadata, P4Error> {
        self.inner.check_disposed()?;
        let running = self.inner.run_lock.clone().lock_owned().await;
        self.inner.check_disposed()?;
        blocking(&self.inner, move |inner| {
            debug!(had_handle = lock(&inner.conn).handle.is_some(), "reconnecting");
            let connected = inner.establish();
            drop(running);
            connected
        })
        .await?
        .map(|(_, metadata)| metadata)
    }

    /// Closes the session.
    ///
    /// A command still running is canceled and given the configured grace
    /// period to exit before the handle is released. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), P4Error> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.idle.stop();
        if let Some(cmd_id) = inner.current_command() {
            debug!(%cmd_id, "canceling running command before close");
            inner.cancel(cmd_id);
        }
        let grace = lock(&inner.config).close_grace();
        let running = tokio::time::timeout(grace, inner.run_lock.lock()).await;
        if running.is_err() {
            warn!(?grace, "command still running after close grace period; releasing anyway");
        }
        inner.drop_connection("close");
        Ok(())
    }

    /// Logs in with `password`.
    ///
    /// If the server does not require login, the password is pushed as
    /// connection state and this returns immediately.
    pub async fn login(
        &self,
        caller: OwnerId,
        password: &str,
        options: &[String],
    ) -> Result<(), P4Error> {
        self.inner.check_owner(caller)?;
        let metadata = self.connect().await?;
        if !metadata.requires_login {
            lock(&self.inner.config).set_password(Some(password.to_string()));
            let handle = lock(&self.inner.conn).handle;
            if let Some(handle) = handle {
                self.inner
                    .boundary
                    .set_password(handle, &metadata.encoding.marshal(password));
            }
            debug!("login not required; password stored as connection state");
            return Ok(());
        }

        lock(&self.inner.interactive).login_password = Some(password.to_string());
        let result = self.run(caller, "login", options).await;
        lock(&self.inner.interactive).login_password = None;
        self.record_connection_result("login", result)
    }

    /// Logs out `user` (or the session's user).
    ///
    /// Returns immediately if the server does not require login.
    pub async fn logout(
        &self,
        caller: OwnerId,
        options: &[String],
        user: Option<&str>,
    ) -> Result<(), P4Error> {
        self.inner.check_owner(caller)?;
        let metadata = self.connect().await?;
        if !metadata.requires_login {
            return Ok(());
        }
        let mut args = options.to_vec();
        if let Some(user) = user {
            args.push(user.to_string());
        }
        let result = self.run(caller, "logout", &args).await;
        self.record_connection_result("logout", result)
    }

    fn record_connection_result<T>(
        &self,
        context: &str,
        result: Result<T, P4Error>,
    ) -> Result<(), P4Error> {
        let mut conn = lock(&self.inner.conn);
        match result {
            Ok(_) => {
                conn.connection_error = None;
                Ok(())
            }
            Err(err) => {
                let error = match err.errors() {
                    [] => ServerError::fatal(err.to_string()),
                    errors => ServerError::new(errors.to_vec()),
                };
                conn.connection_error = Some(error.with_context(context));
                Err(err)
            }
        }
    }

    /// Binds the session to `owner`, or unbinds it with `None`.
    pub fn set_owner(&self, owner: Option<OwnerId>) {
        *lock(&self.inner.owner) = owner;
    }

    /// Returns the owner the session is bound to.
    pub fn owner(&self) -> Option<OwnerId> {
        *lock(&self.inner.owner)
    }

    /// Changes the server address. Takes effect on the next command.
    pub fn set_address(&self, address: Option<String>) {
        lock(&self.inner.config).set_address(address);
        self.inner.mark_stale();
    }

    /// Changes the user. Takes effect on the next command.
    pub fn set_user(&self, user: Option<String>) {
        lock(&self.inner.config).set_user(user);
        self.inner.mark_stale();
    }

    /// Changes the password. Takes effect on the next command.
    pub fn set_password(&self, password: Option<String>) {
        lock(&self.inner.config).set_password(password);
        self.inner.mark_stale();
    }

    /// Changes the workspace. Takes effect on the next command.
    pub fn set_workspace(&self, workspace: Option<String>) {
        lock(&self.inner.config).set_workspace(workspace);
        self.inner.mark_stale();
    }

    /// Changes the working directory. Takes effect on the next command.
    pub fn set_cwd(&self, cwd: Option<PathBuf>) {
        lock(&self.inner.config).set_cwd(cwd);
        self.inner.mark_stale();
    }

    /// Installs the handler for interactive prompts.
    pub fn set_prompt_handler(&self, handler: Option<PromptCallback>) {
        lock(&self.inner.interactive).prompt = handler;
    }

    /// Installs the handler for merge-resolve prompts.
    pub fn set_resolve_handler(&self, handler: Option<ResolveCallback>) {
        lock(&self.inner.interactive).resolve = handler;
    }

    /// Returns a snapshot of the current configuration.
    pub fn config(&self) -> SessionConfig {
        lock(&self.inner.config).clone()
    }

    /// Returns `true` while a native handle is open.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.conn).handle.is_some()
    }

    /// Returns `true` once the session has been closed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Returns the native handle, if connected.
    pub fn native_handle(&self) -> Option<NativeHandle> {
        lock(&self.inner.conn).handle
    }

    /// Returns what was learned on the most recent connect.
    pub fn server_metadata(&self) -> Option<ServerMetadata> {
        lock(&self.inner.conn).metadata.clone()
    }

    /// Returns `true` if the server requires an explicit login.
    pub fn requires_login(&self) -> Option<bool> {
        self.server_metadata().map(|m| m.requires_login)
    }

    /// Returns the last connect, login or connection-level command error.
    pub fn last_connection_error(&self) -> Option<ServerError> {
        lock(&self.inner.conn).connection_error.clone()
    }

    /// Returns the command currently running, if any.
    pub fn current_command(&self) -> Option<CommandId> {
        self.inner.current_command()
    }

    /// Returns when the last command started.
    pub fn last_run(&self) -> Option<std::time::Instant> {
        lock(&self.inner.last_run).map(Instant::into_std)
    }

    /// Returns `true` while the idle-disconnect timer is armed.
    pub fn idle_timer_running(&self) -> bool {
        self.inner.idle.is_running()
    }

    /// Returns the command timing tracker.
    pub fn timing(&self) -> &CommandTimingTracker {
        &self.inner.timing
    }

    /// Returns the "last results" cache this session writes to.
    pub fn recent_results(&self) -> &Arc<RecentResults> {
        &self.inner.recent
    }
}
