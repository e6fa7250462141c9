//! Running commands and reading their results.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::is_receive_interrupted;
use crate::native::NativeHandle;
use crate::results::{ResultEvent, non_empty};
use crate::session::{SessionInner, blocking, lock};
use crate::{
    CommandFailure, CommandId, ErrorItem, InfoMessage, OwnerId, P4Error, P4Session, ResultBundle,
    ServerError, TaggedRecord,
};

/// Bookkeeping for the command holding the run-lock.
///
/// Entering stops the idle timer and registers the command with the timing
/// tracker and the aggregator. Dropping undoes the registration and rearms
/// the idle timer. The scope travels with the native call, so it ends when
/// the native layer returns, not when the caller stops waiting.
struct CommandScope {
    inner: Arc<SessionInner>,
    cmd_id: CommandId,
}

impl CommandScope {
    fn enter(inner: Arc<SessionInner>, cmd_id: CommandId, command: &str) -> Self {
        inner.idle.stop();
        *lock(&inner.last_run) = Some(Instant::now());
        *lock(&inner.current) = Some(cmd_id);
        inner.parallel.reset();
        if lock(&inner.config).parallel_transfers() {
            inner.parallel.arm(tokio::runtime::Handle::current());
        }
        inner.timing.start(cmd_id);
        inner.results.begin(cmd_id, command);
        Self { inner, cmd_id }
    }
}

impl Drop for CommandScope {
    fn drop(&mut self) {
        let inner = &self.inner;
        {
            let mut current = lock(&inner.current);
            if *current == Some(self.cmd_id) {
                *current = None;
            }
        }
        inner.timing.remove(self.cmd_id);
        inner.touch_activity();
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(window) = lock(&inner.config).idle_timeout() {
            inner.idle.restart(Arc::downgrade(inner), window);
        }
    }
}

impl SessionInner {
    pub(crate) fn next_counter(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the session-local slot of `caller`, assigning the next free
    /// one on first use.
    pub(crate) fn owner_slot(&self, caller: OwnerId) -> OwnerId {
        let mut slots = lock(&self.owner_slots);
        let next = (slots.len() as u32).wrapping_add(1);
        *slots.entry(caller).or_insert(OwnerId::from_raw(next))
    }

    /// Runs one command on the blocking pool. Always returns what was
    /// collected, together with the verdict.
    fn execute(
        self: &Arc<Self>,
        command: &str,
        cmd_id: CommandId,
        tagged: bool,
        args: &[String],
    ) -> (ResultBundle, Result<(), P4Error>) {
        let (handle, metadata) = match self.ensure_connected() {
            Ok(connected) => connected,
            Err(err) => return (self.results.finish(cmd_id), Err(err)),
        };
        let config = lock(&self.config).clone();
        if config.parallel_transfers() {
            self.boundary.set_callbacks(handle, self.callbacks(&config));
        }

        let marshaled: Vec<Vec<u8>> = args
            .iter()
            .map(|arg| metadata.encoding.marshal(arg))
            .collect();
        debug!(command, %cmd_id, tagged, args = args.len(), "running command");
        let ok = self
            .boundary
            .run_command(handle, command, cmd_id, tagged, &marshaled);

        let bundle = self.collect(handle, cmd_id);
        let verdict = self.classify(ok, command, cmd_id, args, &bundle);
        (bundle, verdict)
    }

    /// Finishes callback collection and fills whatever the callbacks did not
    /// deliver from the bulk getters.
    fn collect(&self, handle: NativeHandle, cmd_id: CommandId) -> ResultBundle {
        let mut bundle = self.results.finish(cmd_id);
        if bundle.errors.is_none() {
            bundle.errors = non_empty(self.boundary.error_results(handle, cmd_id));
        }
        if bundle.info.is_none() {
            bundle.info = non_empty(self.boundary.info_results(handle, cmd_id));
        }
        if bundle.tagged.is_none() {
            bundle.tagged = non_empty(self.boundary.tagged_output(handle, cmd_id));
        }
        if bundle.text.is_none() {
            bundle.text = self
                .boundary
                .text_results(handle, cmd_id)
                .filter(|text| !text.is_empty());
        }
        if bundle.binary.is_none() {
            bundle.binary = self
                .boundary
                .binary_results(handle, cmd_id)
                .filter(|data| !data.is_empty());
        }
        self.boundary.release_results(handle, cmd_id);
        bundle
    }

    /// Turns the native verdict into a result.
    ///
    /// The native success flag is authoritative: a successful command keeps
    /// its warnings in the bundle and is not escalated.
    fn classify(
        &self,
        ok: bool,
        command: &str,
        cmd_id: CommandId,
        args: &[String],
        bundle: &ResultBundle,
    ) -> Result<(), P4Error> {
        if ok {
            if let Some(warnings) = &bundle.errors {
                debug!(command, %cmd_id, count = warnings.len(), "command succeeded with warnings");
            }
            return Ok(());
        }

        let errors = bundle.error_list();
        if errors.is_empty() {
            let error = self
                .boundary
                .connection_error()
                .map(|item| ServerError::new(vec![item]))
                .unwrap_or_else(|| ServerError::fatal("command failed without reporting an error"))
                .with_context(command);
            warn!(command, %cmd_id, error = %error, "connection-level failure; connection will be re-established");
            let mut conn = lock(&self.conn);
            conn.stale = true;
            conn.connection_error = Some(error.clone());
            return Err(P4Error::Connection(error));
        }

        let server = ServerError::new(errors.to_vec()).with_context(command);
        if errors.iter().any(is_receive_interrupted) {
            debug!(command, %cmd_id, "command canceled");
            return Err(P4Error::Canceled {
                command: command.to_string(),
                cmd_id,
                errors: server,
            });
        }
        debug!(command, %cmd_id, error = %server, "command failed");
        Err(P4Error::Command(Box::new(CommandFailure {
            command: command.to_string(),
            args: args.to_vec(),
            cmd_id,
            errors: server,
            info: bundle.info_list().to_vec(),
        })))
    }
}

impl P4Session {
    /// Returns a fresh command ID for `caller`.
    ///
    /// Each caller gets a session-local owner slot, numbered from 1 in order
    /// of first use, whose bits sit above a per-session 16-bit counter. IDs
    /// from the first 32767 callers of a session never share owner bits.
    /// Past that, slots wrap and two callers may share owner bits; their IDs
    /// then stay distinct only until the counter wraps after 65536 commands.
    pub fn next_command_id(&self, caller: OwnerId) -> CommandId {
        CommandId::compose(self.inner.owner_slot(caller), self.inner.next_counter())
    }

    /// Runs `command` in tagged mode with a fresh command ID.
    pub async fn run(
        &self,
        caller: OwnerId,
        command: &str,
        args: &[String],
    ) -> Result<Arc<ResultBundle>, P4Error> {
        let cmd_id = self.next_command_id(caller);
        self.run_command(caller, command, cmd_id, true, args).await
    }

    /// Runs `command` and waits for it to finish.
    ///
    /// At most one command runs per session; concurrent calls queue on the
    /// run-lock. The returned bundle is also stored as `caller`'s last results,
    /// whether or not the command succeeded.
    ///
    /// Dropping the returned future does not stop the native call. The
    /// session stays busy, and its results are still recorded, until the
    /// native layer returns. Use [`cancel_command`](Self::cancel_command) to
    /// interrupt it.
    ///
    /// # Errors
    ///
    /// * [`P4Error::ThreadMismatch`] if the session is bound to another owner.
    ///   Nothing is sent to the server in that case.
    /// * [`P4Error::Connection`] if no connection could be obtained or the
    ///   command failed without reporting an error.
    /// * [`P4Error::Canceled`] if the command was interrupted by
    ///   [`cancel_command`](Self::cancel_command).
    /// * [`P4Error::Command`] for any other reported failure.
    pub async fn run_command(
        &self,
        caller: OwnerId,
        command: &str,
        cmd_id: CommandId,
        tagged: bool,
        args: &[String],
    ) -> Result<Arc<ResultBundle>, P4Error> {
        let inner = &self.inner;
        inner.check_owner(caller)?;
        inner.check_disposed()?;
        let running = inner.run_lock.clone().lock_owned().await;
        inner.check_disposed()?;

        let scope = CommandScope::enter(inner.clone(), cmd_id, command);
        let (name, owned_args) = (command.to_string(), args.to_vec());
        let outcome = blocking(inner, move |inner| {
            let (bundle, verdict) = inner.execute(&name, cmd_id, tagged, &owned_args);
            let bundle = Arc::new(bundle);
            inner.recent.insert(caller, bundle.clone());
            drop(scope);
            drop(running);
            (bundle, verdict)
        })
        .await;
        match outcome {
            Ok((bundle, verdict)) => verdict.map(|()| bundle),
            Err(err) => {
                inner.results.finish(cmd_id);
                Err(err)
            }
        }
    }

    /// Subscribes to deliveries as they arrive from the native layer.
    pub fn subscribe(&self) -> broadcast::Receiver<ResultEvent> {
        self.inner.results.subscribe()
    }

    /// Returns the most recent bundle `caller` received.
    pub fn last_results(&self, caller: OwnerId) -> Option<Arc<ResultBundle>> {
        self.inner.recent.last(caller)
    }

    /// Returns the cached bundle for `cmd_id`.
    pub fn results(&self, cmd_id: CommandId) -> Option<Arc<ResultBundle>> {
        self.inner.recent.get(cmd_id)
    }

    /// Returns the errors of `cmd_id`. `None` means no errors were reported.
    pub fn get_error_results(&self, cmd_id: CommandId) -> Option<Vec<ErrorItem>> {
        self.results(cmd_id).and_then(|bundle| bundle.errors.clone())
    }

    /// Returns the informational messages of `cmd_id`.
    pub fn get_info_results(&self, cmd_id: CommandId) -> Option<Vec<InfoMessage>> {
        self.results(cmd_id).and_then(|bundle| bundle.info.clone())
    }

    /// Returns the tagged records of `cmd_id`.
    pub fn get_tagged_output(&self, cmd_id: CommandId) -> Option<Vec<TaggedRecord>> {
        self.results(cmd_id).and_then(|bundle| bundle.tagged.clone())
    }

    /// Returns the text output of `cmd_id`.
    pub fn get_text_results(&self, cmd_id: CommandId) -> Option<String> {
        self.results(cmd_id).and_then(|bundle| bundle.text.clone())
    }

    /// Returns the binary output of `cmd_id`.
    pub fn get_binary_results(&self, cmd_id: CommandId) -> Option<Vec<u8>> {
        self.results(cmd_id).and_then(|bundle| bundle.binary.clone())
    }

    /// Suspends the keep-alive deadline of `cmd_id`. Nests.
    pub fn pause_timer(&self, cmd_id: CommandId) {
        self.inner.timing.pause(cmd_id);
    }

    /// Undoes one [`pause_timer`](Self::pause_timer) and refreshes the
    /// deadline.
    pub fn continue_timer(&self, cmd_id: CommandId) {
        self.inner.timing.resume(cmd_id);
    }
}
