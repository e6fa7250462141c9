//! Parallel transfers and command cancellation.
//!
//! When the native layer hands over a bulk transfer, the file batches are
//! spread over short-lived sub-sessions that share the primary session's
//! parameters. Their errors are merged into the primary command's results.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::native::ParallelTransfer;
use crate::session::{SessionInner, lock};
use crate::{CommandId, ErrorItem, OwnerId, P4Error, P4Session, Severity};

#[derive(Debug, Default)]
pub(crate) struct ParallelCoordinator {
    runtime: Mutex<Option<Handle>>,
    sessions: Mutex<Vec<P4Session>>,
    errors: Mutex<Vec<ErrorItem>>,
    active: AtomicUsize,
}

impl ParallelCoordinator {
    /// Forgets errors from the previous command.
    pub(crate) fn reset(&self) {
        lock(&self.errors).clear();
    }

    /// Records the runtime sub-sessions are driven on.
    pub(crate) fn arm(&self, runtime: Handle) {
        *lock(&self.runtime) = Some(runtime);
    }

    pub(crate) fn active_sessions(&self) -> Vec<P4Session> {
        lock(&self.sessions).clone()
    }

    pub(crate) fn active_operations(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn errors(&self) -> Vec<ErrorItem> {
        lock(&self.errors).clone()
    }

    /// Runs `transfer` for the primary command `cmd_id`. Called from the
    /// native layer on the blocking pool; returns `true` if every
    /// sub-session succeeded.
    pub(crate) fn run(
        &self,
        primary: &Arc<SessionInner>,
        cmd_id: CommandId,
        transfer: ParallelTransfer,
    ) -> bool {
        let Some(runtime) = lock(&self.runtime).clone() else {
            warn!(%cmd_id, "parallel transfer requested outside a running command");
            return false;
        };
        let batches: Vec<Vec<String>> = transfer
            .batches
            .into_iter()
            .filter(|batch| !batch.is_empty())
            .collect();
        if batches.is_empty() {
            return true;
        }

        let workers = transfer.threads.clamp(1, batches.len());
        let mut groups: Vec<Vec<String>> = vec![Vec::new(); workers];
        for (i, batch) in batches.into_iter().enumerate() {
            groups[i % workers].extend(batch);
        }

        let config = lock(&primary.config)
            .clone()
            .with_idle_timeout(None)
            .with_parallel_transfers(false);
        let subs: Vec<P4Session> = (0..workers)
            .map(|_| P4Session::new(primary.boundary.clone(), config.clone()))
            .collect();
        lock(&self.sessions).extend(subs.iter().cloned());
        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(%cmd_id, command = %transfer.command, workers, "starting parallel transfer");

        let command = transfer.command;
        let args = transfer.args;
        let joined = runtime.block_on(async move {
            let mut set = JoinSet::new();
            for (sub, files) in subs.into_iter().zip(groups) {
                let command = command.clone();
                let mut args = args.clone();
                args.extend(files);
                set.spawn(async move {
                    let owner = OwnerId::new();
                    let sub_id = sub.next_command_id(owner);
                    let result = sub.run_command(owner, &command, sub_id, false, &args).await;
                    if let Err(err) = sub.close().await {
                        debug!(error = %err, "closing parallel sub-session failed");
                    }
                    result
                });
            }
            let mut outcomes = Vec::new();
            while let Some(outcome) = set.join_next().await {
                outcomes.push(outcome);
            }
            outcomes
        });

        let mut success = true;
        let mut errors = Vec::new();
        for outcome in joined {
            match outcome {
                Ok(Ok(bundle)) => errors.extend(bundle.error_list().iter().cloned()),
                Ok(Err(err)) => {
                    success = false;
                    errors.extend(error_items(&err));
                }
                Err(err) => {
                    success = false;
                    errors.push(ErrorItem::new(
                        Severity::Fatal,
                        0,
                        format!("parallel worker did not complete: {err}"),
                    ));
                }
            }
        }
        debug!(%cmd_id, success, errors = errors.len(), "parallel transfer finished");
        primary.results.merge_errors(cmd_id, errors.clone());
        lock(&self.errors).extend(errors);
        lock(&self.sessions).clear();
        self.active.fetch_sub(1, Ordering::SeqCst);
        success
    }
}

fn error_items(err: &P4Error) -> Vec<ErrorItem> {
    match err.errors() {
        [] => vec![ErrorItem::new(Severity::Failed, 0, err.to_string())],
        items => items.to_vec(),
    }
}

impl SessionInner {
    /// Interrupts `cmd_id`, including any parallel sub-sessions it spawned.
    pub(crate) fn cancel(&self, cmd_id: CommandId) {
        let subs = self.parallel.active_sessions();
        for sub in &subs {
            if let Some(sub_cmd) = sub.current_command() {
                sub.inner.cancel(sub_cmd);
            }
        }
        let handle = lock(&self.conn).handle;
        match handle {
            Some(handle) => {
                debug!(%cmd_id, sub_sessions = subs.len(), "canceling command");
                self.boundary.cancel_command(handle, cmd_id);
            }
            None => debug!(%cmd_id, "cancel requested without an open connection"),
        }
    }
}

impl P4Session {
    /// Asks the native layer to interrupt `cmd_id`.
    ///
    /// Safe to call from any task while the command runs. The interrupted
    /// command returns [`P4Error::Canceled`].
    pub fn cancel_command(&self, cmd_id: CommandId) {
        self.inner.cancel(cmd_id);
    }

    /// Number of parallel transfers in flight.
    pub fn active_parallel_operations(&self) -> usize {
        self.inner.parallel.active_operations()
    }

    /// Errors gathered from sub-sessions during the current or last command.
    pub fn parallel_errors(&self) -> Vec<ErrorItem> {
        self.inner.parallel.errors()
    }
}
