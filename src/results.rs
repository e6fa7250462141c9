//! Command-scoped result collection.
//!
//! Output arrives either incrementally through native callbacks or in bulk
//! once a command completes. [`ResultAggregator`] assembles the callback side
//! and broadcasts a [`ResultEvent`] per delivery; [`RecentResults`] keeps the
//! finished bundles per caller.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    CommandId, ErrorItem, InfoMessage, OwnerId, RecentResultsConfig, ResultBundle, TaggedRecord,
};

const EVENT_CAPACITY: usize = 1024;

/// One delivery, broadcast as it arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResultEvent {
    /// An error or warning was delivered.
    ErrorReceived {
        /// Command the error belongs to.
        cmd_id: CommandId,
        /// The error.
        error: ErrorItem,
    },
    /// An informational message was delivered.
    InfoResultsReceived {
        /// Command the message belongs to.
        cmd_id: CommandId,
        /// The message.
        message: InfoMessage,
    },
    /// A structured record was completed.
    TaggedOutputReceived {
        /// Command the record belongs to.
        cmd_id: CommandId,
        /// The completed record.
        record: TaggedRecord,
    },
    /// A chunk of plain text was delivered.
    TextResultsReceived {
        /// Command the text belongs to.
        cmd_id: CommandId,
        /// The text chunk.
        text: String,
    },
    /// A chunk of binary data was delivered.
    BinaryResultsReceived {
        /// Command the data belongs to.
        cmd_id: CommandId,
        /// The data chunk.
        data: Vec<u8>,
    },
}

impl ResultEvent {
    /// Returns the command this event belongs to.
    pub fn cmd_id(&self) -> CommandId {
        match self {
            Self::ErrorReceived { cmd_id, .. }
            | Self::InfoResultsReceived { cmd_id, .. }
            | Self::TaggedOutputReceived { cmd_id, .. }
            | Self::TextResultsReceived { cmd_id, .. }
            | Self::BinaryResultsReceived { cmd_id, .. } => *cmd_id,
        }
    }
}

/// Buffers the fields of one structured record until its boundary.
#[derive(Debug, Default)]
pub struct RecordAssembler {
    current: Option<(usize, TaggedRecord)>,
}

impl RecordAssembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one delivery. Returns the records completed by it, if any.
    ///
    /// `key == None` closes the record at `index`. A field for a new `index`
    /// closes the previous record first.
    pub fn push(
        &mut self,
        index: usize,
        key: Option<&str>,
        value: Option<&str>,
    ) -> Vec<TaggedRecord> {
        let mut done = Vec::new();
        let index_changed = matches!(&self.current, Some((current, _)) if *current != index);
        if index_changed && let Some((_, record)) = self.current.take() {
            done.push(record);
        }
        match key {
            Some(key) => {
                let (_, record) = self
                    .current
                    .get_or_insert_with(|| (index, TaggedRecord::new()));
                record.insert(key.to_string(), value.unwrap_or_default().to_string());
            }
            None => {
                if let Some((_, record)) = self.current.take() {
                    done.push(record);
                }
            }
        }
        done
    }

    /// Discards a record that never saw its boundary. Returns `true` if one was dropped.
    pub fn discard(&mut self) -> bool {
        self.current.take().is_some()
    }
}

#[derive(Debug, Default)]
struct PendingResults {
    bundle: ResultBundle,
    assembler: RecordAssembler,
}

/// Collects callback deliveries per command ID.
#[derive(Debug)]
pub struct ResultAggregator {
    pending: Mutex<HashMap<CommandId, PendingResults>>,
    events: broadcast::Sender<ResultEvent>,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    /// Creates an aggregator with no pending commands.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<CommandId, PendingResults>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ResultEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Subscribes to deliveries for all commands.
    pub fn subscribe(&self) -> broadcast::Receiver<ResultEvent> {
        self.events.subscribe()
    }

    /// Starts collecting for `cmd_id`, dropping anything left from an earlier
    /// command with the same ID.
    pub fn begin(&self, cmd_id: CommandId, command: &str) {
        let mut pending = PendingResults::default();
        pending.bundle.cmd_id = Some(cmd_id);
        pending.bundle.command = command.to_string();
        self.pending().insert(cmd_id, pending);
    }

    /// Returns `true` while `cmd_id` is being collected.
    pub fn is_pending(&self, cmd_id: CommandId) -> bool {
        self.pending().contains_key(&cmd_id)
    }

    /// Applies `deliver` to the pending results of `cmd_id`.
    ///
    /// Deliveries for a command that was never begun, or that already
    /// finished, are dropped and yield `None`.
    fn with_pending<R>(
        &self,
        cmd_id: CommandId,
        kind: &str,
        deliver: impl FnOnce(&mut PendingResults) -> R,
    ) -> Option<R> {
        let mut pending = self.pending();
        let Some(entry) = pending.get_mut(&cmd_id) else {
            debug!(%cmd_id, kind, "dropping delivery for unknown command");
            return None;
        };
        Some(deliver(entry))
    }

    /// Records one field of a structured record.
    pub fn deliver_tagged(
        &self,
        cmd_id: CommandId,
        index: usize,
        key: Option<&str>,
        value: Option<&str>,
    ) {
        let completed = self.with_pending(cmd_id, "tagged", |entry| {
            let completed = entry.assembler.push(index, key, value);
            if !completed.is_empty() {
                entry
                    .bundle
                    .tagged
                    .get_or_insert_with(Vec::new)
                    .extend(completed.iter().cloned());
            }
            completed
        });
        for record in completed.into_iter().flatten() {
            self.publish(ResultEvent::TaggedOutputReceived { cmd_id, record });
        }
    }

    /// Records one informational message.
    pub fn deliver_info(&self, cmd_id: CommandId, message: InfoMessage) {
        let stored = self.with_pending(cmd_id, "info", |entry| {
            entry
                .bundle
                .info
                .get_or_insert_with(Vec::new)
                .push(message.clone());
        });
        if stored.is_some() {
            self.publish(ResultEvent::InfoResultsReceived { cmd_id, message });
        }
    }

    /// Records one error or warning.
    pub fn deliver_error(&self, cmd_id: CommandId, error: ErrorItem) {
        let stored = self.with_pending(cmd_id, "error", |entry| {
            entry
                .bundle
                .errors
                .get_or_insert_with(Vec::new)
                .push(error.clone());
        });
        if stored.is_some() {
            self.publish(ResultEvent::ErrorReceived { cmd_id, error });
        }
    }

    /// Appends a chunk of plain text.
    pub fn deliver_text(&self, cmd_id: CommandId, text: &str) {
        let stored = self.with_pending(cmd_id, "text", |entry| {
            entry
                .bundle
                .text
                .get_or_insert_with(String::new)
                .push_str(text);
        });
        if stored.is_some() {
            self.publish(ResultEvent::TextResultsReceived {
                cmd_id,
                text: text.to_string(),
            });
        }
    }

    /// Appends a chunk of binary data.
    pub fn deliver_binary(&self, cmd_id: CommandId, data: &[u8]) {
        let stored = self.with_pending(cmd_id, "binary", |entry| {
            entry
                .bundle
                .binary
                .get_or_insert_with(Vec::new)
                .extend_from_slice(data);
        });
        if stored.is_some() {
            self.publish(ResultEvent::BinaryResultsReceived {
                cmd_id,
                data: data.to_vec(),
            });
        }
    }

    /// Appends errors gathered elsewhere (for example from parallel
    /// sub-sessions) without broadcasting them again.
    pub fn merge_errors(&self, cmd_id: CommandId, errors: Vec<ErrorItem>) {
        if errors.is_empty() {
            return;
        }
        self.with_pending(cmd_id, "merged errors", |entry| {
            entry
                .bundle
                .errors
                .get_or_insert_with(Vec::new)
                .extend(errors);
        });
    }

    /// Stops collecting for `cmd_id` and returns what was delivered.
    ///
    /// A record still missing its boundary is dropped, so the bundle only
    /// ever holds complete records.
    pub fn finish(&self, cmd_id: CommandId) -> ResultBundle {
        let Some(mut pending) = self.pending().remove(&cmd_id) else {
            return ResultBundle {
                cmd_id: Some(cmd_id),
                ..ResultBundle::default()
            };
        };
        if pending.assembler.discard() {
            debug!(%cmd_id, "dropping unterminated tagged record");
        }
        pending.bundle.cmd_id = Some(cmd_id);
        pending.bundle
    }
}

/// Normalizes a bulk-fetched list: zero items means "no output of this kind".
pub(crate) fn non_empty<T>(items: Option<Vec<T>>) -> Option<Vec<T>> {
    items.filter(|items| !items.is_empty())
}

#[derive(Debug)]
struct CachedBundle {
    bundle: Arc<ResultBundle>,
    stored_at: Instant,
}

/// The most recent result bundles, keyed by the owner that issued them.
///
/// Each owner sees only its own bundles. Once the total entry count exceeds
/// the configured threshold, entries older than the configured age are evicted.
#[derive(Debug, Default)]
pub struct RecentResults {
    config: RecentResultsConfig,
    entries: Mutex<HashMap<OwnerId, VecDeque<CachedBundle>>>,
}

impl RecentResults {
    /// Creates an empty cache.
    pub fn new(config: RecentResultsConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<OwnerId, VecDeque<CachedBundle>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &RecentResultsConfig {
        &self.config
    }

    /// Stores `bundle` as the most recent result of `owner`.
    pub fn insert(&self, owner: OwnerId, bundle: Arc<ResultBundle>) {
        let now = Instant::now();
        let mut entries = self.entries();
        let queue = entries.entry(owner).or_default();
        queue.push_back(CachedBundle {
            bundle,
            stored_at: now,
        });
        while queue.len() > self.config.per_owner() {
            queue.pop_front();
        }

        let total: usize = entries.values().map(VecDeque::len).sum();
        if total > self.config.evict_threshold() {
            let max_age = self.config.max_age();
            for queue in entries.values_mut() {
                queue.retain(|entry| now.saturating_duration_since(entry.stored_at) <= max_age);
            }
            entries.retain(|_, queue| !queue.is_empty());
            debug!(before = total, "evicted stale result bundles");
        }
    }

    /// Returns the most recent bundle issued by `owner`.
    pub fn last(&self, owner: OwnerId) -> Option<Arc<ResultBundle>> {
        self.entries()
            .get(&owner)
            .and_then(|queue| queue.back())
            .map(|entry| entry.bundle.clone())
    }

    /// Finds the cached bundle for `cmd_id`.
    pub fn get(&self, cmd_id: CommandId) -> Option<Arc<ResultBundle>> {
        self.entries()
            .values()
            .flat_map(|queue| queue.iter().rev())
            .find(|entry| entry.bundle.cmd_id == Some(cmd_id))
            .map(|entry| entry.bundle.clone())
    }

    /// Drops every bundle of `owner`.
    pub fn clear_owner(&self, owner: OwnerId) {
        self.entries().remove(&owner);
    }

    /// Returns the total number of cached bundles.
    pub fn len(&self) -> usize {
        self.entries().values().map(VecDeque::len).sum()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::Severity;
    use proptest::prelude::*;
    use std::time::Duration;

    fn id(n: u32) -> CommandId {
        CommandId::compose(OwnerId::from_raw(3), n)
    }

    #[test]
    fn assembler_emits_only_complete_records() {
        let mut assembler = RecordAssembler::new();
        assert!(assembler.push(0, Some("depotFile"), Some("//depot/a")).is_empty());
        assert!(assembler.push(0, Some("rev"), Some("3")).is_empty());
        let done = assembler.push(0, None, None);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].get("rev").map(String::as_str), Some("3"));

        assert!(assembler.push(1, Some("depotFile"), Some("//depot/b")).is_empty());
        assert!(assembler.discard());
        assert!(!assembler.discard());
    }

    #[test]
    fn assembler_closes_record_when_index_changes() {
        let mut assembler = RecordAssembler::new();
        assembler.push(0, Some("a"), Some("1"));
        let done = assembler.push(1, Some("a"), Some("2"));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn aggregator_broadcasts_and_collects() {
        let aggregator = ResultAggregator::new();
        let mut events = aggregator.subscribe();
        let cmd = id(1);
        aggregator.begin(cmd, "fstat");
        aggregator.deliver_tagged(cmd, 0, Some("depotFile"), Some("//depot/a"));
        aggregator.deliver_tagged(cmd, 0, None, None);
        aggregator.deliver_info(cmd, InfoMessage::new(0, "hello"));
        aggregator.deliver_text(cmd, "abc");
        aggregator.deliver_text(cmd, "def");
        aggregator.deliver_binary(cmd, &[1, 2]);
        aggregator.deliver_error(cmd, ErrorItem::new(Severity::Warning, 1, "careful"));

        let bundle = aggregator.finish(cmd);
        assert_eq!(bundle.command, "fstat");
        assert_eq!(bundle.tagged_count(), 1);
        assert_eq!(bundle.text.as_deref(), Some("abcdef"));
        assert_eq!(bundle.binary.as_deref(), Some(&[1u8, 2][..]));
        assert_eq!(bundle.error_list().len(), 1);
        assert!(!aggregator.is_pending(cmd));

        let first = events.try_recv().unwrap();
        assert!(matches!(first, ResultEvent::TaggedOutputReceived { .. }));
        assert_eq!(first.cmd_id(), cmd);
        let mut count = 1;
        while events.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 6);
    }

    #[test]
    fn deliveries_for_unknown_commands_are_dropped() {
        let aggregator = ResultAggregator::new();
        let mut events = aggregator.subscribe();
        let cmd = id(4);
        aggregator.deliver_info(cmd, InfoMessage::new(0, "early"));
        assert!(!aggregator.is_pending(cmd));

        aggregator.begin(cmd, "sync");
        aggregator.deliver_text(cmd, "on time");
        assert_eq!(aggregator.finish(cmd).text.as_deref(), Some("on time"));

        aggregator.deliver_text(cmd, "late");
        aggregator.deliver_tagged(cmd, 0, Some("depotFile"), Some("//depot/a"));
        aggregator.deliver_tagged(cmd, 0, None, None);
        aggregator.deliver_error(cmd, ErrorItem::new(Severity::Warning, 1, "late"));
        aggregator.deliver_binary(cmd, &[9]);
        aggregator.merge_errors(cmd, vec![ErrorItem::new(Severity::Failed, 2, "late")]);
        assert!(!aggregator.is_pending(cmd));
        assert!(aggregator.pending().is_empty());

        assert!(matches!(
            events.try_recv().unwrap(),
            ResultEvent::TextResultsReceived { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn finish_without_output_reports_none_everywhere() {
        let aggregator = ResultAggregator::new();
        let cmd = id(2);
        aggregator.begin(cmd, "info");
        let bundle = aggregator.finish(cmd);
        assert_eq!(bundle.cmd_id, Some(cmd));
        assert!(bundle.tagged.is_none());
        assert!(bundle.info.is_none());
        assert!(bundle.text.is_none());
        assert!(bundle.binary.is_none());
        assert!(bundle.errors.is_none());
    }

    #[test]
    fn empty_text_is_distinct_from_no_text() {
        let aggregator = ResultAggregator::new();
        let cmd = id(3);
        aggregator.begin(cmd, "print");
        aggregator.deliver_text(cmd, "");
        assert_eq!(aggregator.finish(cmd).text.as_deref(), Some(""));
        assert_eq!(non_empty::<u8>(Some(Vec::new())), None);
    }

    #[test]
    fn recent_results_are_scoped_per_owner() {
        let cache = RecentResults::new(RecentResultsConfig::default());
        let a = OwnerId::from_raw(10);
        let b = OwnerId::from_raw(11);
        let bundle = |n| {
            Arc::new(ResultBundle {
                cmd_id: Some(id(n)),
                ..ResultBundle::default()
            })
        };
        cache.insert(a, bundle(1));
        cache.insert(b, bundle(2));
        cache.insert(a, bundle(3));

        assert_eq!(cache.last(a).unwrap().cmd_id, Some(id(3)));
        assert_eq!(cache.last(b).unwrap().cmd_id, Some(id(2)));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(id(1)).is_none());
        assert!(cache.get(id(2)).is_some());
    }

    #[test]
    fn recent_results_evicts_stale_entries_over_threshold() {
        let config = RecentResultsConfig::new(4)
            .unwrap()
            .with_evict_threshold(2)
            .with_max_age(Duration::from_millis(10));
        let cache = RecentResults::new(config);
        let owner = OwnerId::from_raw(12);
        for n in 0..2 {
            cache.insert(
                owner,
                Arc::new(ResultBundle {
                    cmd_id: Some(id(n)),
                    ..ResultBundle::default()
                }),
            );
        }
        std::thread::sleep(Duration::from_millis(20));
        cache.insert(
            owner,
            Arc::new(ResultBundle {
                cmd_id: Some(id(9)),
                ..ResultBundle::default()
            }),
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.last(owner).unwrap().cmd_id, Some(id(9)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn terminated_records_are_all_emitted(sizes in proptest::collection::vec(1usize..5, 0..20)) {
            let mut assembler = RecordAssembler::new();
            let mut records = Vec::new();
            for (index, size) in sizes.iter().enumerate() {
                for field in 0..*size {
                    let key = format!("k{field}");
                    records.extend(assembler.push(index, Some(key.as_str()), Some("v")));
                }
                records.extend(assembler.push(index, None, None));
            }
            prop_assert_eq!(records.len(), sizes.len());
            for (record, size) in records.iter().zip(&sizes) {
                prop_assert_eq!(record.len(), *size);
            }
            prop_assert!(!assembler.discard());
        }
    }
}
