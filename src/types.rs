//! Public data types shared by the session engine.
//!
//! Most of these types mirror what the native client layer hands back for a
//! single command: structured records, informational messages, errors, and
//! raw text or binary payloads.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};

/// One structured ("tagged") output record: a flat `field -> value` map.
pub type TaggedRecord = BTreeMap<String, String>;

/// Identity of the caller that owns a session or issued a command.
///
/// This stands in for "the current thread": every thread-scoped operation
/// takes the caller's token explicitly instead of looking it up ambiently.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u32);

static NEXT_OWNER_ID: AtomicU32 = AtomicU32::new(1);

impl OwnerId {
    /// Allocates a fresh, process-unique owner token.
    pub fn new() -> Self {
        Self(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps an existing identifier (for example an OS thread id).
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Unique identifier of one command invocation within a session.
///
/// The value always fits in a non-negative `i32`, which is what the native
/// layer expects.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u32);

impl CommandId {
    /// Number of low bits reserved for the rolling counter.
    pub const COUNTER_BITS: u32 = 16;
    /// Mask applied to the rolling counter.
    pub const COUNTER_MASK: u32 = (1 << Self::COUNTER_BITS) - 1;
    /// Mask applied to the owner identifier before it is shifted into the high bits.
    pub const OWNER_MASK: u32 = 0x7FFF;

    /// Combines an owner identifier (high bits) with a counter value (low bits).
    pub const fn compose(owner: OwnerId, counter: u32) -> Self {
        Self(((owner.0 & Self::OWNER_MASK) << Self::COUNTER_BITS) | (counter & Self::COUNTER_MASK))
    }

    /// Wraps a raw identifier as received from the native layer.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & i32::MAX as u32)
    }

    /// Returns the raw identifier.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the owner bits this identifier was composed from.
    pub const fn owner_bits(self) -> u32 {
        self.0 >> Self::COUNTER_BITS
    }
}

impl Display for CommandId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity attached to an error or informational message.
///
/// The ordering matches the native layer: higher is worse.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// No error.
    Empty,
    /// Informational.
    Info,
    /// A warning; the command may still succeed.
    Warning,
    /// The command failed.
    Failed,
    /// A fatal error, usually at the connection level.
    Fatal,
}

impl Severity {
    /// Maps the native numeric severity. Unknown values are treated as fatal.
    pub fn from_native(value: i32) -> Self {
        match value {
            0 => Self::Empty,
            1 => Self::Info,
            2 => Self::Warning,
            3 => Self::Failed,
            _ => Self::Fatal,
        }
    }

    /// Returns the native numeric severity.
    pub fn as_native(self) -> i32 {
        match self {
            Self::Empty => 0,
            Self::Info => 1,
            Self::Warning => 2,
            Self::Failed => 3,
            Self::Fatal => 4,
        }
    }
}

/// One entry of a command's error list.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorItem {
    /// Error severity.
    pub severity: Severity,
    /// Native error code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
}

impl ErrorItem {
    /// Creates an error entry.
    pub fn new(severity: Severity, code: i32, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
        }
    }
}

impl Display for ErrorItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?}, code {})", self.message, self.severity, self.code)
    }
}

/// One informational message emitted by a command.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfoMessage {
    /// Message level (nesting depth as reported by the server).
    pub level: u32,
    /// Message text.
    pub message: String,
}

impl InfoMessage {
    /// Creates an informational message.
    pub fn new(level: u32, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// String marshaling mode negotiated once per connection.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    /// Byte-oriented server; strings are narrowed to single bytes.
    #[default]
    Ascii,
    /// Unicode-enabled server; strings are sent as UTF-8.
    Unicode,
}

impl Encoding {
    /// Marshals a string for the native layer.
    ///
    /// In [`Encoding::Ascii`] mode every non-ASCII character becomes `?`.
    pub fn marshal(self, value: &str) -> Vec<u8> {
        match self {
            Self::Unicode => value.as_bytes().to_vec(),
            Self::Ascii => value
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }

    /// Decodes bytes produced by [`Encoding::marshal`] or by the native layer.
    pub fn unmarshal(self, bytes: &[u8]) -> String {
        match self {
            Self::Unicode => String::from_utf8_lossy(bytes).into_owned(),
            Self::Ascii => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Connection facts learned right after connecting.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerMetadata {
    /// Negotiated string encoding.
    pub encoding: Encoding,
    /// Protocol API level reported by the native layer.
    pub api_level: u32,
    /// Whether the server demands an explicit `login` command.
    pub requires_login: bool,
}

/// Connection parameters discovered from a working directory's config file.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Server address (`host:port`).
    pub address: Option<String>,
    /// User name.
    pub user: Option<String>,
    /// Workspace (client) name.
    pub workspace: Option<String>,
    /// Password or ticket.
    pub password: Option<String>,
}

/// Everything one command produced.
///
/// Each channel is `None` when the command produced no output of that kind,
/// which is distinct from `Some` holding an empty value.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultBundle {
    /// Command this bundle belongs to.
    pub cmd_id: Option<CommandId>,
    /// Command name.
    pub command: String,
    /// Structured records, in delivery order.
    pub tagged: Option<Vec<TaggedRecord>>,
    /// Informational messages, in delivery order.
    pub info: Option<Vec<InfoMessage>>,
    /// Plain text output.
    pub text: Option<String>,
    /// Binary output.
    pub binary: Option<Vec<u8>>,
    /// Errors and warnings, in delivery order.
    pub errors: Option<Vec<ErrorItem>>,
}

impl ResultBundle {
    /// Returns the number of structured records (zero when there are none).
    pub fn tagged_count(&self) -> usize {
        self.tagged.as_ref().map_or(0, Vec::len)
    }

    /// Returns the errors as a slice (empty when there are none).
    pub fn error_list(&self) -> &[ErrorItem] {
        self.errors.as_deref().unwrap_or_default()
    }

    /// Returns the informational messages as a slice (empty when there are none).
    pub fn info_list(&self) -> &[InfoMessage] {
        self.info.as_deref().unwrap_or_default()
    }
}

/// A user choice returned from a merge-resolve prompt.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolveChoice {
    /// Skip this file.
    #[default]
    Skip,
    /// Accept the server ("theirs") revision.
    AcceptTheirs,
    /// Accept the workspace ("yours") revision.
    AcceptYours,
    /// Accept the merged result.
    AcceptMerged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn command_id_is_never_negative() {
        let owner = OwnerId::from_raw(u32::MAX);
        let id = CommandId::compose(owner, u32::MAX);
        assert!(i32::try_from(id.as_raw()).is_ok());
        assert_eq!(id.owner_bits(), CommandId::OWNER_MASK);
    }

    #[test]
    fn command_ids_from_distinct_owners_differ() {
        let a = CommandId::compose(OwnerId::from_raw(1), 7);
        let b = CommandId::compose(OwnerId::from_raw(2), 7);
        assert_ne!(a, b);
    }

    #[test]
    fn ascii_marshaling_narrows_non_ascii() {
        assert_eq!(Encoding::Ascii.marshal("dépôt"), b"d?p?t".to_vec());
        assert_eq!(Encoding::Unicode.marshal("dépôt"), "dépôt".as_bytes().to_vec());
        assert_eq!(Encoding::Unicode.unmarshal("dépôt".as_bytes()), "dépôt");
    }

    #[test]
    fn severity_round_trips_native_values() {
        assert_eq!(Severity::from_native(2), Severity::Warning);
        assert_eq!(Severity::from_native(42), Severity::Fatal);
        assert!(Severity::Failed > Severity::Warning);
    }

    #[test]
    fn empty_bundle_reports_no_output() {
        let bundle = ResultBundle::default();
        assert_eq!(bundle.tagged_count(), 0);
        assert!(bundle.error_list().is_empty());
        assert!(bundle.text.is_none());
    }

    proptest! {
        #[test]
        fn composed_ids_fit_i32_and_keep_owner_bits(owner in any::<u32>(), counter in any::<u32>()) {
            let id = CommandId::compose(OwnerId::from_raw(owner), counter);
            prop_assert!(i32::try_from(id.as_raw()).is_ok());
            prop_assert_eq!(id.owner_bits(), owner & CommandId::OWNER_MASK);
            prop_assert_eq!(id.as_raw() & CommandId::COUNTER_MASK, counter & CommandId::COUNTER_MASK);
        }
    }
}
