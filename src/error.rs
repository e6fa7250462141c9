use thiserror::Error;

use crate::{CommandId, ErrorItem, InfoMessage, OwnerId, Severity};

/// Native error code reported when a command's receive loop was interrupted
/// by a client-side cancel.
pub const RECEIVE_INTERRUPTED_CODE: i32 = 7_206;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// A list of errors returned by the native layer for one operation.
///
/// `context` is typically the command name and `chain` is the error list in
/// delivery order.
pub struct ServerError {
    /// High-level context for the failure (for example, the command name).
    pub context: Option<String>,
    /// The error list.
    pub chain: Vec<ErrorItem>,
}

impl ServerError {
    /// Creates an error from a list of entries.
    pub fn new(chain: Vec<ErrorItem>) -> Self {
        Self {
            context: None,
            chain,
        }
    }

    /// Creates a single fatal entry with no native code.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(vec![ErrorItem::new(Severity::Fatal, 0, message)])
    }

    /// Attaches additional context to this error.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Returns the highest severity in the chain.
    pub fn max_severity(&self) -> Severity {
        self.chain
            .iter()
            .map(|e| e.severity)
            .max()
            .unwrap_or(Severity::Empty)
    }

    /// Returns a single-line, human-readable message.
    pub fn message_summary(&self) -> String {
        let messages: Vec<&str> = self
            .chain
            .iter()
            .map(|e| e.message.trim())
            .filter(|m| !m.is_empty())
            .collect();
        if messages.is_empty() {
            "unknown error".to_string()
        } else {
            messages.join("; ")
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ctx) = self.context.as_deref()
            && !ctx.is_empty()
        {
            write!(f, "{ctx}: ")?;
        }
        write!(f, "{}", self.message_summary())
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
/// A command the native layer reported as failed.
pub struct CommandFailure {
    /// Command name.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Command identifier.
    pub cmd_id: CommandId,
    /// The full error list.
    pub errors: ServerError,
    /// Informational messages gathered up to the failure.
    pub info: Vec<InfoMessage>,
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' failed: {}", self.command, self.errors.message_summary())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
/// Errors returned by this crate.
pub enum P4Error {
    /// No native connection could be obtained, or the connection broke.
    #[error("connection error: {0}")]
    Connection(ServerError),
    /// The native layer reported the command as failed.
    #[error("command error: {0}")]
    Command(Box<CommandFailure>),
    /// The command was interrupted by a caller-issued cancel.
    #[error("command '{command}' ({cmd_id}) was canceled")]
    Canceled {
        /// Command name.
        command: String,
        /// Command identifier.
        cmd_id: CommandId,
        /// Errors the native layer reported for the interrupted command.
        errors: ServerError,
    },
    /// The session is bound to a different owner than the caller.
    #[error("session is owned by {owner} but was used by {caller}")]
    ThreadMismatch {
        /// Declared owner of the session.
        owner: OwnerId,
        /// Caller that attempted the operation.
        caller: OwnerId,
    },
    /// The session has already been closed.
    #[error("session has been disposed")]
    Disposed,
    /// A configuration value is missing or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Reading a local file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// An internal invariant broke (for example, a native worker panicked).
    #[error("internal error: {0}")]
    Internal(String),
}

impl P4Error {
    /// Returns `true` for errors that indicate caller misuse or a dead
    /// connection rather than a command-level failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ThreadMismatch { .. } | Self::Disposed | Self::Internal(_)
        )
    }

    /// Returns `true` if this error is the result of a cancel request.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Returns the native error list attached to this error, if any.
    pub fn errors(&self) -> &[ErrorItem] {
        match self {
            Self::Connection(server) => &server.chain,
            Self::Command(failure) => &failure.errors.chain,
            Self::Canceled { errors, .. } => &errors.chain,
            _ => &[],
        }
    }
}

/// Returns `true` if `item` carries the "receive interrupted by client" signature.
pub(crate) fn is_receive_interrupted(item: &ErrorItem) -> bool {
    item.code == RECEIVE_INTERRUPTED_CODE
        || item
            .message
            .to_ascii_lowercase()
            .contains("interrupted by client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_joins_non_empty_messages() {
        let err = ServerError::new(vec![
            ErrorItem::new(Severity::Failed, 1, "first"),
            ErrorItem::new(Severity::Warning, 2, "  "),
            ErrorItem::new(Severity::Failed, 3, "second"),
        ])
        .with_context("sync");
        assert_eq!(err.to_string(), "sync: first; second");
        assert_eq!(err.max_severity(), Severity::Failed);
    }

    #[test]
    fn empty_chain_is_unknown_error() {
        assert_eq!(ServerError::default().message_summary(), "unknown error");
        assert_eq!(ServerError::default().max_severity(), Severity::Empty);
    }

    #[test]
    fn interrupt_signature_matches_code_or_message() {
        assert!(is_receive_interrupted(&ErrorItem::new(
            Severity::Failed,
            RECEIVE_INTERRUPTED_CODE,
            "",
        )));
        assert!(is_receive_interrupted(&ErrorItem::new(
            Severity::Fatal,
            0,
            "Receive Interrupted By Client.",
        )));
        assert!(!is_receive_interrupted(&ErrorItem::new(
            Severity::Failed,
            1,
            "file(s) not on client",
        )));
    }

    #[test]
    fn fatal_classification() {
        assert!(P4Error::Disposed.is_fatal());
        assert!(
            P4Error::ThreadMismatch {
                owner: OwnerId::from_raw(1),
                caller: OwnerId::from_raw(2),
            }
            .is_fatal()
        );
        assert!(!P4Error::InvalidConfig("x".into()).is_fatal());
    }
}
