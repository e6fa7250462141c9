//! Async session engine for Perforce-style version-control servers.
//!
//! The engine sits between an application and a native client library that
//! speaks the server protocol. The native library is reached through the
//! [`NativeBoundary`] trait; this crate layers connection lifecycle, command
//! identity, per-command result collection, cancellation, keep-alive timing,
//! idle disconnects and parallel transfers on top of it.
//!
//! Most users should start with [`P4Session`], or with [`SessionRegistry`]
//! when several independent callers need their own connections.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use p4engine::{MockBoundary, OwnerId, P4Session, SessionConfig};
//!
//! fn main() -> p4engine::Result<()> {
//!     let rt = tokio::runtime::Builder::new_multi_thread()
//!         .enable_all()
//!         .build()?;
//!
//!     rt.block_on(async {
//!         let config = SessionConfig::new("localhost:6666")
//!             .with_user("admin")
//!             .with_workspace("admin_space");
//!         let session = P4Session::open(Arc::new(MockBoundary::new()), config).await?;
//!
//!         // Results are scoped to the caller that ran the command.
//!         let me = OwnerId::new();
//!         let info = session.run(me, "info", &[]).await?;
//!         println!("{} record(s)", info.tagged_count());
//!         session.close().await
//!     })
//! }
//! ```
//!
//! ## Features
//!
//! - `serde`: enables `Serialize`/`Deserialize` for public data types.
//!
//! ## Callers and ownership
//!
//! Operations that produce results take the caller's [`OwnerId`]. Command IDs
//! embed the owner, the "last results" cache is keyed by it, and a session
//! bound to one owner rejects every other caller with
//! [`P4Error::ThreadMismatch`] before contacting the server.

#![deny(unsafe_code)]

mod command;
pub mod env;
mod error;
mod idle;
pub mod mock;
mod native;
mod options;
mod parallel;
mod registry;
mod results;
mod session;
mod timing;
mod types;

pub use error::{CommandFailure, P4Error, RECEIVE_INTERRUPTED_CODE, ServerError};
/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, P4Error>;
pub use env::{Environment, MemoryEnvironment};
pub use mock::{MockBoundary, MockCommand, RecordedCommand};
pub use native::{
    BinaryCallback, ConnectOutcome, ConnectRequest, ErrorCallback, InfoCallback,
    KeepAliveCallback, NativeBoundary, NativeCallbacks, NativeHandle, ParallelCallback,
    ParallelTransfer, PromptCallback, ResolveCallback, TaggedCallback, TextCallback,
};
pub use options::{RecentResultsConfig, SessionConfig};
pub use registry::SessionRegistry;
pub use results::{RecentResults, RecordAssembler, ResultAggregator, ResultEvent};
pub use session::{P4Session, SessionBuilder};
pub use timing::CommandTimingTracker;
pub use types::{
    CommandId, ConnectionInfo, Encoding, ErrorItem, InfoMessage, OwnerId, ResolveChoice,
    ResultBundle, ServerMetadata, Severity, TaggedRecord,
};
