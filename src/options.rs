//! Connection and engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::env::{Environment, P4CLIENT, P4PASSWD, P4PORT, P4USER};
use crate::{ConnectionInfo, P4Error};

/// Connection parameters and engine policies for one session.
///
/// Build with [`SessionConfig::new`] and the `with_*` setters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    address: Option<String>,
    user: Option<String>,
    password: Option<String>,
    workspace: Option<String>,
    cwd: Option<PathBuf>,
    program_name: String,
    program_version: String,
    idle_timeout: Option<Duration>,
    run_timeout: Duration,
    close_grace: Duration,
    parallel_transfers: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: None,
            user: None,
            password: None,
            workspace: None,
            cwd: None,
            program_name: env!("CARGO_PKG_NAME").to_string(),
            program_version: env!("CARGO_PKG_VERSION").to_string(),
            idle_timeout: Some(Duration::from_secs(5)),
            run_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(1),
            parallel_transfers: false,
        }
    }
}

impl SessionConfig {
    /// Creates a configuration for a server address (`host:port`).
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Creates a configuration whose address, user and workspace are
    /// discovered from config files above `cwd` when the session connects.
    pub fn from_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }

    /// Creates a configuration from the `P4PORT`, `P4USER`, `P4CLIENT` and
    /// `P4PASSWD` settings of `env`.
    pub fn from_environment(env: &dyn Environment) -> Self {
        Self {
            address: env.get(P4PORT),
            user: env.get(P4USER),
            workspace: env.get(P4CLIENT),
            password: env.get(P4PASSWD),
            ..Self::default()
        }
    }

    /// Sets the server address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the user name.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the password (or ticket).
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the workspace name.
    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the program name and version reported to the server.
    #[must_use]
    pub fn with_program(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.program_name = name.into();
        self.program_version = version.into();
        self
    }

    /// Sets the inactivity window after which the connection is dropped.
    ///
    /// `None` disables idle disconnects.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets how long a command may go without contact before the keep-alive
    /// check abandons it.
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Sets how long closing waits for a canceled command to exit.
    #[must_use]
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Enables splitting bulk transfers across parallel sub-sessions.
    #[must_use]
    pub fn with_parallel_transfers(mut self, enabled: bool) -> Self {
        self.parallel_transfers = enabled;
        self
    }

    /// Returns the server address.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Returns the user name.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Returns the password.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Returns the workspace name.
    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    /// Returns the working directory.
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Returns the program name.
    pub fn program_name(&self) -> &str {
        &self.program_name
    }

    /// Returns the program version.
    pub fn program_version(&self) -> &str {
        &self.program_version
    }

    /// Returns the idle-disconnect window.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Returns the per-command run timeout.
    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    /// Returns the close grace period.
    pub fn close_grace(&self) -> Duration {
        self.close_grace
    }

    /// Returns `true` if parallel transfers are enabled.
    pub fn parallel_transfers(&self) -> bool {
        self.parallel_transfers
    }

    pub(crate) fn set_address(&mut self, address: Option<String>) {
        self.address = address;
    }

    pub(crate) fn set_user(&mut self, user: Option<String>) {
        self.user = user;
    }

    pub(crate) fn set_password(&mut self, password: Option<String>) {
        self.password = password;
    }

    pub(crate) fn set_workspace(&mut self, workspace: Option<String>) {
        self.workspace = workspace;
    }

    pub(crate) fn set_cwd(&mut self, cwd: Option<PathBuf>) {
        self.cwd = cwd;
    }

    /// Fills parameters missing from this config with discovered values.
    pub(crate) fn fill_missing(&mut self, info: ConnectionInfo) {
        if self.address.is_none() {
            self.address = info.address;
        }
        if self.user.is_none() {
            self.user = info.user;
        }
        if self.workspace.is_none() {
            self.workspace = info.workspace;
        }
        if self.password.is_none() {
            self.password = info.password;
        }
    }

    /// Returns `true` if connecting should consult config files under `cwd`.
    pub(crate) fn needs_discovery(&self) -> bool {
        self.cwd.is_some()
            && (self.address.is_none() || self.user.is_none() || self.workspace.is_none())
    }
}

/// Bounds for the shared "last results" cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecentResultsConfig {
    per_owner: usize,
    evict_threshold: usize,
    max_age: Duration,
}

impl Default for RecentResultsConfig {
    fn default() -> Self {
        Self {
            per_owner: 1,
            evict_threshold: 100,
            max_age: Duration::from_secs(10 * 60),
        }
    }
}

impl RecentResultsConfig {
    /// Creates a config keeping `per_owner` bundles per owner.
    pub fn new(per_owner: usize) -> Result<Self, P4Error> {
        if per_owner == 0 {
            return Err(P4Error::InvalidConfig("per_owner must be > 0".into()));
        }
        Ok(Self {
            per_owner,
            ..Self::default()
        })
    }

    /// Sets the total entry count above which old entries are evicted.
    #[must_use]
    pub fn with_evict_threshold(mut self, threshold: usize) -> Self {
        self.evict_threshold = threshold;
        self
    }

    /// Sets the age past which entries are evicted once over the threshold.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Returns the number of bundles kept per owner.
    pub fn per_owner(&self) -> usize {
        self.per_owner
    }

    /// Returns the eviction threshold.
    pub fn evict_threshold(&self) -> usize {
        self.evict_threshold
    }

    /// Returns the maximum entry age.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::env::MemoryEnvironment;

    #[test]
    fn environment_defaults() {
        let env = MemoryEnvironment::with_vars([
            (P4PORT, "localhost:6666"),
            (P4USER, "admin"),
            (P4CLIENT, "admin_space"),
        ]);
        let config = SessionConfig::from_environment(&env);
        assert_eq!(config.address(), Some("localhost:6666"));
        assert_eq!(config.user(), Some("admin"));
        assert_eq!(config.workspace(), Some("admin_space"));
        assert_eq!(config.password(), None);
    }

    #[test]
    fn discovery_only_fills_gaps() {
        let mut config = SessionConfig::from_cwd("/work").with_user("alice");
        assert!(config.needs_discovery());
        config.fill_missing(ConnectionInfo {
            address: Some("ssl:host:1666".into()),
            user: Some("bob".into()),
            workspace: Some("ws".into()),
            password: None,
        });
        assert_eq!(config.address(), Some("ssl:host:1666"));
        assert_eq!(config.user(), Some("alice"));
        assert!(!config.needs_discovery());
    }

    #[test]
    fn recent_results_config_rejects_zero_depth() {
        assert!(matches!(
            RecentResultsConfig::new(0),
            Err(P4Error::InvalidConfig(_))
        ));
        let config = RecentResultsConfig::new(3)
            .unwrap()
            .with_evict_threshold(10)
            .with_max_age(Duration::from_secs(1));
        assert_eq!(config.per_owner(), 3);
        assert_eq!(config.evict_threshold(), 10);
    }
}
