//! Named environment settings (`P4PORT`, `P4CONFIG`, ticket paths, ...).
//!
//! The native layer keeps these in a process-wide store. Here the store is an
//! object handed to whoever needs it, so independent sessions (and tests) do
//! not see each other's settings.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Well-known variable naming the server address.
pub const P4PORT: &str = "P4PORT";
/// Well-known variable naming the user.
pub const P4USER: &str = "P4USER";
/// Well-known variable naming the workspace.
pub const P4CLIENT: &str = "P4CLIENT";
/// Well-known variable holding a password.
pub const P4PASSWD: &str = "P4PASSWD";
/// Well-known variable naming the per-directory config file.
pub const P4CONFIG: &str = "P4CONFIG";
/// Well-known variable naming the ticket file.
pub const P4TICKETS: &str = "P4TICKETS";

/// A read/write store of named string settings.
pub trait Environment: Send + Sync {
    /// Returns the value of `name`, if set.
    fn get(&self, name: &str) -> Option<String>;

    /// Sets `name` to `value`, or removes it when `value` is `None`.
    fn set(&self, name: &str, value: Option<&str>);

    /// Sets `name` only if it is already present. Returns `true` if it was updated.
    fn update(&self, name: &str, value: &str) -> bool {
        if self.get(name).is_some() {
            self.set(name, Some(value));
            true
        } else {
            false
        }
    }
}

/// An in-memory [`Environment`].
#[derive(Debug, Default)]
pub struct MemoryEnvironment {
    vars: Mutex<HashMap<String, String>>,
}

impl MemoryEnvironment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an environment pre-populated with `vars`.
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Mutex::new(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Copies the `P4*` variables of the current process into a new store.
    pub fn from_process() -> Self {
        Self::with_vars(std::env::vars().filter(|(k, _)| k.starts_with("P4")))
    }
}

impl Environment for MemoryEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn set(&self, name: &str, value: Option<&str>) {
        let mut vars = self.vars.lock().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(value) => {
                vars.insert(name.to_string(), value.to_string());
            }
            None => {
                vars.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_and_remove() {
        let env = MemoryEnvironment::new();
        assert_eq!(env.get(P4PORT), None);
        env.set(P4PORT, Some("localhost:6666"));
        assert_eq!(env.get(P4PORT).as_deref(), Some("localhost:6666"));
        env.set(P4PORT, None);
        assert_eq!(env.get(P4PORT), None);
    }

    #[test]
    fn update_only_touches_existing_names() {
        let env = MemoryEnvironment::with_vars([(P4USER, "admin")]);
        assert!(!env.update(P4CLIENT, "ws"));
        assert_eq!(env.get(P4CLIENT), None);
        assert!(env.update(P4USER, "bob"));
        assert_eq!(env.get(P4USER).as_deref(), Some("bob"));
    }

    #[test]
    fn stores_are_isolated() {
        let a = MemoryEnvironment::new();
        let b = MemoryEnvironment::new();
        a.set(P4CONFIG, Some(".p4config"));
        assert_eq!(b.get(P4CONFIG), None);
    }
}
