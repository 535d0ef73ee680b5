//! Run context - credentials and shared variables for a bootstrap run
//!
//! Credentials travel through an explicit context object rather than the
//! process environment, so their lifetime is bounded by the run and they can
//! be wiped as soon as the write that consumes them succeeds.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;
use zeroize::Zeroizing;

/// A secret value that zeroes its bytes on drop and redacts in Debug output.
pub struct Sensitive(Zeroizing<String>);

impl Sensitive {
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    /// Borrow the underlying value. Callers must not log or persist it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Explicit copy. Deliberately not `Clone` so duplication is visible at
    /// the call site.
    pub fn duplicate(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Sensitive {
    fn from(value: String) -> Self {
        Self(Zeroizing::new(value))
    }
}

impl From<&str> for Sensitive {
    fn from(value: &str) -> Self {
        Self(Zeroizing::new(value.to_string()))
    }
}

impl fmt::Debug for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sensitive(<redacted>)")
    }
}

/// Execution context for a bootstrap or teardown run
#[derive(Debug)]
pub struct RunContext {
    /// Unique run ID (matches the plan's RunState)
    pub run_id: Uuid,

    /// Address of the secret store (e.g. http://127.0.0.1:8200)
    pub store_addr: String,

    /// Root credential for the secret store
    store_token: Option<Sensitive>,

    /// Non-secret variables available to stage templates (hostnames,
    /// repository URLs, seeded answers)
    pub variables: HashMap<String, String>,

    /// Path where the SSH private key lives or will be generated
    pub ssh_key_path: PathBuf,
}

impl RunContext {
    pub fn new(store_addr: String, store_token: Sensitive, ssh_key_path: PathBuf) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            store_addr,
            store_token: Some(store_token),
            variables: HashMap::new(),
            ssh_key_path,
        }
    }

    /// Borrow the store token, if it has not been scrubbed yet.
    pub fn store_token(&self) -> Option<&Sensitive> {
        self.store_token.as_ref()
    }

    /// Set a template variable
    pub fn set_variable(&mut self, key: String, value: String) {
        self.variables.insert(key, value);
    }

    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    /// Merge a batch of variables (e.g. non-secret answers from seeding)
    pub fn merge_variables(&mut self, vars: HashMap<String, String>) {
        self.variables.extend(vars);
    }

    /// Drop (and thereby zero) all credential material held by the context.
    /// Called once no remaining stage needs the store token.
    pub fn scrub(&mut self) {
        self.store_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_debug_redacts() {
        let s = Sensitive::new("hunter2".to_string());
        assert_eq!(format!("{s:?}"), "Sensitive(<redacted>)");
    }

    #[test]
    fn test_sensitive_duplicate_is_independent() {
        let original = Sensitive::new("hunter2".to_string());
        let copy = original.duplicate();
        drop(original);
        assert_eq!(copy.expose(), "hunter2");
    }

    #[test]
    fn test_context_scrub_removes_token() {
        let mut ctx = RunContext::new(
            "http://127.0.0.1:8200".to_string(),
            Sensitive::from("root-token"),
            PathBuf::from("/tmp/key"),
        );
        assert!(ctx.store_token().is_some());
        ctx.scrub();
        assert!(ctx.store_token().is_none());
    }

    #[test]
    fn test_context_variables() {
        let mut ctx = RunContext::new(
            "http://127.0.0.1:8200".to_string(),
            Sensitive::from("t"),
            PathBuf::from("/tmp/key"),
        );
        ctx.set_variable("netbox_host".to_string(), "netbox.lab".to_string());
        assert_eq!(
            ctx.get_variable("netbox_host"),
            Some(&"netbox.lab".to_string())
        );
        assert_eq!(ctx.get_variable("missing"), None);
    }
}
