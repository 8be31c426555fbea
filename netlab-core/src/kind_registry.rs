//! Node kind registry
//!
//! Maps every kind name (and its aliases) to one shared [`KindEntry`]. The
//! registry is built once at process start, usually by
//! `netlab_kinds::build_registry()`, and is read-only afterwards, so the
//! orchestrator shares it behind an `Arc` without locking.

use crate::config::ReadinessConfig;
use crate::error::{NetlabError, NetlabResult};
use crate::link::LinkEndpointType;
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Default login of a node kind
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Kind-level knobs the orchestrator may consult without knowing the kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PlatformHints {
    /// Readiness polling override for slow-booting kinds
    pub readiness: Option<ReadinessConfig>,
    /// The node runs a VM inside its container
    pub vm_based: bool,
    /// Generate a TLS certificate for the node before PreDeploy
    pub needs_certificate: bool,
    /// How the kind's endpoints are wired, for discovery output
    pub endpoint_type: Option<LinkEndpointType>,
    pub attributes: BTreeMap<String, String>,
}

/// Constructor of a fresh, uninitialized node
pub type NodeConstructor = Arc<dyn Fn() -> Arc<dyn Node> + Send + Sync>;

/// One registered kind, shared by all of its aliases
#[derive(Clone)]
pub struct KindEntry {
    names: Vec<String>,
    construct: NodeConstructor,
    credentials: Option<Credentials>,
    interface_name_format: Option<String>,
    platform_hints: PlatformHints,
}

impl KindEntry {
    /// The first name is the canonical one
    pub fn new<F>(names: &[&str], construct: F) -> Self
    where
        F: Fn() -> Arc<dyn Node> + Send + Sync + 'static,
    {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            construct: Arc::new(construct),
            credentials: None,
            interface_name_format: None,
            platform_hints: PlatformHints::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_interface_format(mut self, format: impl Into<String>) -> Self {
        self.interface_name_format = Some(format.into());
        self
    }

    pub fn with_platform_hints(mut self, hints: PlatformHints) -> Self {
        self.platform_hints = hints;
        self
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn canonical_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or_default()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn interface_name_format(&self) -> Option<&str> {
        self.interface_name_format.as_deref()
    }

    pub fn platform_hints(&self) -> &PlatformHints {
        &self.platform_hints
    }

    /// Render the interface name format for port `n`
    pub fn interface_name(&self, n: u32) -> Option<String> {
        self.interface_name_format
            .as_ref()
            .map(|f| f.replace("{n}", &n.to_string()))
    }

    pub fn construct(&self) -> Arc<dyn Node> {
        (self.construct)()
    }
}

impl fmt::Debug for KindEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindEntry")
            .field("names", &self.names)
            .field("credentials", &self.credentials)
            .field("interface_name_format", &self.interface_name_format)
            .field("platform_hints", &self.platform_hints)
            .finish()
    }
}

/// Lookup table from kind name to [`KindEntry`]
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    entries: HashMap<String, Arc<KindEntry>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry under all of its names.
    ///
    /// Fails with [`NetlabError::DuplicateKind`] if any name is already taken
    /// or repeated within the entry; the registry is left unchanged then.
    pub fn register(&mut self, entry: KindEntry) -> NetlabResult<()> {
        if entry.names.is_empty() {
            return Err(NetlabError::configuration(
                "kind_registry",
                "a kind must be registered under at least one name",
            ));
        }

        let mut seen = HashSet::new();
        for name in &entry.names {
            if self.entries.contains_key(name) || !seen.insert(name.as_str()) {
                return Err(NetlabError::DuplicateKind { kind: name.clone() });
            }
        }

        let entry = Arc::new(entry);
        for name in &entry.names {
            self.entries.insert(name.clone(), Arc::clone(&entry));
        }
        Ok(())
    }

    /// Shorthand for registering names, constructor and credentials
    pub fn register_kind<F>(
        &mut self,
        names: &[&str],
        construct: F,
        credentials: Option<Credentials>,
    ) -> NetlabResult<()>
    where
        F: Fn() -> Arc<dyn Node> + Send + Sync + 'static,
    {
        let mut entry = KindEntry::new(names, construct);
        entry.credentials = credentials;
        self.register(entry)
    }

    /// Construct a fresh, uninitialized node of `kind`
    pub fn construct(&self, kind: &str) -> NetlabResult<Arc<dyn Node>> {
        self.entry(kind).map(|entry| entry.construct())
    }

    pub fn entry(&self, kind: &str) -> NetlabResult<&Arc<KindEntry>> {
        self.entries
            .get(kind)
            .ok_or_else(|| NetlabError::UnknownKind {
                kind: kind.to_string(),
                supported: self.list_names(),
            })
    }

    /// Default credentials of `kind`, if the kind is known and has any
    pub fn credentials(&self, kind: &str) -> Option<&Credentials> {
        self.entries.get(kind).and_then(|e| e.credentials())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    /// All registered names including aliases, sorted
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Distinct entries ordered by canonical name
    pub fn entries(&self) -> Vec<Arc<KindEntry>> {
        let mut entries: Vec<Arc<KindEntry>> = Vec::new();
        for entry in self.entries.values() {
            if !entries.iter().any(|e| Arc::ptr_eq(e, entry)) {
                entries.push(Arc::clone(entry));
            }
        }
        entries.sort_by(|a, b| a.canonical_name().cmp(b.canonical_name()));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedNode;
    use pretty_assertions::assert_eq;

    fn scripted() -> Arc<dyn Node> {
        Arc::new(ScriptedNode::new())
    }

    #[test]
    fn test_register_aliases_share_entry() {
        let mut registry = KindRegistry::new();
        registry
            .register(
                KindEntry::new(&["nokia_sros", "vr-sros"], scripted)
                    .with_credentials(Credentials::new("admin", "admin"))
                    .with_interface_format("eth{n}"),
            )
            .unwrap();

        assert_eq!(registry.list_names(), vec!["nokia_sros", "vr-sros"]);
        let a = registry.entry("nokia_sros").unwrap();
        let b = registry.entry("vr-sros").unwrap();
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.interface_name(3).as_deref(), Some("eth3"));
        assert_eq!(registry.credentials("vr-sros").unwrap().username, "admin");
        assert_eq!(registry.entries().len(), 1);
    }

    #[test]
    fn test_duplicate_within_one_call_is_rejected() {
        let mut registry = KindRegistry::new();
        let err = registry
            .register(KindEntry::new(&["a", "b", "a"], scripted))
            .unwrap_err();
        assert!(matches!(err, NetlabError::DuplicateKind { kind } if kind == "a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_error_message() {
        let mut registry = KindRegistry::new();
        registry.register_kind(&["linux"], scripted, None).unwrap();
        let err = registry.register_kind(&["linux"], scripted, None).unwrap_err();
        assert_eq!(err.to_string(), "node kind \"linux\" already registered");
    }

    #[test]
    fn test_credentials_are_redacted_in_debug() {
        let creds = Credentials::new("admin", "NokiaSrl1!");
        assert!(!format!("{:?}", creds).contains("NokiaSrl1!"));
    }
}
