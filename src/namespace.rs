//! Per-test namespace isolation
//!
//! Every feature runs in its own freshly created namespace, labeled so the
//! policy's bindings select it. Names are unique across concurrently running
//! suites (random suffix plus a per-process counter), so two features that
//! submit identically named objects never collide.
//!
//! The environment keeps a [`NamespaceRegistry`] keyed by test identity so
//! every step of a feature can find the namespace its setup created.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info};

use crate::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_HARNESS};

/// Maximum length of a namespace name (DNS label)
pub const MAX_NAMESPACE_LEN: usize = 63;

/// Length of the random part of generated names
const RANDOM_LEN: usize = 6;

/// Random lowercase alphanumeric string of `len` characters
pub(crate) fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Registry key derived from a test's identity
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceKey(String);

impl NamespaceKey {
    /// Key under which the namespace of `test_name` is stored
    pub fn for_test(test_name: &str) -> Self {
        Self(format!("namespace/{}", test_name))
    }

    /// The key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The namespace allocated to one test
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceContext {
    /// Generated namespace name
    pub name: String,
    /// Registry key of the owning test
    pub key: NamespaceKey,
}

/// Concurrent map from test identity to its namespace
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    entries: DashMap<NamespaceKey, NamespaceContext>,
}

impl NamespaceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a namespace, replacing any previous one for the same key
    pub fn insert(&self, ctx: NamespaceContext) {
        self.entries.insert(ctx.key.clone(), ctx);
    }

    /// Namespace recorded for `key`
    pub fn get(&self, key: &NamespaceKey) -> Option<NamespaceContext> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Namespace recorded for `test_name`
    pub fn for_test(&self, test_name: &str) -> Option<NamespaceContext> {
        self.get(&NamespaceKey::for_test(test_name))
    }

    /// Forget `key`
    pub fn remove(&self, key: &NamespaceKey) -> Option<NamespaceContext> {
        self.entries.remove(key).map(|(_, ctx)| ctx)
    }

    /// Number of live namespaces
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no namespace is live
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of every live namespace
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.value().name.clone()).collect()
    }

    /// Snapshot of every live namespace
    pub fn contexts(&self) -> Vec<NamespaceContext> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}

/// Lowercase `raw` and map everything outside `[a-z0-9-]` to `-`, collapsing
/// runs and trimming dashes at either end.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if mapped == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(mapped);
    }
    out.trim_end_matches('-').to_string()
}

/// `<sanitized-test-name>-<random>-<counter>`, trimmed to a DNS label
pub fn generate_namespace_name(test_name: &str, random: &str, counter: u64) -> String {
    let suffix = format!("-{}-{}", random, counter);
    let budget = MAX_NAMESPACE_LEN.saturating_sub(suffix.len());

    let mut base = sanitize_name(test_name);
    if base.is_empty() {
        base = "test".to_string();
    }
    base.truncate(budget);
    let base = base.trim_end_matches('-');

    format!("{}{}", base, suffix)
}

/// Creates and deletes per-test namespaces
pub struct NamespaceIsolator {
    client: Client,
    labels: BTreeMap<String, String>,
    registry: Arc<NamespaceRegistry>,
    counter: AtomicU64,
}

impl NamespaceIsolator {
    /// Isolator stamping `labels` (plus the managed-by label) on every namespace
    pub fn new(
        client: Client,
        labels: BTreeMap<String, String>,
        registry: Arc<NamespaceRegistry>,
    ) -> Self {
        Self {
            client,
            labels: namespace_labels(&labels),
            registry,
            counter: AtomicU64::new(0),
        }
    }

    /// Labels stamped on every namespace
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Registry the isolator records namespaces in
    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    /// Create a fresh namespace for `test_name` and record it.
    ///
    /// Test names must be unique among live namespaces: a second test with
    /// the same name would shadow the first one's registry entry.
    pub async fn create_namespace(&self, test_name: &str) -> Result<NamespaceContext, Error> {
        let key = NamespaceKey::for_test(test_name);
        if let Some(live) = self.registry.get(&key) {
            return Err(Error::namespace(
                &live.name,
                format!("test name {:?} is already in use by a live namespace", test_name),
            ));
        }

        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = generate_namespace_name(test_name, &random_suffix(RANDOM_LEN), counter);

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(self.labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), &ns)
            .await
            .map_err(|e| Error::namespace(&name, format!("create failed: {}", e)))?;

        let ctx = NamespaceContext { name, key };
        self.registry.insert(ctx.clone());
        info!(test = %test_name, namespace = %ctx.name, "created test namespace");
        Ok(ctx)
    }

    /// Delete a namespace and forget it. Already-deleted namespaces are fine.
    ///
    /// A namespace whose deletion fails stays registered so environment
    /// teardown retries it.
    pub async fn delete_namespace(&self, ctx: &NamespaceContext) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let result = delete_outcome(
            &ctx.name,
            api.delete(&ctx.name, &DeleteParams::background())
                .await
                .map(|_| ()),
        );
        if result.is_ok() {
            self.registry.remove(&ctx.key);
            debug!(namespace = %ctx.name, "deleted test namespace");
        }
        result
    }
}

fn delete_outcome(name: &str, result: Result<(), kube::Error>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::namespace(name, format!("delete failed: {}", e))),
    }
}

fn namespace_labels(configured: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels = configured.clone();
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_HARNESS.to_string(),
    );
    labels
}
