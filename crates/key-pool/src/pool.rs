//! Credential ring with round-robin cursor and class-partitioned lookup
//!
//! The ring itself is immutable after construction. The only shared mutable
//! state is the cursor (`AtomicUsize`) and the per-credential usage counters
//! (`AtomicU64`), so concurrent dispatches never need a lock. Two callers may
//! race for the "next" key; every key in the ring is valid for any call, so
//! the only invariant enforced is that the cursor stays inside the ring.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use common::Secret;
use tracing::{debug, info, warn};

use crate::classes::{ClassMap, OperationClass};
use crate::error::{Error, Result};

/// One API key, identified by its position in the ring.
///
/// Cloning is cheap (the secret is shared) and the key never shows up in
/// `Debug` output.
#[derive(Debug, Clone)]
pub struct Credential {
    index: usize,
    secret: Arc<Secret<String>>,
}

impl Credential {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Raw key for building the outbound request.
    pub fn expose(&self) -> &str {
        self.secret.expose()
    }

    /// Redacted tail of the key for operator-facing output.
    pub fn hint(&self) -> String {
        self.secret.hint()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Credential {}

/// Pool construction options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fail construction when fewer usable keys than this are supplied.
    pub min_credentials: usize,
    /// Operation → credential-class assignment; may be empty.
    pub class_map: ClassMap,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_credentials: 1,
            class_map: ClassMap::new(),
        }
    }
}

/// Ordered ring of API keys shared by every operation caller.
pub struct CredentialPool {
    credentials: Vec<Credential>,
    usage: Vec<AtomicU64>,
    cursor: AtomicUsize,
    class_map: ClassMap,
}

impl CredentialPool {
    /// Build a pool from raw key strings.
    ///
    /// Blank keys are dropped (an unset env var commonly yields `""`). Fails
    /// with `PoolExhausted` when nothing usable remains, with
    /// `InsufficientCredentials` when `min_credentials` is not met, and with
    /// `UnresolvedClass` when the class map points past the end of the ring.
    pub fn new(keys: Vec<String>, config: PoolConfig) -> Result<Self> {
        let supplied = keys.len();
        let credentials: Vec<Credential> = keys
            .into_iter()
            .map(Secret::new)
            .filter(|s| !s.is_blank())
            .enumerate()
            .map(|(index, secret)| Credential {
                index,
                secret: Arc::new(secret),
            })
            .collect();

        let found = credentials.len();
        if found < supplied {
            warn!(
                supplied,
                usable = found,
                "dropped blank credentials from pool"
            );
        }
        if found == 0 {
            return Err(Error::PoolExhausted(
                "no usable credentials configured".into(),
            ));
        }
        if found < config.min_credentials {
            return Err(Error::InsufficientCredentials {
                required: config.min_credentials,
                found,
            });
        }
        for (operation, class) in config.class_map.iter() {
            if class.index() >= found {
                return Err(Error::UnresolvedClass {
                    operation,
                    class,
                    available: found,
                });
            }
        }

        info!(
            credentials = found,
            partitioned_operations = config.class_map.iter().count(),
            "credential pool initialized"
        );
        Ok(Self {
            usage: (0..found).map(|_| AtomicU64::new(0)).collect(),
            credentials,
            cursor: AtomicUsize::new(0),
            class_map: config.class_map,
        })
    }

    /// Number of distinct credentials in the ring.
    pub fn size(&self) -> usize {
        self.credentials.len()
    }

    /// Credential at the cursor.
    pub fn current_credential(&self) -> Result<Credential> {
        let n = self.size();
        if n == 0 {
            return Err(Error::PoolExhausted("pool is empty".into()));
        }
        Ok(self.credentials[self.cursor.load(Ordering::Acquire) % n].clone())
    }

    /// Advance the cursor by one (modulo ring size) and return the new current credential.
    pub fn next_credential(&self) -> Result<Credential> {
        let (_, next) = self.advance()?;
        Ok(self.credentials[next].clone())
    }

    /// Advance past the current credential after a quota error.
    ///
    /// Fails with `AllCredentialsExhausted` when the rotation lands back on the
    /// credential it started from, i.e. on a ring of one.
    pub fn rotate_on_error(&self) -> Result<Credential> {
        let (previous, next) = self.advance()?;
        if next == previous {
            debug!(credential_index = previous, "rotation wrapped onto itself");
            return Err(Error::AllCredentialsExhausted { tried: 1 });
        }
        metrics::counter!("credential_rotations_total", "mode" => "cursor").increment(1);
        debug!(
            from = previous,
            to = next,
            "rotated credential cursor after error"
        );
        Ok(self.credentials[next].clone())
    }

    /// Credential following `failed` in ring order, without touching the cursor.
    ///
    /// Used by class-partitioned calls, whose designated key is independent of
    /// the shared round-robin position.
    pub fn rotate_from(&self, failed: &Credential) -> Result<Credential> {
        let n = self.size();
        if n == 0 {
            return Err(Error::PoolExhausted("pool is empty".into()));
        }
        let next = (failed.index + 1) % n;
        if next == failed.index {
            return Err(Error::AllCredentialsExhausted { tried: 1 });
        }
        metrics::counter!("credential_rotations_total", "mode" => "partitioned").increment(1);
        debug!(
            from = failed.index,
            to = next,
            "rotated away from designated credential"
        );
        Ok(self.credentials[next].clone())
    }

    /// Designated credential for an operation class.
    pub fn credential_for_operation(&self, operation: OperationClass) -> Result<Credential> {
        let class = self
            .class_map
            .get(operation)
            .ok_or(Error::UnmappedOperation(operation))?;
        // Construction guarantees every mapped class resolves inside the ring.
        self.credentials
            .get(class.index())
            .cloned()
            .ok_or(Error::UnresolvedClass {
                operation,
                class,
                available: self.size(),
            })
    }

    /// Whether the class map has an entry for this operation.
    pub fn is_partitioned(&self, operation: OperationClass) -> bool {
        self.class_map.get(operation).is_some()
    }

    /// Count one hand-out of a credential.
    pub fn record_use(&self, credential: &Credential) {
        if let Some(counter) = self.usage.get(credential.index) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Usage count for one ring position.
    pub fn uses(&self, index: usize) -> u64 {
        self.usage
            .get(index)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Pool usage summary for the health endpoint.
    ///
    /// Reports ring size, cursor, per-credential usage (with a redacted key
    /// hint) and per-class usage aggregated through the class map.
    pub fn usage(&self) -> serde_json::Value {
        let n = self.size();
        let credentials: Vec<serde_json::Value> = self
            .credentials
            .iter()
            .map(|c| {
                serde_json::json!({
                    "index": c.index,
                    "key_hint": c.hint(),
                    "uses": self.uses(c.index),
                })
            })
            .collect();

        let mut classes = serde_json::Map::new();
        for (_, class) in self.class_map.iter() {
            classes
                .entry(class.label())
                .or_insert_with(|| serde_json::json!(self.uses(class.index())));
        }

        let operations: serde_json::Map<String, serde_json::Value> = self
            .class_map
            .iter()
            .map(|(op, class)| (op.as_str().to_string(), serde_json::json!(class.label())))
            .collect();

        let total: u64 = (0..n).map(|i| self.uses(i)).sum();
        serde_json::json!({
            "credentials_total": n,
            "cursor": self.cursor.load(Ordering::Acquire) % n.max(1),
            "uses_total": total,
            "credentials": credentials,
            "classes": classes,
            "operations": operations,
        })
    }

    /// Move the cursor forward one slot, returning `(previous, next)`.
    fn advance(&self) -> Result<(usize, usize)> {
        let n = self.size();
        if n == 0 {
            return Err(Error::PoolExhausted("pool is empty".into()));
        }
        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % n))
            .unwrap_or_else(|c| c)
            % n;
        Ok((previous, (previous + 1) % n))
    }
}
