use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use itertools::Itertools;
use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    backend::{ChangeSet, LockConfig},
    core::{LinkError, LinkResult, escape_name},
    kv::Store,
};

/// The leases taken by one lock acquisition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lease {
    /// Random holder token, compared on release.
    token: String,
    /// Lease keys in acquisition order.
    keys: Vec<String>,
}

/// A strategy for exclusive access to a set of record-type namespaces.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Waits until every namespace of the set is held exclusively.
    async fn acquire(&self, namespaces: &BTreeSet<String>) -> LinkResult<Lease>;

    /// Restarts the ttl of every lease, failing with [`LinkError::LockLost`] if one of
    /// them is no longer held.
    async fn renew(&self, lease: &Lease) -> LinkResult<()>;

    async fn release(&self, lease: Lease) -> LinkResult<()>;
}

/// Locking for stores with a single writer: every acquisition succeeds immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

#[async_trait]
impl Locker for NoLock {
    async fn acquire(&self, _namespaces: &BTreeSet<String>) -> LinkResult<Lease> {
        Ok(Lease::default())
    }

    async fn renew(&self, _lease: &Lease) -> LinkResult<()> {
        Ok(())
    }

    async fn release(&self, _lease: Lease) -> LinkResult<()> {
        Ok(())
    }
}

/// Distributed locking through expiring leases in the store itself.
///
/// Each namespace is guarded by its own lease key `lock:{namespace}`. The leases of one
/// request are taken in sorted order, so two requests over overlapping sets cannot
/// deadlock. Every attempt that finds a lease taken backs off exponentially with jitter,
/// until the acquisition timeout elapses.
///
/// Leases are not renewed in the background: an owner that may outlive the ttl calls
/// [`LockScope::renew`]. Scoped transactions renew before they commit.
pub struct StoreLock {
    store: Arc<dyn Store>,
    config: LockConfig,
}

impl StoreLock {
    pub fn new(store: Arc<dyn Store>, config: LockConfig) -> Self {
        Self { store, config }
    }

    fn lease_key(namespace: &str) -> String {
        format!("lock:{}", escape_name(namespace))
    }

    /// Returns `false` once `deadline` passes without taking the lease.
    async fn acquire_one(&self, key: &str, token: &str, deadline: Instant) -> LinkResult<bool> {
        let mut backoff_ms = self.config.initial_backoff_ms.max(1);
        loop {
            if self
                .store
                .set_if_absent(key, token, self.config.ttl())
                .await?
            {
                trace!(key, "lease taken");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }

            // the rng is not `Send`, so it must not live across the await
            let jitter = rand::rng().random_range(0..backoff_ms / 2 + 1);
            let sleep = Duration::from_millis(backoff_ms + jitter);
            debug!(key, backoff_ms = backoff_ms + jitter, "lease held, backing off");
            tokio::time::sleep_until((Instant::now() + sleep).min(deadline)).await;

            backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms.max(1));
        }
    }
}

#[async_trait]
impl Locker for StoreLock {
    async fn acquire(&self, namespaces: &BTreeSet<String>) -> LinkResult<Lease> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout();
        let mut lease = Lease {
            token: Uuid::new_v4().to_string(),
            keys: Vec::with_capacity(namespaces.len()),
        };

        for namespace in namespaces {
            let key = Self::lease_key(namespace);
            let outcome = self.acquire_one(&key, &lease.token, deadline).await;
            match outcome {
                Ok(true) => lease.keys.push(key),
                Ok(false) | Err(_) => {
                    if let Err(err) = self.release(lease).await {
                        warn!(%err, "could not release partially acquired leases");
                    }
                    outcome?;
                    return Err(LinkError::LockTimeout {
                        namespace: namespace.clone(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        debug!(namespaces = %namespaces.iter().join(","), "lock acquired");
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease) -> LinkResult<()> {
        for key in &lease.keys {
            if !self
                .store
                .extend_if_equals(key, &lease.token, self.config.ttl())
                .await?
            {
                return Err(LinkError::LockLost { key: key.clone() });
            }
        }
        trace!(keys = lease.keys.len(), "leases renewed");
        Ok(())
    }

    async fn release(&self, lease: Lease) -> LinkResult<()> {
        for key in lease.keys.iter().rev() {
            if !self.store.delete_if_equals(key, &lease.token).await? {
                warn!(key, "lease expired before release");
            }
        }
        Ok(())
    }
}

struct Held {
    locker: Arc<dyn Locker>,
    lease: Lease,
}

/// # Lock Scope
///
/// Exclusive access to a set of namespaces, held until released.
///
/// A scope is either the *owner* of an acquisition, or *nested* inside an owner over a
/// superset of its namespaces. Nested scopes share the owner's leases and release
/// nothing. Operations that must run inside a held lock take the scope as an argument.
///
/// The owner also carries the change set of a transaction opened under it, shared with
/// its nested scopes, see [`Backend::within`]. Concurrent operations holding different
/// scopes therefore never share buffered changes.
///
/// Call [`LockScope::finish`] or [`LockScope::release`] when done. An owner dropped
/// without release (e.g. on cancellation) releases its leases in the background.
///
/// [`Backend::within`]: crate::Backend::within
pub struct LockScope {
    namespaces: BTreeSet<String>,
    held: Arc<Held>,
    owner: bool,
    changes: Arc<ChangeSet>,
}

impl LockScope {
    /// Acquires `namespaces`, or nests them within `outer` when it is given.
    pub(crate) async fn acquire(
        locker: &Arc<dyn Locker>,
        outer: Option<&LockScope>,
        namespaces: BTreeSet<String>,
    ) -> LinkResult<Self> {
        if let Some(outer) = outer {
            return outer.nest(namespaces);
        }
        let lease = locker.acquire(&namespaces).await?;
        Ok(Self {
            namespaces,
            held: Arc::new(Held {
                locker: locker.clone(),
                lease,
            }),
            owner: true,
            changes: Arc::default(),
        })
    }

    /// Derives a scope for a subset of this scope's namespaces.
    pub fn nest(&self, namespaces: BTreeSet<String>) -> LinkResult<Self> {
        if !self.covers(&namespaces) {
            return Err(LinkError::AlreadyLocking {
                held: self.namespaces.iter().cloned().collect(),
                requested: namespaces.into_iter().collect(),
            });
        }
        trace!(namespaces = %namespaces.iter().join(","), "nested lock scope");
        Ok(Self {
            namespaces,
            held: self.held.clone(),
            owner: false,
            changes: self.changes.clone(),
        })
    }

    pub fn namespaces(&self) -> &BTreeSet<String> {
        &self.namespaces
    }

    pub fn covers(&self, namespaces: &BTreeSet<String>) -> bool {
        namespaces.is_subset(&self.namespaces)
    }

    /// Returns `true` if this scope shares the acquisition of an outer scope.
    pub fn is_nested(&self) -> bool {
        !self.owner
    }

    pub(crate) fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Restarts the ttl of the underlying leases. Fails with [`LinkError::LockLost`] once
    /// a lease has expired or was taken over.
    pub async fn renew(&self) -> LinkResult<()> {
        self.held.locker.renew(&self.held.lease).await
    }

    /// Releases the leases held by this scope. A no-op for nested scopes.
    pub async fn release(mut self) -> LinkResult<()> {
        if !std::mem::take(&mut self.owner) {
            return Ok(());
        }
        self.held.locker.release(self.held.lease.clone()).await
    }

    /// Releases this scope, then hands back `result`.
    ///
    /// A failed release is logged; the leases expire on their own.
    pub async fn finish<T>(self, result: LinkResult<T>) -> LinkResult<T> {
        if let Err(err) = self.release().await {
            warn!(%err, "could not release lock scope");
        }
        result
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        let held = self.held.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = held.locker.release(held.lease.clone()).await {
                        warn!(%err, "could not release dropped lock scope");
                    }
                });
            }
            Err(_) => warn!("lock scope dropped outside a runtime, leases expire after their ttl"),
        }
    }
}

impl std::fmt::Debug for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockScope")
            .field("namespaces", &self.namespaces)
            .field("nested", &self.is_nested())
            .finish()
    }
}
