use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use itertools::Itertools;
use tracing::instrument;

use crate::{
    core::{Key, LinkError, LinkResult, StorageKind, Value, ValueType, index_keys},
    filter::Filter,
    kv::{Coordination, Store},
    lock::{LockScope, Locker, NoLock, StoreLock},
};

use changes::Change;

mod changes;
mod config;
mod scoped;


pub(crate) use changes::ChangeSet;
pub use config::{BackendConfig, LockConfig};
pub use scoped::Scoped;

/// # Backend
///
/// Typed read/write engine over a [`Store`].
///
/// ## Writes
///
/// Every mutation is validated against the shape of its key when issued. While a
/// transaction is open on this handle, mutations are buffered and become visible together
/// on [`commit_transaction`]; otherwise they are applied immediately.
///
/// Opening a handle-level transaction needs `&mut self`, so it cannot be joined by
/// accident from a concurrent operation borrowing the handle. Operations under a lock
/// use the transaction of their [`LockScope`] instead, through [`Backend::within`].
///
/// ## Handles
///
/// A `Backend` is one execution context: transaction state belongs to it alone. Use
/// [`Backend::handle`] to get another context over the same store and lock provider.
///
/// ## Locking
///
/// [`Backend::lock`] grants exclusive access to a set of record-type namespaces. The
/// strategy follows the store's [`Coordination`]: store-backed leases, or a no-op for
/// single-writer stores.
///
/// [`commit_transaction`]: Backend::commit_transaction
pub struct Backend {
    store: Arc<dyn Store>,
    locker: Arc<dyn Locker>,
    config: BackendConfig,
    /// Buffered changes of the handle-level transaction.
    changes: ChangeSet,
}

impl Backend {
    pub fn new<S: Store + 'static>(store: S, config: BackendConfig) -> Self {
        Self::with_store(Arc::new(store), config)
    }

    /// Builds a backend over a shared store, choosing the lock strategy the store supports.
    pub fn with_store(store: Arc<dyn Store>, config: BackendConfig) -> Self {
        let locker: Arc<dyn Locker> = match store.coordination() {
            Coordination::Leases => Arc::new(StoreLock::new(store.clone(), config.lock.clone())),
            Coordination::SingleWriter => Arc::new(NoLock),
        };
        debug!(coordination = ?store.coordination(), "backend created");
        Self {
            store,
            locker,
            config,
            changes: ChangeSet::default(),
        }
    }

    /// Another execution context over the same store and lock provider.
    pub fn handle(&self) -> Self {
        Self {
            store: self.store.clone(),
            locker: self.locker.clone(),
            config: self.config.clone(),
            changes: ChangeSet::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    // -- Reads --

    pub async fn get(&self, key: &Key) -> LinkResult<Option<Value>> {
        let mut values = self.get_multiple(std::slice::from_ref(key)).await?;
        Ok(values.pop().flatten())
    }

    /// Reads several keys. Scalars of the same record hash are read in one round trip.
    ///
    /// Missing scalars read as `None`, missing collections as an empty container.
    #[instrument(skip_all, level = "trace", fields(keys = keys.len()))]
    pub async fn get_multiple(&self, keys: &[Key]) -> LinkResult<Vec<Option<Value>>> {
        let mut values: Vec<Option<Value>> = vec![None; keys.len()];
        // path -> positions of the scalar keys stored in that hash
        let mut scalars: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (pos, key) in keys.iter().enumerate() {
            if !key.is_collection() {
                scalars.entry(key.path()).or_default().push(pos);
                continue;
            }
            let path = key.path();
            let value = match key.value_type() {
                ValueType::List => Value::List(self.store.lrange(&path).await?),
                ValueType::Set => Value::Set(self.store.smembers(&path).await?),
                ValueType::SortedSet => {
                    Value::Set(self.store.zrange(&path).await?.into_iter().collect())
                }
                _ => Value::Hash(self.store.hgetall(&path).await?),
            };
            values[pos] = Some(value);
        }

        for (path, positions) in scalars {
            let fields = positions
                .iter()
                .map(|&pos| keys[pos].name().to_owned())
                .collect_vec();
            let raw = self.store.hmget(&path, &fields).await?;
            for (pos, raw) in positions.into_iter().zip(raw) {
                values[pos] = raw
                    .map(|raw| Value::decode_scalar(&raw, keys[pos].value_type()))
                    .transpose()?;
            }
        }
        Ok(values)
    }

    /// Returns `true` if the key holds a value: the field for scalars, the structure for
    /// collections.
    pub async fn exists(&self, key: &Key) -> LinkResult<bool> {
        if key.is_collection() {
            Ok(self.store.exists(&key.path()).await?)
        } else {
            Ok(self.store.hget(&key.path(), key.name()).await?.is_some())
        }
    }

    /// Membership probe for set keys.
    pub async fn includes(&self, key: &Key, id: &str) -> LinkResult<bool> {
        if key.value_type() != ValueType::Set {
            return Err(LinkError::unsupported(format!(
                "membership checks need a set key, got {} key {}",
                key.value_type(),
                key
            )));
        }
        Ok(self.store.sismember(&key.path(), id).await?)
    }

    // -- Writes --

    /// Inserts members into a set or list, entries into a sorted set, or merges fields
    /// into a hash.
    pub async fn add(&self, key: &Key, value: impl Into<Value>) -> LinkResult<()> {
        self.change(None, Change::add(key.clone(), value.into())?)
            .await
    }

    /// Removes members, or hash fields.
    pub async fn delete(&self, key: &Key, value: impl Into<Value>) -> LinkResult<()> {
        self.change(None, Change::delete(key.clone(), value.into())?)
            .await
    }

    /// Relocates set members, or a subset of hash fields, to `to`.
    pub async fn move_to(&self, key: &Key, value: impl Into<Value>, to: &Key) -> LinkResult<()> {
        self.change(None, Change::move_to(key.clone(), value.into(), to.clone())?)
            .await
    }

    pub async fn clear(&self, key: &Key) -> LinkResult<()> {
        self.change(None, Change::clear(key.clone())?).await
    }

    /// Replaces the whole value of a key. `None` clears it.
    pub async fn set(&self, key: &Key, value: Option<Value>) -> LinkResult<()> {
        self.change(None, Change::set(key.clone(), value)?).await
    }

    /// Removes all attribute, association and index storage of a record.
    pub async fn purge(&self, namespace: &str, id: &str) -> LinkResult<()> {
        self.change(None, Change::purge(namespace, id)?).await
    }

    /// Routes a change to the innermost open transaction: the scope's, then this
    /// handle's. Without either, it is applied right away.
    async fn change(&self, scope: Option<&LockScope>, change: Change) -> LinkResult<()> {
        let mut changes = vec![change];
        if let Some(scope) = scope {
            match scope.changes().queue(changes).await {
                Some(unbuffered) => changes = unbuffered,
                None => return Ok(()),
            }
        }
        self.apply_committed(changes).await
    }

    /// Hands committed changes on: into the open handle-level transaction, or to the store.
    async fn apply_committed(&self, changes: Vec<Change>) -> LinkResult<()> {
        match self.changes.queue(changes).await {
            Some(changes) => self.apply_changes(changes).await,
            None => Ok(()),
        }
    }

    #[instrument(skip_all, level = "debug", fields(changes = changes.len()))]
    async fn apply_changes(&self, changes: Vec<Change>) -> LinkResult<()> {
        let commands = changes::plan(self.store.as_ref(), changes).await?;
        if commands.is_empty() {
            return Ok(());
        }
        trace!(commands = commands.len(), "executing batch");
        self.store.execute(commands).await?;
        Ok(())
    }

    // -- Transactions --

    /// Opens a handle-level transaction. Returns `false` if one is already open.
    pub async fn begin_transaction(&mut self) -> bool {
        self.changes.begin().await
    }

    /// Applies all buffered changes as one atomic batch. Returns `false` if no
    /// transaction was open.
    pub async fn commit_transaction(&mut self) -> LinkResult<bool> {
        let Some(changes) = self.changes.take().await else {
            return Ok(false);
        };
        debug!(changes = changes.len(), "committing transaction");
        self.apply_changes(changes).await?;
        Ok(true)
    }

    /// Discards all buffered changes. Returns `false` if no transaction was open.
    pub async fn abort_transaction(&mut self) -> bool {
        match self.changes.take().await {
            Some(changes) => {
                debug!(changes = changes.len(), "aborted transaction");
                true
            }
            None => false,
        }
    }

    pub async fn in_transaction(&self) -> bool {
        self.changes.is_open().await
    }

    /// Writes and transactions bound to `scope`, see [`Scoped`].
    pub fn within<'s>(&'s self, scope: &'s LockScope) -> Scoped<'s> {
        Scoped::new(self, scope)
    }

    // -- Locking --

    /// Acquires exclusive access to `namespaces`.
    ///
    /// Inside an `outer` scope, a subset of its namespaces yields a nested scope that shares
    /// the outer acquisition; any other namespace fails with
    /// [`LinkError::AlreadyLocking`].
    pub async fn lock<I, S>(&self, outer: Option<&LockScope>, namespaces: I) -> LinkResult<LockScope>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let namespaces: BTreeSet<String> = namespaces.into_iter().map(Into::into).collect();
        LockScope::acquire(&self.locker, outer, namespaces).await
    }

    // -- Queries --

    /// A lazy query over the ids stored in the set `ids_key`, naming records of
    /// `related`.
    pub fn filter(&self, ids_key: Key, related: &str) -> Filter<'_> {
        Filter::new(self, ids_key, related)
    }

    /// The namespace-level set key holding ids of `namespace` records whose `attribute`
    /// holds `value`.
    pub fn index_key(
        &self,
        namespace: &str,
        attribute: &str,
        value_type: ValueType,
        value: Option<&Value>,
    ) -> LinkResult<Key> {
        let (tag, encoded) = index_keys(value_type, value)?;
        Ok(Key::new(
            namespace,
            None,
            format!("{attribute}:{tag}:{encoded}"),
            ValueType::Set,
            StorageKind::Index,
        ))
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("coordination", &self.store.coordination())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
