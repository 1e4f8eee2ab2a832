use crate::{
    backend::{Backend, changes::Change},
    core::{Key, LinkResult, Value},
    lock::LockScope,
};

/// # Scoped
///
/// Writes and transactions of one operation running under a [`LockScope`].
///
/// The transaction lives in the scope: nested scopes join it, independent scopes never
/// do, even when they share a [`Backend`] handle. A committed scope transaction goes into
/// the handle-level transaction if one is open, and to the store otherwise.
pub struct Scoped<'a> {
    backend: &'a Backend,
    scope: &'a LockScope,
}

impl<'a> Scoped<'a> {
    pub(super) fn new(backend: &'a Backend, scope: &'a LockScope) -> Self {
        Self { backend, scope }
    }

    pub fn scope(&self) -> &LockScope {
        self.scope
    }

    // -- Writes --

    pub async fn add(&self, key: &Key, value: impl Into<Value>) -> LinkResult<()> {
        self.change(Change::add(key.clone(), value.into())?).await
    }

    pub async fn delete(&self, key: &Key, value: impl Into<Value>) -> LinkResult<()> {
        self.change(Change::delete(key.clone(), value.into())?).await
    }

    pub async fn move_to(&self, key: &Key, value: impl Into<Value>, to: &Key) -> LinkResult<()> {
        self.change(Change::move_to(key.clone(), value.into(), to.clone())?)
            .await
    }

    pub async fn clear(&self, key: &Key) -> LinkResult<()> {
        self.change(Change::clear(key.clone())?).await
    }

    pub async fn set(&self, key: &Key, value: Option<Value>) -> LinkResult<()> {
        self.change(Change::set(key.clone(), value)?).await
    }

    pub async fn purge(&self, namespace: &str, id: &str) -> LinkResult<()> {
        self.change(Change::purge(namespace, id)?).await
    }

    async fn change(&self, change: Change) -> LinkResult<()> {
        self.backend.change(Some(self.scope), change).await
    }

    // -- Transactions --

    /// Opens the scope's transaction. Returns `false` if it is already open, in which case
    /// the caller runs inside the transaction of an outer operation.
    pub async fn begin_transaction(&self) -> bool {
        self.scope.changes().begin().await
    }

    /// Renews the scope's leases, then applies the buffered changes. A lost lease aborts
    /// the transaction instead. Returns `false` if no transaction was open.
    pub async fn commit_transaction(&self) -> LinkResult<bool> {
        let Some(changes) = self.scope.changes().take().await else {
            return Ok(false);
        };
        self.scope.renew().await?;
        debug!(changes = changes.len(), "committing scoped transaction");
        self.backend.apply_committed(changes).await?;
        Ok(true)
    }

    /// Discards the buffered changes. Returns `false` if no transaction was open.
    pub async fn abort_transaction(&self) -> bool {
        match self.scope.changes().take().await {
            Some(changes) => {
                debug!(changes = changes.len(), "aborted scoped transaction");
                true
            }
            None => false,
        }
    }

    pub async fn in_transaction(&self) -> bool {
        self.scope.changes().is_open().await
    }

    /// Ends a transaction opened by the caller (`opened`): commits on success, aborts on
    /// failure. Transactions owned by an outer operation are left open.
    pub(crate) async fn finish_transaction<T>(
        &self,
        opened: bool,
        result: LinkResult<T>,
    ) -> LinkResult<T> {
        if !opened {
            return result;
        }
        match result {
            Ok(value) => {
                self.commit_transaction().await?;
                Ok(value)
            }
            Err(err) => {
                self.abort_transaction().await;
                Err(err)
            }
        }
    }
}
