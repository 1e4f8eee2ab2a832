use std::collections::BTreeMap;

use crate::{
    associations::{Association, AssociationDef, Callbacks, Registry},
    backend::Backend,
    core::{Key, LinkError, LinkResult, Value, ValueType},
    lock::LockScope,
    record::RecordRef,
};

/// # BelongsTo
///
/// The single-reference side of a relationship.
///
/// Every record keeps one `belongs_to` association hash. The foreign id of this association
/// lives in its field `{inverse}_id`, which is why an inverse must be declared.
pub struct BelongsTo<'a> {
    backend: &'a Backend,
    registry: &'a Registry,
    record: RecordRef,
    def: &'a AssociationDef,
    inverse: &'a str,
    key: Key,
    field: String,
}

impl<'a> BelongsTo<'a> {
    pub(super) fn new(
        backend: &'a Backend,
        registry: &'a Registry,
        record: RecordRef,
        name: &str,
        def: &'a AssociationDef,
    ) -> LinkResult<Self> {
        let Some(inverse) = def.inverse.as_deref() else {
            return Err(LinkError::configuration(format!(
                "belongs_to association '{}' on {} needs an inverse",
                name,
                record.namespace()
            )));
        };
        let id = record.persisted_id()?;
        let key = Key::association(record.namespace(), id, "belongs_to", ValueType::Hash);
        Ok(Self {
            backend,
            registry,
            def,
            inverse,
            key,
            field: format!("{inverse}_id"),
            record,
        })
    }

    pub fn record(&self) -> &RecordRef {
        &self.record
    }

    pub fn related(&self) -> &str {
        &self.def.related
    }

    async fn lock(&self, outer: Option<&LockScope>) -> LinkResult<LockScope> {
        self.backend
            .lock(outer, [self.record.namespace(), self.related()])
            .await
    }

    /// Reads the linked record without locking.
    async fn linked(&self) -> LinkResult<Option<RecordRef>> {
        let ids = self
            .backend
            .get(&self.key)
            .await?
            .and_then(Value::into_hash)
            .unwrap_or_default();
        Ok(ids
            .get(&self.field)
            .map(|id| RecordRef::new(self.related(), id.clone())))
    }

    // -- Reads --

    /// The linked record, if any.
    pub async fn value(&self) -> LinkResult<Option<RecordRef>> {
        self.read(None).await
    }

    pub async fn value_within(&self, scope: &LockScope) -> LinkResult<Option<RecordRef>> {
        self.read(Some(scope)).await
    }

    async fn read(&self, outer: Option<&LockScope>) -> LinkResult<Option<RecordRef>> {
        let scope = self.lock(outer).await?;
        let result = self.linked().await;
        scope.finish(result).await
    }

    // -- Writes --

    /// Links `record`, or removes the link for `None`.
    pub async fn set_value(&self, record: Option<&RecordRef>) -> LinkResult<()> {
        self.write(None, record).await
    }

    pub async fn set_value_within(
        &self,
        scope: &LockScope,
        record: Option<&RecordRef>,
    ) -> LinkResult<()> {
        self.write(Some(scope), record).await
    }

    async fn write(&self, outer: Option<&LockScope>, record: Option<&RecordRef>) -> LinkResult<()> {
        if let Some(record) = record {
            record.expect_persisted_in(self.related())?;
        }
        let scope = self.lock(outer).await?;
        let result = match record {
            Some(record) => self.link(&scope, record).await,
            None => self.unlink(&scope).await,
        };
        scope.finish(result).await
    }

    async fn link(&self, scope: &LockScope, record: &RecordRef) -> LinkResult<()> {
        let id = record.persisted_id()?;
        let callbacks = &self.def.callbacks;
        Callbacks::run(&callbacks.before_add, &self.record, Some(record));

        let writes = self.backend.within(scope);
        let new_txn = writes.begin_transaction().await;
        let result = writes
            .add(&self.key, BTreeMap::from([(self.field.clone(), id.to_owned())]))
            .await;
        writes.finish_transaction(new_txn, result).await?;

        debug!(record = %self.record, linked = %record, "linked");
        Callbacks::run(&callbacks.after_add, &self.record, Some(record));
        Ok(())
    }

    async fn unlink(&self, scope: &LockScope) -> LinkResult<()> {
        let current = self.linked().await?;
        let callbacks = &self.def.callbacks;
        Callbacks::run(&callbacks.before_remove, &self.record, current.as_ref());

        let writes = self.backend.within(scope);
        let new_txn = writes.begin_transaction().await;
        let result = writes.delete(&self.key, self.field.as_str()).await;
        writes.finish_transaction(new_txn, result).await?;

        debug!(record = %self.record, field = %self.field, "unlinked");
        Callbacks::run(&callbacks.after_remove, &self.record, current.as_ref());
        Ok(())
    }

    /// Detaches the owner from the linked record through the inverse side, then clears
    /// this association's field.
    pub async fn on_remove(&self, scope: &LockScope) -> LinkResult<()> {
        if let Some(linked) = self.linked().await? {
            match self.registry.proxy(self.backend, &linked, self.inverse)? {
                Association::HasMany(parent) => {
                    parent
                        .delete_within(scope, std::slice::from_ref(&self.record))
                        .await?
                }
                Association::BelongsTo(other) => other.set_value_within(scope, None).await?,
            }
        }
        self.backend
            .within(scope)
            .delete(&self.key, self.field.as_str())
            .await
    }
}
