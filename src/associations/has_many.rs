use std::collections::BTreeSet;

use futures::stream::BoxStream;

use crate::{
    associations::{AssociationDef, AssociationKind, Callbacks, Registry},
    backend::Backend,
    core::{Key, LinkError, LinkResult, Value, ValueType},
    filter::{Filter, Operand},
    lock::LockScope,
    record::RecordRef,
};

/// # HasMany
///
/// The collection side of a relationship. Member ids live in the set `{name}_ids` of the
/// owning record.
///
/// With an inverse declared, every mutation also updates the [`BelongsTo`] side of each
/// member, inside the same lock and transaction as the membership change.
///
/// [`BelongsTo`]: crate::associations::BelongsTo
pub struct HasMany<'a> {
    backend: &'a Backend,
    registry: &'a Registry,
    record: RecordRef,
    name: String,
    def: &'a AssociationDef,
    key: Key,
}

impl<'a> HasMany<'a> {
    pub(super) fn new(
        backend: &'a Backend,
        registry: &'a Registry,
        record: RecordRef,
        name: &str,
        def: &'a AssociationDef,
    ) -> LinkResult<Self> {
        if let Some(inverse) = def.inverse() {
            let inverse_def = registry.definition(def.related(), inverse)?;
            if inverse_def.kind() != AssociationKind::BelongsTo
                || inverse_def.related() != record.namespace()
            {
                return Err(LinkError::configuration(format!(
                    "inverse '{}' of '{}' must be a belongs_to association on {} pointing back to {}",
                    inverse,
                    name,
                    def.related(),
                    record.namespace()
                )));
            }
        }
        let key = Self::ids_key(&record, name)?;
        Ok(Self {
            backend,
            registry,
            record,
            name: name.to_owned(),
            def,
            key,
        })
    }

    fn ids_key(record: &RecordRef, name: &str) -> LinkResult<Key> {
        Ok(Key::association(
            record.namespace(),
            record.persisted_id()?,
            &format!("{name}_ids"),
            ValueType::Set,
        ))
    }

    pub fn record(&self) -> &RecordRef {
        &self.record
    }

    pub fn related(&self) -> &str {
        self.def.related()
    }

    async fn lock(&self, outer: Option<&LockScope>) -> LinkResult<LockScope> {
        self.backend
            .lock(outer, [self.record.namespace(), self.related()])
            .await
    }

    /// Checks a batch before anything is mutated, returning the member ids.
    fn validate(&self, records: &[RecordRef]) -> LinkResult<Vec<String>> {
        if records.is_empty() {
            return Err(LinkError::validation(format!(
                "no records given for '{}' of {}",
                self.name, self.record
            )));
        }
        records
            .iter()
            .map(|record| {
                record
                    .expect_persisted_in(self.related())
                    .map(str::to_owned)
            })
            .collect()
    }

    // -- Queries --

    /// A fresh query over the current members.
    pub fn filter(&self) -> Filter<'a> {
        self.backend.filter(self.key.clone(), self.related())
    }

    pub async fn ids(&self) -> LinkResult<BTreeSet<String>> {
        self.filter().ids().await
    }

    pub async fn count(&self) -> LinkResult<usize> {
        self.filter().count().await
    }

    pub async fn is_empty(&self) -> LinkResult<bool> {
        self.filter().is_empty().await
    }

    pub async fn exists(&self, id: &str) -> LinkResult<bool> {
        self.filter().exists(id).await
    }

    pub async fn find_by_id(&self, id: &str) -> LinkResult<Option<RecordRef>> {
        self.filter().find_by_id(id).await
    }

    pub async fn all(&self) -> LinkResult<Vec<RecordRef>> {
        self.filter().all().await
    }

    pub async fn select<F>(&self, predicate: F) -> LinkResult<Vec<RecordRef>>
    where
        F: FnMut(&RecordRef) -> bool,
    {
        self.filter().select(predicate).await
    }

    pub async fn reject<F>(&self, predicate: F) -> LinkResult<Vec<RecordRef>>
    where
        F: FnMut(&RecordRef) -> bool,
    {
        self.filter().reject(predicate).await
    }

    pub fn intersect(&self, other: impl Into<Operand>) -> Filter<'a> {
        self.filter().intersect(other)
    }

    pub fn union(&self, other: impl Into<Operand>) -> Filter<'a> {
        self.filter().union(other)
    }

    pub fn diff(&self, other: impl Into<Operand>) -> Filter<'a> {
        self.filter().diff(other)
    }

    pub fn stream(&self) -> BoxStream<'a, LinkResult<RecordRef>> {
        self.filter().into_stream()
    }

    // -- Writes --

    /// Adds `records`, linking each one's inverse side to the owner first.
    pub async fn add(&self, records: &[RecordRef]) -> LinkResult<()> {
        self.add_records(None, records).await
    }

    pub async fn add_within(&self, scope: &LockScope, records: &[RecordRef]) -> LinkResult<()> {
        self.add_records(Some(scope), records).await
    }

    /// Adds a single record and returns the proxy for chaining.
    pub async fn append(&self, record: &RecordRef) -> LinkResult<&Self> {
        self.add(std::slice::from_ref(record)).await?;
        Ok(self)
    }

    /// Removes `records` that are members, clearing each one's inverse side first.
    /// Records that are not members are left alone.
    pub async fn delete(&self, records: &[RecordRef]) -> LinkResult<()> {
        self.delete_records(None, records).await
    }

    pub async fn delete_within(&self, scope: &LockScope, records: &[RecordRef]) -> LinkResult<()> {
        self.delete_records(Some(scope), records).await
    }

    async fn add_records(&self, outer: Option<&LockScope>, records: &[RecordRef]) -> LinkResult<()> {
        let ids = self.validate(records)?;
        let scope = self.lock(outer).await?;
        let result: LinkResult<()> = async {
            let callbacks = &self.def.callbacks;
            for record in records {
                Callbacks::run(&callbacks.before_add, &self.record, Some(record));
            }

            let writes = self.backend.within(&scope);
            let new_txn = writes.begin_transaction().await;
            let result = async {
                if let Some(inverse) = self.def.inverse() {
                    for record in records {
                        self.link_inverse(&scope, record, inverse).await?;
                    }
                }
                writes.add(&self.key, Value::List(ids)).await
            }
            .await;
            writes.finish_transaction(new_txn, result).await?;

            debug!(record = %self.record, association = %self.name, count = records.len(), "added");
            for record in records {
                Callbacks::run(&callbacks.after_add, &self.record, Some(record));
            }
            Ok(())
        }
        .await;
        scope.finish(result).await
    }

    /// Points the inverse side of `record` at the owner, first removing it from a previous
    /// owner through that owner's proxy, so its remove callbacks run.
    async fn link_inverse(&self, scope: &LockScope, record: &RecordRef, inverse: &str) -> LinkResult<()> {
        let member = self.registry.belongs_to(self.backend, record, inverse)?;
        if let Some(previous) = member.value_within(scope).await?
            && previous != self.record
        {
            trace!(%record, %previous, "detaching from previous owner");
            self.registry
                .has_many(self.backend, &previous, &self.name)?
                .delete_within(scope, std::slice::from_ref(record))
                .await?;
        }
        member.set_value_within(scope, Some(&self.record)).await
    }

    async fn delete_records(&self, outer: Option<&LockScope>, records: &[RecordRef]) -> LinkResult<()> {
        let ids = self.validate(records)?;
        let scope = self.lock(outer).await?;
        let result: LinkResult<()> = async {
            let mut members = Vec::with_capacity(records.len());
            for (record, id) in records.iter().zip(ids) {
                if self.backend.includes(&self.key, &id).await? {
                    members.push((record, id));
                }
            }
            if members.is_empty() {
                trace!(record = %self.record, association = %self.name, "nothing to delete");
                return Ok(());
            }

            let callbacks = &self.def.callbacks;
            for (record, _) in &members {
                Callbacks::run(&callbacks.before_remove, &self.record, Some(*record));
            }

            let writes = self.backend.within(&scope);
            let new_txn = writes.begin_transaction().await;
            let result = async {
                if let Some(inverse) = self.def.inverse() {
                    for (record, _) in &members {
                        self.registry
                            .belongs_to(self.backend, record, inverse)?
                            .set_value_within(&scope, None)
                            .await?;
                    }
                }
                let ids = members.iter().map(|(_, id)| id.clone()).collect();
                writes.delete(&self.key, Value::List(ids)).await
            }
            .await;
            writes.finish_transaction(new_txn, result).await?;

            debug!(record = %self.record, association = %self.name, count = members.len(), "deleted");
            for (record, _) in &members {
                Callbacks::run(&callbacks.after_remove, &self.record, Some(*record));
            }
            Ok(())
        }
        .await;
        scope.finish(result).await
    }

    /// Clears the inverse side of every member, then removes the id set.
    pub async fn on_remove(&self, scope: &LockScope) -> LinkResult<()> {
        if let Some(inverse) = self.def.inverse() {
            for id in self.ids().await? {
                let member = RecordRef::new(self.related(), id);
                self.registry
                    .belongs_to(self.backend, &member, inverse)?
                    .set_value_within(scope, None)
                    .await?;
            }
        }
        self.backend.within(scope).clear(&self.key).await
    }
}
